//! Change registries: pending entity states grouped by persistence state.

use crate::entity::PersistenceState;
use crate::operation::KeyMapping;
use ormkit_types::Key;
use std::collections::{HashMap, HashSet};

/// Pending entity changes in registration order.
#[derive(Debug, Default)]
pub struct ChangeRegistry {
    entries: HashMap<Key, (PersistenceState, u64)>,
    next_seq: u64,
}

impl ChangeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` under `state`, keeping its original position.
    pub fn register(&mut self, key: Key, state: PersistenceState) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.0 = state;
            return;
        }
        self.next_seq += 1;
        self.entries.insert(key, (state, self.next_seq));
    }

    /// Drops `key`. Returns its state if it was registered.
    pub fn remove(&mut self, key: &Key) -> Option<PersistenceState> {
        self.entries.remove(key).map(|(s, _)| s)
    }

    /// Registered state of `key`.
    #[must_use]
    pub fn state_of(&self, key: &Key) -> Option<PersistenceState> {
        self.entries.get(key).map(|(s, _)| *s)
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys registered under `state`, in registration order.
    #[must_use]
    pub fn keys(&self, state: PersistenceState) -> Vec<Key> {
        self.ordered(|s| s == state)
    }

    /// Every registered `(key, state)`, in registration order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Key, PersistenceState)> {
        let mut all: Vec<_> = self.entries.iter().map(|(k, (s, n))| (k.clone(), *s, *n)).collect();
        all.sort_by_key(|(_, _, n)| *n);
        all.into_iter().map(|(k, s, _)| (k, s)).collect()
    }

    fn ordered(&self, pred: impl Fn(PersistenceState) -> bool) -> Vec<Key> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, (s, _))| pred(*s))
            .map(|(k, (_, n))| (k.clone(), *n))
            .collect();
        keys.sort_by_key(|(_, n)| *n);
        keys.into_iter().map(|(k, _)| k).collect()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keeps only keys in `keep`.
    pub fn retain(&mut self, keep: &HashSet<Key>) {
        self.entries.retain(|k, _| keep.contains(k));
    }

    /// Rewrites keys through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        self.entries = self
            .entries
            .drain()
            .map(|(k, v)| (mapping.resolve(&k), v))
            .collect();
    }
}

/// Entity sets with pending membership changes.
#[derive(Debug, Default)]
pub struct EntitySetChangeRegistry {
    entries: HashMap<(Key, String), u64>,
    next_seq: u64,
}

impl EntitySetChangeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a set.
    pub fn register(&mut self, owner: Key, field: &str) {
        let key = (owner, field.to_owned());
        if !self.entries.contains_key(&key) {
            self.next_seq += 1;
            self.entries.insert(key, self.next_seq);
        }
    }

    /// Drops a set.
    pub fn remove(&mut self, owner: &Key, field: &str) -> bool {
        self.entries.remove(&(owner.clone(), field.to_owned())).is_some()
    }

    /// Returns true if the set is registered.
    #[must_use]
    pub fn contains(&self, owner: &Key, field: &str) -> bool {
        self.entries.contains_key(&(owner.clone(), field.to_owned()))
    }

    /// Registered sets in registration order.
    #[must_use]
    pub fn sets(&self) -> Vec<(Key, String)> {
        let mut all: Vec<_> = self.entries.iter().map(|(k, n)| (k.clone(), *n)).collect();
        all.sort_by_key(|(_, n)| *n);
        all.into_iter().map(|(k, _)| k).collect()
    }

    /// Number of registered sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Rewrites owner keys through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        self.entries = self
            .entries
            .drain()
            .map(|((owner, field), n)| ((mapping.resolve(&owner), field), n))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkit_types::{EntityTypeId, TypeReference, Value};

    fn key(n: i64) -> Key {
        let t = TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1));
        Key::new(t, vec![Value::Int(n)]).unwrap()
    }

    #[test]
    fn keys_keep_registration_order() {
        let mut reg = ChangeRegistry::new();
        reg.register(key(3), PersistenceState::New);
        reg.register(key(1), PersistenceState::Modified);
        reg.register(key(2), PersistenceState::New);
        reg.register(key(3), PersistenceState::New);
        assert_eq!(reg.keys(PersistenceState::New), vec![key(3), key(2)]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn reregistration_moves_state_not_position() {
        let mut reg = ChangeRegistry::new();
        reg.register(key(1), PersistenceState::Modified);
        reg.register(key(2), PersistenceState::Modified);
        reg.register(key(1), PersistenceState::Removed);
        assert_eq!(reg.state_of(&key(1)), Some(PersistenceState::Removed));
        assert_eq!(reg.entries()[0].0, key(1));
    }

    #[test]
    fn retain_and_remap() {
        let mut reg = ChangeRegistry::new();
        reg.register(key(-1), PersistenceState::New);
        reg.register(key(2), PersistenceState::Modified);
        reg.retain(&[key(-1)].into_iter().collect());
        let mut mapping = KeyMapping::new();
        mapping.insert(key(-1), key(5));
        reg.remap_keys(&mapping);
        assert_eq!(reg.keys(PersistenceState::New), vec![key(5)]);
    }

    #[test]
    fn set_registry_order() {
        let mut reg = EntitySetChangeRegistry::new();
        reg.register(key(2), "items");
        reg.register(key(1), "items");
        reg.register(key(2), "items");
        assert_eq!(reg.sets(), vec![(key(2), "items".to_owned()), (key(1), "items".to_owned())]);
        assert!(reg.remove(&key(2), "items"));
        assert!(!reg.contains(&key(2), "items"));
    }
}
