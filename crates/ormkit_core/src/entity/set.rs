//! In-memory state of an entity-set field.

use crate::operation::KeyMapping;
use crate::transaction::LifetimeToken;
use ormkit_types::Key;

#[derive(Debug, Clone)]
struct SetBackup {
    added: Vec<Key>,
    removed: Vec<Key>,
}

/// Membership of one `(owner, field)` set plus its pending changes.
///
/// Changes can be recorded before the members are loaded; loading folds them
/// into the fetched list.
#[derive(Debug, Clone, Default)]
pub struct EntitySetState {
    items: Option<Vec<Key>>,
    added: Vec<Key>,
    removed: Vec<Key>,
    backup: Option<SetBackup>,
    token: Option<LifetimeToken>,
}

impl EntitySetState {
    /// A set whose members are known.
    #[must_use]
    pub fn loaded(items: Vec<Key>, token: Option<LifetimeToken>) -> Self {
        Self {
            items: Some(items),
            token,
            ..Self::default()
        }
    }

    /// A set whose members were not fetched yet.
    #[must_use]
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// Members, if loaded.
    #[must_use]
    pub fn members(&self) -> Option<&[Key]> {
        self.items.as_deref()
    }

    /// Returns true once members are known.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.items.is_some()
    }

    /// Returns true if the loaded members must be refetched.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        !self.has_changes() && self.token.as_ref().is_some_and(|t| !t.is_valid())
    }

    /// Position of `item` among loaded members.
    #[must_use]
    pub fn index_of(&self, item: &Key) -> Option<usize> {
        self.items.as_ref()?.iter().position(|k| k == item)
    }

    /// Pending additions.
    #[must_use]
    pub fn added(&self) -> &[Key] {
        &self.added
    }

    /// Pending removals.
    #[must_use]
    pub fn removed(&self) -> &[Key] {
        &self.removed
    }

    /// Returns true if there are pending changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Folds fetched members with pending changes.
    pub fn load(&mut self, mut fetched: Vec<Key>, token: Option<LifetimeToken>) {
        fetched.retain(|k| !self.removed.contains(k));
        for item in &self.added {
            if !fetched.contains(item) {
                fetched.push(item.clone());
            }
        }
        self.items = Some(fetched);
        self.token = token;
    }

    /// Adds `item`. Returns false if it is already a member.
    pub fn add(&mut self, item: &Key) -> bool {
        if let Some(items) = &mut self.items {
            if items.contains(item) {
                return false;
            }
            items.push(item.clone());
        } else if self.added.contains(item) {
            return false;
        }
        if let Some(pos) = self.removed.iter().position(|k| k == item) {
            self.removed.remove(pos);
        } else {
            self.added.push(item.clone());
        }
        true
    }

    /// Removes `item`. Returns false if it is not a member.
    pub fn remove(&mut self, item: &Key) -> bool {
        if let Some(items) = &mut self.items {
            let Some(pos) = items.iter().position(|k| k == item) else {
                return false;
            };
            items.remove(pos);
        } else if self.removed.contains(item) {
            return false;
        }
        if let Some(pos) = self.added.iter().position(|k| k == item) {
            self.added.remove(pos);
        } else {
            self.removed.push(item.clone());
        }
        true
    }

    /// Takes pending changes for a flush, keeping a backup.
    pub fn take_changes(&mut self) -> (Vec<Key>, Vec<Key>) {
        let added = std::mem::take(&mut self.added);
        let removed = std::mem::take(&mut self.removed);
        if self.backup.is_none() {
            self.backup = Some(SetBackup {
                added: added.clone(),
                removed: removed.clone(),
            });
        }
        (added, removed)
    }

    /// Restores the changes taken by the last flush.
    pub fn restore_changes(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.added = backup.added;
            self.removed = backup.removed;
        }
    }

    /// Forgets the flush backup and binds the members to `token`.
    pub fn confirm(&mut self, token: Option<LifetimeToken>) {
        self.backup = None;
        self.token = token;
    }

    /// Reverts pending changes in the loaded members.
    pub fn discard_changes(&mut self) {
        if let Some(items) = &mut self.items {
            items.retain(|k| !self.added.contains(k));
            for item in &self.removed {
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
        }
        self.added.clear();
        self.removed.clear();
        self.backup = None;
    }

    /// Rewrites keys through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        let remap = |list: &mut Vec<Key>| {
            for key in list.iter_mut() {
                if let Some(mapped) = mapping.get(key) {
                    *key = mapped.clone();
                }
            }
        };
        if let Some(items) = &mut self.items {
            remap(items);
        }
        remap(&mut self.added);
        remap(&mut self.removed);
        if let Some(backup) = &mut self.backup {
            remap(&mut backup.added);
            remap(&mut backup.removed);
        }
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
    fn add_then_remove_cancels_out() {
        let mut set = EntitySetState::loaded(vec![key(1)], None);
        assert!(set.add(&key(2)));
        assert!(!set.add(&key(2)));
        assert!(set.remove(&key(2)));
        assert!(!set.has_changes());
        assert_eq!(set.members(), Some(&[key(1)][..]));
    }

    #[test]
    fn changes_before_load_are_folded() {
        let mut set = EntitySetState::unloaded();
        set.add(&key(3));
        set.remove(&key(1));
        set.load(vec![key(1), key(2)], None);
        assert_eq!(set.members(), Some(&[key(2), key(3)][..]));
        assert_eq!(set.index_of(&key(3)), Some(1));
    }

    #[test]
    fn restore_after_failed_flush() {
        let mut set = EntitySetState::loaded(vec![], None);
        set.add(&key(1));
        let (added, removed) = set.take_changes();
        assert_eq!(added, vec![key(1)]);
        assert!(removed.is_empty());
        assert!(!set.has_changes());
        set.restore_changes();
        assert_eq!(set.added(), &[key(1)]);
    }

    #[test]
    fn discard_reverts_members() {
        let mut set = EntitySetState::loaded(vec![key(1), key(2)], None);
        set.add(&key(3));
        set.remove(&key(1));
        set.discard_changes();
        let mut members = set.members().unwrap().to_vec();
        members.sort_by_key(|k| k.values()[0].as_int());
        assert_eq!(members, vec![key(1), key(2)]);
    }

    #[test]
    fn remap_rewrites_members_and_pending() {
        let mut set = EntitySetState::loaded(vec![], None);
        set.add(&key(-1));
        let mut mapping = KeyMapping::new();
        mapping.insert(key(-1), key(9));
        set.remap_keys(&mapping);
        assert_eq!(set.members(), Some(&[key(9)][..]));
        assert_eq!(set.added(), &[key(9)]);
    }
}
