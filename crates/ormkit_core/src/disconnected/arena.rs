//! Layered copy-on-write state registries.
//!
//! Registries live in an arena and refer to their origin by [`RegistryId`].
//! Lookups walk the chain from a layer down to the root; writes only touch the
//! layer they target, copying the entry up first. Committing a layer merges it
//! into its origin and retires the slot for good.

use crate::entity::PersistenceState;
use crate::error::{CoreError, CoreResult};
use crate::operation::{KeyMapping, OperationLog};
use crate::types::RegistryId;
use ormkit_types::{Key, MergeBehavior, Tuple};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A row as known to a registry layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredState {
    /// Row data. `None` with a synchronized state records a confirmed-absent
    /// row; `None` with a removed state is a removal marker.
    pub tuple: Option<Tuple>,
    /// Pending state relative to the origin.
    pub state: PersistenceState,
}

impl RegisteredState {
    /// A row read from the store.
    #[must_use]
    pub fn synchronized(tuple: Option<Tuple>) -> Self {
        Self {
            tuple,
            state: PersistenceState::Synchronized,
        }
    }

    /// A row created locally.
    #[must_use]
    pub fn created(tuple: Tuple) -> Self {
        Self {
            tuple: Some(tuple),
            state: PersistenceState::New,
        }
    }

    /// A removal marker.
    #[must_use]
    pub fn removed() -> Self {
        Self {
            tuple: None,
            state: PersistenceState::Removed,
        }
    }

    /// The row if it exists at this layer.
    #[must_use]
    pub fn live_row(&self) -> Option<&Tuple> {
        match self.state {
            PersistenceState::Removed => None,
            _ => self.tuple.as_ref(),
        }
    }
}

/// One layer of rows, set memberships and recorded operations.
#[derive(Debug, Default)]
pub struct StateRegistry {
    origin: Option<RegistryId>,
    entries: HashMap<Key, (RegisteredState, u64)>,
    sets: HashMap<(Key, String), Vec<Key>>,
    operations: OperationLog,
    next_seq: u64,
}

impl StateRegistry {
    fn with_origin(origin: Option<RegistryId>) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    /// The layer below, `None` for the root.
    #[must_use]
    pub fn origin(&self) -> Option<RegistryId> {
        self.origin
    }

    /// Number of rows held by this layer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the layer holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows of this layer in write order.
    #[must_use]
    pub fn entries(&self) -> Vec<(&Key, &RegisteredState)> {
        let mut all: Vec<_> = self.entries.iter().map(|(k, (s, n))| (k, s, *n)).collect();
        all.sort_by_key(|(_, _, n)| *n);
        all.into_iter().map(|(k, s, _)| (k, s)).collect()
    }

    /// Row of `key` at this layer only.
    #[must_use]
    pub fn local(&self, key: &Key) -> Option<&RegisteredState> {
        self.entries.get(key).map(|(s, _)| s)
    }

    pub(crate) fn local_mut(&mut self, key: &Key) -> Option<&mut RegisteredState> {
        self.entries.get_mut(key).map(|(s, _)| s)
    }

    /// Set memberships held by this layer.
    pub fn sets(&self) -> impl Iterator<Item = (&Key, &str, &[Key])> {
        self.sets
            .iter()
            .map(|((owner, field), items)| (owner, field.as_str(), items.as_slice()))
    }

    /// Operations recorded in this layer.
    #[must_use]
    pub fn operations(&self) -> &OperationLog {
        &self.operations
    }

    pub(crate) fn operations_mut(&mut self) -> &mut OperationLog {
        &mut self.operations
    }

    pub(crate) fn put(&mut self, key: Key, state: RegisteredState) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.0 = state;
            return;
        }
        self.next_seq += 1;
        self.entries.insert(key, (state, self.next_seq));
    }

    pub(crate) fn delete(&mut self, key: &Key) -> Option<RegisteredState> {
        self.entries.remove(key).map(|(s, _)| s)
    }

    pub(crate) fn put_set(&mut self, owner: Key, field: &str, items: Vec<Key>) {
        self.sets.insert((owner, field.to_owned()), items);
    }

    /// Marks every row as matching the store.
    pub(crate) fn mark_synchronized(&mut self) {
        for (state, _) in self.entries.values_mut() {
            state.state = PersistenceState::Synchronized;
        }
    }

    fn remap_keys(&mut self, mapping: &KeyMapping) {
        self.entries = self
            .entries
            .drain()
            .map(|(key, (mut state, n))| {
                if let Some(tuple) = &mut state.tuple {
                    tuple.remap_keys(mapping.lookup());
                }
                (mapping.resolve(&key), (state, n))
            })
            .collect();
        self.sets = self
            .sets
            .drain()
            .map(|((owner, field), items)| {
                let items = items.iter().map(|k| mapping.resolve(k)).collect();
                ((mapping.resolve(&owner), field), items)
            })
            .collect();
        self.operations.remap_keys(mapping);
    }
}

/// Slot storage for registry layers.
#[derive(Debug, Default)]
pub struct RegistryArena {
    slots: Vec<Option<StateRegistry>>,
}

impl RegistryArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layer over `origin` (`None` for a root).
    pub fn create(&mut self, origin: Option<RegistryId>) -> CoreResult<RegistryId> {
        if let Some(origin) = origin {
            self.registry(origin)?;
        }
        self.slots.push(Some(StateRegistry::with_origin(origin)));
        Ok(RegistryId::new(self.slots.len() - 1))
    }

    /// Returns true if the layer exists and was not committed or discarded.
    #[must_use]
    pub fn is_live(&self, id: RegistryId) -> bool {
        self.slots.get(id.index()).is_some_and(Option::is_some)
    }

    /// Looks up a live layer.
    pub fn registry(&self, id: RegistryId) -> CoreResult<&StateRegistry> {
        self.slots
            .get(id.index())
            .ok_or_else(|| CoreError::internal(format!("{id} does not exist")))?
            .as_ref()
            .ok_or(CoreError::RegistryCommitted { index: id.index() })
    }

    pub(crate) fn registry_mut(&mut self, id: RegistryId) -> CoreResult<&mut StateRegistry> {
        self.slots
            .get_mut(id.index())
            .ok_or_else(|| CoreError::internal(format!("{id} does not exist")))?
            .as_mut()
            .ok_or(CoreError::RegistryCommitted { index: id.index() })
    }

    /// Finds `key` in `id` or the first layer below that knows it.
    pub fn get(&self, id: RegistryId, key: &Key) -> CoreResult<Option<(&Key, &RegisteredState)>> {
        let mut current = Some(id);
        while let Some(layer) = current {
            let registry = self.registry(layer)?;
            if let Some((k, (state, _))) = registry.entries.get_key_value(key) {
                return Ok(Some((k, state)));
            }
            current = registry.origin;
        }
        Ok(None)
    }

    /// Finds set membership in `id` or the first layer below that knows it.
    pub fn get_set(&self, id: RegistryId, owner: &Key, field: &str) -> CoreResult<Option<&[Key]>> {
        let set_id = (owner.clone(), field.to_owned());
        let mut current = Some(id);
        while let Some(layer) = current {
            let registry = self.registry(layer)?;
            if let Some(items) = registry.sets.get(&set_id) {
                return Ok(Some(items));
            }
            current = registry.origin;
        }
        Ok(None)
    }

    /// Writes a row into layer `id` only.
    pub fn insert(&mut self, id: RegistryId, key: Key, state: RegisteredState) -> CoreResult<()> {
        self.registry_mut(id)?.put(key, state);
        Ok(())
    }

    /// Applies changed slots to the row of `key`, copying it into `id` first.
    pub fn update(&mut self, id: RegistryId, key: &Key, changes: &Tuple) -> CoreResult<()> {
        let (key, current) = match self.get(id, key)? {
            Some((k, state)) => (k.clone(), state.clone()),
            None => return Err(CoreError::EntityNotFound { key: key.clone() }),
        };
        let Some(mut row) = current.live_row().cloned() else {
            return Err(CoreError::EntityNotFound { key });
        };
        row.merge(changes, MergeBehavior::PreferDifference)?;
        let state = match current.state {
            PersistenceState::New => PersistenceState::New,
            _ => PersistenceState::Modified,
        };
        self.insert(id, key, RegisteredState { tuple: Some(row), state })
    }

    /// Removes `key` as seen from `id`.
    ///
    /// A row created in this very layer and unknown below simply disappears;
    /// anything else leaves a removal marker.
    pub fn remove(&mut self, id: RegistryId, key: &Key) -> CoreResult<()> {
        let registry = self.registry(id)?;
        let local_only = registry.local(key).is_some_and(|s| s.state == PersistenceState::New)
            && match registry.origin {
                Some(origin) => self.get(origin, key)?.is_none(),
                None => true,
            };
        let registry = self.registry_mut(id)?;
        if local_only {
            registry.delete(key);
        } else {
            registry.put(key.clone(), RegisteredState::removed());
        }
        registry.sets.retain(|(owner, _), _| owner != key);
        Ok(())
    }

    /// Mutable membership of a set in layer `id`, copied up from the chain.
    pub fn set_mut(&mut self, id: RegistryId, owner: &Key, field: &str) -> CoreResult<&mut Vec<Key>> {
        let set_id = (owner.clone(), field.to_owned());
        if !self.registry(id)?.sets.contains_key(&set_id) {
            let inherited = self
                .get_set(id, owner, field)?
                .map(<[Key]>::to_vec)
                .unwrap_or_default();
            self.registry_mut(id)?.sets.insert(set_id.clone(), inherited);
        }
        self.registry_mut(id)?
            .sets
            .get_mut(&set_id)
            .ok_or_else(|| CoreError::internal("set vanished after copy"))
    }

    /// Merges layer `id` into its origin and retires the slot.
    pub fn commit(&mut self, id: RegistryId) -> CoreResult<()> {
        let origin = self
            .registry(id)?
            .origin
            .ok_or_else(|| CoreError::invalid_operation("the root registry cannot be committed"))?;
        let origin_is_root = self.registry(origin)?.origin.is_none();
        let layer = self.take(id)?;
        let target = self.registry_mut(origin)?;

        let mut entries: Vec<_> = layer.entries.into_iter().collect();
        entries.sort_by_key(|(_, (_, n))| *n);
        for (key, (state, _)) in entries {
            if state.state == PersistenceState::Removed {
                if origin_is_root {
                    target.delete(&key);
                    target.sets.retain(|(owner, _), _| owner != &key);
                } else {
                    target.put(key, state);
                }
                continue;
            }
            match target.local_mut(&key) {
                Some(existing) => {
                    match (&mut existing.tuple, state.tuple) {
                        (Some(row), Some(incoming)) if existing.state != PersistenceState::Removed => {
                            row.merge(&incoming, MergeBehavior::PreferDifference)?;
                        }
                        (slot, incoming) => *slot = incoming,
                    }
                    if existing.state != PersistenceState::New {
                        existing.state = state.state;
                    }
                }
                None => target.put(key, state),
            }
        }
        for ((owner, field), items) in layer.sets {
            target.sets.insert((owner, field), items);
        }
        let mut operations = layer.operations;
        target.operations.append(&mut operations);
        Ok(())
    }

    /// Drops layer `id` and retires the slot.
    pub fn discard(&mut self, id: RegistryId) -> CoreResult<()> {
        self.take(id).map(|_| ())
    }

    fn take(&mut self, id: RegistryId) -> CoreResult<StateRegistry> {
        self.slots
            .get_mut(id.index())
            .ok_or_else(|| CoreError::internal(format!("{id} does not exist")))?
            .take()
            .ok_or(CoreError::RegistryCommitted { index: id.index() })
    }

    /// Rewrites keys of one layer through `mapping`.
    pub fn remap_keys(&mut self, id: RegistryId, mapping: &KeyMapping) -> CoreResult<()> {
        if !mapping.is_empty() {
            self.registry_mut(id)?.remap_keys(mapping);
        }
        Ok(())
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

    fn row(values: &[i64]) -> Tuple {
        Tuple::from_values(values.iter().map(|&v| Value::Int(v)).collect())
    }

    fn chain() -> (RegistryArena, RegistryId, RegistryId) {
        let mut arena = RegistryArena::new();
        let root = arena.create(None).unwrap();
        arena
            .insert(root, key(1), RegisteredState::synchronized(Some(row(&[1, 1]))))
            .unwrap();
        let top = arena.create(Some(root)).unwrap();
        (arena, root, top)
    }

    #[test]
    fn writes_do_not_leak_into_the_origin() {
        let (mut arena, root, top) = chain();
        arena
            .update(top, &key(1), &Tuple::from_slots(vec![None, Some(Value::Int(9))]))
            .unwrap();
        assert_eq!(arena.get(top, &key(1)).unwrap().unwrap().1.tuple, Some(row(&[1, 9])));
        assert_eq!(arena.get(root, &key(1)).unwrap().unwrap().1.tuple, Some(row(&[1, 1])));
        assert_eq!(
            arena.get(top, &key(1)).unwrap().unwrap().1.state,
            PersistenceState::Modified
        );
    }

    #[test]
    fn commit_merges_and_retires_the_slot() {
        let (mut arena, root, top) = chain();
        arena.update(top, &key(1), &Tuple::from_slots(vec![Some(Value::Int(5)), None])).unwrap();
        arena.insert(top, key(2), RegisteredState::created(row(&[2, 2]))).unwrap();
        arena.commit(top).unwrap();
        assert_eq!(arena.get(root, &key(1)).unwrap().unwrap().1.tuple, Some(row(&[5, 1])));
        assert!(arena.get(root, &key(2)).unwrap().is_some());
        assert!(matches!(arena.commit(top), Err(CoreError::RegistryCommitted { index: 1 })));
        assert!(matches!(arena.get(top, &key(1)), Err(CoreError::RegistryCommitted { .. })));
        assert!(!arena.is_live(top));
    }

    #[test]
    fn removal_marker_hides_the_origin_row() {
        let (mut arena, root, top) = chain();
        let mid = arena.create(Some(top)).unwrap();
        arena.remove(mid, &key(1)).unwrap();
        assert!(arena.get(mid, &key(1)).unwrap().unwrap().1.live_row().is_none());
        arena.commit(mid).unwrap();
        assert_eq!(arena.get(top, &key(1)).unwrap().unwrap().1.state, PersistenceState::Removed);
        arena.commit(top).unwrap();
        assert!(arena.get(root, &key(1)).unwrap().is_none());
    }

    #[test]
    fn removing_a_local_creation_leaves_no_marker() {
        let (mut arena, _, top) = chain();
        arena.insert(top, key(3), RegisteredState::created(row(&[3, 3]))).unwrap();
        arena.remove(top, &key(3)).unwrap();
        assert!(arena.get(top, &key(3)).unwrap().is_none());
    }

    #[test]
    fn discard_and_set_copy_on_write() {
        let (mut arena, root, top) = chain();
        arena.registry_mut(root).unwrap().put_set(key(1), "items", vec![key(7)]);
        arena.set_mut(top, &key(1), "items").unwrap().push(key(8));
        assert_eq!(arena.get_set(root, &key(1), "items").unwrap(), Some(&[key(7)][..]));
        assert_eq!(arena.get_set(top, &key(1), "items").unwrap().map(<[Key]>::len), Some(2));
        arena.discard(top).unwrap();
        assert!(matches!(arena.discard(top), Err(CoreError::RegistryCommitted { .. })));
    }

    #[test]
    fn remap_rewrites_rows_and_sets() {
        let (mut arena, _, top) = chain();
        arena.insert(top, key(-1), RegisteredState::created(row(&[0, 0]))).unwrap();
        arena.set_mut(top, &key(1), "items").unwrap().push(key(-1));
        arena.remap_keys(top, &KeyMapping::from(vec![(key(-1), key(10))])).unwrap();
        assert!(arena.registry(top).unwrap().local(&key(10)).is_some());
        assert_eq!(arena.get_set(top, &key(1), "items").unwrap(), Some(&[key(10)][..]));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use ormkit_types::{EntityTypeId, TypeReference, Value};
    use proptest::prelude::*;

    fn key(n: i64) -> Key {
        let t = TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1));
        Key::new(t, vec![Value::Int(n)]).unwrap()
    }

    #[derive(Debug, Clone)]
    enum Write {
        Update(i64, i64),
        Remove(i64),
        Insert(i64),
    }

    fn write_strategy() -> impl Strategy<Value = Write> {
        prop_oneof![
            3 => (1..=3i64, any::<i64>()).prop_map(|(k, v)| Write::Update(k, v)),
            1 => (1..=3i64).prop_map(Write::Remove),
            1 => (10..20i64).prop_map(Write::Insert),
        ]
    }

    proptest! {
        #[test]
        fn child_writes_never_reach_the_origin(writes in prop::collection::vec(write_strategy(), 0..24)) {
            let mut arena = RegistryArena::new();
            let root = arena.create(None).unwrap();
            for k in 1..=3 {
                let tuple = Tuple::from_values(vec![Value::Int(k), Value::Int(0)]);
                arena.insert(root, key(k), RegisteredState::synchronized(Some(tuple))).unwrap();
            }
            let before: Vec<_> = (1..=3)
                .map(|k| arena.get(root, &key(k)).unwrap().map(|(_, s)| s.clone()))
                .collect();

            let top = arena.create(Some(root)).unwrap();
            for write in &writes {
                // Updates of removed rows fail; the origin must stay untouched either way.
                let _ = match write {
                    Write::Update(k, v) => {
                        arena.update(top, &key(*k), &Tuple::from_slots(vec![None, Some(Value::Int(*v))]))
                    }
                    Write::Remove(k) => arena.remove(top, &key(*k)),
                    Write::Insert(k) => {
                        let tuple = Tuple::from_values(vec![Value::Int(*k), Value::Int(0)]);
                        arena.insert(top, key(*k), RegisteredState::created(tuple))
                    }
                };
            }

            let after: Vec<_> = (1..=3)
                .map(|k| arena.get(root, &key(k)).unwrap().map(|(_, s)| s.clone()))
                .collect();
            prop_assert_eq!(&before, &after);
            for k in 10..20 {
                prop_assert!(arena.get(root, &key(k)).unwrap().is_none());
            }

            arena.discard(top).unwrap();
            prop_assert_eq!(arena.registry(root).unwrap().len(), 3);
        }
    }
}
