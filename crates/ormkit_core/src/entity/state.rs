//! Per-identity state held by the identity map.

use crate::entity::EntityObject;
use crate::error::CoreResult;
use crate::transaction::LifetimeToken;
use ormkit_types::{DifferentialTuple, Key, MergeBehavior, Tuple};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Persistence state of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Created in this unit of work and not yet written.
    New,
    /// Loaded and changed since.
    Modified,
    /// Marked for deletion.
    Removed,
    /// Matches the store.
    Synchronized,
}

/// The identity-map unit: key, row and persistence state.
///
/// `tuple == None` means the row is confirmed absent. The state holds only a
/// weak reference to its wrapper object.
#[derive(Debug)]
pub struct EntityState {
    key: Key,
    tuple: Option<DifferentialTuple>,
    persistence_state: PersistenceState,
    is_stale: bool,
    token: Option<LifetimeToken>,
    wrapper: Weak<EntityObject>,
}

impl EntityState {
    pub(crate) fn new(
        key: Key,
        tuple: Option<Tuple>,
        persistence_state: PersistenceState,
        token: Option<LifetimeToken>,
    ) -> Self {
        Self {
            key,
            tuple: tuple.map(DifferentialTuple::new),
            persistence_state,
            is_stale: false,
            token,
            wrapper: Weak::new(),
        }
    }

    /// Returns the key.
    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns the row, or `None` if it is confirmed absent.
    #[must_use]
    pub fn tuple(&self) -> Option<&DifferentialTuple> {
        self.tuple.as_ref()
    }

    /// Returns the effective row as a plain tuple.
    #[must_use]
    pub fn row(&self) -> Option<Tuple> {
        self.tuple.as_ref().map(DifferentialTuple::to_tuple)
    }

    /// Returns the persistence state.
    #[must_use]
    pub fn persistence_state(&self) -> PersistenceState {
        self.persistence_state
    }

    /// Returns true if the state is marked removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.persistence_state == PersistenceState::Removed
    }

    /// Returns true if the cached data must be refetched before use.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Returns true if the state must be refreshed before it is read.
    ///
    /// Only synchronized states can be invalid; pending changes belong to
    /// the current transaction.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.persistence_state == PersistenceState::Synchronized
            && (self.is_stale || self.token.as_ref().is_some_and(|t| !t.is_valid()))
    }

    /// Returns the live wrapper, if one exists.
    #[must_use]
    pub fn wrapper(&self) -> Option<Arc<EntityObject>> {
        self.wrapper.upgrade()
    }

    pub(crate) fn tuple_mut(&mut self) -> Option<&mut DifferentialTuple> {
        self.tuple.as_mut()
    }

    pub(crate) fn set_persistence_state(&mut self, state: PersistenceState) {
        self.persistence_state = state;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.is_stale = stale;
    }

    pub(crate) fn set_token(&mut self, token: Option<LifetimeToken>) {
        self.token = token;
    }

    pub(crate) fn bind_wrapper(&mut self, wrapper: &Arc<EntityObject>) {
        self.wrapper = Arc::downgrade(wrapper);
    }

    pub(crate) fn take_wrapper(&mut self) -> Weak<EntityObject> {
        std::mem::take(&mut self.wrapper)
    }

    /// Moves the state to a new key and refreshes a live wrapper.
    pub(crate) fn rekey(&mut self, key: Key) {
        if let Some(wrapper) = self.wrapper.upgrade() {
            wrapper.set_key(key.clone());
        }
        self.key = key;
    }

    /// Replaces the row with a fresh one for a (re)created entity.
    pub(crate) fn reset(&mut self, tuple: Tuple, state: PersistenceState, token: Option<LifetimeToken>) {
        self.tuple = Some(DifferentialTuple::new(tuple));
        self.persistence_state = state;
        self.is_stale = false;
        self.token = token;
    }

    /// Merges fetched data. `None` marks the row absent.
    pub(crate) fn update(&mut self, incoming: Option<Tuple>, token: Option<LifetimeToken>) -> CoreResult<()> {
        match incoming {
            None => self.tuple = None,
            Some(row) => {
                let same_shape = self.tuple.as_ref().is_some_and(|t| t.arity() == row.arity());
                if !same_shape {
                    self.tuple = Some(DifferentialTuple::new(row));
                } else if let Some(current) = self.tuple.as_mut() {
                    current.update_origin(&row, MergeBehavior::PreferDifference)?;
                }
            }
        }
        self.is_stale = false;
        self.token = token;
        Ok(())
    }

    pub(crate) fn remap_references(&mut self, map: impl Fn(&Key) -> Option<Key>) {
        if let Some(tuple) = &mut self.tuple {
            tuple.remap_keys(map);
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

    fn row(a: i64, b: i64) -> Tuple {
        Tuple::from_values(vec![Value::Int(a), Value::Int(b)])
    }

    #[test]
    fn update_prefers_incoming_but_keeps_difference() {
        let mut state = EntityState::new(key(1), Some(row(1, 2)), PersistenceState::Synchronized, None);
        state.tuple_mut().unwrap().set(0, Value::Int(10)).unwrap();
        state.update(Some(row(5, 6)), None).unwrap();
        assert_eq!(state.row(), Some(row(10, 6)));
        assert_eq!(state.tuple().unwrap().origin().get(0), Some(&Value::Int(5)));
    }

    #[test]
    fn update_with_none_marks_absent() {
        let mut state = EntityState::new(key(1), Some(row(1, 2)), PersistenceState::Synchronized, None);
        state.set_stale(true);
        state.update(None, None).unwrap();
        assert!(state.tuple().is_none());
        assert!(!state.is_stale());
    }

    #[test]
    fn invalidation_follows_token() {
        let token = LifetimeToken::new();
        let mut state = EntityState::new(key(1), Some(row(1, 2)), PersistenceState::Synchronized, Some(token.clone()));
        assert!(!state.is_invalidated());
        token.expire();
        assert!(state.is_invalidated());
        state.set_persistence_state(PersistenceState::Modified);
        assert!(!state.is_invalidated());
    }

    #[test]
    fn rekey_refreshes_wrapper() {
        let mut state = EntityState::new(key(-1), None, PersistenceState::New, None);
        let wrapper = Arc::new(EntityObject::new(key(-1)));
        state.bind_wrapper(&wrapper);
        state.rekey(key(7));
        assert_eq!(wrapper.key(), key(7));
        assert_eq!(state.key(), &key(7));
    }
}
