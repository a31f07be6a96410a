//! Attaching a disconnected state to a session.

use super::{PersistReason, Session};
use crate::disconnected::DisconnectedState;
use crate::entity::EntityObject;
use crate::error::{CoreError, CoreResult};
use crate::operation::KeyMapping;
use crate::storage::StorageDriver;
use ormkit_types::Key;
use std::sync::Weak;
use tracing::{debug, warn};

impl<D: StorageDriver> Session<D> {
    /// Routes reads and flushes of this session through `state`.
    ///
    /// Pending changes are flushed to the store first and the cache is
    /// dropped, so every later read comes from the state.
    pub fn attach(&mut self, state: DisconnectedState) -> CoreResult<()> {
        if self.disconnected.is_some() {
            return Err(CoreError::AlreadyAttached);
        }
        if !self.transactions.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot attach a disconnected state inside a transaction",
            ));
        }
        self.persist(PersistReason::Manual)?;
        self.reset_cache();
        self.disconnected = Some(state);
        debug!(session = %self.id, "disconnected state attached");
        Ok(())
    }

    /// Flushes pending changes into the attached state and hands it back.
    pub fn detach(&mut self) -> CoreResult<DisconnectedState> {
        self.ensure_detachable()?;
        self.persist(PersistReason::Manual)?;
        self.reset_cache();
        let state = self.disconnected.take().ok_or(CoreError::NotAttached)?;
        debug!(session = %self.id, "disconnected state detached");
        Ok(state)
    }

    /// Applies the attached state's changes to this session's store.
    ///
    /// Live wrappers keep working afterwards and follow any key the store
    /// assigned, whether or not the apply succeeded.
    pub fn apply_disconnected_changes(&mut self) -> CoreResult<KeyMapping> {
        self.ensure_detachable()?;
        self.persist(PersistReason::Manual)?;

        let wrappers: Vec<(Key, Weak<EntityObject>)> = self
            .cache
            .iter_mut()
            .map(|(key, state)| (key.clone(), state.take_wrapper()))
            .collect();
        self.reset_cache();
        let mut state = self.disconnected.take().ok_or(CoreError::NotAttached)?;

        let result = state.apply_changes(self);

        self.reset_cache();
        self.disconnected = Some(state);
        let empty = KeyMapping::new();
        let mapping = result.as_ref().unwrap_or(&empty);
        self.relink_wrappers(wrappers, mapping);
        result
    }

    /// Forgets the attached state's local changes and this session's
    /// pending ones.
    pub fn cancel_disconnected_changes(&mut self) -> CoreResult<()> {
        self.ensure_detachable()?;
        self.reset_cache();
        match self.disconnected.as_mut() {
            Some(state) => state.cancel_changes(),
            None => Err(CoreError::NotAttached),
        }
    }

    fn ensure_detachable(&self) -> CoreResult<()> {
        if self.disconnected.is_none() {
            return Err(CoreError::NotAttached);
        }
        if !self.transactions.is_empty() {
            return Err(CoreError::invalid_operation(
                "a transaction is open on the disconnected state",
            ));
        }
        Ok(())
    }

    fn relink_wrappers(&mut self, wrappers: Vec<(Key, Weak<EntityObject>)>, mapping: &KeyMapping) {
        for (key, weak) in wrappers {
            let Some(wrapper) = weak.upgrade() else { continue };
            let key = mapping.resolve(&key);
            wrapper.set_key(key.clone());
            if let Err(err) = self.load_state(&key) {
                warn!(%key, error = %err, "wrapper could not be reloaded");
                continue;
            }
            if let Some(state) = self.cache.get_mut(&key) {
                if !state.is_removed() && state.tuple().is_some() {
                    state.bind_wrapper(&wrapper);
                }
            }
        }
    }
}
