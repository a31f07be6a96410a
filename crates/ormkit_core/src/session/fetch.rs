//! Loading rows and entity sets into the identity map.

use super::{cancellable, Session};
use crate::entity::{EntityObject, PersistenceState};
use crate::error::{CoreError, CoreResult};
use crate::storage::{FetchedRow, StorageDriver};
use ormkit_types::{Key, Tuple, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

impl<D: StorageDriver> Session<D> {
    /// Loads an entity. Returns `None` if no live row exists.
    ///
    /// Cached synchronized states are reused while their transaction token is
    /// valid; invalidated or stale states are refetched.
    pub fn fetch(&mut self, key: &Key) -> CoreResult<Option<Arc<EntityObject>>> {
        self.load_state(key)?;
        self.live_wrapper(key)
    }

    /// Async [`fetch`](Self::fetch).
    pub async fn fetch_async(
        &mut self,
        key: &Key,
        cancel: &CancellationToken,
    ) -> CoreResult<Option<Arc<EntityObject>>> {
        if self.needs_fetch(key) {
            let fetched = match self.disconnected.as_mut() {
                Some(state) => state.fetch_row(key, &mut self.driver, self.domain.model())?,
                None => {
                    self.check_timeout()?;
                    cancellable(cancel, self.driver.fetch_entity_state_async(key)).await?
                }
            };
            self.apply_fetched(key, fetched)?;
        }
        self.live_wrapper(key)
    }

    /// Marks a cached state stale and reloads it.
    pub fn refresh(&mut self, key: &Key) -> CoreResult<Option<Tuple>> {
        if let Some(state) = self.cache.get_mut(key) {
            if state.persistence_state() == PersistenceState::Synchronized {
                state.set_stale(true);
            }
        }
        self.row(key)
    }

    /// Current row of an entity, including pending changes.
    pub fn row(&mut self, key: &Key) -> CoreResult<Option<Tuple>> {
        self.load_state(key)?;
        Ok(self
            .cache
            .get(key)
            .filter(|s| !s.is_removed())
            .and_then(|s| s.row()))
    }

    /// Reads a scalar or reference field.
    pub fn get_field(&mut self, key: &Key, field: &str) -> CoreResult<Value> {
        let key = self.live_key(key)?;
        let info = self.domain.model().field(key.type_id(), field)?;
        let slot = info
            .slot()
            .ok_or_else(|| CoreError::invalid_operation(format!("field '{field}' does not hold a value")))?;
        Ok(self
            .cache
            .get(&key)
            .and_then(|s| s.tuple())
            .and_then(|t| t.get(slot))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub(crate) fn needs_fetch(&self, key: &Key) -> bool {
        self.cache.get(key).map_or(true, |s| s.is_invalidated())
    }

    /// Makes sure the cached state for `key` is current.
    pub(crate) fn load_state(&mut self, key: &Key) -> CoreResult<()> {
        if !self.needs_fetch(key) {
            return Ok(());
        }
        let fetched = self.dispatch_fetch(key)?;
        self.apply_fetched(key, fetched)
    }

    fn apply_fetched(&mut self, key: &Key, fetched: Option<FetchedRow>) -> CoreResult<()> {
        match fetched {
            Some(row) => {
                trace!(key = %row.key, "fetched");
                self.update_state_in_cache(&row.key, Some(row.tuple), false)
            }
            None => {
                trace!(%key, "not found");
                self.update_state_in_cache(key, None, false)
            }
        }
    }

    /// Canonical key of a live entity, fetching it if needed.
    pub(crate) fn live_key(&mut self, key: &Key) -> CoreResult<Key> {
        self.load_state(key)?;
        let state = self
            .cache
            .get(key)
            .ok_or_else(|| CoreError::EntityNotFound { key: key.clone() })?;
        if state.is_removed() {
            return Err(CoreError::EntityRemoved { key: key.clone() });
        }
        if state.tuple().is_none() {
            return Err(CoreError::EntityNotFound { key: key.clone() });
        }
        Ok(state.key().clone())
    }

    fn live_wrapper(&mut self, key: &Key) -> CoreResult<Option<Arc<EntityObject>>> {
        let live = self
            .cache
            .get(key)
            .is_some_and(|s| !s.is_removed() && s.tuple().is_some());
        if live {
            self.entity_object(key).map(Some)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn dispatch_fetch(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>> {
        match self.disconnected.as_mut() {
            Some(state) => state.fetch_row(key, &mut self.driver, self.domain.model()),
            None => {
                self.check_timeout()?;
                self.driver.fetch_entity_state(key)
            }
        }
    }

    pub(crate) fn dispatch_fetch_set(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        match self.disconnected.as_mut() {
            Some(state) => state.fetch_set(owner, field, &mut self.driver),
            None => {
                self.check_timeout()?;
                self.driver.fetch_entity_set(owner, field)
            }
        }
    }
}
