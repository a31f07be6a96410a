//! Storage calls of an attached session routed through the layers.

use super::{DisconnectedState, RegisteredState};
use crate::error::CoreResult;
use crate::model::DomainModel;
use crate::storage::{FetchedRow, PersistAction, StorageDriver};
use ormkit_types::{Key, Tuple, VersionInfo};
use tracing::trace;

impl DisconnectedState {
    /// Reads a row from the layers, falling back to the store when connected.
    ///
    /// Rows read from the store join the baseline with their version.
    pub(crate) fn fetch_row<D: StorageDriver>(
        &mut self,
        key: &Key,
        driver: &mut D,
        model: &DomainModel,
    ) -> CoreResult<Option<FetchedRow>> {
        if let Some((found, state)) = self.arena.get(self.top(), key)? {
            return Ok(state.live_row().map(|tuple| FetchedRow {
                key: found.clone(),
                tuple: tuple.clone(),
            }));
        }
        if !self.connected {
            return Ok(None);
        }

        let fetched = driver.fetch_entity_state(key)?;
        match &fetched {
            Some(row) => {
                let version = self.version_of(model, &row.key, &row.tuple)?;
                self.arena.insert(
                    self.original,
                    row.key.clone(),
                    RegisteredState::synchronized(Some(row.tuple.clone())),
                )?;
                self.versions.set(row.key.clone(), version);
                trace!(key = %row.key, "baseline row fetched");
            }
            None if key.is_exact() => {
                self.arena
                    .insert(self.original, key.clone(), RegisteredState::synchronized(None))?;
            }
            None => {}
        }
        Ok(fetched)
    }

    /// Reads set membership from the layers, falling back to the store.
    pub(crate) fn fetch_set<D: StorageDriver>(
        &mut self,
        owner: &Key,
        field: &str,
        driver: &mut D,
    ) -> CoreResult<Vec<Key>> {
        if let Some(items) = self.arena.get_set(self.top(), owner, field)? {
            return Ok(items.to_vec());
        }
        if !self.connected {
            return Ok(Vec::new());
        }
        let items = driver.fetch_entity_set(owner, field)?;
        self.arena
            .registry_mut(self.original)?
            .put_set(owner.clone(), field, items.clone());
        Ok(items)
    }

    /// Writes flushed actions into the topmost layer.
    pub(crate) fn persist_actions<D: StorageDriver>(&mut self, actions: &[PersistAction], driver: &mut D) -> CoreResult<()> {
        let top = self.top();
        for action in actions {
            match action {
                PersistAction::Insert { key, tuple } => {
                    self.arena.insert(top, key.clone(), RegisteredState::created(tuple.clone()))?;
                }
                PersistAction::Update { key, tuple } => self.arena.update(top, key, tuple)?,
                PersistAction::Remove { key } => self.arena.remove(top, key)?,
                PersistAction::LinkAdd { owner, field, item } => {
                    self.fetch_set(owner, field, driver)?;
                    let items = self.arena.set_mut(top, owner, field)?;
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
                PersistAction::LinkRemove { owner, field, item } => {
                    self.fetch_set(owner, field, driver)?;
                    self.arena.set_mut(top, owner, field)?.retain(|k| k != item);
                }
            }
        }
        trace!(count = actions.len(), "flushed into local layer");
        Ok(())
    }

    pub(crate) fn version_of(&self, model: &DomainModel, key: &Key, row: &Tuple) -> CoreResult<VersionInfo> {
        let info = model.type_info(key.type_id())?;
        Ok(info.version_of(row, |k| self.versions.get(k).cloned()))
    }
}
