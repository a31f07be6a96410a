//! Registration of fetched rows into the baseline.

use super::{DisconnectedState, MergeMode, RegisteredState};
use crate::entity::PersistenceState;
use crate::error::{CoreError, CoreResult};
use ormkit_types::{Key, Tuple, VersionInfo};
use tracing::{debug, warn};

impl DisconnectedState {
    /// Registers a row and its version in the baseline.
    ///
    /// `None` records the row as absent. With [`MergeMode::Strict`] and
    /// version validation on, a recorded version that differs from `version`
    /// is a [`CoreError::VersionConflict`] and nothing changes.
    pub fn register_entity_state(
        &mut self,
        key: &Key,
        tuple: Option<Tuple>,
        version: VersionInfo,
        mode: MergeMode,
    ) -> CoreResult<()> {
        self.check_version(key, &version, mode)?;
        self.absorb_row(key, tuple, version, mode)
    }

    /// Registers every baseline row of `source` into this state.
    ///
    /// Each row goes through the same rule as [`register_entity_state`],
    /// with the version `source` recorded for it. Conflicts are checked for
    /// all rows before any row is written, so a failed merge leaves this
    /// baseline as it was and can be retried with another mode.
    ///
    /// [`register_entity_state`]: Self::register_entity_state
    pub fn merge(&mut self, source: &DisconnectedState, mode: MergeMode) -> CoreResult<()> {
        let rows = source.original()?.entries();
        for (key, _) in &rows {
            let version = source.versions.get(key).cloned().unwrap_or_default();
            self.check_version(key, &version, mode)?;
        }
        for (key, state) in &rows {
            let version = source.versions.get(key).cloned().unwrap_or_default();
            self.absorb_row(key, state.tuple.clone(), version, mode)?;
        }

        let original = self.original;
        let missing: Vec<_> = source
            .original()?
            .sets()
            .filter(|(owner, field, _)| matches!(self.arena.get_set(original, owner, field), Ok(None)))
            .map(|(owner, field, items)| (owner.clone(), field.to_owned(), items.to_vec()))
            .collect();
        let registry = self.arena.registry_mut(original)?;
        for (owner, field, items) in missing {
            registry.put_set(owner, &field, items);
        }
        debug!(rows = rows.len(), ?mode, "disconnected states merged");
        Ok(())
    }

    fn check_version(&self, key: &Key, version: &VersionInfo, mode: MergeMode) -> CoreResult<()> {
        if mode != MergeMode::Strict || !self.config.versions_usage.validate {
            return Ok(());
        }
        match self.versions.get(key) {
            Some(recorded) if recorded.conflicts_with(version) => {
                warn!(%key, "version conflict while registering");
                Err(CoreError::VersionConflict {
                    key: key.clone(),
                    expected: recorded.clone(),
                    actual: version.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn absorb_row(&mut self, key: &Key, tuple: Option<Tuple>, version: VersionInfo, mode: MergeMode) -> CoreResult<()> {
        let registry = self.arena.registry_mut(self.original)?;
        let known = match registry.local_mut(key) {
            Some(existing) => {
                match (&mut existing.tuple, tuple) {
                    (Some(row), Some(incoming)) => row.merge(&incoming, mode.merge_behavior())?,
                    (slot, incoming) if mode != MergeMode::PreferOriginal || slot.is_none() => {
                        *slot = incoming;
                    }
                    _ => {}
                }
                existing.state = PersistenceState::Synchronized;
                true
            }
            None => {
                registry.put(key.clone(), RegisteredState::synchronized(tuple));
                false
            }
        };

        let keep_recorded = known && mode == MergeMode::PreferOriginal && self.versions.contains(key);
        if self.config.versions_usage.update && !keep_recorded {
            self.versions.set(key.clone(), version);
        }
        Ok(())
    }
}
