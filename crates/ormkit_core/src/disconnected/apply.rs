//! Pushing recorded changes to a live session.

use super::{DisconnectedState, RegisteredState};
use crate::error::{CoreError, CoreResult};
use crate::operation::{KeyMapping, OperationLog};
use crate::session::{PersistReason, Session};
use crate::storage::StorageDriver;
use ormkit_types::{Key, Tuple, VersionInfo};
use std::sync::Arc;
use tracing::{debug, warn};

/// A row read back from the store after the replay.
struct Refreshed {
    key: Key,
    row: Option<Tuple>,
    version: VersionInfo,
}

impl DisconnectedState {
    /// Replays the recorded operations against `target` in one transaction.
    ///
    /// Recorded versions of touched rows are validated first when enabled.
    /// On success the local changes become the new baseline, rewritten to the
    /// keys the store assigned, and the returned mapping says which recorded
    /// keys changed. On failure the target transaction is rolled back and
    /// this state is left as it was.
    pub fn apply_changes<D: StorageDriver>(&mut self, target: &mut Session<D>) -> CoreResult<KeyMapping> {
        if !self.transactional.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot apply changes while a local transaction is open",
            ));
        }
        if target.disconnected().is_some() {
            return Err(CoreError::invalid_operation(
                "the target session serves a disconnected state",
            ));
        }

        let recorded = self.state()?.operations();
        let log = match &self.config.operation_filter {
            Some(keep) => recorded.filter(|op| keep(op)),
            None => recorded.clone(),
        };
        debug!(operations = log.len(), "applying disconnected changes");

        let tx = target.begin_transaction()?;
        let (mapping, refreshed) = match self.apply_in(target, &log) {
            Ok(done) => {
                target.commit_transaction(tx)?;
                done
            }
            Err(err) => {
                if target.is_open(tx) {
                    if let Err(rollback) = target.rollback_transaction(tx) {
                        return Err(target.rollback_failure(err, rollback));
                    }
                }
                return Err(err);
            }
        };

        self.absorb(&mapping, refreshed)?;
        debug!(remapped = mapping.len(), "disconnected changes applied");
        Ok(mapping)
    }

    fn apply_in<D: StorageDriver>(
        &self,
        target: &mut Session<D>,
        log: &OperationLog,
    ) -> CoreResult<(KeyMapping, Vec<Refreshed>)> {
        let domain = Arc::clone(target.domain());
        let model = domain.model();
        let touched: Vec<Key> = log.touched_keys().into_iter().filter(|k| !k.is_temporary()).collect();

        if self.config.versions_usage.validate {
            for key in &touched {
                let Some(expected) = self.versions.get(key).filter(|v| !v.is_void()) else {
                    continue;
                };
                let actual = match target.refresh(key)? {
                    Some(row) => self.version_of(model, key, &row)?,
                    None => VersionInfo::Void,
                };
                if &actual != expected {
                    warn!(%key, "version conflict while applying");
                    return Err(CoreError::VersionConflict {
                        key: key.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }

        let outcome = log.replay(target)?;
        let flushed = target.persist(PersistReason::Other)?;
        let mapping = outcome.mapping.then(&flushed);

        let mut refreshed = Vec::new();
        let mut seen = Vec::new();
        for key in log.touched_keys() {
            let key = mapping.resolve(&key);
            if key.is_temporary() || seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            if let Some(keep) = &self.config.version_filter {
                if !keep(&key) {
                    continue;
                }
            }
            let row = target.refresh(&key)?;
            let version = match &row {
                Some(row) => self.version_of(model, &key, row)?,
                None => VersionInfo::Void,
            };
            refreshed.push(Refreshed { key, row, version });
        }
        Ok((mapping, refreshed))
    }

    /// Folds the applied state layer into the baseline.
    fn absorb(&mut self, mapping: &KeyMapping, refreshed: Vec<Refreshed>) -> CoreResult<()> {
        self.arena.commit(self.state)?;
        self.arena.remap_keys(self.original, mapping)?;
        self.versions.remap_keys(mapping.lookup());

        let registry = self.arena.registry_mut(self.original)?;
        for entry in refreshed {
            match entry.row {
                Some(row) => registry.put(entry.key.clone(), RegisteredState::synchronized(Some(row))),
                None => {
                    registry.delete(&entry.key);
                }
            }
            if !self.config.versions_usage.update {
                continue;
            }
            if entry.version.is_void() {
                self.versions.remove(&entry.key);
            } else {
                self.versions.set(entry.key, entry.version);
            }
        }
        registry.mark_synchronized();
        registry.operations_mut().clear();
        self.state = self.arena.create(Some(self.original))?;
        Ok(())
    }
}
