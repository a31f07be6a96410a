//! Disconnected (offline) state.
//!
//! A [`DisconnectedState`] keeps a baseline of fetched rows (the original
//! layer), the local changes made on top of it (the state layer) and one
//! extra layer per open local transaction. While attached to a session it
//! serves every read and absorbs every flush; [`Session::apply_disconnected_changes`]
//! later replays the recorded operations against the store.
//!
//! [`Session::apply_disconnected_changes`]: crate::Session::apply_disconnected_changes

mod apply;
mod arena;
mod handler;
mod merge;
mod snapshot;

pub use arena::{RegisteredState, RegistryArena, StateRegistry};
pub use snapshot::{DisconnectedSnapshot, LayerSnapshot, SnapshotRow, SnapshotSet};

use crate::config::DisconnectedConfig;
use crate::error::{CoreError, CoreResult};
use crate::operation::{Operation, OperationLog};
use crate::types::RegistryId;
use ormkit_types::{Key, MergeBehavior, Tuple, VersionSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Conflict policy when registering fetched data into the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeMode {
    /// Reject rows whose version differs from the recorded one.
    #[default]
    Strict,
    /// Incoming data wins without version checks.
    PreferNew,
    /// Data already in the baseline wins.
    PreferOriginal,
}

impl MergeMode {
    /// Tuple merge behavior implied by the mode.
    #[must_use]
    pub fn merge_behavior(self) -> MergeBehavior {
        match self {
            MergeMode::Strict | MergeMode::PreferNew => MergeBehavior::PreferDifference,
            MergeMode::PreferOriginal => MergeBehavior::PreferOrigin,
        }
    }
}

/// Offline baseline, local changes and recorded operations.
pub struct DisconnectedState {
    arena: RegistryArena,
    original: RegistryId,
    state: RegistryId,
    transactional: Vec<RegistryId>,
    versions: VersionSet,
    config: DisconnectedConfig,
    connected: bool,
}

impl fmt::Debug for DisconnectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisconnectedState")
            .field("original", &self.original)
            .field("state", &self.state)
            .field("transactional", &self.transactional)
            .field("versions", &self.versions.len())
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl DisconnectedState {
    /// Creates an empty, disconnected state.
    pub fn new(config: DisconnectedConfig) -> CoreResult<Self> {
        let mut arena = RegistryArena::new();
        let original = arena.create(None)?;
        let state = arena.create(Some(original))?;
        Ok(Self {
            arena,
            original,
            state,
            transactional: Vec::new(),
            versions: VersionSet::new(),
            config,
            connected: false,
        })
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &DisconnectedConfig {
        &self.config
    }

    /// Mutable configuration.
    pub fn config_mut(&mut self) -> &mut DisconnectedConfig {
        &mut self.config
    }

    /// Recorded versions of baseline rows.
    #[must_use]
    pub fn versions(&self) -> &VersionSet {
        &self.versions
    }

    /// Lets reads fall through to the store for rows the baseline lacks.
    pub fn connect(&mut self) {
        self.connected = true;
    }

    /// Serves reads from the local layers only.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Returns true while reads may reach the store.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Layer storage.
    #[must_use]
    pub fn arena(&self) -> &RegistryArena {
        &self.arena
    }

    /// The baseline layer.
    pub fn original(&self) -> CoreResult<&StateRegistry> {
        self.arena.registry(self.original)
    }

    /// The layer holding committed local changes.
    pub fn state(&self) -> CoreResult<&StateRegistry> {
        self.arena.registry(self.state)
    }

    /// Operations recorded by committed local work.
    pub fn operations(&self) -> CoreResult<&OperationLog> {
        Ok(self.state()?.operations())
    }

    /// Number of open local transactions.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.transactional.len()
    }

    /// Row of `key` as seen from the topmost layer.
    pub fn row(&self, key: &Key) -> CoreResult<Option<Tuple>> {
        Ok(self
            .arena
            .get(self.top(), key)?
            .and_then(|(_, s)| s.live_row().cloned()))
    }

    /// Baseline row of `key`.
    pub fn baseline(&self, key: &Key) -> CoreResult<Option<&RegisteredState>> {
        Ok(self.original()?.local(key))
    }

    /// Forgets local changes and recorded operations.
    ///
    /// Fails while a local transaction is open.
    pub fn cancel_changes(&mut self) -> CoreResult<()> {
        if !self.transactional.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot cancel changes while a local transaction is open",
            ));
        }
        self.arena.discard(self.state)?;
        self.state = self.arena.create(Some(self.original))?;
        debug!("disconnected changes cancelled");
        Ok(())
    }

    pub(crate) fn top(&self) -> RegistryId {
        self.transactional.last().copied().unwrap_or(self.state)
    }

    pub(crate) fn record(&mut self, op: &Operation, depth: usize, composite: bool) -> CoreResult<()> {
        if self.config.operation_log_type.records(depth, composite) {
            let top = self.top();
            self.arena.registry_mut(top)?.operations_mut().push(op.clone());
        }
        Ok(())
    }

    pub(crate) fn begin_layer(&mut self) -> CoreResult<()> {
        let layer = self.arena.create(Some(self.top()))?;
        self.transactional.push(layer);
        Ok(())
    }

    pub(crate) fn commit_layer(&mut self) -> CoreResult<()> {
        let layer = self
            .transactional
            .pop()
            .ok_or_else(|| CoreError::internal("no local transaction layer"))?;
        self.arena.commit(layer)
    }

    pub(crate) fn discard_layer(&mut self) -> CoreResult<()> {
        let layer = self
            .transactional
            .pop()
            .ok_or_else(|| CoreError::internal("no local transaction layer"))?;
        self.arena.discard(layer)
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
    fn layers_stack_over_the_state() {
        let mut ds = DisconnectedState::new(DisconnectedConfig::default()).unwrap();
        let state = ds.top();
        ds.begin_layer().unwrap();
        assert_ne!(ds.top(), state);
        ds.arena
            .insert(ds.top(), key(1), RegisteredState::created(Tuple::from_values(vec![Value::Int(1)])))
            .unwrap();
        ds.record(&Operation::EntityCreate { key: key(1) }, 0, false).unwrap();
        ds.commit_layer().unwrap();
        assert_eq!(ds.top(), state);
        assert!(ds.row(&key(1)).unwrap().is_some());
        assert_eq!(ds.operations().unwrap().len(), 1);
    }

    #[test]
    fn cancel_requires_no_open_layer() {
        let mut ds = DisconnectedState::new(DisconnectedConfig::default()).unwrap();
        ds.begin_layer().unwrap();
        assert!(ds.cancel_changes().is_err());
        ds.discard_layer().unwrap();
        ds.cancel_changes().unwrap();
        assert!(ds.state().unwrap().is_empty());
    }

    #[test]
    fn merge_modes_map_to_behaviors() {
        assert_eq!(MergeMode::default(), MergeMode::Strict);
        assert_eq!(MergeMode::PreferOriginal.merge_behavior(), MergeBehavior::PreferOrigin);
        assert_eq!(MergeMode::PreferNew.merge_behavior(), MergeBehavior::PreferDifference);
    }
}
