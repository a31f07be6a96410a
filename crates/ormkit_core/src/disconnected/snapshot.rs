//! Serializable form of a disconnected state.

use super::{DisconnectedState, MergeMode, RegisteredState, RegistryArena, StateRegistry};
use crate::config::{DisconnectedConfig, VersionsUsage};
use crate::entity::PersistenceState;
use crate::error::{CoreError, CoreResult};
use crate::model::DomainModel;
use crate::operation::{OperationLog, OperationLogType};
use crate::types::RegistryId;
use ormkit_types::{from_cbor, to_cbor, Key, Tuple, VersionSet};
use serde::{Deserialize, Serialize};

/// One row of a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Row key.
    pub key: Key,
    /// Row data, if any.
    pub tuple: Option<Tuple>,
    /// Pending state relative to the layer below.
    pub state: PersistenceState,
}

/// One entity-set membership of a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSet {
    /// Set owner.
    pub owner: Key,
    /// Set field.
    pub field: String,
    /// Members in order.
    pub items: Vec<Key>,
}

/// Flat content of one registry layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerSnapshot {
    /// Rows in write order.
    pub rows: Vec<SnapshotRow>,
    /// Set memberships.
    pub sets: Vec<SnapshotSet>,
    /// Recorded operations.
    pub operations: OperationLog,
}

impl LayerSnapshot {
    fn capture(registry: &StateRegistry) -> Self {
        let rows = registry
            .entries()
            .into_iter()
            .map(|(key, state)| SnapshotRow {
                key: key.clone(),
                tuple: state.tuple.clone(),
                state: state.state,
            })
            .collect();
        let mut sets: Vec<SnapshotSet> = registry
            .sets()
            .map(|(owner, field, items)| SnapshotSet {
                owner: owner.clone(),
                field: field.to_owned(),
                items: items.to_vec(),
            })
            .collect();
        sets.sort_by(|a, b| (a.owner.to_string(), &a.field).cmp(&(b.owner.to_string(), &b.field)));
        Self {
            rows,
            sets,
            operations: registry.operations().clone(),
        }
    }

    fn validate(&self, model: &DomainModel) -> CoreResult<()> {
        for row in &self.rows {
            let info = model.type_info(row.key.type_id())?;
            if let Some(tuple) = &row.tuple {
                if tuple.arity() != info.arity() {
                    return Err(CoreError::invalid_operation(format!(
                        "row {} has {} slots, {} expects {}",
                        row.key,
                        tuple.arity(),
                        info.name(),
                        info.arity()
                    )));
                }
            }
        }
        for set in &self.sets {
            let field = model.field(set.owner.type_id(), &set.field)?;
            if !field.is_entity_set() {
                return Err(CoreError::invalid_operation(format!(
                    "'{}' on {} is not an entity set",
                    set.field, set.owner
                )));
            }
        }
        Ok(())
    }

    fn load(self, arena: &mut RegistryArena, id: RegistryId) -> CoreResult<()> {
        let registry = arena.registry_mut(id)?;
        for row in self.rows {
            registry.put(
                row.key,
                RegisteredState {
                    tuple: row.tuple,
                    state: row.state,
                },
            );
        }
        for set in self.sets {
            registry.put_set(set.owner, &set.field, set.items);
        }
        let mut operations = self.operations;
        registry.operations_mut().append(&mut operations);
        Ok(())
    }
}

/// A disconnected state frozen for storage or transfer.
///
/// Filters configured on the live state are code and are not captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectedSnapshot {
    /// Baseline rows.
    pub original: LayerSnapshot,
    /// Committed local changes.
    pub state: LayerSnapshot,
    /// Recorded versions.
    pub versions: VersionSet,
    /// Conflict policy.
    pub merge_mode: MergeMode,
    /// Version switches.
    pub versions_usage: VersionsUsage,
    /// Operation recording policy.
    pub operation_log_type: OperationLogType,
}

impl DisconnectedSnapshot {
    /// Encodes the snapshot as CBOR.
    pub fn to_cbor(&self) -> CoreResult<Vec<u8>> {
        Ok(to_cbor(self)?)
    }

    /// Decodes a snapshot from CBOR.
    pub fn from_cbor(bytes: &[u8]) -> CoreResult<Self> {
        Ok(from_cbor(bytes)?)
    }
}

impl DisconnectedState {
    /// Captures the baseline, local changes and versions.
    ///
    /// Fails while a local transaction is open.
    pub fn snapshot(&self) -> CoreResult<DisconnectedSnapshot> {
        if !self.transactional.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot snapshot while a local transaction is open",
            ));
        }
        Ok(DisconnectedSnapshot {
            original: LayerSnapshot::capture(self.original()?),
            state: LayerSnapshot::capture(self.state()?),
            versions: self.versions.clone(),
            merge_mode: self.config.merge_mode,
            versions_usage: self.config.versions_usage,
            operation_log_type: self.config.operation_log_type,
        })
    }

    /// Rebuilds a disconnected, detached state from a snapshot.
    ///
    /// Every row and set is checked against `model` first.
    pub fn restore(snapshot: DisconnectedSnapshot, model: &DomainModel) -> CoreResult<Self> {
        snapshot.original.validate(model)?;
        snapshot.state.validate(model)?;

        let config = DisconnectedConfig::new()
            .merge_mode(snapshot.merge_mode)
            .versions_usage(snapshot.versions_usage)
            .operation_log_type(snapshot.operation_log_type);
        let mut restored = Self::new(config)?;
        snapshot.original.load(&mut restored.arena, restored.original)?;
        snapshot.state.load(&mut restored.arena, restored.state)?;
        restored.versions = snapshot.versions;
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TypeInfo;
    use crate::operation::Operation;
    use ormkit_types::{EntityTypeId, TypeReference, Value, VersionInfo};

    const NOTE: EntityTypeId = EntityTypeId::new(1);
    const FOLDER: EntityTypeId = EntityTypeId::new(2);

    fn model() -> DomainModel {
        DomainModel::new(vec![
            TypeInfo::entity(NOTE, "Note").field("text"),
            TypeInfo::entity(FOLDER, "Folder").field("title").entity_set("notes", NOTE, None),
        ])
        .unwrap()
    }

    fn key(type_id: EntityTypeId, n: i64) -> Key {
        Key::new(TypeReference::exact(type_id, type_id), vec![Value::Int(n)]).unwrap()
    }

    fn text(s: &str) -> Tuple {
        Tuple::from_values(vec![Value::Text(s.into())])
    }

    fn populated() -> DisconnectedState {
        let mut ds = DisconnectedState::new(DisconnectedConfig::default().merge_mode(MergeMode::PreferNew)).unwrap();
        ds.register_entity_state(
            &key(NOTE, 1),
            Some(text("baseline")),
            VersionInfo::from_values(vec![Value::Int(3)]),
            MergeMode::Strict,
        )
        .unwrap();
        let state = ds.state;
        ds.arena
            .insert(state, key(NOTE, 2), RegisteredState::created(text("local")))
            .unwrap();
        ds.arena
            .set_mut(state, &key(FOLDER, 1), "notes")
            .unwrap()
            .push(key(NOTE, 2));
        ds.record(&Operation::EntityCreate { key: key(NOTE, 2) }, 0, false).unwrap();
        ds
    }

    #[test]
    fn snapshot_survives_cbor() {
        let ds = populated();
        let bytes = ds.snapshot().unwrap().to_cbor().unwrap();
        let restored = DisconnectedState::restore(DisconnectedSnapshot::from_cbor(&bytes).unwrap(), &model()).unwrap();

        assert_eq!(restored.row(&key(NOTE, 1)).unwrap(), Some(text("baseline")));
        assert_eq!(restored.row(&key(NOTE, 2)).unwrap(), Some(text("local")));
        assert!(restored.baseline(&key(NOTE, 2)).unwrap().is_none());
        assert_eq!(restored.operations().unwrap().len(), 1);
        assert_eq!(restored.versions(), ds.versions());
        assert_eq!(restored.config().merge_mode, MergeMode::PreferNew);
        assert_eq!(
            restored.arena().get_set(restored.top(), &key(FOLDER, 1), "notes").unwrap(),
            Some(&[key(NOTE, 2)][..])
        );
        assert!(!restored.is_connected());
    }

    #[test]
    fn restore_rejects_rows_that_do_not_fit_the_model() {
        let mut snapshot = populated().snapshot().unwrap();
        snapshot.state.rows[0].tuple = Some(Tuple::from_values(vec![Value::Int(1), Value::Int(2)]));
        assert!(DisconnectedState::restore(snapshot, &model()).is_err());

        let mut snapshot = populated().snapshot().unwrap();
        snapshot.state.sets[0].field = "title".into();
        assert!(DisconnectedState::restore(snapshot, &model()).is_err());
    }

    #[test]
    fn snapshot_requires_closed_layers() {
        let mut ds = populated();
        ds.begin_layer().unwrap();
        assert!(ds.snapshot().is_err());
    }
}
