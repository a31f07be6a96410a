//! Operation log: replayable record of high-level edits.
//!
//! Operations are registered by the session in program order. A capture scope
//! (or an attached disconnected state) decides which of them are recorded
//! according to its [`OperationLogType`].

mod capture;
mod mapping;
mod replay;

pub use capture::{CaptureScope, OperationCapturer};
pub use mapping::KeyMapping;
pub use replay::ReplayOutcome;

use ormkit_types::{Key, Value};
use serde::{Deserialize, Serialize};

/// A recorded edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A key was generated for a new entity.
    KeyGenerate {
        /// The generated key.
        key: Key,
    },
    /// An entity was created.
    EntityCreate {
        /// The new entity.
        key: Key,
    },
    /// Several fields of a new entity were initialized at once.
    EntityInitialize {
        /// The entity.
        key: Key,
        /// `(field path, value)` pairs.
        values: Vec<(String, Value)>,
    },
    /// A field was written.
    FieldSet {
        /// The entity.
        key: Key,
        /// Field path.
        field: String,
        /// New value.
        value: Value,
    },
    /// An entity was removed.
    EntityRemove {
        /// The entity.
        key: Key,
    },
    /// An item was added to an entity set.
    EntitySetAdd {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Added item.
        item: Key,
    },
    /// An item was removed from an entity set.
    EntitySetRemove {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Removed item.
        item: Key,
    },
    /// An entity set was cleared.
    EntitySetClear {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
    },
    /// An application identifier was bound to an entity.
    IdentifierAssign {
        /// The entity.
        key: Key,
        /// The identifier.
        identifier: String,
    },
}

impl Operation {
    /// The entity the operation targets.
    #[must_use]
    pub fn target(&self) -> Option<&Key> {
        match self {
            Self::KeyGenerate { key }
            | Self::EntityCreate { key }
            | Self::EntityInitialize { key, .. }
            | Self::FieldSet { key, .. }
            | Self::EntityRemove { key }
            | Self::IdentifierAssign { key, .. } => Some(key),
            Self::EntitySetAdd { owner, .. }
            | Self::EntitySetRemove { owner, .. }
            | Self::EntitySetClear { owner, .. } => Some(owner),
        }
    }

    /// Every key the operation mentions, including referenced values.
    #[must_use]
    pub fn keys(&self) -> Vec<&Key> {
        let mut keys = Vec::with_capacity(2);
        match self {
            Self::KeyGenerate { key }
            | Self::EntityCreate { key }
            | Self::EntityRemove { key }
            | Self::IdentifierAssign { key, .. } => keys.push(key),
            Self::EntityInitialize { key, values } => {
                keys.push(key);
                keys.extend(values.iter().filter_map(|(_, v)| v.as_key()));
            }
            Self::FieldSet { key, value, .. } => {
                keys.push(key);
                keys.extend(value.as_key());
            }
            Self::EntitySetAdd { owner, item, .. } | Self::EntitySetRemove { owner, item, .. } => {
                keys.push(owner);
                keys.push(item);
            }
            Self::EntitySetClear { owner, .. } => keys.push(owner),
        }
        keys
    }

    /// Returns a copy with every key rewritten through `mapping`.
    #[must_use]
    pub fn remap_keys(&self, mapping: &KeyMapping) -> Operation {
        let k = |key: &Key| mapping.resolve(key);
        let v = |value: &Value| value.map_key(mapping.lookup()).unwrap_or_else(|| value.clone());
        match self {
            Self::KeyGenerate { key } => Self::KeyGenerate { key: k(key) },
            Self::EntityCreate { key } => Self::EntityCreate { key: k(key) },
            Self::EntityInitialize { key, values } => Self::EntityInitialize {
                key: k(key),
                values: values.iter().map(|(f, x)| (f.clone(), v(x))).collect(),
            },
            Self::FieldSet { key, field, value } => Self::FieldSet {
                key: k(key),
                field: field.clone(),
                value: v(value),
            },
            Self::EntityRemove { key } => Self::EntityRemove { key: k(key) },
            Self::EntitySetAdd { owner, field, item } => Self::EntitySetAdd {
                owner: k(owner),
                field: field.clone(),
                item: k(item),
            },
            Self::EntitySetRemove { owner, field, item } => Self::EntitySetRemove {
                owner: k(owner),
                field: field.clone(),
                item: k(item),
            },
            Self::EntitySetClear { owner, field } => Self::EntitySetClear {
                owner: k(owner),
                field: field.clone(),
            },
            Self::IdentifierAssign { key, identifier } => Self::IdentifierAssign {
                key: k(key),
                identifier: identifier.clone(),
            },
        }
    }
}

/// Which registered operations a log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationLogType {
    /// Only operations issued directly by the caller; nested ones are implied.
    #[default]
    OutermostOperationLog,
    /// Only leaf operations; composite ones are represented by what they do.
    SystemOperationLog,
}

impl OperationLogType {
    /// Decides whether an operation registered at `depth` is recorded.
    #[must_use]
    pub fn records(self, depth: usize, composite: bool) -> bool {
        match self {
            Self::OutermostOperationLog => depth == 0,
            Self::SystemOperationLog => !composite,
        }
    }
}

/// Ordered sequence of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
    operations: Vec<Operation>,
}

impl OperationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation.
    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    /// Appends every operation of `other`.
    pub fn append(&mut self, other: &mut OperationLog) {
        self.operations.append(&mut other.operations);
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Iterates in recorded order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Drops every operation.
    pub fn clear(&mut self) {
        self.operations.clear();
    }

    /// Rewrites every key through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        for op in &mut self.operations {
            *op = op.remap_keys(mapping);
        }
    }

    /// Returns the operations passing `keep`, in order.
    #[must_use]
    pub fn filter(&self, keep: impl Fn(&Operation) -> bool) -> OperationLog {
        Self {
            operations: self.operations.iter().filter(|op| keep(op)).cloned().collect(),
        }
    }

    /// Every key mentioned by the log, first mention first.
    #[must_use]
    pub fn touched_keys(&self) -> Vec<Key> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for op in &self.operations {
            for key in op.keys() {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }
}

impl FromIterator<Operation> for OperationLog {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkit_types::{EntityTypeId, TypeReference};

    fn key(n: i64) -> Key {
        let t = TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1));
        if n < 0 {
            Key::temporary(t, vec![Value::Int(n)]).unwrap()
        } else {
            Key::new(t, vec![Value::Int(n)]).unwrap()
        }
    }

    #[test]
    fn log_type_gates() {
        assert!(OperationLogType::OutermostOperationLog.records(0, true));
        assert!(!OperationLogType::OutermostOperationLog.records(1, false));
        assert!(OperationLogType::SystemOperationLog.records(3, false));
        assert!(!OperationLogType::SystemOperationLog.records(0, true));
    }

    #[test]
    fn remap_rewrites_keys_and_references() {
        let mut mapping = KeyMapping::new();
        mapping.insert(key(-1), key(10));
        let op = Operation::FieldSet {
            key: key(2),
            field: "parent".into(),
            value: Value::Ref(key(-1)),
        };
        assert_eq!(
            op.remap_keys(&mapping),
            Operation::FieldSet {
                key: key(2),
                field: "parent".into(),
                value: Value::Ref(key(10)),
            }
        );
    }

    #[test]
    fn touched_keys_are_deduplicated_in_order() {
        let log: OperationLog = vec![
            Operation::KeyGenerate { key: key(-1) },
            Operation::EntityCreate { key: key(-1) },
            Operation::EntitySetAdd {
                owner: key(3),
                field: "items".into(),
                item: key(-1),
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(log.touched_keys(), vec![key(-1), key(3)]);
    }

    #[test]
    fn filter_keeps_order() {
        let log: OperationLog = vec![
            Operation::EntityCreate { key: key(1) },
            Operation::IdentifierAssign {
                key: key(1),
                identifier: "a".into(),
            },
            Operation::EntityRemove { key: key(1) },
        ]
        .into_iter()
        .collect();
        let filtered = log.filter(|op| !matches!(op, Operation::IdentifierAssign { .. }));
        assert_eq!(filtered.len(), 2);
        assert!(matches!(filtered.iter().last(), Some(Operation::EntityRemove { .. })));
    }
}
