//! Error types for the persistence engine.

use crate::transaction::TransactionState;
use crate::types::TransactionId;
use ormkit_types::{EntityTypeId, Key, TypesError, VersionInfo};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in session, transaction and disconnected operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Primitive type error.
    #[error("types error: {0}")]
    Types(#[from] TypesError),

    /// A live, non-removed state already exists for the key.
    #[error("identity conflict: entity {key} is already bound")]
    IdentityConflict {
        /// The conflicting key.
        key: Key,
    },

    /// Optimistic-concurrency check failed.
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// The entity whose version disagreed.
        key: Key,
        /// Version recorded locally.
        expected: VersionInfo,
        /// Version observed now.
        actual: VersionInfo,
    },

    /// The disconnected state is not attached to a session.
    #[error("disconnected state is not attached")]
    NotAttached,

    /// A disconnected state is already attached.
    #[error("disconnected state is already attached")]
    AlreadyAttached,

    /// An inner transaction is still open.
    #[error("nested transaction {inner} is still open")]
    NestedTransactionOpen {
        /// The open inner transaction.
        inner: TransactionId,
    },

    /// The operation needs an open transaction.
    #[error("an open transaction is required")]
    TransactionRequired,

    /// The transaction is not in a state that allows the operation.
    #[error("transaction {id} is {state:?}")]
    InvalidTransactionState {
        /// The transaction.
        id: TransactionId,
        /// Its current state.
        state: TransactionState,
    },

    /// The outermost transaction's deadline has passed.
    #[error("transaction {id} timed out")]
    TransactionTimeout {
        /// The outermost transaction.
        id: TransactionId,
    },

    /// The entity was removed in this unit of work.
    #[error("entity {key} is removed")]
    EntityRemoved {
        /// The removed key.
        key: Key,
    },

    /// No row exists for the key.
    #[error("entity {key} not found")]
    EntityNotFound {
        /// The missing key.
        key: Key,
    },

    /// A committed registry handle was used again.
    #[error("registry {index} was already committed")]
    RegistryCommitted {
        /// Slot index of the registry.
        index: usize,
    },

    /// Pinned entities block a flush that cannot be deferred.
    #[error("{count} pinned entities cannot be deferred")]
    PinnedEntities {
        /// Number of pinned entities.
        count: usize,
    },

    /// Commit-time validation failed.
    #[error("validation failed for {key}: {message}")]
    ValidationFailed {
        /// The invalid entity.
        key: Key,
        /// What was wrong.
        message: String,
    },

    /// The storage driver reported a failure.
    #[error("storage error: {message}")]
    Storage {
        /// Driver message.
        message: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The type is not part of the domain model.
    #[error("unknown type {type_id}")]
    UnknownType {
        /// The unknown type.
        type_id: EntityTypeId,
    },

    /// The field is not declared on the type.
    #[error("unknown field '{field}' on {type_id}")]
    UnknownField {
        /// Owning type.
        type_id: EntityTypeId,
        /// Field path.
        field: String,
    },

    /// Rolling back after a failure failed too.
    #[error("{original} (rollback also failed: {rollback})")]
    RollbackFailed {
        /// The failure that triggered the rollback.
        original: Box<CoreError>,
        /// The rollback failure.
        rollback: Box<CoreError>,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Internal invariant violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl CoreError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation_failed(key: Key, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            key,
            message: message.into(),
        }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(type_id: EntityTypeId, field: impl Into<String>) -> Self {
        Self::UnknownField {
            type_id,
            field: field.into(),
        }
    }

    /// Returns true if the caller may reasonably retry the operation.
    ///
    /// The engine itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Storage { .. } | CoreError::TransactionTimeout { .. } => true,
            CoreError::RollbackFailed { original, .. } => original.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for optimistic-concurrency failures.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CoreError::VersionConflict { .. })
    }
}
