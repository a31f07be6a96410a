//! Storage driver interface.
//!
//! The engine never talks SQL; it hands a driver ordered [`PersistAction`]s
//! and transaction commands, and asks it for rows and entity-set memberships.

mod memory;

pub use memory::{MemoryDriver, MemoryStorage};

use crate::error::CoreResult;
use crate::transaction::TransactionInfo;
use ormkit_types::{Key, Tuple};

/// One write sent to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistAction {
    /// Insert a new row.
    Insert {
        /// Exact key.
        key: Key,
        /// Full row.
        tuple: Tuple,
    },
    /// Update changed slots of an existing row.
    Update {
        /// Exact key.
        key: Key,
        /// Only the changed slots are available.
        tuple: Tuple,
    },
    /// Delete a row and every link it owns or appears in.
    Remove {
        /// Exact key.
        key: Key,
    },
    /// Add an entity-set link.
    LinkAdd {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Linked item.
        item: Key,
    },
    /// Remove an entity-set link.
    LinkRemove {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Unlinked item.
        item: Key,
    },
}

impl PersistAction {
    /// The row or owner the action writes.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Remove { key } => key,
            Self::LinkAdd { owner, .. } | Self::LinkRemove { owner, .. } => owner,
        }
    }
}

/// A row returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRow {
    /// The key with its exact type resolved.
    pub key: Key,
    /// The stored row.
    pub tuple: Tuple,
}

/// Backend executing persistence commands.
///
/// The async methods default to the sync ones; drivers with real I/O
/// override them. Savepoint methods are only called inside an open
/// transaction.
#[allow(async_fn_in_trait)]
pub trait StorageDriver {
    /// Applies `actions` in order.
    fn persist(&mut self, actions: &[PersistAction], for_query: bool) -> CoreResult<()>;

    /// Loads a row. `key` may carry a hierarchy-only type.
    fn fetch_entity_state(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>>;

    /// Loads the members of an entity set, in link order.
    fn fetch_entity_set(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>>;

    /// Begins a physical transaction.
    fn begin_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()>;

    /// Creates a savepoint.
    fn create_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()>;

    /// Releases a savepoint, keeping its changes.
    fn release_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()>;

    /// Rolls back to a savepoint and releases it.
    fn rollback_to_savepoint(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()>;

    /// Commits the physical transaction.
    fn commit_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()>;

    /// Rolls back the physical transaction.
    fn rollback_transaction(&mut self, tx: &TransactionInfo) -> CoreResult<()>;

    /// Async [`persist`](Self::persist).
    async fn persist_async(&mut self, actions: &[PersistAction], for_query: bool) -> CoreResult<()> {
        self.persist(actions, for_query)
    }

    /// Async [`fetch_entity_state`](Self::fetch_entity_state).
    async fn fetch_entity_state_async(&mut self, key: &Key) -> CoreResult<Option<FetchedRow>> {
        self.fetch_entity_state(key)
    }

    /// Async [`fetch_entity_set`](Self::fetch_entity_set).
    async fn fetch_entity_set_async(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        self.fetch_entity_set(owner, field)
    }

    /// Async [`begin_transaction`](Self::begin_transaction).
    async fn begin_transaction_async(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.begin_transaction(tx)
    }

    /// Async [`create_savepoint`](Self::create_savepoint).
    async fn create_savepoint_async(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.create_savepoint(tx, name)
    }

    /// Async [`release_savepoint`](Self::release_savepoint).
    async fn release_savepoint_async(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.release_savepoint(tx, name)
    }

    /// Async [`rollback_to_savepoint`](Self::rollback_to_savepoint).
    async fn rollback_to_savepoint_async(&mut self, tx: &TransactionInfo, name: &str) -> CoreResult<()> {
        self.rollback_to_savepoint(tx, name)
    }

    /// Async [`commit_transaction`](Self::commit_transaction).
    async fn commit_transaction_async(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.commit_transaction(tx)
    }

    /// Async [`rollback_transaction`](Self::rollback_transaction).
    async fn rollback_transaction_async(&mut self, tx: &TransactionInfo) -> CoreResult<()> {
        self.rollback_transaction(tx)
    }
}
