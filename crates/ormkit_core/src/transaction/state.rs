//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::transaction::LifetimeToken;
use crate::types::TransactionId;
use ormkit_types::Key;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created but not yet begun.
    NotActivated,
    /// Transaction is active and can perform operations.
    Active,
    /// Commit is in progress.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// Rollback is in progress.
    RollingBack,
    /// Transaction has been rolled back.
    RolledBack,
}

impl TransactionState {
    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (NotActivated, Active)
                | (Active, Committing)
                | (Committing, Committed)
                | (Active | Committing, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    /// Returns true for `Committed` and `RolledBack`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// Isolation level requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read committed data only.
    #[default]
    ReadCommitted,
    /// Rows read once stay stable.
    RepeatableRead,
    /// Full serializability.
    Serializable,
    /// Snapshot isolation.
    Snapshot,
}

/// How a scoped transaction is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionOpenMode {
    /// Join the innermost open transaction, or begin one if none is open.
    #[default]
    Auto,
    /// Always begin a new (possibly nested) transaction.
    New,
}

/// Handle passed to the storage driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Session-local transaction ID.
    pub id: TransactionId,
    /// Logical ID shared with the outermost transaction.
    pub guid: Uuid,
    /// Isolation level of the outermost transaction.
    pub isolation: IsolationLevel,
    /// Savepoint name for nested transactions.
    pub savepoint: Option<String>,
}

/// A node of the session's transaction stack.
///
/// Nested transactions share the outermost transaction's guid and isolation
/// level and are implemented as savepoints.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    guid: Uuid,
    isolation: IsolationLevel,
    state: TransactionState,
    token: LifetimeToken,
    deadline: Option<Instant>,
    savepoint: Option<String>,
    is_disconnected: bool,
    doomed: bool,
    touched: HashSet<Key>,
}

impl Transaction {
    /// Creates an outermost transaction.
    pub(crate) fn outermost(
        id: TransactionId,
        isolation: IsolationLevel,
        timeout: Option<Duration>,
        is_disconnected: bool,
    ) -> Self {
        Self {
            id,
            guid: Uuid::new_v4(),
            isolation,
            state: TransactionState::NotActivated,
            token: LifetimeToken::new(),
            deadline: timeout.map(|t| Instant::now() + t),
            savepoint: None,
            is_disconnected,
            doomed: false,
            touched: HashSet::new(),
        }
    }

    /// Creates a transaction nested inside `outer`.
    pub(crate) fn nested(id: TransactionId, outer: &Transaction) -> Self {
        Self {
            id,
            guid: outer.guid,
            isolation: outer.isolation,
            state: TransactionState::NotActivated,
            token: LifetimeToken::new(),
            deadline: None,
            savepoint: Some(format!("sp_{}", id.as_u64())),
            is_disconnected: outer.is_disconnected,
            doomed: false,
            touched: HashSet::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the logical ID shared with the outermost transaction.
    #[must_use]
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Returns the isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns true for savepoint-backed transactions.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.savepoint.is_some()
    }

    /// Returns true if the transaction runs against a disconnected state.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.is_disconnected
    }

    /// Returns the savepoint name of a nested transaction.
    #[must_use]
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// Returns the lifetime token.
    #[must_use]
    pub fn token(&self) -> &LifetimeToken {
        &self.token
    }

    /// Returns the deadline of an outermost transaction with a timeout.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once a failed flush left the transaction unusable.
    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Keys persisted under this transaction.
    pub fn touched(&self) -> impl Iterator<Item = &Key> {
        self.touched.iter()
    }

    /// Returns the handle passed to the driver.
    #[must_use]
    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            guid: self.guid,
            isolation: self.isolation,
            savepoint: self.savepoint.clone(),
        }
    }

    pub(crate) fn transition(&mut self, next: TransactionState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransactionState {
                id: self.id,
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn doom(&mut self) {
        self.doomed = true;
    }

    pub(crate) fn touch(&mut self, keys: impl IntoIterator<Item = Key>) {
        self.touched.extend(keys);
    }

    pub(crate) fn take_touched(&mut self) -> HashSet<Key> {
        std::mem::take(&mut self.touched)
    }

    pub(crate) fn remap_touched(&mut self, map: impl Fn(&Key) -> Option<Key>) {
        self.touched = self
            .touched
            .drain()
            .map(|k| map(&k).unwrap_or(k))
            .collect();
    }
}
