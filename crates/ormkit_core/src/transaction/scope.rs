//! Scoped transaction guard.

use crate::error::CoreResult;
use crate::session::Session;
use crate::storage::StorageDriver;
use crate::types::TransactionId;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// A transaction bound to a lexical scope.
///
/// The guard derefs to the session. Call [`complete`](Self::complete) to mark
/// the work as successful; the transaction is committed when the guard is
/// dropped, or rolled back if it was never completed. Use
/// [`commit`](Self::commit) to observe commit errors instead of having them
/// logged on drop.
///
/// A scope opened with [`TransactionOpenMode::Auto`](crate::TransactionOpenMode::Auto)
/// inside an open transaction joins it and leaves its outcome to the owner.
pub struct TransactionScope<'s, D: StorageDriver> {
    session: &'s mut Session<D>,
    id: Option<TransactionId>,
    completed: bool,
}

impl<'s, D: StorageDriver> TransactionScope<'s, D> {
    pub(crate) fn new(session: &'s mut Session<D>, id: Option<TransactionId>) -> Self {
        Self {
            session,
            id,
            completed: false,
        }
    }

    /// The owned transaction, or `None` for a joined scope.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.id
    }

    /// Marks the scope as successful.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    /// Completes and commits now, returning the commit result.
    pub fn commit(mut self) -> CoreResult<()> {
        self.completed = true;
        match self.id.take() {
            Some(id) => self.session.commit_transaction(id),
            None => Ok(()),
        }
    }

    /// Rolls back now.
    pub fn rollback(mut self) -> CoreResult<()> {
        match self.id.take() {
            Some(id) => self.session.rollback_transaction(id),
            None => Ok(()),
        }
    }
}

impl<D: StorageDriver> Deref for TransactionScope<'_, D> {
    type Target = Session<D>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<D: StorageDriver> DerefMut for TransactionScope<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<D: StorageDriver> Drop for TransactionScope<'_, D> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else { return };
        if !self.session.is_open(id) {
            return;
        }
        let result = if self.completed {
            self.session.commit_transaction(id)
        } else {
            self.session.rollback_transaction(id)
        };
        if let Err(err) = result {
            warn!(transaction = %id, error = %err, "scoped transaction did not finish cleanly");
        }
    }
}
