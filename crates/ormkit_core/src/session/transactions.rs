//! Transaction stack: begin, commit and rollback, sync and async.

use super::{cancellable, PersistReason, Session};
use crate::entity::PersistenceState;
use crate::error::{CoreError, CoreResult};
use crate::events::SessionEvent;
use crate::storage::StorageDriver;
use crate::transaction::{
    IsolationLevel, Transaction, TransactionInfo, TransactionOpenMode, TransactionScope, TransactionState,
};
use crate::types::TransactionId;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl<D: StorageDriver> Session<D> {
    /// The innermost open transaction.
    #[must_use]
    pub fn active_transaction(&self) -> Option<&Transaction> {
        self.transactions.last()
    }

    /// Looks up an open transaction.
    #[must_use]
    pub fn transaction_by_id(&self, id: TransactionId) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.id() == id)
    }

    /// Number of open transactions.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.transactions.len()
    }

    /// Opens a transaction with the session defaults.
    ///
    /// Inside an open transaction this opens a nested one backed by a
    /// savepoint, after flushing pending changes.
    pub fn begin_transaction(&mut self) -> CoreResult<TransactionId> {
        self.begin_transaction_with(self.config.default_isolation_level, self.config.default_timeout)
    }

    /// Opens a transaction with explicit settings. Nested transactions
    /// inherit both from the outermost one.
    pub fn begin_transaction_with(
        &mut self,
        isolation: IsolationLevel,
        timeout: Option<Duration>,
    ) -> CoreResult<TransactionId> {
        self.check_can_begin()?;
        if !self.transactions.is_empty() {
            self.persist(PersistReason::NestedTransaction)?;
            self.check_timeout()?;
        }
        let tx = self.new_transaction(isolation, timeout);
        self.physical_begin(&tx.info())?;
        self.activate(tx)
    }

    /// Async [`begin_transaction`](Self::begin_transaction).
    pub async fn begin_transaction_async(&mut self, cancel: &CancellationToken) -> CoreResult<TransactionId> {
        self.check_can_begin()?;
        if !self.transactions.is_empty() {
            self.persist_async(PersistReason::NestedTransaction, cancel).await?;
            self.check_timeout()?;
        }
        let tx = self.new_transaction(self.config.default_isolation_level, self.config.default_timeout);
        let info = tx.info();
        if self.disconnected.is_some() {
            self.physical_begin(&info)?;
        } else {
            match &info.savepoint {
                Some(name) => cancellable(cancel, self.driver.create_savepoint_async(&info, name)).await?,
                None => cancellable(cancel, self.driver.begin_transaction_async(&info)).await?,
            }
        }
        self.activate(tx)
    }

    /// Opens a scope that commits or rolls back when it ends.
    ///
    /// With [`TransactionOpenMode::Auto`] inside an open transaction the scope
    /// joins it and completing the scope does nothing.
    pub fn open_transaction(&mut self, mode: TransactionOpenMode) -> CoreResult<TransactionScope<'_, D>> {
        if mode == TransactionOpenMode::Auto && !self.transactions.is_empty() {
            return Ok(TransactionScope::new(self, None));
        }
        let id = self.begin_transaction()?;
        Ok(TransactionScope::new(self, Some(id)))
    }

    /// Runs `f` in a new transaction, committing on success and rolling back
    /// on failure.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> CoreResult<T>) -> CoreResult<T> {
        let id = self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit_transaction(id)?;
                Ok(value)
            }
            Err(err) => {
                if self.is_open(id) {
                    if let Err(rollback) = self.rollback_transaction(id) {
                        return Err(self.rollback_failure(err, rollback));
                    }
                }
                Err(err)
            }
        }
    }

    /// Commits the innermost transaction `id`.
    ///
    /// Flushes, validates (outermost only) and commits. Any failure rolls the
    /// transaction back and returns the original error.
    pub fn commit_transaction(&mut self, id: TransactionId) -> CoreResult<()> {
        let info = self.begin_commit(id)?;
        let result = self.commit_steps(&info);
        match result {
            Ok(()) => self.end_commit(),
            Err(err) => Err(self.abort_commit(err)),
        }
    }

    /// Async [`commit_transaction`](Self::commit_transaction).
    pub async fn commit_transaction_async(&mut self, id: TransactionId, cancel: &CancellationToken) -> CoreResult<()> {
        let info = self.begin_commit(id)?;
        let result = self.commit_steps_async(&info, cancel).await;
        match result {
            Ok(()) => self.end_commit(),
            Err(err) => match self.rollback_innermost_async().await {
                Ok(()) => Err(err),
                Err(rollback) => Err(self.rollback_failure(err, rollback)),
            },
        }
    }

    /// Rolls back transaction `id` and every transaction nested in it.
    ///
    /// Pending changes are discarded: new entities leave the cache, modified
    /// and removed ones return to their last flushed rows.
    pub fn rollback_transaction(&mut self, id: TransactionId) -> CoreResult<()> {
        let index = self.position(id)?;
        let mut first = None;
        while self.transactions.len() > index {
            if let Err(err) = self.rollback_innermost() {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Async [`rollback_transaction`](Self::rollback_transaction).
    pub async fn rollback_transaction_async(&mut self, id: TransactionId) -> CoreResult<()> {
        let index = self.position(id)?;
        let mut first = None;
        while self.transactions.len() > index {
            if let Err(err) = self.rollback_innermost_async().await {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Fails once the outermost transaction's deadline has passed.
    pub fn check_timeout(&self) -> CoreResult<()> {
        match self.transactions.first() {
            Some(outer) if outer.deadline().is_some_and(|d| Instant::now() >= d) => {
                Err(CoreError::TransactionTimeout { id: outer.id() })
            }
            _ => Ok(()),
        }
    }

    fn check_can_begin(&self) -> CoreResult<()> {
        match self.transactions.last() {
            Some(outer) if !outer.is_active() => Err(CoreError::InvalidTransactionState {
                id: outer.id(),
                state: outer.state(),
            }),
            Some(outer) if outer.is_doomed() => Err(CoreError::invalid_operation(format!(
                "{} failed to flush and must be rolled back",
                outer.id()
            ))),
            _ => Ok(()),
        }
    }

    fn new_transaction(&mut self, isolation: IsolationLevel, timeout: Option<Duration>) -> Transaction {
        self.next_tx_id += 1;
        let id = TransactionId::new(self.next_tx_id);
        match self.transactions.last() {
            Some(outer) => Transaction::nested(id, outer),
            None => Transaction::outermost(id, isolation, timeout, self.disconnected.is_some()),
        }
    }

    fn activate(&mut self, mut tx: Transaction) -> CoreResult<TransactionId> {
        tx.transition(TransactionState::Active)?;
        let id = tx.id();
        let nested = tx.is_nested();
        debug!(%id, nested, "transaction opened");
        self.transactions.push(tx);
        self.publish(SessionEvent::TransactionOpened { id, nested });
        Ok(id)
    }

    fn position(&self, id: TransactionId) -> CoreResult<usize> {
        self.transactions
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not open")))
    }

    fn begin_commit(&mut self, id: TransactionId) -> CoreResult<TransactionInfo> {
        let index = self.position(id)?;
        if let Some(inner) = self.transactions.get(index + 1) {
            let inner = self.transactions.last().map_or(inner.id(), Transaction::id);
            return Err(CoreError::NestedTransactionOpen { inner });
        }
        let tx = &mut self.transactions[index];
        tx.transition(TransactionState::Committing)?;
        Ok(tx.info())
    }

    fn ensure_not_doomed(&self) -> CoreResult<()> {
        match self.transactions.last() {
            Some(tx) if tx.is_doomed() => Err(CoreError::invalid_operation(format!(
                "{} failed to flush and must be rolled back",
                tx.id()
            ))),
            _ => Ok(()),
        }
    }

    fn commit_steps(&mut self, info: &TransactionInfo) -> CoreResult<()> {
        self.ensure_not_doomed()?;
        self.persist(PersistReason::Commit)?;
        if self.transactions.len() == 1 && self.config.validate_on_commit {
            self.validate_transaction()?;
        }
        self.check_timeout()?;
        self.physical_commit(info)
    }

    async fn commit_steps_async(&mut self, info: &TransactionInfo, cancel: &CancellationToken) -> CoreResult<()> {
        self.ensure_not_doomed()?;
        self.persist_async(PersistReason::Commit, cancel).await?;
        if self.transactions.len() == 1 && self.config.validate_on_commit {
            self.validate_transaction()?;
        }
        self.check_timeout()?;
        if self.disconnected.is_some() {
            return self.physical_commit(info);
        }
        match &info.savepoint {
            Some(name) => cancellable(cancel, self.driver.release_savepoint_async(info, name)).await,
            None => cancellable(cancel, self.driver.commit_transaction_async(info)).await,
        }
    }

    fn end_commit(&mut self) -> CoreResult<()> {
        let mut tx = self
            .transactions
            .pop()
            .ok_or_else(|| CoreError::internal("transaction stack is empty"))?;
        tx.transition(TransactionState::Committed)?;
        match self.transactions.last_mut() {
            Some(outer) => {
                tx.token().promote_to(outer.token());
                outer.touch(tx.take_touched());
            }
            None if !self.config.non_transactional_reads => tx.token().expire(),
            None => {}
        }
        debug!(id = %tx.id(), "transaction committed");
        self.publish(SessionEvent::TransactionCommitted { id: tx.id() });
        Ok(())
    }

    fn abort_commit(&mut self, err: CoreError) -> CoreError {
        warn!(error = %err, "commit failed; rolling back");
        match self.rollback_innermost() {
            Ok(()) => err,
            Err(rollback) => self.rollback_failure(err, rollback),
        }
    }

    /// Moves the innermost transaction to rolling back and discards pending
    /// changes. Returns its info for the physical rollback.
    fn start_rollback(&mut self) -> CoreResult<Option<TransactionInfo>> {
        let Some(tx) = self.transactions.last_mut() else {
            return Ok(None);
        };
        tx.transition(TransactionState::RollingBack)?;
        let info = tx.info();
        self.revert_pending_changes();
        Ok(Some(info))
    }

    fn finish_rollback(&mut self) {
        if let Some(mut tx) = self.transactions.pop() {
            if let Err(err) = tx.transition(TransactionState::RolledBack) {
                warn!(error = %err, "unexpected transaction state after rollback");
            }
            tx.token().expire();
            debug!(id = %tx.id(), "transaction rolled back");
            self.publish(SessionEvent::TransactionRolledBack { id: tx.id() });
        }
    }

    fn rollback_innermost(&mut self) -> CoreResult<()> {
        let Some(info) = self.start_rollback()? else {
            return Ok(());
        };
        let result = self.physical_rollback(&info);
        self.finish_rollback();
        result
    }

    async fn rollback_innermost_async(&mut self) -> CoreResult<()> {
        let Some(info) = self.start_rollback()? else {
            return Ok(());
        };
        let result = if self.disconnected.is_some() {
            self.physical_rollback(&info)
        } else {
            match &info.savepoint {
                Some(name) => self.driver.rollback_to_savepoint_async(&info, name).await,
                None => self.driver.rollback_transaction_async(&info).await,
            }
        };
        self.finish_rollback();
        result
    }

    fn revert_pending_changes(&mut self) {
        for (key, state) in self.registry.entries() {
            match state {
                PersistenceState::New => {
                    self.cache.remove(&key);
                }
                PersistenceState::Modified | PersistenceState::Removed => {
                    if let Some(cached) = self.cache.get_mut(&key) {
                        if let Some(tuple) = cached.tuple_mut() {
                            tuple.rollback_difference();
                            tuple.drop_backup();
                        }
                        cached.set_persistence_state(PersistenceState::Synchronized);
                    }
                }
                PersistenceState::Synchronized => {}
            }
        }
        for (owner, field) in self.set_registry.sets() {
            if let Some(set) = self.entity_sets.get_mut(&(owner, field)) {
                set.discard_changes();
            }
        }
        self.registry.clear();
        self.set_registry.clear();
        self.cache.retain(|_, s| !s.is_removed());
    }

    fn physical_begin(&mut self, info: &TransactionInfo) -> CoreResult<()> {
        if let Some(state) = self.disconnected.as_mut() {
            return state.begin_layer();
        }
        match &info.savepoint {
            Some(name) => self.driver.create_savepoint(info, name),
            None => self.driver.begin_transaction(info),
        }
    }

    fn physical_commit(&mut self, info: &TransactionInfo) -> CoreResult<()> {
        if let Some(state) = self.disconnected.as_mut() {
            return state.commit_layer();
        }
        match &info.savepoint {
            Some(name) => self.driver.release_savepoint(info, name),
            None => self.driver.commit_transaction(info),
        }
    }

    fn physical_rollback(&mut self, info: &TransactionInfo) -> CoreResult<()> {
        if let Some(state) = self.disconnected.as_mut() {
            return state.discard_layer();
        }
        match &info.savepoint {
            Some(name) => self.driver.rollback_to_savepoint(info, name),
            None => self.driver.rollback_transaction(info),
        }
    }
}
