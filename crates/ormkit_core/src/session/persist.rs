//! The flush pipeline: pending changes become storage actions.

use super::{cancellable, ChangeItem, KeyRemapper, PersistReason, Session};
use crate::entity::PersistenceState;
use crate::error::{CoreError, CoreResult};
use crate::events::SessionEvent;
use crate::model::VersionMode;
use crate::operation::KeyMapping;
use crate::storage::{PersistAction, StorageDriver};
use crate::transaction::{IsolationLevel, TransactionInfo};
use crate::types::TransactionId;
use ormkit_types::{Key, Tuple, Value};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything a flush needs to finish or undo itself.
struct PersistPlan {
    reason: PersistReason,
    auto_tx: bool,
    actions: Vec<PersistAction>,
    mapping: KeyMapping,
    persisted: Vec<(Key, PersistenceState)>,
    sets: Vec<(Key, String)>,
}

impl PersistPlan {
    fn for_query(&self) -> bool {
        self.reason == PersistReason::Query
    }
}

fn auto_transaction_info() -> TransactionInfo {
    TransactionInfo {
        id: TransactionId::new(0),
        guid: Uuid::new_v4(),
        isolation: IsolationLevel::default(),
        savepoint: None,
    }
}

impl<D: StorageDriver> Session<D> {
    /// Flushes pending changes to the driver.
    ///
    /// Returns the temporary-to-final key mapping applied by this flush. On
    /// failure every state, set and version bump is restored, the registries
    /// stay intact and, unless entity states are non-transactional, the open
    /// transaction is doomed.
    pub fn persist(&mut self, reason: PersistReason) -> CoreResult<KeyMapping> {
        let Some(plan) = self.prepare_persist(reason)? else {
            return Ok(KeyMapping::new());
        };
        let result = self.execute_persist(&plan);
        self.finish_persist(plan, result)
    }

    /// Async [`persist`](Self::persist). Cancellation takes the failure path.
    pub async fn persist_async(&mut self, reason: PersistReason, cancel: &CancellationToken) -> CoreResult<KeyMapping> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let Some(plan) = self.prepare_persist(reason)? else {
            return Ok(KeyMapping::new());
        };
        let result = self.execute_persist_async(&plan, cancel).await;
        self.finish_persist(plan, result)
    }

    fn prepare_persist(&mut self, reason: PersistReason) -> CoreResult<Option<PersistPlan>> {
        if self.is_persisting || (self.registry.is_empty() && self.set_registry.is_empty()) {
            return Ok(None);
        }

        let items: Vec<ChangeItem> = self
            .registry
            .entries()
            .into_iter()
            .map(|(key, state)| {
                let references = self
                    .cache
                    .get(&key)
                    .and_then(|s| s.row())
                    .map(|row| row.references().cloned().collect())
                    .unwrap_or_default();
                ChangeItem { key, state, references }
            })
            .collect();
        let split = self.pinner.process(&items);
        if !split.pinned.is_empty()
            && matches!(reason, PersistReason::Commit | PersistReason::NestedTransaction)
        {
            return Err(CoreError::PinnedEntities {
                count: split.pinned.len(),
            });
        }

        self.is_persisting = true;
        self.publish(SessionEvent::Persisting { reason });
        let plan = self.build_plan(reason, &split.pinned);
        if plan.is_err() {
            self.is_persisting = false;
        }
        plan.map(Some)
    }

    fn build_plan(&mut self, reason: PersistReason, pinned: &[Key]) -> CoreResult<PersistPlan> {
        let mut mapping = KeyMapping::new();
        if self.config.lazy_key_generation && self.disconnected.is_none() {
            let pinned_set: HashSet<&Key> = pinned.iter().collect();
            let temporary: Vec<Key> = self
                .registry
                .keys(PersistenceState::New)
                .into_iter()
                .filter(|k| k.is_temporary() && !pinned_set.contains(k))
                .collect();
            mapping = KeyRemapper::new(&self.domain).remap(&temporary)?;
            self.remap_entity_keys(&mapping)?;
        }
        let pinned: HashSet<Key> = pinned.iter().map(|k| mapping.resolve(k)).collect();
        let persisted: Vec<(Key, PersistenceState)> = self
            .registry
            .entries()
            .into_iter()
            .filter(|(k, _)| !pinned.contains(k))
            .collect();

        self.bump_versions(&persisted)?;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut removes = Vec::new();
        for (key, state) in &persisted {
            let Some(cached) = self.cache.get_mut(key) else { continue };
            match state {
                PersistenceState::New => {
                    if let Some(tuple) = cached.tuple_mut() {
                        inserts.push(PersistAction::Insert {
                            key: key.clone(),
                            tuple: tuple.to_tuple(),
                        });
                        tuple.commit_difference();
                    }
                }
                PersistenceState::Modified => {
                    if let Some(tuple) = cached.tuple_mut() {
                        let changed = tuple.changed_slots();
                        if !changed.is_empty() {
                            let full = tuple.to_tuple();
                            let mut slots = vec![None; full.arity()];
                            for slot in changed {
                                slots[slot] = full.get(slot).cloned();
                            }
                            updates.push(PersistAction::Update {
                                key: key.clone(),
                                tuple: Tuple::from_slots(slots),
                            });
                        }
                        tuple.commit_difference();
                    }
                }
                PersistenceState::Removed => removes.push(PersistAction::Remove { key: key.clone() }),
                PersistenceState::Synchronized => {}
            }
        }

        let mut links = Vec::new();
        let mut sets = Vec::new();
        for (owner, field) in self.set_registry.sets() {
            if pinned.contains(&owner) {
                continue;
            }
            let Some(set) = self.entity_sets.get_mut(&(owner.clone(), field.clone())) else {
                continue;
            };
            if set.added().iter().chain(set.removed()).any(|k| pinned.contains(k)) {
                continue;
            }
            let (added, removed) = set.take_changes();
            for item in removed {
                links.push(PersistAction::LinkRemove {
                    owner: owner.clone(),
                    field: field.clone(),
                    item,
                });
            }
            for item in added {
                links.push(PersistAction::LinkAdd {
                    owner: owner.clone(),
                    field: field.clone(),
                    item,
                });
            }
            sets.push((owner, field));
        }

        let mut actions = inserts;
        actions.append(&mut updates);
        actions.append(&mut links);
        actions.append(&mut removes);
        debug!(?reason, actions = actions.len(), pinned = pinned.len(), "flush prepared");

        Ok(PersistPlan {
            reason,
            auto_tx: self.transactions.is_empty() && self.disconnected.is_none(),
            actions,
            mapping,
            persisted,
            sets,
        })
    }

    /// Increments auto versions of new and modified entities, unless the
    /// application already wrote the version in this cycle. The row is backed
    /// up first so a failed flush also reverts the bump.
    fn bump_versions(&mut self, persisted: &[(Key, PersistenceState)]) -> CoreResult<()> {
        for (key, state) in persisted {
            if !matches!(state, PersistenceState::New | PersistenceState::Modified) {
                continue;
            }
            let info = self.domain.model().type_info(key.type_id())?;
            let slots: Vec<usize> = info
                .version_fields()
                .filter(|f| f.version_mode() == Some(VersionMode::Auto))
                .map(|f| f.offset())
                .collect();
            let Some(tuple) = self.cache.get_mut(key).and_then(|s| s.tuple_mut()) else {
                continue;
            };
            let changed = tuple.changed_slots();
            for slot in slots {
                if *state == PersistenceState::Modified && changed.contains(&slot) {
                    continue;
                }
                let next = tuple.get(slot).and_then(Value::as_int).unwrap_or(0) + 1;
                tuple.take_backup();
                tuple.set(slot, Value::Int(next))?;
            }
        }
        Ok(())
    }

    fn execute_persist(&mut self, plan: &PersistPlan) -> CoreResult<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }
        if !plan.auto_tx {
            return self.dispatch_persist(&plan.actions, plan.for_query());
        }
        let info = auto_transaction_info();
        self.driver.begin_transaction(&info)?;
        let result = self
            .driver
            .persist(&plan.actions, plan.for_query())
            .and_then(|()| self.driver.commit_transaction(&info));
        match result {
            Ok(()) => Ok(()),
            Err(err) => match self.driver.rollback_transaction(&info) {
                Ok(()) => Err(err),
                Err(rollback) => Err(self.rollback_failure(err, rollback)),
            },
        }
    }

    async fn execute_persist_async(&mut self, plan: &PersistPlan, cancel: &CancellationToken) -> CoreResult<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }
        if self.disconnected.is_some() {
            return self.dispatch_persist(&plan.actions, plan.for_query());
        }
        if !plan.auto_tx {
            self.check_timeout()?;
            return cancellable(cancel, self.driver.persist_async(&plan.actions, plan.for_query())).await;
        }
        let info = auto_transaction_info();
        cancellable(cancel, self.driver.begin_transaction_async(&info)).await?;
        let mut result = cancellable(cancel, self.driver.persist_async(&plan.actions, plan.for_query())).await;
        if result.is_ok() {
            result = cancellable(cancel, self.driver.commit_transaction_async(&info)).await;
        }
        match result {
            Ok(()) => Ok(()),
            Err(err) => match self.driver.rollback_transaction_async(&info).await {
                Ok(()) => Err(err),
                Err(rollback) => Err(self.rollback_failure(err, rollback)),
            },
        }
    }

    pub(crate) fn dispatch_persist(&mut self, actions: &[PersistAction], for_query: bool) -> CoreResult<()> {
        match self.disconnected.as_mut() {
            Some(state) => state.persist_actions(actions, &mut self.driver),
            None => {
                self.check_timeout()?;
                self.driver.persist(actions, for_query)
            }
        }
    }

    fn finish_persist(&mut self, plan: PersistPlan, result: CoreResult<()>) -> CoreResult<KeyMapping> {
        self.is_persisting = false;
        match result {
            Ok(()) => {
                let token = self.current_token();
                let mut written = Vec::new();
                for (key, state) in &plan.persisted {
                    self.registry.remove(key);
                    if *state == PersistenceState::Removed {
                        self.cache.remove(key);
                        continue;
                    }
                    if let Some(cached) = self.cache.get_mut(key) {
                        if let Some(tuple) = cached.tuple_mut() {
                            tuple.drop_backup();
                        }
                        cached.set_persistence_state(PersistenceState::Synchronized);
                        cached.set_token(token.clone());
                    }
                    written.push(key.clone());
                }
                for (owner, field) in &plan.sets {
                    if let Some(set) = self.entity_sets.get_mut(&(owner.clone(), field.clone())) {
                        set.confirm(token.clone());
                    }
                    self.set_registry.remove(owner, field);
                }
                if let Some(tx) = self.transactions.last_mut() {
                    tx.touch(written);
                }
                let count = plan.persisted.len();
                debug!(reason = ?plan.reason, count, "flush complete");
                self.publish(SessionEvent::Persisted {
                    reason: plan.reason,
                    count,
                });
                Ok(plan.mapping)
            }
            Err(err) => {
                for (owner, field) in &plan.sets {
                    if let Some(set) = self.entity_sets.get_mut(&(owner.clone(), field.clone())) {
                        set.restore_changes();
                    }
                }
                for (key, state) in &plan.persisted {
                    if *state == PersistenceState::Removed {
                        continue;
                    }
                    if let Some(tuple) = self.cache.get_mut(key).and_then(|s| s.tuple_mut()) {
                        tuple.restore_difference();
                    }
                }
                if !self.config.non_transactional_entity_states {
                    if let Some(tx) = self.transactions.last_mut() {
                        tx.doom();
                    }
                }
                warn!(reason = ?plan.reason, error = %err, "flush failed; pending changes restored");
                Err(err)
            }
        }
    }
}
