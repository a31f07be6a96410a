//! The unit of work.
//!
//! A [`Session`] owns the identity map, the change registries, the
//! transaction stack and the event bus. It is single-owner: every operation
//! takes `&mut self`, and async operations must not be interleaved.

mod attach;
mod fetch;
mod fields;
mod persist;
mod pinner;
mod remap;
mod transactions;
mod validation;

pub use pinner::{ChangeItem, Pinner, PinnerResult};
pub use remap::KeyRemapper;

use crate::config::SessionConfig;
use crate::disconnected::DisconnectedState;
use crate::domain::Domain;
use crate::entity::{EntityObject, EntitySetState, EntityState, PersistenceState};
use crate::error::{CoreError, CoreResult};
use crate::events::{Channel, EventBus, EventFilter, EventKind, SessionEvent, SubscriptionId};
use crate::operation::{KeyMapping, Operation};
use crate::registry::{ChangeRegistry, EntitySetChangeRegistry};
use crate::storage::StorageDriver;
use crate::transaction::{LifetimeToken, Transaction};
use crate::types::TransactionId;
use ormkit_types::Key;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Why a flush runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistReason {
    /// Requested by the application.
    Manual,
    /// Before a query reads the store.
    Query,
    /// Before a transaction commits.
    Commit,
    /// Before a nested transaction opens.
    NestedTransaction,
    /// The change registry reached its size limit.
    ChangeRegistrySizeLimit,
    /// Key remapping needs the store's view.
    RemapEntityKeys,
    /// Anything else.
    Other,
}

/// An operation whose call has not returned yet.
#[derive(Debug)]
struct PendingOperation {
    operation: Operation,
    depth: usize,
    composite: bool,
}

/// A unit of work over one storage driver.
pub struct Session<D: StorageDriver> {
    id: Uuid,
    domain: Arc<Domain>,
    config: SessionConfig,
    driver: D,
    cache: HashMap<Key, EntityState>,
    registry: ChangeRegistry,
    set_registry: EntitySetChangeRegistry,
    entity_sets: HashMap<(Key, String), EntitySetState>,
    pinner: Pinner,
    events: EventBus,
    transactions: Vec<Transaction>,
    operation_depth: usize,
    pending_operations: Vec<Vec<PendingOperation>>,
    is_persisting: bool,
    identifiers: HashMap<String, Key>,
    disconnected: Option<DisconnectedState>,
    next_tx_id: u64,
}

impl<D: StorageDriver> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cached", &self.cache.len())
            .field("pending", &self.registry.len())
            .field("transactions", &self.transactions.len())
            .field("disconnected", &self.disconnected.is_some())
            .finish_non_exhaustive()
    }
}

impl<D: StorageDriver> Session<D> {
    /// Opens a session. Usually called through [`Domain::open_session`].
    pub fn new(domain: Arc<Domain>, driver: D, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            config,
            driver,
            cache: HashMap::new(),
            registry: ChangeRegistry::new(),
            set_registry: EntitySetChangeRegistry::new(),
            entity_sets: HashMap::new(),
            pinner: Pinner::new(),
            events: EventBus::new(),
            transactions: Vec::new(),
            operation_depth: 0,
            pending_operations: Vec::new(),
            is_persisting: false,
            identifiers: HashMap::new(),
            disconnected: None,
            next_tx_id: 0,
        }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The owning domain.
    #[must_use]
    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The storage driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable access to the storage driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The cached state for `key`, without fetching.
    #[must_use]
    pub fn entity_state(&self, key: &Key) -> Option<&EntityState> {
        self.cache.get(key)
    }

    /// Number of cached states.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Pending entity changes.
    #[must_use]
    pub fn change_registry(&self) -> &ChangeRegistry {
        &self.registry
    }

    /// Entity sets with pending membership changes.
    #[must_use]
    pub fn entity_set_registry(&self) -> &EntitySetChangeRegistry {
        &self.set_registry
    }

    /// Returns true while a flush is running.
    #[must_use]
    pub fn is_persisting(&self) -> bool {
        self.is_persisting
    }

    /// The attached disconnected state.
    #[must_use]
    pub fn disconnected(&self) -> Option<&DisconnectedState> {
        self.disconnected.as_ref()
    }

    /// Mutable access to the attached disconnected state, e.g. to connect it.
    pub fn disconnected_mut(&mut self) -> Option<&mut DisconnectedState> {
        self.disconnected.as_mut()
    }

    /// Subscribes to session events.
    pub fn subscribe(
        &mut self,
        channel: Channel,
        filter: EventFilter,
        handler: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(channel, filter, Box::new(handler))
    }

    /// Removes a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Binds an application identifier to an entity.
    pub fn assign_identifier(&mut self, key: &Key, identifier: &str) -> CoreResult<()> {
        let key = self.live_key(key)?;
        let op = Operation::IdentifierAssign {
            key: key.clone(),
            identifier: identifier.to_owned(),
        };
        self.within_operation(op, false, |s| {
            s.identifiers.insert(identifier.to_owned(), key);
            Ok(())
        })
    }

    /// The entity bound to `identifier`.
    #[must_use]
    pub fn identified(&self, identifier: &str) -> Option<&Key> {
        self.identifiers.get(identifier)
    }

    /// Pins an entity so flushes skip it (and entities that need it).
    pub fn pin(&mut self, key: &Key) {
        self.pinner.pin(key.clone());
    }

    /// Unpins an entity. Returns false if it was not pinned.
    pub fn unpin(&mut self, key: &Key) -> bool {
        self.pinner.unpin(key)
    }

    /// Returns true if `key` is explicitly pinned.
    #[must_use]
    pub fn is_pinned(&self, key: &Key) -> bool {
        self.pinner.is_pinned(key)
    }

    /// The live wrapper for a cached entity, creating one if needed.
    pub fn entity_object(&mut self, key: &Key) -> CoreResult<Arc<EntityObject>> {
        let state = self
            .cache
            .get_mut(key)
            .ok_or_else(|| CoreError::EntityNotFound { key: key.clone() })?;
        if let Some(wrapper) = state.wrapper() {
            return Ok(wrapper);
        }
        let wrapper = Arc::new(EntityObject::new(state.key().clone()));
        state.bind_wrapper(&wrapper);
        Ok(wrapper)
    }

    /// Creates or reuses the state for `key` as a new entity.
    ///
    /// A cached removed or absent state is reused. A live state is returned
    /// unchanged, or rejected with [`CoreError::IdentityConflict`] when
    /// `fail_if_bound` is set.
    pub fn create_entity_state(&mut self, key: &Key, fail_if_bound: bool) -> CoreResult<()> {
        self.ensure_can_change()?;
        let info = self.domain.model().type_info(key.type_id())?;
        let fresh = info.new_tuple();
        let token = self.current_token();

        let live = self
            .cache
            .get(key)
            .map(|s| !s.is_removed() && s.tuple().is_some());
        match live {
            Some(true) if fail_if_bound => Err(CoreError::IdentityConflict { key: key.clone() }),
            Some(true) => Ok(()),
            Some(false) if self.registry.state_of(key) == Some(PersistenceState::Removed) => {
                // The stored row still exists: overwrite it instead of inserting.
                if let Some(state) = self.cache.get_mut(key) {
                    match state.tuple_mut() {
                        Some(tuple) => {
                            for (slot, value) in fresh.available() {
                                tuple.set(slot, value.clone())?;
                            }
                        }
                        None => state.reset(fresh, PersistenceState::Modified, token),
                    }
                }
                self.mark(key, PersistenceState::Modified);
                Ok(())
            }
            Some(false) => {
                if let Some(state) = self.cache.get_mut(key) {
                    state.reset(fresh, PersistenceState::New, token);
                }
                self.mark(key, PersistenceState::New);
                Ok(())
            }
            None => {
                self.cache.insert(
                    key.clone(),
                    EntityState::new(key.clone(), Some(fresh), PersistenceState::New, token),
                );
                self.mark(key, PersistenceState::New);
                Ok(())
            }
        }
    }

    /// Merges fetched data into the cache, creating a synchronized state if
    /// none exists. `None` records the row as absent.
    pub fn update_state_in_cache(
        &mut self,
        key: &Key,
        tuple: Option<ormkit_types::Tuple>,
        is_stale: bool,
    ) -> CoreResult<()> {
        let key = if tuple.is_some() && !key.is_exact() {
            self.domain
                .resolve_key(key)
                .ok_or_else(|| CoreError::internal(format!("cannot resolve the exact type of {key}")))?
        } else {
            key.clone()
        };
        let token = self.current_token();
        match self.cache.get_mut(&key) {
            Some(state) => {
                state.update(tuple, token)?;
                state.set_stale(is_stale);
            }
            None => {
                let mut state = EntityState::new(key.clone(), tuple, PersistenceState::Synchronized, token);
                state.set_stale(is_stale);
                self.cache.insert(key.clone(), state);
            }
        }
        self.domain.remember_key(&key);
        Ok(())
    }

    /// Sets a cached state's persistence state and registers the change.
    pub(crate) fn mark(&mut self, key: &Key, state: PersistenceState) {
        if let Some(cached) = self.cache.get_mut(key) {
            cached.set_persistence_state(state);
        }
        self.registry.register(key.clone(), state);
    }

    /// Flushes eagerly once the change registry reached its limit.
    ///
    /// Runs only at the start of an outermost operation; returns the key
    /// mapping of that flush so callers can resolve their arguments.
    pub(crate) fn check_registry_limit(&mut self) -> CoreResult<KeyMapping> {
        if self.operation_depth > 0
            || self.is_persisting
            || self.registry.len() < self.config.entity_change_registry_size
        {
            return Ok(KeyMapping::new());
        }
        tracing::debug!(
            pending = self.registry.len(),
            limit = self.config.entity_change_registry_size,
            "change registry limit reached"
        );
        self.persist(PersistReason::ChangeRegistrySizeLimit)
    }

    pub(crate) fn ensure_can_change(&self) -> CoreResult<()> {
        let in_transaction = self.transactions.last().is_some_and(Transaction::is_active);
        if in_transaction || self.config.non_transactional_entity_states || self.disconnected.is_some() {
            Ok(())
        } else {
            Err(CoreError::TransactionRequired)
        }
    }

    /// Runs `f` one nesting level deeper and registers `op` once it succeeds.
    ///
    /// Operations stay pending until the outermost call returns `Ok`; a
    /// failure anywhere drops them together with everything nested inside.
    pub(crate) fn within_operation<T>(
        &mut self,
        op: Operation,
        composite: bool,
        f: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let depth = self.operation_depth;
        self.pending_operations.push(vec![PendingOperation {
            operation: op,
            depth,
            composite,
        }]);
        self.operation_depth += 1;
        let result = f(self);
        self.operation_depth -= 1;
        let frame = self.pending_operations.pop().unwrap_or_default();
        let value = result?;
        match self.pending_operations.last_mut() {
            Some(parent) => parent.extend(frame),
            None => self.register_operations(frame)?,
        }
        Ok(value)
    }

    fn register_operations(&mut self, frame: Vec<PendingOperation>) -> CoreResult<()> {
        for pending in frame {
            if let Some(state) = self.disconnected.as_mut() {
                state.record(&pending.operation, pending.depth, pending.composite)?;
            }
            if self.events.is_observed(EventKind::OperationRegistering) {
                self.events.publish(&SessionEvent::OperationRegistering {
                    operation: pending.operation,
                    depth: pending.depth,
                    composite: pending.composite,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        if self.events.is_observed(event.kind()) {
            self.events.publish(&event);
        }
    }

    pub(crate) fn current_token(&self) -> Option<LifetimeToken> {
        self.transactions.last().map(|t| t.token().clone())
    }

    /// Drops every cached state and pending change.
    pub(crate) fn reset_cache(&mut self) {
        self.cache.clear();
        self.entity_sets.clear();
        self.registry.clear();
        self.set_registry.clear();
    }

    /// Combines a failure with the failure of the rollback it triggered.
    pub(crate) fn rollback_failure(&self, original: CoreError, rollback: CoreError) -> CoreError {
        if self.config.suppress_rollback_exceptions {
            warn!(error = %original, rollback_error = %rollback, "rollback after failure also failed");
            original
        } else {
            CoreError::RollbackFailed {
                original: Box::new(original),
                rollback: Box::new(rollback),
            }
        }
    }

    /// Returns true if `id` is on the transaction stack.
    #[must_use]
    pub fn is_open(&self, id: TransactionId) -> bool {
        self.transactions.iter().any(|t| t.id() == id)
    }
}

/// Races `fut` against `cancel`. A cancelled token wins ties.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        result = fut => result,
    }
}
