//! Session event bus.
//!
//! Observers subscribe on one of two channels. The system channel is used by
//! engine components (operation capture, wrapper refresh); the user channel is
//! for application code. Dispatch is synchronous and ordered: all matching
//! system subscribers in subscription order, then all matching user
//! subscribers in subscription order.

use crate::operation::{KeyMapping, Operation};
use crate::session::PersistReason;
use crate::types::TransactionId;
use ormkit_types::{Key, Value};
use std::fmt;
use tracing::trace;

/// Subscription channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Engine-internal observers.
    System,
    /// Application observers.
    User,
}

/// Discriminant of a [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An operation was registered.
    OperationRegistering,
    /// An entity was created.
    EntityCreated,
    /// A field was written.
    FieldSet,
    /// An entity is about to be removed.
    EntityRemoving,
    /// An entity was removed.
    EntityRemoved,
    /// An item was added to an entity set.
    EntitySetItemAdded,
    /// An item was removed from an entity set.
    EntitySetItemRemoved,
    /// Temporary keys were replaced.
    KeysRemapped,
    /// A flush is starting.
    Persisting,
    /// A flush completed.
    Persisted,
    /// A transaction was opened.
    TransactionOpened,
    /// A transaction committed.
    TransactionCommitted,
    /// A transaction rolled back.
    TransactionRolledBack,
}

/// An event published by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An operation is registered. Sent once the outermost call that
    /// contains it succeeded; operations of failed calls are never sent.
    OperationRegistering {
        /// The operation.
        operation: Operation,
        /// Nesting depth (0 = outermost).
        depth: usize,
        /// Whether the operation is implemented through nested operations.
        composite: bool,
    },
    /// An entity was created.
    EntityCreated {
        /// The new entity.
        key: Key,
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
    /// An entity is about to be removed.
    EntityRemoving {
        /// The entity.
        key: Key,
    },
    /// An entity was removed.
    EntityRemoved {
        /// The entity.
        key: Key,
    },
    /// An item was added to an entity set.
    EntitySetItemAdded {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Added item.
        item: Key,
    },
    /// An item was removed from an entity set.
    EntitySetItemRemoved {
        /// Set owner.
        owner: Key,
        /// Set field.
        field: String,
        /// Removed item.
        item: Key,
    },
    /// Temporary keys were replaced.
    KeysRemapped {
        /// The applied mapping.
        mapping: KeyMapping,
    },
    /// A flush is starting.
    Persisting {
        /// Why.
        reason: PersistReason,
    },
    /// A flush completed.
    Persisted {
        /// Why.
        reason: PersistReason,
        /// Number of entities written.
        count: usize,
    },
    /// A transaction was opened.
    TransactionOpened {
        /// The transaction.
        id: TransactionId,
        /// Whether it is a savepoint.
        nested: bool,
    },
    /// A transaction committed.
    TransactionCommitted {
        /// The transaction.
        id: TransactionId,
    },
    /// A transaction rolled back.
    TransactionRolledBack {
        /// The transaction.
        id: TransactionId,
    },
}

impl SessionEvent {
    /// Returns the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OperationRegistering { .. } => EventKind::OperationRegistering,
            Self::EntityCreated { .. } => EventKind::EntityCreated,
            Self::FieldSet { .. } => EventKind::FieldSet,
            Self::EntityRemoving { .. } => EventKind::EntityRemoving,
            Self::EntityRemoved { .. } => EventKind::EntityRemoved,
            Self::EntitySetItemAdded { .. } => EventKind::EntitySetItemAdded,
            Self::EntitySetItemRemoved { .. } => EventKind::EntitySetItemRemoved,
            Self::KeysRemapped { .. } => EventKind::KeysRemapped,
            Self::Persisting { .. } => EventKind::Persisting,
            Self::Persisted { .. } => EventKind::Persisted,
            Self::TransactionOpened { .. } => EventKind::TransactionOpened,
            Self::TransactionCommitted { .. } => EventKind::TransactionCommitted,
            Self::TransactionRolledBack { .. } => EventKind::TransactionRolledBack,
        }
    }

    /// Returns the entity the event is about, if any.
    #[must_use]
    pub fn key(&self) -> Option<&Key> {
        match self {
            Self::EntityCreated { key }
            | Self::FieldSet { key, .. }
            | Self::EntityRemoving { key }
            | Self::EntityRemoved { key } => Some(key),
            Self::EntitySetItemAdded { owner, .. } | Self::EntitySetItemRemoved { owner, .. } => {
                Some(owner)
            }
            Self::OperationRegistering { operation, .. } => operation.target(),
            _ => None,
        }
    }
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kind: Option<EventKind>,
    key: Option<Key>,
}

impl EventFilter {
    /// Matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches one event kind.
    #[must_use]
    pub fn kind(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            key: None,
        }
    }

    /// Restricts the filter to events about `key`.
    #[must_use]
    pub fn for_key(mut self, key: Key) -> Self {
        self.key = Some(key);
        self
    }

    /// Returns true if `event` passes the filter.
    #[must_use]
    pub fn matches(&self, event: &SessionEvent) -> bool {
        if self.kind.is_some_and(|k| k != event.kind()) {
            return false;
        }
        match &self.key {
            Some(key) => event.key() == Some(key),
            None => true,
        }
    }
}

/// Callback receiving events.
pub type EventHandler = Box<dyn FnMut(&SessionEvent) + Send>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

/// Ordered observer lists for the two channels.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    system: Vec<Subscriber>,
    user: Vec<Subscriber>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("system", &self.system.len())
            .field("user", &self.user.len())
            .finish()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn subscribe(&mut self, channel: Channel, filter: EventFilter, handler: EventHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let subscriber = Subscriber { id, filter, handler };
        trace!(subscription = id.0, ?channel, "event subscriber added");
        match channel {
            Channel::System => self.system.push(subscriber),
            Channel::User => self.user.push(subscriber),
        }
        id
    }

    /// Removes a subscriber. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.system.len() + self.user.len();
        self.system.retain(|s| s.id != id);
        self.user.retain(|s| s.id != id);
        let removed = before != self.system.len() + self.user.len();
        if removed {
            trace!(subscription = id.0, "event subscriber removed");
        }
        removed
    }

    /// Returns true if any subscriber may receive events of `kind`.
    #[must_use]
    pub fn is_observed(&self, kind: EventKind) -> bool {
        self.system
            .iter()
            .chain(self.user.iter())
            .any(|s| s.filter.kind.map_or(true, |k| k == kind))
    }

    /// Dispatches an event: system channel first, then user channel.
    pub fn publish(&mut self, event: &SessionEvent) {
        for subscriber in self.system.iter_mut().chain(self.user.iter_mut()) {
            if subscriber.filter.matches(event) {
                (subscriber.handler)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkit_types::{EntityTypeId, TypeReference};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn key(n: i64) -> Key {
        let t = TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1));
        Key::new(t, vec![Value::Int(n)]).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        Box::new(move |e: &SessionEvent| log.lock().push(format!("{tag}:{:?}", e.kind())))
    }

    #[test]
    fn system_before_user_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(Channel::User, EventFilter::all(), recorder(&log, "u1"));
        bus.subscribe(Channel::System, EventFilter::all(), recorder(&log, "s1"));
        bus.subscribe(Channel::User, EventFilter::all(), recorder(&log, "u2"));
        bus.subscribe(Channel::System, EventFilter::all(), recorder(&log, "s2"));

        bus.publish(&SessionEvent::EntityCreated { key: key(1) });
        let seen = log.lock().clone();
        assert_eq!(
            seen,
            vec![
                "s1:EntityCreated",
                "s2:EntityCreated",
                "u1:EntityCreated",
                "u2:EntityCreated"
            ]
        );
    }

    #[test]
    fn filters_by_kind_and_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(
            Channel::User,
            EventFilter::kind(EventKind::EntityRemoved).for_key(key(2)),
            recorder(&log, "u"),
        );
        bus.publish(&SessionEvent::EntityRemoved { key: key(1) });
        bus.publish(&SessionEvent::EntityCreated { key: key(2) });
        bus.publish(&SessionEvent::EntityRemoved { key: key(2) });
        assert_eq!(log.lock().len(), 1);
        assert!(bus.is_observed(EventKind::EntityRemoved));
        assert!(!bus.is_observed(EventKind::FieldSet));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let id = bus.subscribe(Channel::System, EventFilter::all(), recorder(&log, "s"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&SessionEvent::EntityCreated { key: key(1) });
        assert!(log.lock().is_empty());
    }
}
