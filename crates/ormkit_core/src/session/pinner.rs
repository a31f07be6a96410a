//! Deferral of pinned entities during a flush.

use crate::entity::PersistenceState;
use crate::operation::KeyMapping;
use ormkit_types::Key;
use std::collections::HashSet;

/// A pending change as seen by the pinner.
#[derive(Debug, Clone)]
pub struct ChangeItem {
    /// The entity.
    pub key: Key,
    /// Its pending state.
    pub state: PersistenceState,
    /// Entities its current row references.
    pub references: Vec<Key>,
}

/// Outcome of [`Pinner::process`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinnerResult {
    /// Changes that can be flushed, in input order.
    pub persistable: Vec<Key>,
    /// Changes that must wait, in input order.
    pub pinned: Vec<Key>,
}

/// Explicitly pinned entities.
///
/// A pinned new entity holds back every change that references it, since
/// flushing those would store a reference to a row that does not exist yet.
#[derive(Debug, Default)]
pub struct Pinner {
    pins: HashSet<Key>,
}

impl Pinner {
    /// Creates a pinner with no pins.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `key`.
    pub fn pin(&mut self, key: Key) {
        self.pins.insert(key);
    }

    /// Unpins `key`.
    pub fn unpin(&mut self, key: &Key) -> bool {
        self.pins.remove(key)
    }

    /// Returns true if `key` is pinned.
    #[must_use]
    pub fn is_pinned(&self, key: &Key) -> bool {
        self.pins.contains(key)
    }

    /// Returns true if nothing is pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Splits `items` into persistable and pinned changes.
    #[must_use]
    pub fn process(&self, items: &[ChangeItem]) -> PinnerResult {
        if self.pins.is_empty() {
            return PinnerResult {
                persistable: items.iter().map(|i| i.key.clone()).collect(),
                pinned: Vec::new(),
            };
        }

        let mut pinned: HashSet<&Key> = items
            .iter()
            .filter(|i| self.pins.contains(&i.key))
            .map(|i| &i.key)
            .collect();
        let mut blocking: HashSet<&Key> = items
            .iter()
            .filter(|i| pinned.contains(&i.key) && i.state == PersistenceState::New)
            .map(|i| &i.key)
            .collect();

        loop {
            let mut changed = false;
            for item in items {
                if pinned.contains(&item.key) {
                    continue;
                }
                if item.references.iter().any(|r| blocking.contains(r)) {
                    pinned.insert(&item.key);
                    if item.state == PersistenceState::New {
                        blocking.insert(&item.key);
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let (pinned_items, persistable): (Vec<&ChangeItem>, Vec<&ChangeItem>) =
            items.iter().partition(|i| pinned.contains(&i.key));
        PinnerResult {
            persistable: persistable.into_iter().map(|i| i.key.clone()).collect(),
            pinned: pinned_items.into_iter().map(|i| i.key.clone()).collect(),
        }
    }

    /// Rewrites pins through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        self.pins = self.pins.drain().map(|k| mapping.resolve(&k)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkit_types::{EntityTypeId, TypeReference, Value};

    fn key(n: i64) -> Key {
        let t = TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1));
        Key::new(t, vec![Value::Int(n)]).unwrap()
    }

    fn item(n: i64, state: PersistenceState, refs: &[i64]) -> ChangeItem {
        ChangeItem {
            key: key(n),
            state,
            references: refs.iter().map(|&r| key(r)).collect(),
        }
    }

    #[test]
    fn no_pins_everything_persists() {
        let pinner = Pinner::new();
        let result = pinner.process(&[item(1, PersistenceState::New, &[])]);
        assert_eq!(result.persistable, vec![key(1)]);
        assert!(result.pinned.is_empty());
    }

    #[test]
    fn pins_propagate_through_new_references() {
        let mut pinner = Pinner::new();
        pinner.pin(key(1));
        let items = [
            item(1, PersistenceState::New, &[]),
            item(2, PersistenceState::New, &[1]),
            item(3, PersistenceState::Modified, &[2]),
            item(4, PersistenceState::Modified, &[]),
        ];
        let result = pinner.process(&items);
        assert_eq!(result.pinned, vec![key(1), key(2), key(3)]);
        assert_eq!(result.persistable, vec![key(4)]);
    }

    #[test]
    fn pinned_modified_entity_does_not_block_referrers() {
        let mut pinner = Pinner::new();
        pinner.pin(key(1));
        let items = [item(1, PersistenceState::Modified, &[]), item(2, PersistenceState::New, &[1])];
        let result = pinner.process(&items);
        assert_eq!(result.pinned, vec![key(1)]);
        assert_eq!(result.persistable, vec![key(2)]);
    }

    #[test]
    fn remap_moves_pins() {
        let mut pinner = Pinner::new();
        pinner.pin(key(-1));
        pinner.remap_keys(&KeyMapping::from(vec![(key(-1), key(7))]));
        assert!(pinner.is_pinned(&key(7)));
        assert!(!pinner.unpin(&key(-1)));
    }
}
