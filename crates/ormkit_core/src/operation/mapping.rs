//! Temporary-to-final key mapping.

use ormkit_types::Key;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mapping from temporary keys to their final keys, produced by one flush or replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(Key, Key)>", into = "Vec<(Key, Key)>")]
pub struct KeyMapping {
    map: HashMap<Key, Key>,
}

impl KeyMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    pub fn insert(&mut self, from: Key, to: Key) {
        self.map.insert(from, to);
    }

    /// Returns the final key for `key`, if mapped.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Key> {
        self.map.get(key)
    }

    /// Returns the final key for `key`, or `key` itself.
    #[must_use]
    pub fn resolve(&self, key: &Key) -> Key {
        self.map.get(key).cloned().unwrap_or_else(|| key.clone())
    }

    /// Returns true if `key` is mapped.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over `(from, to)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Key)> {
        self.map.iter()
    }

    /// Lookup closure for the `remap_keys` family of methods.
    pub fn lookup(&self) -> impl Fn(&Key) -> Option<Key> + '_ {
        move |k| self.map.get(k).cloned()
    }

    /// Follows this mapping, then `next`.
    ///
    /// Entries of `next` that are not reachable from this mapping are kept too.
    #[must_use]
    pub fn then(&self, next: &KeyMapping) -> KeyMapping {
        let mut composed = KeyMapping::new();
        for (from, to) in &self.map {
            composed.insert(from.clone(), next.resolve(to));
        }
        for (from, to) in &next.map {
            if !composed.map.contains_key(from) {
                composed.insert(from.clone(), to.clone());
            }
        }
        composed
    }
}

impl From<Vec<(Key, Key)>> for KeyMapping {
    fn from(entries: Vec<(Key, Key)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }
}

impl From<KeyMapping> for Vec<(Key, Key)> {
    fn from(mapping: KeyMapping) -> Self {
        mapping.map.into_iter().collect()
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

    #[test]
    fn resolve_falls_back_to_input() {
        let mut m = KeyMapping::new();
        m.insert(key(-1), key(5));
        assert_eq!(m.resolve(&key(-1)), key(5));
        assert_eq!(m.resolve(&key(7)), key(7));
    }

    #[test]
    fn composition_follows_chains() {
        let mut first = KeyMapping::new();
        first.insert(key(-1), key(-10));
        let mut second = KeyMapping::new();
        second.insert(key(-10), key(3));
        second.insert(key(-20), key(4));

        let composed = first.then(&second);
        assert_eq!(composed.get(&key(-1)), Some(&key(3)));
        assert_eq!(composed.get(&key(-20)), Some(&key(4)));
        assert_eq!(composed.get(&key(-10)), Some(&key(3)));
        assert_eq!(composed.len(), 3);
    }
}
