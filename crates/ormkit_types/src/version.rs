//! Optimistic-concurrency version fingerprints.

use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A comparable version fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VersionInfo {
    /// No version tracking.
    #[default]
    Void,
    /// Values of the version columns, in declaration order.
    Values(Vec<Value>),
}

impl VersionInfo {
    /// Builds a version from column values. An empty list is [`VersionInfo::Void`].
    #[must_use]
    pub fn from_values(values: Vec<Value>) -> Self {
        if values.is_empty() {
            Self::Void
        } else {
            Self::Values(values)
        }
    }

    /// Returns true for [`VersionInfo::Void`].
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Returns the version values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Void => &[],
            Self::Values(v) => v,
        }
    }

    /// Concatenates two versions; `Void` is the neutral element.
    #[must_use]
    pub fn combine(&self, other: &VersionInfo) -> VersionInfo {
        match (self, other) {
            (Self::Void, v) | (v, Self::Void) => v.clone(),
            (Self::Values(a), Self::Values(b)) => {
                Self::Values(a.iter().chain(b.iter()).cloned().collect())
            }
        }
    }

    /// Returns true if `self`, taken as the recorded version, rejects
    /// `incoming`: a tracked version conflicts with anything else, including
    /// `Void`. A `Void` record never conflicts.
    #[must_use]
    pub fn conflicts_with(&self, incoming: &VersionInfo) -> bool {
        !self.is_void() && self != incoming
    }

    /// SHA-256 fingerprint of the version values.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for value in self.values() {
            feed(&mut hasher, value);
        }
        hasher.finalize().into()
    }

    /// Rewrites references held in version values.
    #[must_use]
    pub fn remap_keys(&self, map: impl Fn(&Key) -> Option<Key>) -> Option<VersionInfo> {
        let Self::Values(values) = self else {
            return None;
        };
        let mut changed = false;
        let remapped = values
            .iter()
            .map(|v| match v.map_key(&map) {
                Some(mapped) => {
                    changed = true;
                    mapped
                }
                None => v.clone(),
            })
            .collect();
        changed.then_some(Self::Values(remapped))
    }
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Int(n) => {
            hasher.update([2u8]);
            hasher.update(n.to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update([3u8]);
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update([4u8]);
            hasher.update((b.len() as u64).to_be_bytes());
            hasher.update(b);
        }
        Value::Uuid(u) => {
            hasher.update([5u8]);
            hasher.update(u.as_bytes());
        }
        Value::Ref(key) => {
            hasher.update([6u8]);
            hasher.update(key.type_ref().hierarchy_root().as_u32().to_be_bytes());
            hasher.update((key.values().len() as u64).to_be_bytes());
            for v in key.values() {
                feed(hasher, v);
            }
        }
    }
}

/// Key → version map used for optimistic-concurrency validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<(Key, VersionInfo)>", into = "Vec<(Key, VersionInfo)>")]
pub struct VersionSet {
    versions: HashMap<Key, VersionInfo>,
}

impl VersionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded version, if any.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&VersionInfo> {
        self.versions.get(key)
    }

    /// Returns true if a version is recorded for `key`.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.versions.contains_key(key)
    }

    /// Records a version, replacing any previous one.
    pub fn set(&mut self, key: Key, version: VersionInfo) {
        self.versions.insert(key, version);
    }

    /// Forgets the version of `key`.
    pub fn remove(&mut self, key: &Key) -> Option<VersionInfo> {
        self.versions.remove(key)
    }

    /// Returns true if the recorded version (if any) agrees with `version`.
    #[must_use]
    pub fn is_valid(&self, key: &Key, version: &VersionInfo) -> bool {
        self.versions
            .get(key)
            .map_or(true, |recorded| !recorded.conflicts_with(version))
    }

    /// Number of recorded versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns true if no version is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &VersionInfo)> {
        self.versions.iter()
    }

    /// Moves entries of remapped keys and rewrites references in values.
    pub fn remap_keys(&mut self, map: impl Fn(&Key) -> Option<Key>) {
        let old = std::mem::take(&mut self.versions);
        for (key, version) in old {
            let key = map(&key).unwrap_or(key);
            let version = version.remap_keys(&map).unwrap_or(version);
            self.versions.insert(key, version);
        }
    }

    /// Copies every entry of `other` into this set.
    pub fn extend(&mut self, other: &VersionSet) {
        for (k, v) in &other.versions {
            self.versions.insert(k.clone(), v.clone());
        }
    }
}

impl From<Vec<(Key, VersionInfo)>> for VersionSet {
    fn from(entries: Vec<(Key, VersionInfo)>) -> Self {
        Self {
            versions: entries.into_iter().collect(),
        }
    }
}

impl From<VersionSet> for Vec<(Key, VersionInfo)> {
    fn from(set: VersionSet) -> Self {
        set.versions.into_iter().collect()
    }
}
