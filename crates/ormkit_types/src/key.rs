//! Entity identity.

use crate::error::{TypesError, TypesResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Identifier of a persistent type in the domain model.
///
/// Type IDs are stable and assigned when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityTypeId(pub u32);

impl EntityTypeId {
    /// Creates a new type ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type:{}", self.0)
    }
}

/// How precisely a key knows the type of the entity it identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeAccuracy {
    /// The exact type is known.
    Exact,
    /// Only the hierarchy is known; the exact type is resolved lazily.
    Hierarchy,
}

/// Type reference carried by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeReference {
    type_id: EntityTypeId,
    hierarchy_root: EntityTypeId,
    accuracy: TypeAccuracy,
}

impl TypeReference {
    /// A reference to an exactly known type.
    #[must_use]
    pub const fn exact(type_id: EntityTypeId, hierarchy_root: EntityTypeId) -> Self {
        Self {
            type_id,
            hierarchy_root,
            accuracy: TypeAccuracy::Exact,
        }
    }

    /// A reference to "some type of this hierarchy".
    #[must_use]
    pub const fn hierarchy(hierarchy_root: EntityTypeId) -> Self {
        Self {
            type_id: hierarchy_root,
            hierarchy_root,
            accuracy: TypeAccuracy::Hierarchy,
        }
    }

    /// Returns the (possibly approximate) type ID.
    #[must_use]
    pub const fn type_id(&self) -> EntityTypeId {
        self.type_id
    }

    /// Returns the hierarchy root.
    #[must_use]
    pub const fn hierarchy_root(&self) -> EntityTypeId {
        self.hierarchy_root
    }

    /// Returns the accuracy.
    #[must_use]
    pub const fn accuracy(&self) -> TypeAccuracy {
        self.accuracy
    }

    /// Returns true if the exact type is known.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.accuracy == TypeAccuracy::Exact
    }

    /// Accuracy-aware comparison.
    ///
    /// Two exact references must name the same type; as soon as one side
    /// is a hierarchy reference only the hierarchy roots are compared.
    #[must_use]
    pub fn matches(&self, other: &TypeReference) -> bool {
        if self.is_exact() && other.is_exact() {
            self.type_id == other.type_id
        } else {
            self.hierarchy_root == other.hierarchy_root
        }
    }
}

struct KeyInner {
    type_ref: TypeReference,
    values: Box<[Value]>,
    temporary: bool,
    hash: OnceLock<u64>,
}

/// Immutable entity identity: a type reference plus key values.
///
/// Cloning is cheap. The hash is computed on first use and cached.
#[derive(Clone)]
pub struct Key {
    inner: Arc<KeyInner>,
}

impl Key {
    /// Creates a key with final (store-assigned or natural) values.
    pub fn new(type_ref: TypeReference, values: Vec<Value>) -> TypesResult<Self> {
        Self::build(type_ref, values, false)
    }

    /// Creates a temporary key awaiting its final value.
    pub fn temporary(type_ref: TypeReference, values: Vec<Value>) -> TypesResult<Self> {
        Self::build(type_ref, values, true)
    }

    fn build(type_ref: TypeReference, values: Vec<Value>, temporary: bool) -> TypesResult<Self> {
        if values.is_empty() {
            return Err(TypesError::EmptyKey {
                type_id: type_ref.type_id().as_u32(),
            });
        }
        Ok(Self {
            inner: Arc::new(KeyInner {
                type_ref,
                values: values.into_boxed_slice(),
                temporary,
                hash: OnceLock::new(),
            }),
        })
    }

    /// Returns the type reference.
    #[must_use]
    pub fn type_ref(&self) -> TypeReference {
        self.inner.type_ref
    }

    /// Returns the (possibly approximate) type ID.
    #[must_use]
    pub fn type_id(&self) -> EntityTypeId {
        self.inner.type_ref.type_id()
    }

    /// Returns the key values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.inner.values
    }

    /// Returns true if this key was generated client-side and awaits remap.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.inner.temporary
    }

    /// Returns true if the exact type is known.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.inner.type_ref.is_exact()
    }

    /// Returns a copy of this key with its exact type resolved.
    #[must_use]
    pub fn with_exact_type(&self, type_id: EntityTypeId) -> Key {
        let type_ref = TypeReference::exact(type_id, self.inner.type_ref.hierarchy_root());
        Key {
            inner: Arc::new(KeyInner {
                type_ref,
                values: self.inner.values.clone(),
                temporary: self.inner.temporary,
                hash: OnceLock::new(),
            }),
        }
    }

    /// Returns true if both handles share the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Key) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn cached_hash(&self) -> u64 {
        *self.inner.hash.get_or_init(|| {
            let mut hasher = DefaultHasher::new();
            self.inner.type_ref.hierarchy_root().hash(&mut hasher);
            self.inner.values.hash(&mut hasher);
            hasher.finish()
        })
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.cached_hash() == other.cached_hash()
            && self.inner.type_ref.matches(&other.inner.type_ref)
            && self.inner.values == other.inner.values
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash());
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.is_exact() { "" } else { "~" };
        write!(f, "{}{}(", self.type_id().as_u32(), marker)?;
        for (i, v) in self.values().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")?;
        if self.is_temporary() {
            f.write_str("*")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct KeyRepr {
    type_ref: TypeReference,
    values: Vec<Value>,
    temporary: bool,
}

impl Serialize for Key {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        KeyRepr {
            type_ref: self.type_ref(),
            values: self.values().to_vec(),
            temporary: self.is_temporary(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = KeyRepr::deserialize(deserializer)?;
        Key::build(repr.type_ref, repr.values, repr.temporary).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ROOT: EntityTypeId = EntityTypeId::new(1);
    const DERIVED: EntityTypeId = EntityTypeId::new(2);
    const OTHER: EntityTypeId = EntityTypeId::new(3);

    fn exact(t: EntityTypeId, v: i64) -> Key {
        Key::new(TypeReference::exact(t, ROOT), vec![Value::Int(v)]).unwrap()
    }

    #[test]
    fn exact_keys_compare_types() {
        assert_eq!(exact(ROOT, 1), exact(ROOT, 1));
        assert_ne!(exact(ROOT, 1), exact(DERIVED, 1));
        assert_ne!(exact(ROOT, 1), exact(ROOT, 2));
    }

    #[test]
    fn hierarchy_key_matches_any_exact_member() {
        let loose = Key::new(TypeReference::hierarchy(ROOT), vec![Value::Int(1)]).unwrap();
        assert_eq!(loose, exact(DERIVED, 1));
        assert_eq!(loose, exact(ROOT, 1));

        let foreign = Key::new(TypeReference::hierarchy(OTHER), vec![Value::Int(1)]).unwrap();
        assert_ne!(loose, foreign);
    }

    #[test]
    fn hierarchy_key_finds_exact_entry_in_map() {
        let mut map = HashMap::new();
        map.insert(exact(DERIVED, 5), "row");
        let loose = Key::new(TypeReference::hierarchy(ROOT), vec![Value::Int(5)]).unwrap();
        assert_eq!(map.get(&loose), Some(&"row"));
    }

    #[test]
    fn resolving_exact_type_keeps_values() {
        let loose = Key::new(TypeReference::hierarchy(ROOT), vec![Value::Int(9)]).unwrap();
        let resolved = loose.with_exact_type(DERIVED);
        assert!(resolved.is_exact());
        assert_eq!(resolved.type_id(), DERIVED);
        assert_eq!(resolved.values(), loose.values());
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = Key::new(TypeReference::exact(ROOT, ROOT), vec![]).unwrap_err();
        assert!(matches!(err, TypesError::EmptyKey { type_id: 1 }));
    }

    #[test]
    fn temporary_flag_does_not_affect_equality() {
        let t = TypeReference::exact(ROOT, ROOT);
        let tmp = Key::temporary(t, vec![Value::Int(-1)]).unwrap();
        let fin = Key::new(t, vec![Value::Int(-1)]).unwrap();
        assert!(tmp.is_temporary());
        assert_eq!(tmp, fin);
    }

    #[test]
    fn display() {
        assert_eq!(exact(ROOT, 4).to_string(), "1(4)");
        let tmp = Key::temporary(TypeReference::hierarchy(ROOT), vec![Value::Int(-2)]).unwrap();
        assert_eq!(tmp.to_string(), "1~(-2)*");
    }
}
