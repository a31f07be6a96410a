//! Key generation service.

use crate::error::CoreResult;
use ormkit_types::{Key, TypeReference, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

/// Produces keys for new entities.
///
/// Generators are shared by every session of a domain and must be safe for
/// concurrent use.
pub trait KeyGenerator: Send + Sync {
    /// Generates a key for `type_ref`. Temporary keys are replaced at flush time.
    fn generate(&self, type_ref: TypeReference, temporary: bool) -> CoreResult<Key>;

    /// Returns true if `key` still awaits its final value.
    fn is_temporary(&self, key: &Key) -> bool {
        key.is_temporary()
    }
}

/// Integer keys from a process-wide counter.
///
/// Final keys count up from the start value; temporary keys count down from -1
/// so the two ranges never collide.
#[derive(Debug)]
pub struct SequentialKeyGenerator {
    next: AtomicI64,
    next_temporary: AtomicI64,
}

impl SequentialKeyGenerator {
    /// Creates a generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator whose first final key is `start`.
    #[must_use]
    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
            next_temporary: AtomicI64::new(-1),
        }
    }
}

impl Default for SequentialKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for SequentialKeyGenerator {
    fn generate(&self, type_ref: TypeReference, temporary: bool) -> CoreResult<Key> {
        let key = if temporary {
            let n = self.next_temporary.fetch_sub(1, Ordering::SeqCst);
            Key::temporary(type_ref, vec![Value::Int(n)])?
        } else {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Key::new(type_ref, vec![Value::Int(n)])?
        };
        Ok(key)
    }
}

/// Random UUID keys.
#[derive(Debug, Default)]
pub struct GuidKeyGenerator;

impl KeyGenerator for GuidKeyGenerator {
    fn generate(&self, type_ref: TypeReference, temporary: bool) -> CoreResult<Key> {
        let value = vec![Value::Uuid(Uuid::new_v4())];
        let key = if temporary {
            Key::temporary(type_ref, value)?
        } else {
            Key::new(type_ref, value)?
        };
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkit_types::EntityTypeId;

    fn type_ref() -> TypeReference {
        TypeReference::exact(EntityTypeId::new(1), EntityTypeId::new(1))
    }

    #[test]
    fn sequential_ranges_do_not_overlap() {
        let gen = SequentialKeyGenerator::starting_at(100);
        let a = gen.generate(type_ref(), false).unwrap();
        let b = gen.generate(type_ref(), false).unwrap();
        let t = gen.generate(type_ref(), true).unwrap();
        assert_eq!(a.values(), &[Value::Int(100)]);
        assert_eq!(b.values(), &[Value::Int(101)]);
        assert_eq!(t.values(), &[Value::Int(-1)]);
        assert!(gen.is_temporary(&t));
        assert!(!gen.is_temporary(&a));
    }

    #[test]
    fn guid_keys_are_unique() {
        let gen = GuidKeyGenerator;
        let a = gen.generate(type_ref(), false).unwrap();
        let b = gen.generate(type_ref(), true).unwrap();
        assert_ne!(a, b);
        assert!(b.is_temporary());
    }
}
