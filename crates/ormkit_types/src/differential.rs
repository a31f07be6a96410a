//! Differential tuple: uncommitted edits overlaid on an immutable origin.

use crate::error::{TypesError, TypesResult};
use crate::key::Key;
use crate::tuple::{MergeBehavior, Tuple};
use crate::value::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Backup {
    origin: Arc<Tuple>,
    difference: Option<Tuple>,
}

/// A row buffer that overlays a writable difference over a shared origin.
///
/// The origin is never mutated in place: every operation that changes it
/// builds a fresh tuple and swaps the `Arc`, so other holders of the old
/// origin keep seeing the old data.
#[derive(Debug, Clone)]
pub struct DifferentialTuple {
    origin: Arc<Tuple>,
    difference: Option<Tuple>,
    backup: Option<Backup>,
}

impl DifferentialTuple {
    /// Wraps an owned origin.
    #[must_use]
    pub fn new(origin: Tuple) -> Self {
        Self::from_shared(Arc::new(origin))
    }

    /// Wraps a shared origin.
    #[must_use]
    pub fn from_shared(origin: Arc<Tuple>) -> Self {
        Self {
            origin,
            difference: None,
            backup: None,
        }
    }

    /// Returns the arity.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.origin.arity()
    }

    /// Returns the shared origin.
    #[must_use]
    pub fn origin(&self) -> &Arc<Tuple> {
        &self.origin
    }

    /// Returns the pending difference.
    #[must_use]
    pub fn difference(&self) -> Option<&Tuple> {
        self.difference.as_ref()
    }

    /// Returns true if there are uncommitted edits.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.difference
            .as_ref()
            .is_some_and(|d| d.available_count() > 0)
    }

    /// Returns true if a backup is held.
    #[must_use]
    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Reads a slot, falling through to the origin.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.difference
            .as_ref()
            .and_then(|d| d.get(index))
            .or_else(|| self.origin.get(index))
    }

    /// Returns true if the slot is readable from either layer.
    #[must_use]
    pub fn is_available(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Writes a slot into the difference.
    pub fn set(&mut self, index: usize, value: Value) -> TypesResult<()> {
        let arity = self.arity();
        if index >= arity {
            return Err(TypesError::slot_out_of_range(index, arity));
        }
        self.difference
            .get_or_insert_with(|| Tuple::new(arity))
            .set(index, value)
    }

    /// Indexes of slots written since the last merge.
    #[must_use]
    pub fn changed_slots(&self) -> Vec<usize> {
        self.difference
            .as_ref()
            .map(|d| d.available().map(|(i, _)| i).collect())
            .unwrap_or_default()
    }

    /// Returns the effective row as a regular tuple.
    #[must_use]
    pub fn to_tuple(&self) -> Tuple {
        let mut merged = (*self.origin).clone();
        if let Some(diff) = &self.difference {
            // Arity is enforced by `set`, so this cannot fail.
            let _ = merged.merge(diff, MergeBehavior::PreferDifference);
        }
        merged
    }

    /// Folds the difference into a fresh origin.
    pub fn merge(&mut self) {
        if let Some(diff) = self.difference.take() {
            let mut merged = (*self.origin).clone();
            let _ = merged.merge(&diff, MergeBehavior::PreferDifference);
            self.origin = Arc::new(merged);
        }
    }

    /// Backs up the current layers, then merges.
    ///
    /// The merge is irreversible once [`drop_backup`](Self::drop_backup) is called.
    pub fn commit_difference(&mut self) {
        self.take_backup();
        self.merge();
    }

    /// Backs up the current layers, then discards the difference.
    pub fn rollback_difference(&mut self) {
        self.take_backup();
        self.difference = None;
    }

    /// Re-applies the last backup. Returns false when there was none.
    pub fn restore_difference(&mut self) -> bool {
        match self.backup.take() {
            Some(backup) => {
                self.origin = backup.origin;
                self.difference = backup.difference;
                true
            }
            None => false,
        }
    }

    /// Forgets the last backup.
    pub fn drop_backup(&mut self) {
        self.backup = None;
    }

    /// Merges freshly fetched data into the origin without touching the difference.
    pub fn update_origin(&mut self, incoming: &Tuple, behavior: MergeBehavior) -> TypesResult<()> {
        let mut merged = (*self.origin).clone();
        merged.merge(incoming, behavior)?;
        self.origin = Arc::new(merged);
        Ok(())
    }

    /// Rewrites references in both layers. Returns true if anything changed.
    pub fn remap_keys(&mut self, map: impl Fn(&Key) -> Option<Key>) -> bool {
        let mut changed = false;
        if self.origin.references().any(|k| map(k).is_some()) {
            let mut origin = (*self.origin).clone();
            origin.remap_keys(&map);
            self.origin = Arc::new(origin);
            changed = true;
        }
        if let Some(diff) = &mut self.difference {
            changed |= diff.remap_keys(&map);
        }
        changed
    }

    /// Backs up the current layers unless a backup is already held.
    ///
    /// An older backup belongs to an earlier step of the same flush and wins.
    pub fn take_backup(&mut self) {
        if self.backup.is_none() {
            self.backup = Some(Backup {
                origin: Arc::clone(&self.origin),
                difference: self.difference.clone(),
            });
        }
    }
}

impl From<Tuple> for DifferentialTuple {
    fn from(t: Tuple) -> Self {
        Self::new(t)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn row_and_edits() -> impl Strategy<Value = (Vec<i64>, Vec<(usize, i64)>)> {
        prop::collection::vec(any::<i64>(), 1..8).prop_flat_map(|row| {
            let arity = row.len();
            (Just(row), prop::collection::vec((0..arity, any::<i64>()), 0..12))
        })
    }

    proptest! {
        #[test]
        fn shared_origin_is_never_written((row, edits) in row_and_edits()) {
            let origin = Arc::new(Tuple::from_values(row.iter().copied().map(Value::Int).collect()));
            let pristine = (*origin).clone();
            let mut t = DifferentialTuple::from_shared(Arc::clone(&origin));
            for (slot, value) in &edits {
                t.set(*slot, Value::Int(*value)).unwrap();
            }
            t.merge();
            prop_assert_eq!(&*origin, &pristine);
        }

        #[test]
        fn commit_then_restore_is_identity((row, edits) in row_and_edits()) {
            let mut t = DifferentialTuple::new(Tuple::from_values(row.into_iter().map(Value::Int).collect()));
            for (slot, value) in &edits {
                t.set(*slot, Value::Int(*value)).unwrap();
            }
            let before = t.to_tuple();
            let changed = t.changed_slots();

            t.commit_difference();
            prop_assert_eq!(t.to_tuple(), before.clone());
            prop_assert!(!t.has_changes());

            prop_assert!(t.restore_difference());
            prop_assert_eq!(t.to_tuple(), before);
            prop_assert_eq!(t.changed_slots(), changed);
        }

        #[test]
        fn rollback_returns_to_origin((row, edits) in row_and_edits()) {
            let origin = Tuple::from_values(row.into_iter().map(Value::Int).collect());
            let mut t = DifferentialTuple::new(origin.clone());
            for (slot, value) in &edits {
                t.set(*slot, Value::Int(*value)).unwrap();
            }
            t.rollback_difference();
            prop_assert_eq!(t.to_tuple(), origin);
            t.drop_backup();
            prop_assert!(!t.restore_difference());
        }
    }
}
