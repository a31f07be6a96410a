//! Fixed-arity row buffer with per-slot availability.

use crate::error::{TypesError, TypesResult};
use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Which side wins when two tuples are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MergeBehavior {
    /// Slots already available in the receiver are kept.
    PreferOrigin,
    /// Available slots of the incoming tuple overwrite the receiver.
    #[default]
    PreferDifference,
}

/// A fixed-arity vector of slots.
///
/// `None` means "not available" (never loaded or never written);
/// `Some(Value::Null)` is an available null.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tuple {
    slots: Vec<Option<Value>>,
}

impl Tuple {
    /// Creates a tuple with every slot unavailable.
    #[must_use]
    pub fn new(arity: usize) -> Self {
        Self {
            slots: vec![None; arity],
        }
    }

    /// Creates a fully available tuple.
    #[must_use]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            slots: values.into_iter().map(Some).collect(),
        }
    }

    /// Creates a tuple from raw slots.
    #[must_use]
    pub fn from_slots(slots: Vec<Option<Value>>) -> Self {
        Self { slots }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot value when available.
    ///
    /// Out-of-range indexes read as unavailable.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Returns true if the slot holds a value.
    #[must_use]
    pub fn is_available(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Writes a slot.
    pub fn set(&mut self, index: usize, value: Value) -> TypesResult<()> {
        let arity = self.arity();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| TypesError::slot_out_of_range(index, arity))?;
        *slot = Some(value);
        Ok(())
    }

    /// Marks a slot as unavailable.
    pub fn clear(&mut self, index: usize) -> TypesResult<()> {
        let arity = self.arity();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| TypesError::slot_out_of_range(index, arity))?;
        *slot = None;
        Ok(())
    }

    /// Returns the number of available slots.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if every slot is available.
    #[must_use]
    pub fn is_fully_available(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Returns the raw slots.
    #[must_use]
    pub fn slots(&self) -> &[Option<Value>] {
        &self.slots
    }

    /// Iterates over `(index, value)` pairs of available slots.
    pub fn available(&self) -> impl Iterator<Item = (usize, &Value)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }

    /// Merges `other` into `self`.
    pub fn merge(&mut self, other: &Tuple, behavior: MergeBehavior) -> TypesResult<()> {
        if other.arity() != self.arity() {
            return Err(TypesError::arity_mismatch(self.arity(), other.arity()));
        }
        for (slot, incoming) in self.slots.iter_mut().zip(other.slots.iter()) {
            let Some(incoming) = incoming else { continue };
            match behavior {
                MergeBehavior::PreferDifference => *slot = Some(incoming.clone()),
                MergeBehavior::PreferOrigin => {
                    if slot.is_none() {
                        *slot = Some(incoming.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrites every reference slot through `map`. Returns true if any slot changed.
    pub fn remap_keys(&mut self, map: impl Fn(&Key) -> Option<Key>) -> bool {
        let mut changed = false;
        for value in self.slots.iter_mut().flatten() {
            if let Some(mapped) = value.map_key(&map) {
                *value = mapped;
                changed = true;
            }
        }
        changed
    }

    /// Returns every key referenced from this tuple.
    pub fn references(&self) -> impl Iterator<Item = &Key> {
        self.slots.iter().flatten().filter_map(Value::as_key)
    }
}
