//! Replacing temporary keys with final ones.

use super::Session;
use crate::domain::Domain;
use crate::error::{CoreError, CoreResult};
use crate::events::SessionEvent;
use crate::operation::KeyMapping;
use crate::storage::StorageDriver;
use ormkit_types::Key;
use std::collections::HashMap;
use tracing::debug;

/// Assigns final keys to temporary ones.
#[derive(Debug)]
pub struct KeyRemapper<'a> {
    domain: &'a Domain,
}

impl<'a> KeyRemapper<'a> {
    /// Creates a remapper using the domain's key generators.
    #[must_use]
    pub fn new(domain: &'a Domain) -> Self {
        Self { domain }
    }

    /// Generates a final key for every temporary key in `keys`.
    pub fn remap<'k>(&self, keys: impl IntoIterator<Item = &'k Key>) -> CoreResult<KeyMapping> {
        let mut mapping = KeyMapping::new();
        for key in keys {
            if key.is_temporary() && !mapping.contains(key) {
                let fresh = self.domain.generate_key(key.type_id(), false)?;
                mapping.insert(key.clone(), fresh);
            }
        }
        Ok(mapping)
    }
}

impl<D: StorageDriver> Session<D> {
    /// Rewrites every key in the session through `mapping`.
    ///
    /// Covers cached states and the references inside their rows, entity
    /// sets, registries, pins, identifiers and transaction bookkeeping.
    /// Publishes [`SessionEvent::KeysRemapped`].
    pub fn remap_entity_keys(&mut self, mapping: &KeyMapping) -> CoreResult<()> {
        if mapping.is_empty() {
            return Ok(());
        }
        let moved: Vec<Key> = self.cache.keys().filter(|k| mapping.contains(k)).cloned().collect();
        for old in &moved {
            let fresh = mapping.resolve(old);
            let taken = self
                .cache
                .get(&fresh)
                .is_some_and(|s| !s.is_removed() && s.tuple().is_some());
            if taken && !mapping.contains(&fresh) {
                return Err(CoreError::IdentityConflict { key: fresh });
            }
        }

        let mut states: Vec<_> = moved.iter().filter_map(|k| self.cache.remove(k)).collect();
        for state in &mut states {
            let fresh = mapping.resolve(state.key());
            state.rekey(fresh);
        }
        for state in states {
            self.domain.remember_key(state.key());
            self.cache.insert(state.key().clone(), state);
        }
        for state in self.cache.values_mut() {
            state.remap_references(mapping.lookup());
        }

        let sets: HashMap<_, _> = self
            .entity_sets
            .drain()
            .map(|((owner, field), mut set)| {
                set.remap_keys(mapping);
                ((mapping.resolve(&owner), field), set)
            })
            .collect();
        self.entity_sets = sets;

        self.registry.remap_keys(mapping);
        self.set_registry.remap_keys(mapping);
        self.pinner.remap_keys(mapping);
        for key in self.identifiers.values_mut() {
            if let Some(fresh) = mapping.get(key) {
                *key = fresh.clone();
            }
        }
        for tx in &mut self.transactions {
            tx.remap_touched(mapping.lookup());
        }
        for pending in self.pending_operations.iter_mut().flatten() {
            pending.operation = pending.operation.remap_keys(mapping);
        }

        debug!(count = mapping.len(), "entity keys remapped");
        self.publish(SessionEvent::KeysRemapped {
            mapping: mapping.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::model::{DomainModel, TypeInfo};
    use ormkit_types::EntityTypeId;

    const NOTE: EntityTypeId = EntityTypeId::new(1);

    #[test]
    fn only_temporary_keys_are_mapped() {
        let domain = Domain::new(
            DomainModel::new(vec![TypeInfo::entity(NOTE, "Note").field("text")]).unwrap(),
            DomainConfig::default(),
        );
        let temp = domain.generate_key(NOTE, true).unwrap();
        let fixed = domain.generate_key(NOTE, false).unwrap();
        let mapping = KeyRemapper::new(&domain).remap([&temp, &fixed, &temp]).unwrap();
        assert_eq!(mapping.len(), 1);
        let fresh = mapping.resolve(&temp);
        assert!(!fresh.is_temporary());
        assert_ne!(fresh, fixed);
    }
}
