//! Entity creation, field writes, removal and entity-set membership.

use super::Session;
use crate::entity::{EntityObject, EntitySetState, PersistenceState};
use crate::error::{CoreError, CoreResult};
use crate::events::SessionEvent;
use crate::model::{FieldInfo, FieldKind, TypeKind};
use crate::operation::Operation;
use crate::storage::StorageDriver;
use ormkit_types::{EntityTypeId, Key, Value};
use std::sync::Arc;
use tracing::trace;

impl<D: StorageDriver> Session<D> {
    /// Creates a new entity of `type_id` with a generated key.
    pub fn create_entity(&mut self, type_id: EntityTypeId) -> CoreResult<Arc<EntityObject>> {
        self.check_registry_limit()?;
        self.ensure_can_change()?;
        let key = self.generate_key(type_id)?;
        self.create_entity_with_key(&key)
    }

    /// Generates a key for a new entity.
    ///
    /// The key is temporary with lazy key generation or while disconnected.
    pub fn generate_key(&mut self, type_id: EntityTypeId) -> CoreResult<Key> {
        self.entity_type(type_id)?;
        let temporary = self.config.lazy_key_generation || self.disconnected.is_some();
        let key = self.domain.generate_key(type_id, temporary)?;
        self.within_operation(Operation::KeyGenerate { key: key.clone() }, false, |_| Ok(()))?;
        Ok(key)
    }

    /// Creates a new entity with an explicit key.
    pub fn create_entity_with_key(&mut self, key: &Key) -> CoreResult<Arc<EntityObject>> {
        if !key.is_exact() {
            return Err(CoreError::invalid_operation(format!(
                "cannot create {key}: the exact type is unknown"
            )));
        }
        self.entity_type(key.type_id())?;
        self.check_registry_limit()?;
        self.ensure_can_change()?;
        let op = Operation::EntityCreate { key: key.clone() };
        self.within_operation(op, false, |s| {
            s.create_entity_state(key, true)?;
            s.publish(SessionEvent::EntityCreated { key: key.clone() });
            if let Some(hooks) = s.domain.model().type_info(key.type_id())?.lifecycle().cloned() {
                hooks.on_created(key);
            }
            trace!(%key, "entity created");
            Ok(())
        })?;
        self.entity_object(key)
    }

    /// Writes several fields at once.
    pub fn initialize_entity(&mut self, key: &Key, values: Vec<(String, Value)>) -> CoreResult<()> {
        let mapping = self.check_registry_limit()?;
        let key = self.live_key(&mapping.resolve(key))?;
        self.ensure_can_change()?;
        for (field, value) in &values {
            self.writable_field(&key, field, value)?;
        }
        let op = Operation::EntityInitialize {
            key: key.clone(),
            values: values.clone(),
        };
        self.within_operation(op, true, |s| {
            for (field, value) in values {
                s.set_field(&key, &field, value)?;
            }
            Ok(())
        })
    }

    /// Writes a scalar or reference field.
    ///
    /// Writing a paired reference moves the entity between the owners'
    /// entity sets.
    pub fn set_field(&mut self, key: &Key, field: &str, value: Value) -> CoreResult<()> {
        let mapping = self.check_registry_limit()?;
        let value = value.map_key(mapping.lookup()).unwrap_or(value);
        let key = self.live_key(&mapping.resolve(key))?;
        let (info, slot) = self.writable_field(&key, field, &value)?;
        self.ensure_can_change()?;

        let op = Operation::FieldSet {
            key: key.clone(),
            field: field.to_owned(),
            value: value.clone(),
        };
        self.within_operation(op, false, |s| s.apply_field_set(&key, &info, slot, value))
    }

    /// Resolves a field that can take `value`, with its tuple slot.
    fn writable_field(&self, key: &Key, field: &str, value: &Value) -> CoreResult<(FieldInfo, usize)> {
        let info = self.domain.model().field(key.type_id(), field)?.clone();
        let slot = info
            .slot()
            .ok_or_else(|| CoreError::invalid_operation(format!("field '{field}' does not hold a value")))?;
        self.check_value(&info, value)?;
        Ok((info, slot))
    }

    fn check_value(&self, info: &FieldInfo, value: &Value) -> CoreResult<()> {
        match (info.kind(), value) {
            (_, Value::Null) => Ok(()),
            (FieldKind::Reference { target, .. }, Value::Ref(item)) => {
                if self.domain.model().is_subtype(item.type_id(), *target)
                    || self.domain.model().is_subtype(*target, item.type_ref().hierarchy_root())
                {
                    Ok(())
                } else {
                    Err(CoreError::invalid_operation(format!(
                        "{item} cannot be stored in '{}'",
                        info.name()
                    )))
                }
            }
            (FieldKind::Reference { .. }, _) => Err(CoreError::invalid_operation(format!(
                "'{}' only holds references",
                info.name()
            ))),
            (_, Value::Ref(_)) => Err(CoreError::invalid_operation(format!(
                "'{}' cannot hold a reference",
                info.name()
            ))),
            _ => Ok(()),
        }
    }

    fn apply_field_set(&mut self, key: &Key, info: &FieldInfo, slot: usize, value: Value) -> CoreResult<()> {
        let current = self
            .cache
            .get(key)
            .and_then(|s| s.tuple())
            .and_then(|t| t.get(slot))
            .cloned();
        if current.as_ref() == Some(&value) {
            return Ok(());
        }

        if let Some(set_name) = info.paired() {
            if let Some(old_owner) = current.as_ref().and_then(Value::as_key) {
                self.apply_set_remove(old_owner, set_name, key, false)?;
            }
            if let Some(new_owner) = value.as_key() {
                self.apply_set_add(new_owner, set_name, key, false)?;
            }
        }

        let state = self
            .cache
            .get_mut(key)
            .ok_or_else(|| CoreError::EntityNotFound { key: key.clone() })?;
        let tuple = state
            .tuple_mut()
            .ok_or_else(|| CoreError::EntityNotFound { key: key.clone() })?;
        tuple.set(slot, value.clone())?;
        let next = match state.persistence_state() {
            PersistenceState::New => PersistenceState::New,
            _ => PersistenceState::Modified,
        };
        self.mark(key, next);

        if let Some(hooks) = self.domain.model().type_info(key.type_id())?.lifecycle().cloned() {
            hooks.on_field_set(key, info, &value);
        }
        self.publish(SessionEvent::FieldSet {
            key: key.clone(),
            field: info.name().to_owned(),
            value,
        });
        Ok(())
    }

    /// Removes an entity.
    ///
    /// Lifecycle hooks may veto the removal. Removing a new entity that was
    /// never flushed simply forgets it.
    pub fn remove_entity(&mut self, key: &Key) -> CoreResult<()> {
        let mapping = self.check_registry_limit()?;
        let key = self.live_key(&mapping.resolve(key))?;
        self.ensure_can_change()?;
        if let Some(hooks) = self.domain.model().type_info(key.type_id())?.lifecycle().cloned() {
            hooks.on_removing(&key)?;
        }
        let op = Operation::EntityRemove { key: key.clone() };
        self.within_operation(op, false, |s| s.apply_remove(&key))
    }

    fn apply_remove(&mut self, key: &Key) -> CoreResult<()> {
        self.publish(SessionEvent::EntityRemoving { key: key.clone() });

        let info = self.domain.model().type_info(key.type_id())?.clone();
        let row = self.cache.get(key).and_then(|s| s.row());
        for field in info.reference_fields() {
            let Some(set_name) = field.paired() else { continue };
            let owner = row
                .as_ref()
                .and_then(|r| r.get(field.offset()))
                .and_then(Value::as_key)
                .cloned();
            if let Some(owner) = owner {
                self.apply_set_remove(&owner, set_name, key, false)?;
            }
        }

        let containing: Vec<(Key, String)> = self
            .entity_sets
            .iter()
            .filter(|(_, set)| match set.members() {
                Some(members) => members.contains(key),
                None => set.added().contains(key),
            })
            .map(|(id, _)| id.clone())
            .collect();
        for (owner, field) in containing {
            self.apply_set_remove(&owner, &field, key, false)?;
        }

        let owned: Vec<(Key, String)> = self
            .entity_sets
            .keys()
            .filter(|(owner, _)| owner == key)
            .cloned()
            .collect();
        for (owner, field) in owned {
            self.entity_sets.remove(&(owner.clone(), field.clone()));
            self.set_registry.remove(&owner, &field);
        }

        if self.registry.state_of(key) == Some(PersistenceState::New) {
            self.registry.remove(key);
            if let Some(state) = self.cache.get_mut(key) {
                state.set_persistence_state(PersistenceState::Removed);
            }
        } else {
            self.mark(key, PersistenceState::Removed);
        }

        self.publish(SessionEvent::EntityRemoved { key: key.clone() });
        trace!(%key, "entity removed");
        Ok(())
    }

    /// Members of an entity set, loading them if needed.
    pub fn entity_set_items(&mut self, owner: &Key, field: &str) -> CoreResult<Vec<Key>> {
        let owner = self.live_key(owner)?;
        self.set_field_info(&owner, field)?;
        let set = self.set_state_mut(&owner, field, true)?;
        Ok(set.members().map(<[Key]>::to_vec).unwrap_or_default())
    }

    /// Position of `item` in an entity set, if it is a member.
    pub fn entity_set_item_index(&mut self, owner: &Key, field: &str, item: &Key) -> CoreResult<Option<usize>> {
        let owner = self.live_key(owner)?;
        self.set_field_info(&owner, field)?;
        Ok(self.set_state_mut(&owner, field, true)?.index_of(item))
    }

    /// Adds `item` to an entity set. Returns false if it was already a member.
    ///
    /// For a paired set this writes the item's back reference instead.
    pub fn add_to_set(&mut self, owner: &Key, field: &str, item: &Key) -> CoreResult<bool> {
        let mapping = self.check_registry_limit()?;
        let owner = self.live_key(&mapping.resolve(owner))?;
        let item = self.live_key(&mapping.resolve(item))?;
        let info = self.set_field_info(&owner, field)?;
        self.check_item(&info, &item)?;
        self.ensure_can_change()?;

        let op = Operation::EntitySetAdd {
            owner: owner.clone(),
            field: field.to_owned(),
            item: item.clone(),
        };
        match info.paired().map(str::to_owned) {
            Some(reference) => self.within_operation(op, true, |s| {
                let target = Value::Ref(owner.clone());
                if s.get_field(&item, &reference)? == target {
                    return Ok(false);
                }
                s.set_field(&item, &reference, target)?;
                Ok(true)
            }),
            None => self.within_operation(op, false, |s| s.apply_set_add(&owner, field, &item, true)),
        }
    }

    /// Removes `item` from an entity set. Returns false if it was not a member.
    pub fn remove_from_set(&mut self, owner: &Key, field: &str, item: &Key) -> CoreResult<bool> {
        let mapping = self.check_registry_limit()?;
        let owner = self.live_key(&mapping.resolve(owner))?;
        let item = self.live_key(&mapping.resolve(item))?;
        let info = self.set_field_info(&owner, field)?;
        self.ensure_can_change()?;

        let op = Operation::EntitySetRemove {
            owner: owner.clone(),
            field: field.to_owned(),
            item: item.clone(),
        };
        match info.paired().map(str::to_owned) {
            Some(reference) => self.within_operation(op, true, |s| {
                if s.get_field(&item, &reference)? != Value::Ref(owner.clone()) {
                    return Ok(false);
                }
                s.set_field(&item, &reference, Value::Null)?;
                Ok(true)
            }),
            None => self.within_operation(op, false, |s| s.apply_set_remove(&owner, field, &item, true)),
        }
    }

    /// Removes every member of an entity set.
    pub fn clear_set(&mut self, owner: &Key, field: &str) -> CoreResult<()> {
        let mapping = self.check_registry_limit()?;
        let owner = self.live_key(&mapping.resolve(owner))?;
        let info = self.set_field_info(&owner, field)?;
        self.ensure_can_change()?;
        let items = self.entity_set_items(&owner, field)?;

        let op = Operation::EntitySetClear {
            owner: owner.clone(),
            field: field.to_owned(),
        };
        let paired = info.paired().map(str::to_owned);
        self.within_operation(op, paired.is_some(), |s| {
            for item in &items {
                match &paired {
                    Some(reference) => s.set_field(item, reference, Value::Null)?,
                    None => {
                        s.apply_set_remove(&owner, field, item, true)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn entity_type(&self, type_id: EntityTypeId) -> CoreResult<()> {
        let info = self.domain.model().type_info(type_id)?;
        if info.kind() == TypeKind::Entity {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!("{} is not an entity type", info.name())))
        }
    }

    fn set_field_info(&self, owner: &Key, field: &str) -> CoreResult<FieldInfo> {
        let info = self.domain.model().field(owner.type_id(), field)?;
        if info.is_entity_set() {
            Ok(info.clone())
        } else {
            Err(CoreError::invalid_operation(format!("field '{field}' is not an entity set")))
        }
    }

    fn check_item(&self, info: &FieldInfo, item: &Key) -> CoreResult<()> {
        match info.kind() {
            FieldKind::EntitySet { target, .. } if self.domain.model().is_subtype(item.type_id(), *target) => Ok(()),
            _ => Err(CoreError::invalid_operation(format!(
                "{item} cannot be added to '{}'",
                info.name()
            ))),
        }
    }

    /// The state of an entity set, loading its members when `load` is set.
    pub(crate) fn set_state_mut(&mut self, owner: &Key, field: &str, load: bool) -> CoreResult<&mut EntitySetState> {
        let id = (owner.clone(), field.to_owned());
        let needs_load = load
            && self
                .entity_sets
                .get(&id)
                .map_or(true, |s| !s.is_loaded() || s.is_invalidated());
        if needs_load {
            let owner_is_new = self
                .cache
                .get(owner)
                .is_some_and(|s| s.persistence_state() == PersistenceState::New);
            let fetched = if owner_is_new {
                Vec::new()
            } else {
                self.dispatch_fetch_set(owner, field)?
            };
            let token = self.current_token();
            self.entity_sets.entry(id.clone()).or_default().load(fetched, token);
        }
        Ok(self.entity_sets.entry(id).or_default())
    }

    pub(crate) fn apply_set_add(&mut self, owner: &Key, field: &str, item: &Key, load: bool) -> CoreResult<bool> {
        let added = self.set_state_mut(owner, field, load)?.add(item);
        if added {
            self.set_registry.register(owner.clone(), field);
            self.publish(SessionEvent::EntitySetItemAdded {
                owner: owner.clone(),
                field: field.to_owned(),
                item: item.clone(),
            });
        }
        Ok(added)
    }

    pub(crate) fn apply_set_remove(&mut self, owner: &Key, field: &str, item: &Key, load: bool) -> CoreResult<bool> {
        let removed = self.set_state_mut(owner, field, load)?.remove(item);
        if removed {
            self.set_registry.register(owner.clone(), field);
            self.publish(SessionEvent::EntitySetItemRemoved {
                owner: owner.clone(),
                field: field.to_owned(),
                item: item.clone(),
            });
        }
        Ok(removed)
    }
}
