//! Wrapper objects handed to application code.

use crate::error::CoreResult;
use crate::session::Session;
use crate::storage::StorageDriver;
use ormkit_types::{EntityTypeId, Key, Tuple, Value};
use parking_lot::RwLock;
use std::sync::Arc;

/// Field access shared by entities and embedded structures.
///
/// Wrappers hold no data; every access goes through the owning session.
pub trait Persistent {
    /// Key of the entity whose tuple stores the fields.
    fn owner_key(&self) -> Key;

    /// Full path of `field` inside the owner's tuple.
    fn field_path(&self, field: &str) -> String;

    /// Whether commit-time validation applies to the object itself.
    fn can_be_validated(&self) -> bool;

    /// Reads a field.
    fn get_field<D: StorageDriver>(&self, session: &mut Session<D>, field: &str) -> CoreResult<Value> {
        session.get_field(&self.owner_key(), &self.field_path(field))
    }

    /// Writes a field.
    fn set_field<D: StorageDriver>(
        &self,
        session: &mut Session<D>,
        field: &str,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        session.set_field(&self.owner_key(), &self.field_path(field), value.into())
    }

    /// Returns the object's slots.
    fn tuple<D: StorageDriver>(&self, session: &mut Session<D>) -> CoreResult<Option<Tuple>>;
}

/// Live handle to an entity.
///
/// The session keeps only a weak reference; the key is refreshed in place
/// when a temporary key is replaced.
#[derive(Debug)]
pub struct EntityObject {
    key: RwLock<Key>,
    type_id: EntityTypeId,
}

impl EntityObject {
    pub(crate) fn new(key: Key) -> Self {
        Self {
            type_id: key.type_id(),
            key: RwLock::new(key),
        }
    }

    /// Current key.
    #[must_use]
    pub fn key(&self) -> Key {
        self.key.read().clone()
    }

    /// Entity type.
    #[must_use]
    pub fn type_id(&self) -> EntityTypeId {
        self.type_id
    }

    /// Handle to an embedded structure field.
    #[must_use]
    pub fn structure(self: &Arc<Self>, path: &str) -> StructureObject {
        StructureObject {
            owner: Arc::clone(self),
            path: path.to_owned(),
        }
    }

    pub(crate) fn set_key(&self, key: Key) {
        *self.key.write() = key;
    }
}

impl Persistent for EntityObject {
    fn owner_key(&self) -> Key {
        self.key()
    }

    fn field_path(&self, field: &str) -> String {
        field.to_owned()
    }

    fn can_be_validated(&self) -> bool {
        true
    }

    fn tuple<D: StorageDriver>(&self, session: &mut Session<D>) -> CoreResult<Option<Tuple>> {
        session.row(&self.key())
    }
}

/// Embedded structure stored in consecutive slots of its owner's tuple.
#[derive(Debug, Clone)]
pub struct StructureObject {
    owner: Arc<EntityObject>,
    path: String,
}

impl StructureObject {
    /// Owning entity.
    #[must_use]
    pub fn owner(&self) -> &Arc<EntityObject> {
        &self.owner
    }

    /// Field path of the structure inside the owner.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Persistent for StructureObject {
    fn owner_key(&self) -> Key {
        self.owner.key()
    }

    fn field_path(&self, field: &str) -> String {
        format!("{}.{}", self.path, field)
    }

    fn can_be_validated(&self) -> bool {
        false
    }

    fn tuple<D: StorageDriver>(&self, session: &mut Session<D>) -> CoreResult<Option<Tuple>> {
        let key = self.owner.key();
        let field = session.domain().model().field(key.type_id(), &self.path)?.clone();
        Ok(session.row(&key)?.map(|row| {
            Tuple::from_slots(row.slots()[field.offset()..field.offset() + field.length()].to_vec())
        }))
    }
}
