//! Type and field metadata consulted by the engine.
//!
//! The model is built once, validated, and then shared read-only through the
//! [`Domain`](crate::Domain). Every entity tuple is laid out as the
//! concatenation of its fields' slots: scalars and references take one slot,
//! structures expand in place, and entity sets take none.

use crate::error::{CoreError, CoreResult};
use ormkit_types::{EntityTypeId, Key, Tuple, Value, VersionInfo};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Whether a type is an entity or an embedded structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Has its own identity.
    Entity,
    /// Embedded value object stored inside an owner's tuple.
    Structure,
}

/// Kind of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain value.
    Scalar,
    /// Reference to another entity, stored as [`Value::Ref`] or null.
    Reference {
        /// Referenced type.
        target: EntityTypeId,
        /// Entity set on the target that mirrors this reference.
        paired_set: Option<String>,
    },
    /// Collection of referenced entities.
    EntitySet {
        /// Item type.
        target: EntityTypeId,
        /// Reference field on the item type that mirrors this set.
        paired: Option<String>,
    },
    /// Embedded structure.
    Structure {
        /// Structure type.
        structure: EntityTypeId,
    },
}

/// How a version field is maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMode {
    /// The application writes the version.
    Manual,
    /// The engine increments an integer version once per flush cycle.
    Auto,
}

/// How an entity's version fingerprint is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Every non-reference value slot.
    AllFields,
    /// Only fields declared as versions.
    #[default]
    Explicit,
    /// Explicit versions combined with the versions of referenced entities.
    Roots,
    /// No version tracking.
    None,
}

/// Hooks invoked around entity lifecycle events.
///
/// Implemented per type and attached with [`TypeInfo::hooks`].
pub trait LifecycleHooks: Send + Sync {
    /// Called after an entity of the type was created.
    fn on_created(&self, _key: &Key) {}

    /// Called before removal. Returning an error vetoes the removal.
    fn on_removing(&self, _key: &Key) -> CoreResult<()> {
        Ok(())
    }

    /// Called after a field was written.
    fn on_field_set(&self, _key: &Key, _field: &FieldInfo, _value: &Value) {}

    /// Validates a row before commit.
    fn validate(&self, _key: &Key, _row: &Tuple) -> Result<(), String> {
        Ok(())
    }
}

/// A resolved field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    name: String,
    kind: FieldKind,
    offset: usize,
    length: usize,
    nullable: bool,
    version: Option<VersionMode>,
}

impl FieldInfo {
    /// Full field path (`address.city` for structure members).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field kind.
    #[must_use]
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// First slot of the field.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of slots.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Slot of a single-slot field (scalar or reference).
    #[must_use]
    pub fn slot(&self) -> Option<usize> {
        match self.kind {
            FieldKind::Scalar | FieldKind::Reference { .. } => Some(self.offset),
            _ => None,
        }
    }

    /// Whether null is an acceptable value.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Version mode, if this is a version field.
    #[must_use]
    pub fn version_mode(&self) -> Option<VersionMode> {
        self.version
    }

    /// Returns true for reference fields.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    /// Returns true for entity set fields.
    #[must_use]
    pub fn is_entity_set(&self) -> bool {
        matches!(self.kind, FieldKind::EntitySet { .. })
    }

    /// The mirrored field or set name, if paired.
    #[must_use]
    pub fn paired(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Reference { paired_set, .. } => paired_set.as_deref(),
            FieldKind::EntitySet { paired, .. } => paired.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldDecl {
    name: String,
    kind: FieldKind,
    nullable: bool,
    version: Option<VersionMode>,
}

/// Metadata for one persistent type.
#[derive(Clone)]
pub struct TypeInfo {
    id: EntityTypeId,
    name: String,
    kind: TypeKind,
    parent: Option<EntityTypeId>,
    hierarchy_root: EntityTypeId,
    declared: Vec<FieldDecl>,
    fields: Vec<FieldInfo>,
    index: HashMap<String, usize>,
    arity: usize,
    version_policy: VersionPolicy,
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("arity", &self.arity)
            .field("version_policy", &self.version_policy)
            .finish_non_exhaustive()
    }
}

impl TypeInfo {
    fn declare(id: EntityTypeId, name: &str, kind: TypeKind) -> Self {
        Self {
            id,
            name: name.to_owned(),
            kind,
            parent: None,
            hierarchy_root: id,
            declared: Vec::new(),
            fields: Vec::new(),
            index: HashMap::new(),
            arity: 0,
            version_policy: VersionPolicy::default(),
            hooks: None,
        }
    }

    /// Declares an entity type.
    #[must_use]
    pub fn entity(id: EntityTypeId, name: &str) -> Self {
        Self::declare(id, name, TypeKind::Entity)
    }

    /// Declares a structure type.
    #[must_use]
    pub fn structure(id: EntityTypeId, name: &str) -> Self {
        Self::declare(id, name, TypeKind::Structure)
    }

    fn push(mut self, name: &str, kind: FieldKind, nullable: bool, version: Option<VersionMode>) -> Self {
        self.declared.push(FieldDecl {
            name: name.to_owned(),
            kind,
            nullable,
            version,
        });
        self
    }

    /// Inherits the fields of `parent`.
    #[must_use]
    pub fn derived_from(mut self, parent: EntityTypeId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Adds a nullable scalar field.
    #[must_use]
    pub fn field(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, true, None)
    }

    /// Adds a non-nullable scalar field.
    #[must_use]
    pub fn required(self, name: &str) -> Self {
        self.push(name, FieldKind::Scalar, false, None)
    }

    /// Adds a version field.
    #[must_use]
    pub fn version(self, name: &str, mode: VersionMode) -> Self {
        self.push(name, FieldKind::Scalar, false, Some(mode))
    }

    /// Adds a nullable reference field.
    #[must_use]
    pub fn reference(self, name: &str, target: EntityTypeId) -> Self {
        self.push(
            name,
            FieldKind::Reference {
                target,
                paired_set: None,
            },
            true,
            None,
        )
    }

    /// Adds an entity set field, optionally paired with a reference on the item type.
    #[must_use]
    pub fn entity_set(self, name: &str, target: EntityTypeId, paired: Option<&str>) -> Self {
        self.push(
            name,
            FieldKind::EntitySet {
                target,
                paired: paired.map(str::to_owned),
            },
            true,
            None,
        )
    }

    /// Adds an embedded structure field.
    #[must_use]
    pub fn structure_field(self, name: &str, structure: EntityTypeId) -> Self {
        self.push(name, FieldKind::Structure { structure }, true, None)
    }

    /// Sets the version policy.
    #[must_use]
    pub fn version_policy(mut self, policy: VersionPolicy) -> Self {
        self.version_policy = policy;
        self
    }

    /// Attaches lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Type ID.
    #[must_use]
    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity or structure.
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Direct parent type.
    #[must_use]
    pub fn parent(&self) -> Option<EntityTypeId> {
        self.parent
    }

    /// Root of the type's hierarchy.
    #[must_use]
    pub fn hierarchy_root(&self) -> EntityTypeId {
        self.hierarchy_root
    }

    /// Number of tuple slots.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Resolved fields, inherited ones first.
    #[must_use]
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Looks up a field by path.
    #[must_use]
    pub fn field_info(&self, path: &str) -> Option<&FieldInfo> {
        self.index.get(path).map(|&i| &self.fields[i])
    }

    /// Version policy.
    #[must_use]
    pub fn policy(&self) -> VersionPolicy {
        self.version_policy
    }

    /// Lifecycle hooks, if any.
    #[must_use]
    pub fn lifecycle(&self) -> Option<&Arc<dyn LifecycleHooks>> {
        self.hooks.as_ref()
    }

    /// Fields declared as versions.
    pub fn version_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.version.is_some())
    }

    /// Single-slot reference fields.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    /// A fresh tuple for a new entity: every slot available and null,
    /// auto versions start at zero.
    #[must_use]
    pub fn new_tuple(&self) -> Tuple {
        let mut values = vec![Value::Null; self.arity];
        for field in self.version_fields() {
            if field.version == Some(VersionMode::Auto) {
                values[field.offset] = Value::Int(0);
            }
        }
        Tuple::from_values(values)
    }

    /// Computes the version fingerprint of a row under the type's policy.
    ///
    /// `resolve` supplies recorded versions of referenced entities for
    /// [`VersionPolicy::Roots`].
    pub fn version_of(&self, row: &Tuple, resolve: impl Fn(&Key) -> Option<VersionInfo>) -> VersionInfo {
        let explicit = || {
            VersionInfo::from_values(
                self.version_fields()
                    .filter_map(|f| row.get(f.offset).cloned())
                    .collect(),
            )
        };
        match self.version_policy {
            VersionPolicy::None => VersionInfo::Void,
            VersionPolicy::Explicit => explicit(),
            VersionPolicy::AllFields => VersionInfo::from_values(
                self.fields
                    .iter()
                    .filter(|f| matches!(f.kind, FieldKind::Scalar))
                    .filter_map(|f| row.get(f.offset).cloned())
                    .collect(),
            ),
            VersionPolicy::Roots => self
                .reference_fields()
                .filter_map(|f| row.get(f.offset).and_then(Value::as_key))
                .filter_map(&resolve)
                .fold(explicit(), |acc, v| acc.combine(&v)),
        }
    }

    fn add_resolved(&mut self, field: FieldInfo) {
        self.index.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
    }
}

/// The validated set of types known to a domain.
#[derive(Debug, Clone, Default)]
pub struct DomainModel {
    types: HashMap<EntityTypeId, TypeInfo>,
    order: Vec<EntityTypeId>,
}

impl DomainModel {
    /// Builds and validates a model.
    ///
    /// Resolves inheritance, structure expansion and set/reference pairing.
    pub fn new(types: Vec<TypeInfo>) -> CoreResult<Self> {
        let mut declared = HashMap::new();
        let mut order = Vec::with_capacity(types.len());
        for info in types {
            order.push(info.id);
            if declared.insert(info.id, info).is_some() {
                return Err(CoreError::invalid_operation("duplicate type id in model"));
            }
        }

        let mut model = DomainModel {
            types: HashMap::new(),
            order,
        };
        let ids = model.order.clone();
        for id in &ids {
            model.resolve(*id, &declared, &mut HashSet::new())?;
        }
        model.resolve_pairs()?;
        Ok(model)
    }

    fn resolve(
        &mut self,
        id: EntityTypeId,
        declared: &HashMap<EntityTypeId, TypeInfo>,
        visiting: &mut HashSet<EntityTypeId>,
    ) -> CoreResult<()> {
        if self.types.contains_key(&id) {
            return Ok(());
        }
        let decl = declared
            .get(&id)
            .ok_or(CoreError::UnknownType { type_id: id })?;
        if !visiting.insert(id) {
            return Err(CoreError::invalid_operation(format!(
                "cyclic type definition through {}",
                decl.name
            )));
        }

        let mut info = decl.clone();
        if let Some(parent_id) = decl.parent {
            self.resolve(parent_id, declared, visiting)?;
            let parent = &self.types[&parent_id];
            if parent.kind != info.kind {
                return Err(CoreError::invalid_operation(format!(
                    "{} cannot derive from {}",
                    info.name, parent.name
                )));
            }
            info.hierarchy_root = parent.hierarchy_root;
            info.arity = parent.arity;
            for field in parent.fields.clone() {
                info.add_resolved(field);
            }
        }

        for field in &decl.declared {
            match &field.kind {
                FieldKind::Structure { structure } => {
                    self.resolve(*structure, declared, visiting)?;
                    let st = &self.types[structure];
                    if st.kind != TypeKind::Structure {
                        return Err(CoreError::invalid_operation(format!(
                            "{} is not a structure",
                            st.name
                        )));
                    }
                    let base = info.arity;
                    let members: Vec<FieldInfo> = st.fields.clone();
                    let length = st.arity;
                    info.add_resolved(FieldInfo {
                        name: field.name.clone(),
                        kind: field.kind.clone(),
                        offset: base,
                        length,
                        nullable: field.nullable,
                        version: None,
                    });
                    for member in members {
                        info.add_resolved(FieldInfo {
                            name: format!("{}.{}", field.name, member.name),
                            offset: base + member.offset,
                            ..member
                        });
                    }
                    info.arity += length;
                }
                FieldKind::EntitySet { .. } => {
                    if info.kind == TypeKind::Structure {
                        return Err(CoreError::invalid_operation(
                            "structures cannot declare entity sets",
                        ));
                    }
                    let offset = info.arity;
                    info.add_resolved(FieldInfo {
                        name: field.name.clone(),
                        kind: field.kind.clone(),
                        offset,
                        length: 0,
                        nullable: true,
                        version: None,
                    });
                }
                FieldKind::Scalar | FieldKind::Reference { .. } => {
                    let offset = info.arity;
                    info.add_resolved(FieldInfo {
                        name: field.name.clone(),
                        kind: field.kind.clone(),
                        offset,
                        length: 1,
                        nullable: field.nullable,
                        version: field.version,
                    });
                    info.arity += 1;
                }
            }
        }

        visiting.remove(&id);
        self.types.insert(id, info);
        Ok(())
    }

    fn resolve_pairs(&mut self) -> CoreResult<()> {
        let mut pairs = Vec::new();
        for info in self.types.values() {
            for field in &info.fields {
                if let FieldKind::EntitySet {
                    target,
                    paired: Some(paired),
                } = &field.kind
                {
                    pairs.push((info.id, field.name.clone(), *target, paired.clone()));
                }
            }
        }

        for (owner, set_name, target, reference) in pairs {
            let mut found = false;
            let ids: Vec<EntityTypeId> = self.types.keys().copied().collect();
            for id in ids {
                if !self.is_subtype(id, target) {
                    continue;
                }
                let owner_root = self.types[&owner].hierarchy_root;
                let Some(info) = self.types.get_mut(&id) else { continue };
                let Some(&i) = info.index.get(&reference) else { continue };
                match &mut info.fields[i].kind {
                    FieldKind::Reference { target: ref_target, paired_set } => {
                        if *ref_target != owner && *ref_target != owner_root {
                            return Err(CoreError::invalid_operation(format!(
                                "reference '{reference}' does not point back to the set owner"
                            )));
                        }
                        *paired_set = Some(set_name.clone());
                        found = true;
                    }
                    _ => {
                        return Err(CoreError::invalid_operation(format!(
                            "paired field '{reference}' is not a reference"
                        )))
                    }
                }
            }
            if !found {
                return Err(CoreError::unknown_field(target, reference));
            }
        }
        Ok(())
    }

    /// Returns true if `id` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subtype(&self, id: EntityTypeId, ancestor: EntityTypeId) -> bool {
        let mut current = Some(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.types.get(&c).and_then(|t| t.parent);
        }
        false
    }

    /// Looks up a type.
    pub fn type_info(&self, id: EntityTypeId) -> CoreResult<&TypeInfo> {
        self.types
            .get(&id)
            .ok_or(CoreError::UnknownType { type_id: id })
    }

    /// Looks up a field of a type by path.
    pub fn field(&self, id: EntityTypeId, path: &str) -> CoreResult<&FieldInfo> {
        self.type_info(id)?
            .field_info(path)
            .ok_or_else(|| CoreError::unknown_field(id, path))
    }

    /// Returns true if the type exists.
    #[must_use]
    pub fn contains(&self, id: EntityTypeId) -> bool {
        self.types.contains_key(&id)
    }

    /// All types in declaration order.
    pub fn types(&self) -> impl Iterator<Item = &TypeInfo> {
        self.order.iter().filter_map(|id| self.types.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSON: EntityTypeId = EntityTypeId::new(1);
    const EMPLOYEE: EntityTypeId = EntityTypeId::new(2);
    const ADDRESS: EntityTypeId = EntityTypeId::new(3);
    const TEAM: EntityTypeId = EntityTypeId::new(4);

    fn model() -> DomainModel {
        DomainModel::new(vec![
            TypeInfo::structure(ADDRESS, "Address").field("city").field("street"),
            TypeInfo::entity(PERSON, "Person")
                .required("name")
                .structure_field("address", ADDRESS)
                .version("version", VersionMode::Auto),
            TypeInfo::entity(EMPLOYEE, "Employee")
                .derived_from(PERSON)
                .reference("team", TEAM),
            TypeInfo::entity(TEAM, "Team")
                .required("title")
                .entity_set("members", EMPLOYEE, Some("team")),
        ])
        .unwrap()
    }

    #[test]
    fn structure_fields_expand_in_place() {
        let model = model();
        let person = model.type_info(PERSON).unwrap();
        assert_eq!(person.arity(), 4);
        assert_eq!(person.field_info("address").unwrap().length(), 2);
        assert_eq!(person.field_info("address.city").unwrap().slot(), Some(1));
        assert_eq!(person.field_info("address.street").unwrap().slot(), Some(2));
        assert_eq!(person.field_info("version").unwrap().slot(), Some(3));
    }

    #[test]
    fn derived_types_inherit_layout() {
        let model = model();
        let employee = model.type_info(EMPLOYEE).unwrap();
        assert_eq!(employee.hierarchy_root(), PERSON);
        assert_eq!(employee.arity(), 5);
        assert_eq!(employee.field_info("team").unwrap().slot(), Some(4));
        assert!(model.is_subtype(EMPLOYEE, PERSON));
        assert!(!model.is_subtype(PERSON, EMPLOYEE));
    }

    #[test]
    fn pairing_is_resolved_both_ways() {
        let model = model();
        let team = model.field(EMPLOYEE, "team").unwrap();
        assert_eq!(team.paired(), Some("members"));
        let members = model.field(TEAM, "members").unwrap();
        assert_eq!(members.paired(), Some("team"));
        assert_eq!(members.slot(), None);
    }

    #[test]
    fn new_tuple_starts_auto_versions_at_zero() {
        let model = model();
        let t = model.type_info(PERSON).unwrap().new_tuple();
        assert!(t.is_fully_available());
        assert_eq!(t.get(3), Some(&Value::Int(0)));
        assert_eq!(t.get(0), Some(&Value::Null));
    }

    #[test]
    fn unknown_lookups_fail() {
        let model = model();
        assert!(matches!(
            model.type_info(EntityTypeId::new(99)),
            Err(CoreError::UnknownType { .. })
        ));
        assert!(matches!(
            model.field(PERSON, "nope"),
            Err(CoreError::UnknownField { .. })
        ));
    }

    #[test]
    fn version_policies() {
        let model = model();
        let person = model.type_info(PERSON).unwrap();
        let mut row = person.new_tuple();
        row.set(0, Value::from("ann")).unwrap();
        assert_eq!(person.version_of(&row, |_| None), VersionInfo::Values(vec![Value::Int(0)]));

        let all = person.clone().version_policy(VersionPolicy::AllFields);
        assert_eq!(all.version_of(&row, |_| None).values().len(), 4);

        let none = person.clone().version_policy(VersionPolicy::None);
        assert!(none.version_of(&row, |_| None).is_void());
    }

    #[test]
    fn cyclic_inheritance_is_rejected() {
        let a = EntityTypeId::new(10);
        let b = EntityTypeId::new(11);
        let result = DomainModel::new(vec![
            TypeInfo::entity(a, "A").derived_from(b),
            TypeInfo::entity(b, "B").derived_from(a),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn pairing_requires_reference() {
        let result = DomainModel::new(vec![
            TypeInfo::entity(TEAM, "Team").entity_set("members", PERSON, Some("name")),
            TypeInfo::entity(PERSON, "Person").field("name"),
        ]);
        assert!(result.is_err());
    }
}
