//! Entity records and the per-type capability registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityType, PropertyName, Revision};
use crate::value::{PropertyMap, TypeSchema, Value, ValueKind};

/// Per-revision entity metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Revision at which this record was written.
    pub revision: Revision,

    /// Tombstone flag; set on the final record of a deleted entity.
    pub deleted: bool,

    /// Whether this revision originated locally and must be replayed to
    /// the source.
    pub replay_to_source: bool,

    /// Names of the properties modified in this revision. Drives index
    /// maintenance and change replay.
    pub changed_properties: BTreeSet<PropertyName>,
}

/// A typed, identified, revisioned record.
///
/// Property mutation goes through [`Entity::set`]/[`Entity::unset`] so
/// the changed-properties set stays accurate; preprocessors rely on it.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    id: EntityId,
    entity_type: EntityType,
    /// Revision, tombstone, replay and change-set metadata.
    pub metadata: EntityMetadata,
    properties: PropertyMap,
}

impl Entity {
    /// Creates a new entity of the given type with a fresh id.
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self::with_id(entity_type, EntityId::new())
    }

    /// Creates an entity with an explicit id (e.g. from a command).
    pub fn with_id(entity_type: impl Into<EntityType>, id: EntityId) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            metadata: EntityMetadata::default(),
            properties: PropertyMap::new(),
        }
    }

    /// The stable entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The entity type tag.
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// The revision this record was read at or written as.
    pub fn revision(&self) -> Revision {
        self.metadata.revision
    }

    /// True if this record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.metadata.deleted
    }

    /// Reads a property value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get_str_key(name)
    }

    /// Sets a property and records it as changed.
    pub fn set(&mut self, name: impl Into<PropertyName>, value: Value) {
        let name = name.into();
        self.metadata.changed_properties.insert(name.clone());
        self.properties.set(name, value);
    }

    /// Removes a property and records it as changed.
    pub fn unset(&mut self, name: &PropertyName) {
        self.metadata.changed_properties.insert(name.clone());
        self.properties.unset(name);
    }

    /// The full property bag.
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Marks every present property as changed (used for freshly created
    /// entities, where everything is new).
    pub fn mark_all_changed(&mut self) {
        let names: Vec<PropertyName> = self.properties.names().cloned().collect();
        for name in names {
            self.metadata.changed_properties.insert(name);
        }
    }
}

/// The serialized on-disk form of one revision record.
///
/// Type and id live in the tree name and key; only metadata and
/// properties are stored in the value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub deleted: bool,
    pub replay_to_source: bool,
    pub changed_properties: BTreeSet<PropertyName>,
    pub properties: PropertyMap,
}

impl StoredRecord {
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            deleted: entity.metadata.deleted,
            replay_to_source: entity.metadata.replay_to_source,
            changed_properties: entity.metadata.changed_properties.clone(),
            properties: entity.properties().clone(),
        }
    }

    pub fn into_entity(self, entity_type: EntityType, id: EntityId, revision: Revision) -> Entity {
        let mut entity = Entity::with_id(entity_type, id);
        entity.metadata = EntityMetadata {
            revision,
            deleted: self.deleted,
            replay_to_source: self.replay_to_source,
            changed_properties: self.changed_properties,
        };
        // Bypass change tracking: this is a read, not a mutation.
        entity.properties = self.properties;
        entity
    }
}

/// Capability record for one entity type.
///
/// Replaces adaptor-factory hierarchies: the pipeline and query engine
/// are polymorphic over this record, not over trait hierarchies.
#[derive(Clone, Debug, Default)]
pub struct TypeCapabilities {
    /// Schema restricting declared property kinds.
    pub schema: TypeSchema,

    /// Properties maintained in secondary indices. Multi-valued (list)
    /// properties fan out to one index entry per element.
    pub index_properties: Vec<PropertyName>,
}

impl TypeCapabilities {
    /// Creates capabilities with the given schema and indexed properties.
    pub fn new(
        schema: TypeSchema,
        index_properties: impl IntoIterator<Item = PropertyName>,
    ) -> Self {
        Self {
            schema,
            index_properties: index_properties.into_iter().collect(),
        }
    }
}

/// Registry of entity types known to a resource instance.
///
/// Constructed once at startup and shared through the process context;
/// there is no global registry.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<EntityType, TypeCapabilities>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a type's capabilities.
    pub fn register(&mut self, entity_type: impl Into<EntityType>, caps: TypeCapabilities) {
        self.types.insert(entity_type.into(), caps);
    }

    /// Looks up a type's capabilities.
    pub fn capabilities(&self, entity_type: &EntityType) -> Option<&TypeCapabilities> {
        self.types.get(entity_type)
    }

    /// Returns the indexed properties of a type (empty if unregistered).
    pub fn index_properties(&self, entity_type: &EntityType) -> &[PropertyName] {
        self.types
            .get(entity_type)
            .map(|caps| caps.index_properties.as_slice())
            .unwrap_or(&[])
    }

    /// Returns true if the type is registered.
    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.types.contains_key(entity_type)
    }

    /// Iterates registered types.
    pub fn types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.keys()
    }

    /// The standard PIM type set: mail, folder, calendar, event, todo,
    /// contact.
    pub fn standard() -> Arc<Self> {
        let mut registry = Self::new();

        registry.register(
            "mail",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("subject", ValueKind::String)
                    .property("sender", ValueKind::String)
                    .property("senderName", ValueKind::String)
                    .property("date", ValueKind::Timestamp)
                    .property("folder", ValueKind::IdRef)
                    .property_kinds("mimeMessage", [ValueKind::Bytes, ValueKind::Blob])
                    .property("plainTextBody", ValueKind::String)
                    .property("unread", ValueKind::Bool)
                    .property("important", ValueKind::Bool)
                    .property("draft", ValueKind::Bool)
                    .property("trash", ValueKind::Bool)
                    .property("sent", ValueKind::Bool)
                    .property("messageId", ValueKind::String)
                    .property("parentMessageIds", ValueKind::String)
                    .property("threadId", ValueKind::String),
                [
                    PropertyName::new("folder"),
                    PropertyName::new("date"),
                    PropertyName::new("messageId"),
                    PropertyName::new("parentMessageIds"),
                    PropertyName::new("threadId"),
                    PropertyName::new("draft"),
                ],
            ),
        );

        registry.register(
            "folder",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("name", ValueKind::String)
                    .property("icon", ValueKind::String)
                    .property("parent", ValueKind::IdRef)
                    .property("specialpurpose", ValueKind::String)
                    .property("enabled", ValueKind::Bool),
                [
                    PropertyName::new("name"),
                    PropertyName::new("parent"),
                    PropertyName::new("specialpurpose"),
                ],
            ),
        );

        registry.register(
            "calendar",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("name", ValueKind::String)
                    .property("color", ValueKind::String)
                    .property("enabled", ValueKind::Bool),
                [PropertyName::new("name")],
            ),
        );

        registry.register(
            "event",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("uid", ValueKind::String)
                    .property("summary", ValueKind::String)
                    .property("description", ValueKind::String)
                    .property("dtStart", ValueKind::Timestamp)
                    .property("dtEnd", ValueKind::Timestamp)
                    .property("recurring", ValueKind::Bool)
                    .property("allDay", ValueKind::Bool)
                    .property("calendar", ValueKind::IdRef)
                    .property_kinds("ical", [ValueKind::Bytes, ValueKind::Blob]),
                [
                    PropertyName::new("uid"),
                    PropertyName::new("dtStart"),
                    PropertyName::new("dtEnd"),
                    PropertyName::new("calendar"),
                    PropertyName::new("recurring"),
                ],
            ),
        );

        registry.register(
            "todo",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("uid", ValueKind::String)
                    .property("summary", ValueKind::String)
                    .property("description", ValueKind::String)
                    .property("completedDate", ValueKind::Timestamp)
                    .property("dueDate", ValueKind::Timestamp)
                    .property("status", ValueKind::String)
                    .property("calendar", ValueKind::IdRef),
                [
                    PropertyName::new("uid"),
                    PropertyName::new("calendar"),
                    PropertyName::new("status"),
                    PropertyName::new("dueDate"),
                ],
            ),
        );

        registry.register(
            "contact",
            TypeCapabilities::new(
                TypeSchema::new()
                    .property("uid", ValueKind::String)
                    .property("fn", ValueKind::String)
                    .property("firstname", ValueKind::String)
                    .property("lastname", ValueKind::String)
                    .property("emails", ValueKind::String)
                    .property("addressbook", ValueKind::IdRef)
                    .property_kinds("vcard", [ValueKind::Bytes, ValueKind::Blob]),
                [
                    PropertyName::new("uid"),
                    PropertyName::new("fn"),
                    PropertyName::new("emails"),
                    PropertyName::new("addressbook"),
                ],
            ),
        );

        Arc::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_set_tracks_changes() {
        let mut entity = Entity::new("event");
        assert!(entity.metadata.changed_properties.is_empty());

        entity.set("summary", Value::String("A".into()));
        assert!(entity
            .metadata
            .changed_properties
            .contains(&PropertyName::new("summary")));
        assert_eq!(entity.get("summary").and_then(Value::as_str), Some("A"));
    }

    #[test]
    fn test_entity_unset_tracks_changes() {
        let mut entity = Entity::new("event");
        entity.set("summary", Value::String("A".into()));
        entity.metadata.changed_properties.clear();

        entity.unset(&PropertyName::new("summary"));
        assert!(entity.get("summary").is_none());
        assert!(entity
            .metadata
            .changed_properties
            .contains(&PropertyName::new("summary")));
    }

    #[test]
    fn test_stored_record_roundtrip() {
        let mut entity = Entity::new("mail");
        entity.set("subject", Value::String("hello".into()));
        entity.metadata.replay_to_source = true;

        let record = StoredRecord::from_entity(&entity);
        let bytes = bincode::serialize(&record).unwrap();
        let restored: StoredRecord = bincode::deserialize(&bytes).unwrap();
        let roundtripped =
            restored.into_entity(entity.entity_type().clone(), entity.id(), Revision(3));

        assert_eq!(roundtripped.id(), entity.id());
        assert_eq!(roundtripped.revision(), Revision(3));
        assert!(roundtripped.metadata.replay_to_source);
        assert_eq!(
            roundtripped.get("subject").and_then(Value::as_str),
            Some("hello")
        );
    }

    #[test]
    fn test_standard_registry_has_pim_types() {
        let registry = TypeRegistry::standard();
        for name in ["mail", "folder", "calendar", "event", "todo", "contact"] {
            assert!(
                registry.contains(&EntityType::new(name)),
                "missing type {}",
                name
            );
        }
    }

    #[test]
    fn test_standard_mail_indices() {
        let registry = TypeRegistry::standard();
        let indexed = registry.index_properties(&EntityType::new("mail"));
        assert!(indexed.contains(&PropertyName::new("threadId")));
        assert!(indexed.contains(&PropertyName::new("folder")));
        assert!(indexed.contains(&PropertyName::new("date")));
    }

    #[test]
    fn test_unregistered_type_has_no_indices() {
        let registry = TypeRegistry::standard();
        assert!(registry
            .index_properties(&EntityType::new("widget"))
            .is_empty());
    }
}
