//! ``src/model/entity.rs``
//! ============================================================================
//! # Entity and Publish Records
//!
//! Immutable snapshots of what the entity database returned. Field values stay
//! as raw JSON so grouping and filtering compare exactly what the server sent.

use compact_str::CompactString;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record type name used for published files.
pub const PUBLISHED_FILE_TYPE: &str = "PublishedFile";

/// Lightweight link to an entity (`{"type": .., "id": .., "name": ..}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: CompactString,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    #[must_use]
    pub fn new(entity_type: &str, id: i64) -> Self {
        Self {
            entity_type: CompactString::new(entity_type),
            id,
            name: None,
        }
    }

    #[must_use]
    pub fn named(entity_type: &str, id: i64, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(entity_type, id)
        }
    }

    /// Interpret a raw field value as an entity link.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let entity_type = object.get("type")?.as_str()?;
        let id = object.get("id")?.as_i64()?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(Self {
            entity_type: CompactString::new(entity_type),
            id,
            name,
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("type".into(), Value::from(self.entity_type.as_str()));
        object.insert("id".into(), Value::from(self.id));
        if let Some(name) = &self.name {
            object.insert("name".into(), Value::from(name.as_str()));
        }
        Value::Object(object)
    }

    /// Same entity regardless of display name.
    #[must_use]
    pub fn same_entity(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type && self.id == other.id
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.entity_type, self.id))
    }
}

/// Anything filters can be evaluated against.
pub trait FieldSource {
    /// Raw value of `field`, `Value::Null` when absent.
    fn field_value(&self, field: &str) -> Value;
}

/// One entity as returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "type")]
    pub entity_type: CompactString,
    pub id: i64,
    #[serde(default)]
    pub fields: IndexMap<String, Value>,
}

impl EntityRecord {
    #[must_use]
    pub fn new(entity_type: &str, id: i64) -> Self {
        Self {
            entity_type: CompactString::new(entity_type),
            id,
            fields: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(field.to_owned(), value);
        self
    }

    /// Best display name: `code`, then `name`, then `content`.
    #[must_use]
    pub fn display_name(&self) -> String {
        ["code", "name", "content"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map_or_else(|| format!("{} {}", self.entity_type, self.id), str::to_owned)
    }

    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type.clone(),
            id: self.id,
            name: Some(self.display_name()),
        }
    }
}

impl FieldSource for EntityRecord {
    fn field_value(&self, field: &str) -> Value {
        match field {
            "id" => Value::from(self.id),
            "type" => Value::from(self.entity_type.as_str()),
            _ => self.fields.get(field).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Stable handle for a thumbnail image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThumbnailRef {
    /// Content/version identifier; the cache key.
    pub key: CompactString,
    /// Where the host downloads it from.
    pub source: String,
}

/// One published file at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: i64,
    #[serde(rename = "type", default = "default_publish_type")]
    pub entity_type: CompactString,
    #[serde(default)]
    pub name: String,
    pub published_file_type: String,
    pub path: String,
    pub version_number: i64,
    #[serde(default)]
    pub linked_entity: Option<EntityRef>,
    #[serde(default)]
    pub task: Option<EntityRef>,
    #[serde(default)]
    pub thumbnail_ref: Option<ThumbnailRef>,
    #[serde(default)]
    pub fields: IndexMap<String, Value>,
}

fn default_publish_type() -> CompactString {
    CompactString::const_new(PUBLISHED_FILE_TYPE)
}

impl PublishRecord {
    #[must_use]
    pub fn new(id: i64, published_file_type: &str, path: &str, version_number: i64) -> Self {
        Self {
            id,
            entity_type: default_publish_type(),
            name: String::new(),
            published_file_type: published_file_type.to_owned(),
            path: path.to_owned(),
            version_number,
            linked_entity: None,
            task: None,
            thumbnail_ref: None,
            fields: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn linked_to(mut self, entity: EntityRef) -> Self {
        self.linked_entity = Some(entity);
        self
    }

    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    #[must_use]
    pub fn with_thumbnail(mut self, key: &str, source: &str) -> Self {
        self.thumbnail_ref = Some(ThumbnailRef {
            key: CompactString::new(key),
            source: source.to_owned(),
        });
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(field.to_owned(), value);
        self
    }

    /// Key used to collapse older versions of the same stream.
    #[must_use]
    pub fn version_stream(&self) -> (Option<(CompactString, i64)>, &str) {
        (
            self.linked_entity
                .as_ref()
                .map(|e| (e.entity_type.clone(), e.id)),
            self.published_file_type.as_str(),
        )
    }

    #[must_use]
    pub fn as_entity_ref(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type.clone(),
            id: self.id,
            name: (!self.name.is_empty()).then(|| self.name.clone()),
        }
    }
}

impl FieldSource for PublishRecord {
    fn field_value(&self, field: &str) -> Value {
        let opt_ref = |r: &Option<EntityRef>| r.as_ref().map_or(Value::Null, EntityRef::to_value);

        match field {
            "id" => Value::from(self.id),
            "type" => Value::from(self.entity_type.as_str()),
            "code" | "name" => Value::from(self.name.as_str()),
            "published_file_type" => Value::from(self.published_file_type.as_str()),
            "path" => Value::from(self.path.as_str()),
            "version_number" => Value::from(self.version_number),
            "entity" => opt_ref(&self.linked_entity),
            "task" => opt_ref(&self.task),
            _ => self.fields.get(field).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Runtime context late-bound filter tokens resolve against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub project: Option<EntityRef>,
    pub user: Option<EntityRef>,
    pub entity: Option<EntityRef>,
    pub step: Option<EntityRef>,
    pub task: Option<EntityRef>,
}

impl Context {
    #[must_use]
    pub fn for_project(project: EntityRef) -> Self {
        Self {
            project: Some(project),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: EntityRef) -> Self {
        self.user = Some(user);
        self
    }
}

/// One child returned when listing a navigation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    pub label: String,
    pub path: String,
    #[serde(default)]
    pub entity_ref: Option<EntityRef>,
    #[serde(default = "default_true")]
    pub has_children: bool,
}

const fn default_true() -> bool {
    true
}
