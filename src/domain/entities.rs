use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::StoreError;

/// A kind of entity known to the host application, e.g. `Post` or `Comment`.
///
/// Two entity types are the same type when their lowercased names match; the
/// lowercased name is the `entityTypeTag` used in cache keys.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: Arc<str>,
    tag: Arc<str>,
    fields: Arc<BTreeSet<String>>,
}

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        let tag = name.to_lowercase();
        Self {
            name: name.into(),
            tag: tag.into(),
            fields: Arc::new(BTreeSet::new()),
        }
    }

    /// Declare the fields this type exposes for instance lookup and relationship routes.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut declared = (*self.fields).clone();
        declared.extend(fields.into_iter().map(Into::into));
        self.fields = Arc::new(declared);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A snapshot of one changed entity, as delivered by the change notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInstance {
    entity_type: String,
    id: String,
    fields: BTreeMap<String, String>,
}

impl EntityInstance {
    pub fn new(entity_type: &EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.tag().to_string(),
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Lowercased type name of this instance.
    pub fn entity_tag(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_a(&self, entity_type: &EntityType) -> bool {
        self.entity_type == entity_type.tag()
    }

    /// Value of `field` on this instance. Fields that were not captured resolve to
    /// the instance identifier, so an instance field such as `id` or `pk` works
    /// without being copied into the field map.
    pub fn value_of(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or(&self.id)
    }

    pub fn field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

impl fmt::Display for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.id)
    }
}

/// Kind of change reported for an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted];

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One filtered lookup against the entity store.
///
/// Reads as: "all instances of `entity_type` whose `field` references `value`,
/// identified by their `identify_by` field".
#[derive(Debug, Clone, Copy)]
pub struct FieldLookup<'a> {
    pub entity_type: &'a EntityType,
    pub field: &'a str,
    pub value: &'a EntityInstance,
    pub identify_by: &'a str,
}

/// Capability to query the application's data-access layer.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Return the distinct identifiers of every matching instance.
    async fn find_by_field(&self, lookup: FieldLookup<'_>) -> Result<BTreeSet<String>, StoreError>;
}
