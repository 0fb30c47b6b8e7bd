//! In-process entity store.
//!
//! Holds entity snapshots and the relationships between them so the route resolver
//! can be exercised without a database. Relationship fields may be many-valued
//! (`Post.comments`) or scalar foreign keys captured as instance fields
//! (`Comment.post = "7"`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::util::lock::{rw_read, rw_write};

use super::entities::{EntityInstance, EntityStore, FieldLookup};
use super::error::StoreError;

const SOURCE: &str = "domain::memory";

type Link = (String, String);

#[derive(Debug, Clone)]
struct StoredEntity {
    instance: EntityInstance,
    links: BTreeMap<String, BTreeSet<Link>>,
}

impl StoredEntity {
    fn references(&self, field: &str, value: &EntityInstance) -> bool {
        let linked = self.links.get(field).is_some_and(|targets| {
            targets.contains(&(value.entity_tag().to_string(), value.id().to_string()))
        });
        linked || self.instance.field(field) == Some(value.id())
    }
}

/// Entity store backed by in-memory tables keyed by entity tag.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    tables: RwLock<HashMap<String, Vec<StoredEntity>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance, keeping any relationships already recorded.
    pub fn insert(&self, instance: EntityInstance) {
        let mut tables = rw_write(&self.tables, SOURCE, "insert");
        let table = tables.entry(instance.entity_tag().to_string()).or_default();
        match table.iter_mut().find(|row| row.instance.id() == instance.id()) {
            Some(row) => row.instance = instance,
            None => table.push(StoredEntity {
                instance,
                links: BTreeMap::new(),
            }),
        }
    }

    /// Record that `owner.field` references `target`.
    pub fn link(&self, owner: &EntityInstance, field: &str, target: &EntityInstance) {
        let mut tables = rw_write(&self.tables, SOURCE, "link");
        let table = tables.entry(owner.entity_tag().to_string()).or_default();
        let index = match table.iter().position(|row| row.instance.id() == owner.id()) {
            Some(index) => index,
            None => {
                table.push(StoredEntity {
                    instance: owner.clone(),
                    links: BTreeMap::new(),
                });
                table.len() - 1
            }
        };
        table[index]
            .links
            .entry(field.to_string())
            .or_default()
            .insert((target.entity_tag().to_string(), target.id().to_string()));
    }

    pub fn remove(&self, instance: &EntityInstance) {
        let mut tables = rw_write(&self.tables, SOURCE, "remove");
        if let Some(table) = tables.get_mut(instance.entity_tag()) {
            table.retain(|row| row.instance.id() != instance.id());
        }
    }

    /// Number of stored instances across all types.
    pub fn len(&self) -> usize {
        rw_read(&self.tables, SOURCE, "len")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_by_field(&self, lookup: FieldLookup<'_>) -> Result<BTreeSet<String>, StoreError> {
        let tables = rw_read(&self.tables, SOURCE, "find_by_field");
        let Some(table) = tables.get(lookup.entity_type.tag()) else {
            return Ok(BTreeSet::new());
        };

        Ok(table
            .iter()
            .filter(|row| row.references(lookup.field, lookup.value))
            .map(|row| row.instance.value_of(lookup.identify_by).to_string())
            .collect())
    }
}
