//! Route resolution: from a changed related instance back to the primary
//! instances whose cached representations embed it.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, instrument};

use crate::domain::{EntityInstance, EntityStore, EntityType, FieldLookup};

use super::error::CacheError;
use super::rules::Route;

pub struct RouteResolver {
    entities: Arc<dyn EntityStore>,
}

impl RouteResolver {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }

    /// Identifiers (values of `identify_by`) of every `primary` instance whose
    /// `route.relationship_field` references `changed`.
    ///
    /// The result is a set: a primary instance reachable more than once yields one
    /// identifier.
    #[instrument(
        skip_all,
        fields(route = route.relationship_field(), changed = %changed, primary = primary.name())
    )]
    pub async fn resolve(
        &self,
        route: &Route,
        changed: &EntityInstance,
        primary: &EntityType,
        identify_by: &str,
    ) -> Result<BTreeSet<String>, CacheError> {
        let ids = self
            .entities
            .find_by_field(FieldLookup {
                entity_type: primary,
                field: route.relationship_field(),
                value: changed,
                identify_by,
            })
            .await
            .map_err(CacheError::entity_store)?;

        debug!(matched = ids.len(), "Route resolved");
        Ok(ids)
    }

    /// Union of `resolve` over `routes`. Lookups run concurrently; the first failure
    /// fails the whole resolution.
    pub async fn resolve_all(
        &self,
        routes: &[Route],
        changed: &EntityInstance,
        primary: &EntityType,
        identify_by: &str,
    ) -> Result<BTreeSet<String>, CacheError> {
        let lookups = routes
            .iter()
            .map(|route| self.resolve(route, changed, primary, identify_by));
        let resolved = try_join_all(lookups).await?;
        Ok(resolved.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::{MemoryEntityStore, StoreError};

    struct OfflineStore;

    #[async_trait]
    impl EntityStore for OfflineStore {
        async fn find_by_field(
            &self,
            _lookup: FieldLookup<'_>,
        ) -> Result<BTreeSet<String>, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
    }

    fn post() -> EntityType {
        EntityType::new("Post").with_fields(["id", "comments", "featured_comments"])
    }

    fn comment() -> EntityType {
        EntityType::new("Comment")
    }

    #[tokio::test]
    async fn resolves_primary_identifiers() {
        let store = Arc::new(MemoryEntityStore::new());
        let comment_1 = EntityInstance::new(&comment(), "1");
        store.link(&EntityInstance::new(&post(), "7"), "comments", &comment_1);
        store.link(&EntityInstance::new(&post(), "8"), "comments", &comment_1);
        store.insert(EntityInstance::new(&post(), "9"));

        let resolver = RouteResolver::new(store);
        let ids = resolver
            .resolve(&Route::new("comments"), &comment_1, &post(), "id")
            .await
            .expect("resolution succeeds");

        assert_eq!(ids, BTreeSet::from(["7".to_string(), "8".to_string()]));
    }

    #[tokio::test]
    async fn union_over_routes_is_distinct() {
        let store = Arc::new(MemoryEntityStore::new());
        let comment_1 = EntityInstance::new(&comment(), "1");
        let post_7 = EntityInstance::new(&post(), "7");
        store.link(&post_7, "comments", &comment_1);
        store.link(&post_7, "featured_comments", &comment_1);

        let resolver = RouteResolver::new(store);
        let ids = resolver
            .resolve_all(
                &[Route::new("comments"), Route::new("featured_comments")],
                &comment_1,
                &post(),
                "id",
            )
            .await
            .expect("resolution succeeds");

        assert_eq!(ids, BTreeSet::from(["7".to_string()]));
    }

    #[tokio::test]
    async fn unlinked_instance_resolves_to_nothing() {
        let resolver = RouteResolver::new(Arc::new(MemoryEntityStore::new()));
        let ids = resolver
            .resolve_all(
                &[Route::new("comments")],
                &EntityInstance::new(&comment(), "404"),
                &post(),
                "id",
            )
            .await
            .expect("resolution succeeds");
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_entity_store_error() {
        let resolver = RouteResolver::new(Arc::new(OfflineStore));
        let error = resolver
            .resolve(
                &Route::new("comments"),
                &EntityInstance::new(&comment(), "1"),
                &post(),
                "id",
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            CacheError::StoreUnavailable {
                store: crate::cache::error::StoreKind::Entity,
                ..
            }
        ));
    }
}
