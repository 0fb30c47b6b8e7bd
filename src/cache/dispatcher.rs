//! Invalidation dispatcher.
//!
//! Subscribes one receiver per (rule, event kind) to the change notifier and, when a
//! change fires, turns the rule's scope into key prefixes and purges them from the
//! cache store. Invocations are independent: the registry is read-only and prefix
//! deletion is idempotent, so concurrent invocations need no coordination.

use std::collections::BTreeSet;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, instrument, warn};

use crate::domain::{ChangeKind, EntityStore};

use super::error::CacheError;
use super::events::{ChangeEvent, ChangeHandler, ChangeNotifier, SubscriptionId};
use super::keys::KeyPrefix;
use super::registry::{CompiledRule, InvalidationRegistry, RuleScope};
use super::resolver::RouteResolver;
use super::store::CacheStore;

const METRIC_INVALIDATION: &str = "viewcache_invalidation_total";
const METRIC_INVALIDATION_FAILED: &str = "viewcache_invalidation_failed_total";
const METRIC_EVICTED_KEYS: &str = "viewcache_evicted_keys_total";
const METRIC_INVALIDATION_MS: &str = "viewcache_invalidation_ms";

/// Result of one rule invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub scope: &'static str,
    pub prefixes: Vec<KeyPrefix>,
    pub evicted: usize,
}

pub struct InvalidationDispatcher {
    registry: Arc<InvalidationRegistry>,
    cache: Arc<dyn CacheStore>,
    resolver: RouteResolver,
}

impl InvalidationDispatcher {
    pub fn new(
        registry: Arc<InvalidationRegistry>,
        cache: Arc<dyn CacheStore>,
        entities: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            registry,
            cache,
            resolver: RouteResolver::new(entities),
        }
    }

    pub fn registry(&self) -> &Arc<InvalidationRegistry> {
        &self.registry
    }

    /// Subscribe one receiver per (rule, event kind) pair.
    pub fn subscribe(self: &Arc<Self>, notifier: &dyn ChangeNotifier) -> Vec<SubscriptionId> {
        let reference = self.registry.namespace().reference();
        let mut subscriptions = Vec::new();

        for rule in self.registry.rules() {
            for kind in rule.event_kinds() {
                let receiver = RuleReceiver {
                    dispatcher: Arc::clone(self),
                    reference: reference.to_string(),
                    entity_tag: rule.source().tag().to_string(),
                    rule: rule.clone(),
                    kind: *kind,
                };
                subscriptions.push(notifier.subscribe(
                    rule.source(),
                    &BTreeSet::from([*kind]),
                    Arc::new(receiver),
                ));
            }
        }

        debug!(
            reference,
            subscriptions = subscriptions.len(),
            "Invalidation receivers subscribed"
        );
        subscriptions
    }

    /// Key prefixes `rule` evicts for `event`.
    pub async fn plan(
        &self,
        rule: &CompiledRule,
        event: &ChangeEvent,
    ) -> Result<BTreeSet<KeyPrefix>, CacheError> {
        let namespace = self.registry.namespace();
        let reference = namespace.reference();
        let entity_tag = namespace.entity_tag();
        let whole_type = || BTreeSet::from([KeyPrefix::entity_type(reference, entity_tag)]);

        let Some(primary) = namespace.primary() else {
            return Ok(BTreeSet::from([KeyPrefix::namespace(reference)]));
        };

        match rule.scope() {
            RuleScope::Namespace => Ok(BTreeSet::from([KeyPrefix::namespace(reference)])),
            RuleScope::EntityType => Ok(whole_type()),
            RuleScope::Instance { field } if event.instance.is_a(primary) => {
                Ok(BTreeSet::from([KeyPrefix::instance(
                    reference,
                    entity_tag,
                    event.instance.value_of(field),
                )]))
            }
            // Only reachable when called with an event of another type; the
            // subscription never delivers one.
            RuleScope::Instance { .. } => Ok(whole_type()),
            RuleScope::Routed { field } => {
                let routes = self.registry.routes_for(event.instance.entity_tag());
                let ids = self
                    .resolver
                    .resolve_all(routes, &event.instance, primary, field)
                    .await?;
                Ok(ids
                    .iter()
                    .map(|id| KeyPrefix::instance(reference, entity_tag, id))
                    .collect())
            }
        }
    }

    /// Compute and execute the eviction for one rule.
    #[instrument(
        skip_all,
        fields(
            reference = self.registry.namespace().reference(),
            rule = rule.index(),
            scope = %rule.scope(),
            entity = %event.instance,
            event_kind = %event.kind,
        )
    )]
    pub async fn invalidate(
        &self,
        rule: &CompiledRule,
        event: &ChangeEvent,
    ) -> Result<InvalidationOutcome, CacheError> {
        let started_at = Instant::now();
        let result = self.invalidate_inner(rule, event).await;

        match &result {
            Ok(outcome) => {
                counter!(METRIC_INVALIDATION, "scope" => outcome.scope).increment(1);
                counter!(METRIC_EVICTED_KEYS).increment(outcome.evicted as u64);
                debug!(
                    prefixes = outcome.prefixes.len(),
                    evicted = outcome.evicted,
                    "Invalidation complete"
                );
            }
            Err(_) => counter!(METRIC_INVALIDATION_FAILED).increment(1),
        }
        histogram!(METRIC_INVALIDATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        result
    }

    async fn invalidate_inner(
        &self,
        rule: &CompiledRule,
        event: &ChangeEvent,
    ) -> Result<InvalidationOutcome, CacheError> {
        let prefixes = self.plan(rule, event).await?;

        let deletions = prefixes
            .iter()
            .map(|prefix| self.cache.delete_by_prefix(prefix.as_str()));
        let mut evicted = 0;
        let mut failure = None;
        for result in join_all(deletions).await {
            match result {
                Ok(count) => evicted += count,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(CacheError::cache_store(err));
        }

        Ok(InvalidationOutcome {
            scope: rule.scope().label(),
            prefixes: prefixes.into_iter().collect(),
            evicted,
        })
    }

    /// Run every rule subscribed to `event`'s type and kind, each isolated from the
    /// others' failures. For hosts that deliver events without per-rule subscriptions.
    pub async fn handle_event(
        &self,
        event: &ChangeEvent,
    ) -> Vec<Result<InvalidationOutcome, CacheError>> {
        let matching = self.registry.rules().iter().filter(|rule| {
            event.instance.is_a(rule.source()) && rule.event_kinds().contains(&event.kind)
        });
        join_all(matching.map(|rule| self.invalidate(rule, event))).await
    }
}

/// Snapshot captured by each subscription: the namespace reference, the rule and its
/// source tag, and the event kind it was registered for.
struct RuleReceiver {
    dispatcher: Arc<InvalidationDispatcher>,
    reference: String,
    entity_tag: String,
    rule: CompiledRule,
    kind: ChangeKind,
}

#[async_trait]
impl ChangeHandler for RuleReceiver {
    async fn handle(&self, event: &ChangeEvent) {
        if event.kind != self.kind || event.instance.entity_tag() != self.entity_tag {
            return;
        }

        if let Err(err) = self.dispatcher.invalidate(&self.rule, event).await {
            let cause = err.source().map(ToString::to_string).unwrap_or_default();
            warn!(
                reference = %self.reference,
                rule = self.rule.index(),
                event_id = %event.id,
                error = %err,
                cause = %cause,
                "Invalidation failed; cached entries may be stale"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::namespace::Namespace;
    use crate::cache::rules::Rule;
    use crate::cache::store::{CachedResponse, MemoryCacheStore};
    use crate::domain::{EntityInstance, EntityType, MemoryEntityStore, StoreError};

    struct FlakyStore {
        inner: MemoryCacheStore,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, response: CachedResponse) -> Result<(), StoreError> {
            self.inner.set(key, response).await
        }

        async fn delete_by_prefix(&self, _prefix: &str) -> Result<usize, StoreError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::unavailable("cache node down"))
        }
    }

    fn post() -> EntityType {
        EntityType::new("Post").with_fields(["id", "comments"])
    }

    fn comment() -> EntityType {
        EntityType::new("Comment").with_fields(["id"])
    }

    fn dispatcher(
        namespace: Namespace,
        rules: Vec<Rule>,
        cache: Arc<dyn CacheStore>,
        entities: Arc<MemoryEntityStore>,
    ) -> InvalidationDispatcher {
        let registry = InvalidationRegistry::build(namespace, rules).expect("valid registry");
        InvalidationDispatcher::new(Arc::new(registry), cache, entities)
    }

    fn event(kind: ChangeKind, instance: EntityInstance) -> ChangeEvent {
        ChangeEvent::new(kind, instance, 0)
    }

    async fn seed(cache: &MemoryCacheStore, keys: &[&str]) {
        for key in keys {
            cache
                .set(key, CachedResponse::new(200, "cached"))
                .await
                .expect("seed");
        }
    }

    #[tokio::test]
    async fn instance_rule_evicts_only_that_instance() {
        let cache = Arc::new(MemoryCacheStore::default());
        seed(&cache, &["posts:post:7:aa:en", "posts:post:7:bb:es", "posts:post:9:aa:en"]).await;
        let namespace = Namespace::builder("posts")
            .primary(post())
            .instance_field("id")
            .build()
            .unwrap();
        let dispatcher = dispatcher(
            namespace,
            vec![Rule::new(post(), [ChangeKind::Updated])],
            cache.clone(),
            Arc::new(MemoryEntityStore::new()),
        );

        let rule = dispatcher.registry().rule(0).unwrap().clone();
        let outcome = dispatcher
            .invalidate(&rule, &event(ChangeKind::Updated, EntityInstance::new(&post(), "7")))
            .await
            .expect("invalidation succeeds");

        assert_eq!(outcome.scope, "instance");
        assert_eq!(outcome.evicted, 2);
        assert_eq!(cache.keys(), vec!["posts:post:9:aa:en".to_string()]);
    }

    #[tokio::test]
    async fn routed_rule_plans_one_prefix_per_primary() {
        let entities = Arc::new(MemoryEntityStore::new());
        let comment_1 = EntityInstance::new(&comment(), "1");
        entities.link(&EntityInstance::new(&post(), "7"), "comments", &comment_1);
        entities.link(&EntityInstance::new(&post(), "9"), "comments", &comment_1);

        let namespace = Namespace::builder("posts")
            .primary(post())
            .instance_field("id")
            .build()
            .unwrap();
        let dispatcher = dispatcher(
            namespace,
            vec![Rule::new(comment(), [ChangeKind::Created]).route("comments")],
            Arc::new(MemoryCacheStore::default()),
            entities,
        );

        let rule = dispatcher.registry().rule(0).unwrap().clone();
        let prefixes = dispatcher
            .plan(&rule, &event(ChangeKind::Created, comment_1))
            .await
            .expect("plan succeeds");

        let prefixes: Vec<_> = prefixes.iter().map(KeyPrefix::as_str).collect();
        assert_eq!(prefixes, ["posts:post:7:", "posts:post:9:"]);
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_raised() {
        let cache = Arc::new(FlakyStore {
            inner: MemoryCacheStore::default(),
            deletes: AtomicUsize::new(0),
        });
        let namespace = Namespace::builder("posts").primary(post()).build().unwrap();
        let dispatcher = Arc::new(dispatcher(
            namespace,
            vec![
                Rule::new(post(), [ChangeKind::Updated]),
                Rule::new(post(), [ChangeKind::Updated, ChangeKind::Deleted]),
            ],
            cache.clone(),
            Arc::new(MemoryEntityStore::new()),
        ));

        let results = dispatcher
            .handle_event(&event(ChangeKind::Updated, EntityInstance::new(&post(), "7")))
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| matches!(
            result,
            Err(CacheError::StoreUnavailable { .. })
        )));
        assert_eq!(cache.deletes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscribes_one_receiver_per_rule_and_kind() {
        let bus = crate::cache::events::ChangeBus::new();
        let namespace = Namespace::builder("posts").primary(post()).build().unwrap();
        let dispatcher = Arc::new(dispatcher(
            namespace,
            vec![
                Rule::on_any_change(post()),
                Rule::new(comment(), [ChangeKind::Created]).route("comments"),
            ],
            Arc::new(MemoryCacheStore::default()),
            Arc::new(MemoryEntityStore::new()),
        ));

        let subscriptions = dispatcher.subscribe(&bus);
        assert_eq!(subscriptions.len(), 4);
        assert_eq!(bus.subscriber_count(), 4);
    }
}
