//! Cached view: one namespace wired end to end.
//!
//! `CachedView::wire` validates the rules, subscribes the dispatcher to the change
//! notifier and hands back the read path. The read path computes the key, serves a
//! stored response verbatim on hit and commits successful responses on miss.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::domain::EntityStore;

use super::dispatcher::InvalidationDispatcher;
use super::error::{CacheError, StoreKind};
use super::events::{ChangeNotifier, SubscriptionId};
use super::keys::{CacheKey, RequestContext, build_key};
use super::namespace::Namespace;
use super::registry::InvalidationRegistry;
use super::rules::Rule;
use super::store::{CacheStore, CachedResponse};

const METRIC_HIT: &str = "viewcache_response_hit_total";
const METRIC_MISS: &str = "viewcache_response_miss_total";
const METRIC_COMMIT: &str = "viewcache_response_commit_total";
const METRIC_STORE_ERROR: &str = "viewcache_store_error_total";

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CachedResponse),
    /// Nothing usable is stored; commit the computed response under this key.
    Miss(CacheKey),
}

pub struct CachedView {
    cache: Arc<dyn CacheStore>,
    dispatcher: Arc<InvalidationDispatcher>,
    subscriptions: Vec<SubscriptionId>,
}

impl CachedView {
    /// Build the registry for `namespace`, subscribe its receivers to `notifier`
    /// and return the read path.
    ///
    /// Misconfigured rules fail here, before the namespace serves any request.
    pub fn wire(
        namespace: Namespace,
        rules: impl IntoIterator<Item = Rule>,
        cache: Arc<dyn CacheStore>,
        entities: Arc<dyn EntityStore>,
        notifier: &dyn ChangeNotifier,
    ) -> Result<Self, CacheError> {
        let registry = Arc::new(InvalidationRegistry::build(namespace, rules)?);
        let dispatcher = Arc::new(InvalidationDispatcher::new(
            registry,
            Arc::clone(&cache),
            entities,
        ));
        let subscriptions = dispatcher.subscribe(notifier);

        Ok(Self {
            cache,
            dispatcher,
            subscriptions,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        self.dispatcher.registry().namespace()
    }

    pub fn dispatcher(&self) -> &Arc<InvalidationDispatcher> {
        &self.dispatcher
    }

    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }

    pub fn key_for(&self, request: &RequestContext) -> CacheKey {
        build_key(self.namespace(), request)
    }

    /// Look up `request`. A store failure degrades to a miss.
    #[instrument(skip_all, fields(reference = self.namespace().reference(), target = request.target()))]
    pub async fn lookup(&self, request: &RequestContext) -> Lookup {
        let key = self.key_for(request);
        let serialized = key.to_string();

        match self.cache.get(&serialized).await {
            Ok(Some(response)) => {
                counter!(METRIC_HIT).increment(1);
                debug!(key = %serialized, outcome = "hit", "Response cache lookup");
                Lookup::Hit(response)
            }
            Ok(None) => {
                counter!(METRIC_MISS).increment(1);
                debug!(key = %serialized, outcome = "miss", "Response cache lookup");
                Lookup::Miss(key)
            }
            Err(err) => {
                let err = CacheError::cache_store(err);
                counter!(METRIC_MISS).increment(1);
                counter!(METRIC_STORE_ERROR, "store" => StoreKind::Cache.as_str(), "op" => "get")
                    .increment(1);
                warn!(key = %serialized, error = %err, "Response cache lookup failed; serving uncached");
                Lookup::Miss(key)
            }
        }
    }

    /// Store `response` under `key` if it is a success. Returns whether it was
    /// written.
    pub async fn commit(&self, key: &CacheKey, response: CachedResponse) -> bool {
        if !response.is_success() {
            debug!(key = %key, status = response.status, "Response not cacheable");
            return false;
        }

        let serialized = key.to_string();
        match self.cache.set(&serialized, response).await {
            Ok(()) => {
                counter!(METRIC_COMMIT).increment(1);
                debug!(key = %serialized, "Response committed");
                true
            }
            Err(err) => {
                let err = CacheError::cache_store(err);
                counter!(METRIC_STORE_ERROR, "store" => StoreKind::Cache.as_str(), "op" => "set")
                    .increment(1);
                warn!(key = %serialized, error = %err, "Response commit failed");
                false
            }
        }
    }

    /// Serve `request` from the cache or from `handler`.
    ///
    /// The commit completes before this returns. Dropping the future before then
    /// leaves the store untouched.
    pub async fn serve<F, Fut>(&self, request: &RequestContext, handler: F) -> CachedResponse
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResponse>,
    {
        match self.lookup(request).await {
            Lookup::Hit(response) => response,
            Lookup::Miss(key) => {
                let response = handler().await;
                self.commit(&key, response.clone()).await;
                response
            }
        }
    }
}
