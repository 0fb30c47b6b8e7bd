//! Cache store capability and the bundled in-memory implementation.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;

use crate::domain::StoreError;
use crate::util::lock::{rw_read, rw_write};

use super::config::CacheConfig;

const SOURCE: &str = "cache::store";
const METRIC_MEMORY_EVICT: &str = "viewcache_memory_evict_total";

/// Cached HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Only 2xx responses are committed to the store.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Key/value store holding serialized responses.
///
/// Implementations must tolerate concurrent callers. `delete_by_prefix` removes
/// every key whose serialized form starts with `prefix` and returns how many were
/// removed; removing nothing is not an error.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError>;

    async fn set(&self, key: &str, response: CachedResponse) -> Result<(), StoreError>;

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// In-memory response store with LRU eviction.
pub struct MemoryCacheStore {
    responses: RwLock<LruCache<String, CachedResponse>>,
}

impl MemoryCacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.memory_response_limit_non_zero())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            responses: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Snapshot of the stored keys, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.responses, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        rw_read(&self.responses, SOURCE, "contains").contains(key)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.responses, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.responses, SOURCE, "clear").clear();
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        Ok(rw_write(&self.responses, SOURCE, "get").get(key).cloned())
    }

    async fn set(&self, key: &str, response: CachedResponse) -> Result<(), StoreError> {
        let evicted = rw_write(&self.responses, SOURCE, "set").push(key.to_string(), response);
        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            counter!(METRIC_MEMORY_EVICT).increment(1);
        }
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut responses = rw_write(&self.responses, SOURCE, "delete_by_prefix");
        let doomed: Vec<String> = responses
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            responses.pop(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn ok(body: &'static str) -> CachedResponse {
        CachedResponse::new(200, body).with_header("content-type", "text/plain")
    }

    #[tokio::test]
    async fn roundtrip_and_prefix_delete() {
        let store = MemoryCacheStore::default();
        store.set("posts:post:7:aa:en", ok("seven")).await.unwrap();
        store.set("posts:post:7:bb:es", ok("siete")).await.unwrap();
        store.set("posts:post:9:aa:en", ok("nine")).await.unwrap();

        let cached = store.get("posts:post:7:aa:en").await.unwrap().expect("cached");
        assert_eq!(cached.body, Bytes::from("seven"));

        let removed = store.delete_by_prefix("posts:post:7:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys(), vec!["posts:post:9:aa:en".to_string()]);
    }

    #[tokio::test]
    async fn deleting_absent_prefix_is_a_no_op() {
        let store = MemoryCacheStore::default();
        store.set("posts:post:9:aa:en", ok("nine")).await.unwrap();

        assert_eq!(store.delete_by_prefix("posts:post:7:").await.unwrap(), 0);
        assert_eq!(store.delete_by_prefix("posts:post:7:").await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lru_capacity_is_enforced() {
        let config = CacheConfig {
            memory_response_limit: 2,
            ..Default::default()
        };
        let store = MemoryCacheStore::new(&config);

        store.set("a:::1:en", ok("a")).await.unwrap();
        store.set("b:::1:en", ok("b")).await.unwrap();
        assert!(store.get("a:::1:en").await.unwrap().is_some());
        store.set("c:::1:en", ok("c")).await.unwrap();

        assert!(store.contains("a:::1:en"));
        assert!(!store.contains("b:::1:en"));
        assert!(store.contains("c:::1:en"));
    }

    #[test]
    fn success_is_any_2xx() {
        assert!(CachedResponse::new(200, "").is_success());
        assert!(CachedResponse::new(204, "").is_success());
        assert!(!CachedResponse::new(304, "").is_success());
        assert!(!CachedResponse::new(500, "").is_success());
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = MemoryCacheStore::default();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .responses
                .write()
                .expect("responses lock should be acquired");
            panic!("poison responses lock");
        }));

        store.set("a:::1:en", ok("a")).await.unwrap();
        assert!(store.get("a:::1:en").await.unwrap().is_some());
        store.clear();
        assert!(store.is_empty());
    }
}
