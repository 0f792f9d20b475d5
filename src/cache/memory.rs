use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::CacheProvider;
use crate::connectors::QueryResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: QueryResult,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: QueryResult, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Process-local cache. The least recently used entry makes room when the
/// cache is full; expired entries are dropped when they are next read.
pub struct MemoryCache {
    store: RwLock<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: RwLock::new(LruCache::new(capacity)),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Option<QueryResult> {
        // LruCache::get bumps recency, so reads need the write lock
        let mut store = self.store.write().await;
        let entry = store.get(key)?;
        if !entry.is_expired() {
            return Some(entry.value.clone());
        }
        store.pop(key);
        None
    }

    async fn set(&self, key: &str, value: &QueryResult, ttl: Duration) {
        let evicted = self
            .store
            .write()
            .await
            .push(key.to_string(), CacheEntry::new(value.clone(), ttl));
        if let Some((evicted_key, _)) = evicted.filter(|(k, _)| k != key) {
            debug!("Result cache full, evicted {}", evicted_key);
        }
    }

    async fn delete(&self, key: &str) {
        self.store.write().await.pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(n: i64) -> QueryResult {
        QueryResult::success(vec!["n".to_string()], vec![vec![json!(n)]], Duration::from_millis(3))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemoryCache::new(10);
        cache.set("a", &result(1), Duration::from_secs(300)).await;
        assert_eq!(cache.get("a").await, Some(result(1)));
        assert_eq!(cache.get("missing").await, None);

        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new(10);
        cache.set("a", &result(1), Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn full_cache_evicts_the_least_recently_used_entry() {
        let cache = MemoryCache::new(2);
        cache.set("old", &result(1), Duration::from_secs(300)).await;
        cache.set("read", &result(2), Duration::from_secs(300)).await;
        // touching "old" leaves "read" as the least recently used
        assert!(cache.get("old").await.is_some());
        cache.set("new", &result(3), Duration::from_secs(300)).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("read").await, None);
        assert_eq!(cache.get("old").await, Some(result(1)));
        assert_eq!(cache.get("new").await, Some(result(3)));
    }

    #[tokio::test]
    async fn overwriting_a_key_does_not_evict() {
        let cache = MemoryCache::new(2);
        cache.set("a", &result(1), Duration::from_secs(300)).await;
        cache.set("b", &result(2), Duration::from_secs(300)).await;
        cache.set("a", &result(10), Duration::from_secs(300)).await;

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a").await, Some(result(10)));
        assert_eq!(cache.get("b").await, Some(result(2)));
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let cache = MemoryCache::new(0);
        assert_eq!(cache.store.try_read().unwrap().cap().get(), 1);
    }
}
