use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A volatile, namespace-isolated store of non-negative integers with atomic primitives.
///
/// Entries may vanish between any two calls, so every `None` has to be treated as a normal
/// outcome rather than "never written".
#[async_trait::async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>>;

    /// Set `key` only if it is absent. Returns whether this call created it.
    async fn add(&self, namespace: &str, key: &str, value: u64) -> anyhow::Result<bool>;

    /// Like [`FastCache::add`], but the entry disappears on its own after `ttl`.
    async fn add_expiring(
        &self,
        namespace: &str,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Atomically add `delta` to an existing entry. `None` means the entry is not present.
    async fn incr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>>;

    /// Atomically subtract `delta` from an existing entry, never going below zero.
    async fn decr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>>;

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;

    /// Drop every entry of every namespace. Anything not yet persisted is lost.
    async fn clear(&self) -> anyhow::Result<()>;

    async fn stats(&self) -> anyhow::Result<CacheStats>;

    /// Signed increment, routed to [`FastCache::decr`] for negative deltas.
    async fn increment(
        &self,
        namespace: &str,
        key: &str,
        delta: i64,
    ) -> anyhow::Result<Option<u64>> {
        if delta >= 0 {
            self.incr(namespace, key, delta.unsigned_abs()).await
        } else {
            self.decr(namespace, key, delta.unsigned_abs()).await
        }
    }
}

/// Usage figures shown on the dashboard.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held, dirty markers included.
    pub items: u64,
    pub hits: u64,
    pub misses: u64,
}

type Slot = (String, String);

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// In-process [`FastCache`]. Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemCache {
    entries: Arc<Mutex<HashMap<Slot, Entry>>>,
    counters: Arc<Counters>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a single entry as if the cache had evicted it.
    pub async fn evict(&self, namespace: &str, key: &str) -> bool {
        self.entries.lock().await.remove(&slot(namespace, key)).is_some()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.expired(now));
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn insert_absent(
        &self,
        namespace: &str,
        key: &str,
        value: u64,
        ttl: Option<Duration>,
    ) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let slot = slot(namespace, key);
        if entries.get(&slot).is_some_and(|entry| !entry.expired(now)) {
            return false;
        }
        let expires = ttl.map(|ttl| now + ttl);
        entries.insert(slot, Entry { value, expires });
        true
    }

    async fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: impl FnOnce(u64) -> u64 + Send,
    ) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let slot = slot(namespace, key);
        match entries.get_mut(&slot) {
            Some(entry) if !entry.expired(now) => {
                entry.value = apply(entry.value);
                Some(entry.value)
            }
            Some(_) => {
                entries.remove(&slot);
                None
            }
            None => None,
        }
    }
}

fn slot(namespace: &str, key: &str) -> Slot {
    (namespace.to_string(), key.to_string())
}

#[async_trait::async_trait]
impl FastCache for MemCache {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
        let now = Instant::now();
        let value = self
            .entries
            .lock()
            .await
            .get(&slot(namespace, key))
            .filter(|entry| !entry.expired(now))
            .map(|entry| entry.value);

        let counter = match value {
            Some(_) => &self.counters.hits,
            None => &self.counters.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn add(&self, namespace: &str, key: &str, value: u64) -> anyhow::Result<bool> {
        Ok(self.insert_absent(namespace, key, value, None).await)
    }

    async fn add_expiring(
        &self,
        namespace: &str,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        Ok(self.insert_absent(namespace, key, value, Some(ttl)).await)
    }

    async fn incr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
        Ok(self
            .update(namespace, key, |value| value.saturating_add(delta))
            .await)
    }

    async fn decr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
        Ok(self
            .update(namespace, key, |value| value.saturating_sub(delta))
            .await)
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.entries.lock().await.remove(&slot(namespace, key));
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<CacheStats> {
        Ok(CacheStats {
            items: self.len().await as u64,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        })
    }
}

#[tokio::test]
async fn test_mem_cache_primitives() {
    let cache = MemCache::new();

    assert_eq!(cache.incr("ns", "hits", 1).await.unwrap(), None);
    assert!(cache.add("ns", "hits", 3).await.unwrap());
    assert!(!cache.add("ns", "hits", 10).await.unwrap());
    assert_eq!(cache.increment("ns", "hits", 2).await.unwrap(), Some(5));
    assert_eq!(cache.increment("ns", "hits", -100).await.unwrap(), Some(0));

    // namespaces do not see each other
    assert_eq!(cache.get("other", "hits").await.unwrap(), None);

    assert!(cache.evict("ns", "hits").await);
    assert_eq!(cache.get("ns", "hits").await.unwrap(), None);

    cache.add("a", "x", 1).await.unwrap();
    cache.add("b", "y", 1).await.unwrap();
    cache.clear().await.unwrap();
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_mem_cache_expiring_entries() {
    let cache = MemCache::new();
    let ttl = Duration::from_millis(20);

    assert!(cache.add_expiring("ns", "hits_dirty", 1, ttl).await.unwrap());
    assert!(!cache.add_expiring("ns", "hits_dirty", 1, ttl).await.unwrap());
    assert_eq!(cache.get("ns", "hits_dirty").await.unwrap(), Some(1));

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("ns", "hits_dirty").await.unwrap(), None);
    assert_eq!(cache.incr("ns", "hits_dirty", 1).await.unwrap(), None);
    // an expired entry can be created again
    assert!(cache.add_expiring("ns", "hits_dirty", 1, ttl).await.unwrap());
}

#[tokio::test]
async fn test_mem_cache_stats() {
    let cache = MemCache::new();
    cache.add("ns", "hits", 1).await.unwrap();
    cache.get("ns", "hits").await.unwrap();
    cache.get("ns", "hits").await.unwrap();
    cache.get("ns", "nothing").await.unwrap();

    let stats = cache.stats().await.unwrap();
    assert_eq!(
        stats,
        CacheStats {
            items: 1,
            hits: 2,
            misses: 1
        }
    );
}
