//! Write-behind, read-through counters.
//!
//! Updates land in the [`FastCache`] with an atomic increment. A cache miss reloads the last
//! persisted value from the [`DurableStore`] before applying the delta. Persisting is left to a
//! [`FlushWorker`] fed through a [`WorkQueue`]; a `_dirty` marker in the cache makes sure only one
//! flush per counter is pending at a time.
//!
//! Two callers missing the cache for the same counter at the same moment both read the same
//! durable baseline. Only the first seed lands, the delta of the other one is lost. This window
//! is accepted: there is no lock around the miss path.
//!
//! Dirty markers expire after [`DEFAULT_MARKER_TTL`] so a flush lost with a crashed process
//! cannot block later flushes of its counter forever.

use crate::cache::{CacheStats, FastCache};
use crate::key::{CounterKey, KeyShape, DEFAULT_NAMESPACE};
use crate::period::{Period, PeriodType};
use crate::queue::{FlushTask, WorkQueue};
use crate::store::{CounterRecord, DurableStore};
use crate::worker::{FlushOutcome, FlushWorker};
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;

pub const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(600);

/// An increment or decrement of one logical event, tallied once per period type.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Update {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub period: Period,
    #[builder(default = vec![PeriodType::All])]
    pub period_types: Vec<PeriodType>,
    #[builder(default = 1)]
    pub delta: i64,
    #[builder(default = DEFAULT_NAMESPACE.to_string(), setter(into))]
    pub namespace: String,
    /// Only try to schedule a flush when the counter hits a multiple of this. `0` counts as unset.
    #[builder(default, setter(strip_option))]
    pub batch_size: Option<u64>,
    #[builder(default)]
    pub shape: KeyShape,
}

impl Update {
    fn targets(&self) -> Vec<(CounterKey, FlushTask)> {
        match self.shape {
            KeyShape::Simple => vec![(
                CounterKey::simple(&self.namespace, &self.name),
                FlushTask::simple(&self.namespace, &self.name),
            )],
            KeyShape::Scoped => self
                .period_types
                .iter()
                .map(|ty| {
                    (
                        CounterKey::scoped(&self.namespace, *ty, &self.period, &self.name),
                        FlushTask::scoped(&self.namespace, *ty, &self.period, &self.name),
                    )
                })
                .collect(),
        }
    }

    fn flush_due(&self, count: u64) -> bool {
        match self.batch_size {
            None | Some(0) => true,
            Some(size) => count % size == 0,
        }
    }
}

/// Coordinates of a single counter to read.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Lookup {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub period: Period,
    #[builder(default)]
    pub period_type: PeriodType,
    #[builder(default = DEFAULT_NAMESPACE.to_string(), setter(into))]
    pub namespace: String,
    #[builder(default)]
    pub shape: KeyShape,
}

impl Lookup {
    pub fn key(&self) -> CounterKey {
        match self.shape {
            KeyShape::Simple => CounterKey::simple(&self.namespace, &self.name),
            KeyShape::Scoped => {
                CounterKey::scoped(&self.namespace, self.period_type, &self.period, &self.name)
            }
        }
    }
}

pub struct Coordinator<C, S, Q> {
    cache: Arc<C>,
    store: Arc<S>,
    queue: Arc<Q>,
    marker_ttl: Duration,
}

impl<C, S, Q> Clone for Coordinator<C, S, Q> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            marker_ttl: self.marker_ttl,
        }
    }
}

impl<C: FastCache, S: DurableStore, Q: WorkQueue> Coordinator<C, S, Q> {
    pub fn new(cache: C, store: S, queue: Q) -> Self {
        Self {
            cache: Arc::new(cache),
            store: Arc::new(store),
            queue: Arc::new(queue),
            marker_ttl: DEFAULT_MARKER_TTL,
        }
    }

    /// How long a dirty marker may outlive the flush it announced.
    pub fn with_marker_ttl(mut self, ttl: Duration) -> Self {
        self.marker_ttl = ttl;
        self
    }

    /// The flush handler sharing this coordinator's cache and store.
    pub fn flush_worker(&self) -> FlushWorker<C, S> {
        FlushWorker::new(Arc::clone(&self.cache), Arc::clone(&self.store))
    }

    /// Current value of a counter, or `None` if it was never persisted nor cached.
    pub async fn read(&self, lookup: &Lookup) -> anyhow::Result<Option<u64>> {
        let key = lookup.key();
        let namespace = key.namespace();
        let partial = key.partial();

        if let Some(count) = self.cache.get(namespace, &partial).await? {
            return Ok(Some(count));
        }

        let Some(record) = self.store.get_by_key(&key.full()).await? else {
            return Ok(None);
        };

        // losing this race only means someone else already seeded the cache
        self.cache.add(namespace, &partial, record.count).await?;
        Ok(Some(record.count))
    }

    /// Apply `update.delta` to every targeted counter, returning their new values in order.
    pub async fn increment(&self, update: &Update) -> anyhow::Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(update.period_types.len());
        for (key, task) in update.targets() {
            let count = self.apply(&key, update.delta).await?;
            if update.flush_due(count) {
                self.schedule_flush(&key, task, update.delta).await?;
            }
            counts.push(count);
        }
        Ok(counts)
    }

    pub async fn decrement(&self, update: &Update) -> anyhow::Result<Vec<u64>> {
        let negated = Update {
            delta: update.delta.saturating_neg(),
            ..update.clone()
        };
        self.increment(&negated).await
    }

    async fn apply(&self, key: &CounterKey, delta: i64) -> anyhow::Result<u64> {
        let partial = key.partial();
        if let Some(count) = self.cache.increment(key.namespace(), &partial, delta).await? {
            return Ok(count);
        }

        let baseline = match self.store.get_by_key(&key.full()).await? {
            Some(record) => record.count,
            None => 0,
        };
        let count = baseline.saturating_add_signed(delta);

        if self.cache.add(key.namespace(), &partial, count).await? {
            return Ok(count);
        }

        tracing::debug!("{key} was seeded concurrently, delta {delta} is dropped");
        let live = self.cache.get(key.namespace(), &partial).await?;
        Ok(live.unwrap_or(count))
    }

    async fn schedule_flush(
        &self,
        key: &CounterKey,
        task: FlushTask,
        delta: i64,
    ) -> anyhow::Result<()> {
        let namespace = key.namespace();
        let dirty = key.dirty();

        // a pending flush reads the live value, so it covers this update too
        let marked = self
            .cache
            .add_expiring(namespace, &dirty, delta.unsigned_abs(), self.marker_ttl)
            .await?;
        if !marked {
            return Ok(());
        }

        if let Err(err) = self.queue.enqueue(task).await {
            self.cache.delete(namespace, &dirty).await?;
            return Err(err.context(format!("fail to schedule writeback of {key}")));
        }

        Ok(())
    }

    /// Flush a single persisted counter right away. `None` if no record has that key.
    pub async fn flush(&self, full_key: &str) -> anyhow::Result<Option<FlushOutcome>> {
        let Some(record) = self.store.get_by_key(full_key).await? else {
            return Ok(None);
        };
        let outcome = self.flush_worker().flush(&record.key()).await?;
        Ok(Some(outcome))
    }

    pub async fn records(&self, namespace: Option<&str>) -> anyhow::Result<Vec<CounterRecord>> {
        self.store.records(namespace).await
    }

    pub async fn record(&self, full_key: &str) -> anyhow::Result<Option<CounterRecord>> {
        self.store.get_by_key(full_key).await
    }

    /// Drop the cached value of a counter. The next access reloads it from the durable store.
    pub async fn forget(&self, key: &CounterKey) -> anyhow::Result<()> {
        self.cache.delete(key.namespace(), &key.partial()).await
    }

    pub async fn cache_stats(&self) -> anyhow::Result<CacheStats> {
        self.cache.stats().await
    }

    /// Drop the whole cache. Counts that were not flushed yet are lost.
    pub async fn clear_cache(&self) -> anyhow::Result<()> {
        tracing::warn!("deleting all cached counters, any count not flushed before is lost");
        self.cache.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use crate::store::JsonStore;
    use crate::testing::{FailingQueue, RecordingQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestCoordinator = Coordinator<MemCache, JsonStore, RecordingQueue>;

    fn setup() -> (TestCoordinator, MemCache, JsonStore, RecordingQueue) {
        let cache = MemCache::new();
        let store = JsonStore::in_memory();
        let queue = RecordingQueue::default();
        let coordinator = Coordinator::new(cache.clone(), store.clone(), queue.clone());
        (coordinator, cache, store, queue)
    }

    fn visits() -> Lookup {
        Lookup::builder().name("visits").build()
    }

    #[tokio::test]
    async fn test_increment_then_read() {
        let (counter, _, _, _) = setup();
        assert_eq!(counter.read(&visits()).await.unwrap(), None);

        let update = Update::builder().name("visits").delta(5).build();
        assert_eq!(counter.increment(&update).await.unwrap(), vec![5]);
        assert_eq!(counter.read(&visits()).await.unwrap(), Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_sum_up() {
        let (counter, _, _, _) = setup();
        let update = Update::builder().name("visits").build();
        counter.increment(&update).await.unwrap();

        let handles: Vec<_> = (0..99)
            .map(|_| {
                let counter = counter.clone();
                let update = update.clone();
                tokio::spawn(async move { counter.increment(&update).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.read(&visits()).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let (counter, cache, _, _) = setup();
        let update = Update::builder().name("visits").delta(3).build();
        counter.increment(&update).await.unwrap();

        let update = Update::builder().name("visits").delta(-100).build();
        assert_eq!(counter.increment(&update).await.unwrap(), vec![0]);
        assert_eq!(counter.read(&visits()).await.unwrap(), Some(0));

        // the same floor applies when the baseline comes from the durable store
        let update = Update::builder().name("visits").delta(3).build();
        counter.increment(&update).await.unwrap();
        counter.flush_worker().flush(&visits().key()).await.unwrap();
        cache.evict(DEFAULT_NAMESPACE, &visits().key().partial()).await;

        let update = Update::builder().name("visits").delta(100).build();
        assert_eq!(counter.decrement(&update).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_pending_flush_is_not_duplicated() {
        let (counter, _, _, queue) = setup();
        let update = Update::builder().name("visits").build();

        counter.increment(&update).await.unwrap();
        counter.increment(&update).await.unwrap();
        assert_eq!(queue.len(), 1);

        let worker = counter.flush_worker();
        for task in queue.drain() {
            worker.invoke(&task).await.unwrap();
        }

        counter.increment(&update).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_read_through_after_eviction() {
        let (counter, cache, store, queue) = setup();
        let update = Update::builder().name("visits").namespace("site").build();
        counter.increment(&update).await.unwrap();

        let worker = counter.flush_worker();
        for task in queue.drain() {
            assert_eq!(worker.invoke(&task).await.unwrap(), FlushOutcome::Persisted(1));
        }

        let lookup = Lookup::builder().name("visits").namespace("site").build();
        assert!(cache.evict("site", &lookup.key().partial()).await);
        assert_eq!(counter.read(&lookup).await.unwrap(), Some(1));
        // read-through seeded the cache again
        assert_eq!(cache.get("site", &lookup.key().partial()).await.unwrap(), Some(1));
        assert_eq!(store.get_by_key("site:all:all:visits").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_increment_after_eviction_resumes_from_store() {
        let (counter, cache, _, queue) = setup();
        let update = Update::builder().name("visits").delta(4).build();
        counter.increment(&update).await.unwrap();
        let worker = counter.flush_worker();
        for task in queue.drain() {
            worker.invoke(&task).await.unwrap();
        }

        cache.evict(DEFAULT_NAMESPACE, &visits().key().partial()).await;
        let update = Update::builder().name("visits").delta(2).build();
        assert_eq!(counter.increment(&update).await.unwrap(), vec![6]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_gates_flushes() {
        let (counter, _, _, queue) = setup();
        let update = Update::builder().name("visits").batch_size(10).build();

        for _ in 0..9 {
            counter.increment(&update).await.unwrap();
        }
        assert_eq!(queue.len(), 0);

        counter.increment(&update).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_uses_value_after_reload() {
        let (counter, cache, store, queue) = setup();
        let key = visits().key();
        store.upsert(CounterRecord::new(&key, 9)).await.unwrap();

        let update = Update::builder().name("visits").batch_size(10).build();
        assert_eq!(counter.increment(&update).await.unwrap(), vec![10]);
        assert_eq!(queue.len(), 1);
        assert_eq!(cache.get(DEFAULT_NAMESPACE, &key.partial()).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_every_period_type_is_tallied() {
        let (counter, _, _, queue) = setup();
        let period: Period = "2011-06-15 10:00:00".parse().unwrap();
        let update = Update::builder()
            .name("tweets")
            .namespace("tweet")
            .period(period.clone())
            .period_types(vec![PeriodType::Day, PeriodType::Week])
            .build();

        assert_eq!(counter.increment(&update).await.unwrap(), vec![1, 1]);
        assert_eq!(counter.increment(&update).await.unwrap(), vec![2, 2]);

        let tasks = queue.drain();
        assert_eq!(tasks.len(), 2);
        let keys: Vec<String> = tasks.iter().map(|task| task.key().unwrap().full()).collect();
        assert_eq!(
            keys,
            vec![
                "tweet:day:2011-06-15:tweets".to_string(),
                "tweet:week:2011-06-13week:tweets".to_string(),
            ]
        );

        let lookup = Lookup::builder()
            .name("tweets")
            .namespace("tweet")
            .period("2011-06-19 23:00:00".parse().unwrap())
            .period_type(PeriodType::Week)
            .build();
        assert_eq!(counter.read(&lookup).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_simple_shape() {
        let (counter, _, store, queue) = setup();
        let update = Update::builder()
            .name("visits")
            .namespace("site")
            .shape(KeyShape::Simple)
            .delta(3)
            .build();
        counter.increment(&update).await.unwrap();

        let worker = counter.flush_worker();
        for task in queue.drain() {
            worker.invoke(&task).await.unwrap();
        }
        assert_eq!(store.get_by_key("site:visits").await.unwrap().unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_failed_enqueue_releases_marker() {
        let cache = MemCache::new();
        let counter = Coordinator::new(cache.clone(), JsonStore::in_memory(), FailingQueue);
        let update = Update::builder().name("visits").build();

        assert!(counter.increment(&update).await.is_err());
        let dirty = visits().key().dirty();
        assert_eq!(cache.get(DEFAULT_NAMESPACE, &dirty).await.unwrap(), None);
        // the update itself still landed
        assert_eq!(cache.get(DEFAULT_NAMESPACE, &visits().key().partial()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_stale_marker_expires() {
        let (counter, cache, _, queue) = setup();
        let counter = counter.with_marker_ttl(Duration::from_millis(20));
        let update = Update::builder().name("visits").build();

        // the flush announced here is never run, as if the process died with it queued
        counter.increment(&update).await.unwrap();
        queue.drain();
        counter.increment(&update).await.unwrap();
        assert_eq!(queue.len(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let dirty = visits().key().dirty();
        assert_eq!(cache.get(DEFAULT_NAMESPACE, &dirty).await.unwrap(), None);
        counter.increment(&update).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    /// Reports a miss for the first `misses` increments, as if two callers raced on an evicted key.
    struct RacingCache {
        inner: MemCache,
        misses: AtomicUsize,
    }

    impl RacingCache {
        fn take_miss(&self) -> bool {
            self.misses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait::async_trait]
    impl FastCache for RacingCache {
        async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
            self.inner.get(namespace, key).await
        }

        async fn add(&self, namespace: &str, key: &str, value: u64) -> anyhow::Result<bool> {
            self.inner.add(namespace, key, value).await
        }

        async fn add_expiring(
            &self,
            namespace: &str,
            key: &str,
            value: u64,
            ttl: Duration,
        ) -> anyhow::Result<bool> {
            self.inner.add_expiring(namespace, key, value, ttl).await
        }

        async fn incr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
            if self.take_miss() {
                return Ok(None);
            }
            self.inner.incr(namespace, key, delta).await
        }

        async fn decr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
            if self.take_miss() {
                return Ok(None);
            }
            self.inner.decr(namespace, key, delta).await
        }

        async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
            self.inner.delete(namespace, key).await
        }

        async fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear().await
        }

        async fn stats(&self) -> anyhow::Result<CacheStats> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn test_miss_race_loses_at_most_one_update() {
        let store = JsonStore::in_memory();
        let key = visits().key();
        store.upsert(CounterRecord::new(&key, 5)).await.unwrap();

        let cache = RacingCache {
            inner: MemCache::new(),
            misses: AtomicUsize::new(2),
        };
        let queue = RecordingQueue::default();
        let counter = Coordinator::new(cache, store, queue.clone());
        let update = Update::builder().name("visits").build();

        // both callers miss and reload the baseline of 5, only the first seed lands
        assert_eq!(counter.increment(&update).await.unwrap(), vec![6]);
        // the loser reports the live value, not its own computation
        assert_eq!(counter.increment(&update).await.unwrap(), vec![6]);
        assert_eq!(counter.read(&visits()).await.unwrap(), Some(6));

        // once seeded, updates are atomic again
        counter.increment(&update).await.unwrap();
        assert_eq!(counter.read(&visits()).await.unwrap(), Some(7));
        assert_eq!(queue.len(), 1);
    }
}
