use crate::cache::FastCache;
use crate::key::CounterKey;
use crate::queue::{FlushTask, TaskHandler};
use crate::store::{CounterRecord, DurableStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The cached value was written to the durable store.
    Persisted(u64),
    /// Nothing was cached for the counter, the durable store was left alone.
    CacheMiss,
}

/// Copies the live cache value of a counter into the durable store.
///
/// Running it twice for the same counter is harmless: the second run persists whatever the
/// cache holds at that moment.
pub struct FlushWorker<C, S> {
    cache: Arc<C>,
    store: Arc<S>,
}

impl<C, S> Clone for FlushWorker<C, S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            store: Arc::clone(&self.store),
        }
    }
}

impl<C: FastCache, S: DurableStore> FlushWorker<C, S> {
    pub fn new(cache: Arc<C>, store: Arc<S>) -> Self {
        Self { cache, store }
    }

    pub async fn invoke(&self, task: &FlushTask) -> anyhow::Result<FlushOutcome> {
        let key = task.key()?;
        self.flush(&key).await
    }

    pub async fn flush(&self, key: &CounterKey) -> anyhow::Result<FlushOutcome> {
        let namespace = key.namespace();
        let partial = key.partial();

        // Clear the marker first so increments landing during the write schedule a new flush.
        self.cache.delete(namespace, &key.dirty()).await?;

        let Some(value) = self.cache.get(namespace, &partial).await? else {
            tracing::error!("writeback failure for partial key={partial} in namespace {namespace}");
            return Ok(FlushOutcome::CacheMiss);
        };

        self.store.upsert(CounterRecord::new(key, value)).await?;
        tracing::debug!("persisted {key} = {value}");

        Ok(FlushOutcome::Persisted(value))
    }
}

#[async_trait::async_trait]
impl<C, S> TaskHandler for FlushWorker<C, S>
where
    C: FastCache + 'static,
    S: DurableStore + 'static,
{
    async fn handle(&self, task: &FlushTask) -> anyhow::Result<()> {
        self.invoke(task).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use crate::store::JsonStore;

    #[tokio::test]
    async fn test_flush_twice_is_idempotent() {
        let cache = Arc::new(MemCache::new());
        let store = Arc::new(JsonStore::in_memory());
        let worker = FlushWorker::new(Arc::clone(&cache), Arc::clone(&store));

        let key = CounterKey::simple("site", "visits");
        cache.add("site", "visits", 42).await.unwrap();
        cache.add("site", &key.dirty(), 1).await.unwrap();

        let task = FlushTask::simple("site", "visits");
        assert_eq!(worker.invoke(&task).await.unwrap(), FlushOutcome::Persisted(42));
        assert_eq!(cache.get("site", &key.dirty()).await.unwrap(), None);
        assert_eq!(worker.invoke(&task).await.unwrap(), FlushOutcome::Persisted(42));

        let record = store.get_by_key("site:visits").await.unwrap().unwrap();
        assert_eq!(record.count, 42);
    }

    #[tokio::test]
    async fn test_flush_without_cached_value() {
        let cache = Arc::new(MemCache::new());
        let store = Arc::new(JsonStore::in_memory());
        let worker = FlushWorker::new(Arc::clone(&cache), Arc::clone(&store));

        let key = CounterKey::simple("site", "gone");
        cache.add("site", &key.dirty(), 1).await.unwrap();

        let outcome = worker.flush(&key).await.unwrap();
        assert_eq!(outcome, FlushOutcome::CacheMiss);
        assert_eq!(cache.get("site", &key.dirty()).await.unwrap(), None);
        assert!(store.records(None).await.unwrap().is_empty());
    }
}
