use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admin;
use crate::cache::FastCache;
use crate::counter::Coordinator;
use crate::queue::TaskQueue;
use crate::redis::RedisCache;
use crate::store::JsonStore;

pub type LiveCounter<C = RedisCache> = Coordinator<C, JsonStore, TaskQueue>;

pub struct AppData<C = RedisCache>(Arc<RuntimeData<C>>);

impl<C> From<RuntimeData<C>> for AppData<C> {
    fn from(data: RuntimeData<C>) -> Self {
        Self(Arc::new(data))
    }
}

impl<C> Clone for AppData<C> {
    fn clone(&self) -> Self {
        AppData(Arc::clone(&self.0))
    }
}

impl<C> Deref for AppData<C> {
    type Target = Arc<RuntimeData<C>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(typed_builder::TypedBuilder)]
pub struct RuntimeData<C> {
    pub counter: LiveCounter<C>,
    pub queue: TaskQueue,
}

/// Periodically flush every known counter until `shutdown` flips.
pub fn spawn_writeback_sweep<C: FastCache + 'static>(
    data: AppData<C>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = admin::writeback_all(&data.counter, None, false).await {
                        let queue = data.queue.name();
                        tracing::error!("periodic writeback on {queue} failed: {err:#}")
                    }
                }
            }
        }
        tracing::info!("quitting writeback sweep");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use crate::counter::Update;
    use crate::key::{CounterKey, KeyShape};

    #[tokio::test]
    async fn test_sweep_persists_cached_counts() {
        // keep the receiver alive, nobody consumes the queue in this test
        let (queue, _receiver) = TaskQueue::new("writebacks");
        let cache = MemCache::new();
        let store = JsonStore::in_memory();
        let counter = Coordinator::new(cache, store, queue.clone());

        let update = Update::builder()
            .name("visits")
            .namespace("site")
            .shape(KeyShape::Simple)
            .build();
        counter.increment(&update).await.unwrap();
        // seed a durable record so the sweep knows the counter
        let key = CounterKey::simple("site", "visits");
        counter.flush_worker().flush(&key).await.unwrap();
        counter.increment(&update).await.unwrap();

        let data: AppData<MemCache> = RuntimeData::builder()
            .counter(counter)
            .queue(queue)
            .build()
            .into();

        let (tx, rx) = watch::channel(false);
        let sweep = spawn_writeback_sweep(data.clone(), Duration::from_millis(10), rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = data.counter.record("site:visits").await.unwrap();
                if record.map(|r| r.count) == Some(2) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweep did not persist the counter");

        tx.send(true).unwrap();
        sweep.await.unwrap();
    }
}
