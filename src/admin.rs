//! Maintenance and dashboard handlers. They hold no state of their own and only go through the
//! public operations of a [`Coordinator`].

use crate::cache::{CacheStats, FastCache};
use crate::counter::{Coordinator, Lookup, Update};
use crate::key::{CounterKey, KeyShape, DEFAULT_NAMESPACE};
use crate::queue::WorkQueue;
use crate::store::{CounterRecord, DurableStore};
use crate::worker::FlushOutcome;
use serde::{Deserialize, Serialize};

pub const DASHBOARD_LIMIT: usize = 20;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WritebackReport {
    pub flushed: usize,
    /// Records whose counter was no longer cached, nothing was written for them.
    pub missing: usize,
}

/// Flush every counter the durable store knows about, optionally dropping it from the cache
/// once persisted.
pub async fn writeback_all<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    namespace: Option<&str>,
    delete: bool,
) -> anyhow::Result<WritebackReport>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    tracing::info!("writing back all counters, namespace={namespace:?}, delete={delete}");

    let mut report = WritebackReport::default();
    for record in counter.records(namespace).await? {
        let key = record.key();
        match counter.flush(&key.full()).await? {
            Some(FlushOutcome::Persisted(_)) => {
                report.flushed += 1;
                if delete {
                    counter.forget(&key).await?;
                }
            }
            Some(FlushOutcome::CacheMiss) | None => report.missing += 1,
        }
    }

    tracing::info!("writeback done: {report:?}");
    Ok(report)
}

/// Drop every cached counter. Destructive: counts not flushed yet are gone for good.
pub async fn clear_entire_cache<C, S, Q>(counter: &Coordinator<C, S, Q>) -> anyhow::Result<()>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    counter.clear_cache().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Action {
    #[serde(rename = "Increment Counter")]
    Increment,
    #[serde(rename = "Decrement Counter")]
    Decrement,
}

/// A submitted counter form. Forms always address simple counters.
#[derive(Debug, Clone, Deserialize)]
pub struct CounterForm {
    pub counter: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub delta: i64,
    #[serde(rename = "type")]
    pub action: Action,
}

pub(crate) fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

pub async fn apply<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    form: &CounterForm,
) -> anyhow::Result<u64>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let update = Update::builder()
        .name(form.counter.as_str())
        .namespace(form.namespace.as_str())
        .delta(form.delta)
        .shape(KeyShape::Simple)
        .build();

    let counts = match form.action {
        Action::Increment => counter.increment(&update).await?,
        Action::Decrement => counter.decrement(&update).await?,
    };

    Ok(counts.first().copied().unwrap_or_default())
}

/// Current value of a simple counter.
pub async fn get_count<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    name: &str,
    namespace: &str,
) -> anyhow::Result<Option<u64>>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    tracing::info!("querying counter {name} in namespace {namespace}");
    let lookup = Lookup::builder()
        .name(name)
        .namespace(namespace)
        .shape(KeyShape::Simple)
        .build();
    counter.read(&lookup).await
}

/// The largest persisted counters of a namespace, biggest first.
async fn top_records<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    namespace: Option<&str>,
    limit: usize,
) -> anyhow::Result<Vec<CounterRecord>>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let mut records = counter.records(namespace).await?;
    records.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    records.truncate(limit);
    Ok(records)
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub namespace: String,
    pub counters: Vec<CounterRecord>,
    pub counter_name: Option<String>,
    pub modified_counter: Option<CounterRecord>,
    pub delta: i64,
    pub cache_stats: CacheStats,
}

pub async fn dashboard<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    namespace: &str,
    counter_name: Option<&str>,
    delta: i64,
) -> anyhow::Result<Dashboard>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let modified_counter = match counter_name {
        Some(name) => counter.record(&CounterKey::simple(namespace, name).full()).await?,
        None => None,
    };

    Ok(Dashboard {
        namespace: namespace.to_string(),
        counters: top_records(counter, Some(namespace), DASHBOARD_LIMIT).await?,
        counter_name: counter_name.map(str::to_string),
        modified_counter,
        delta,
        cache_stats: counter.cache_stats().await?,
    })
}

#[derive(Debug, Serialize)]
struct CounterEntry {
    key: String,
    count: String,
}

/// JSON listing `[{"key": ..., "count": ...}]` of the largest persisted counters.
pub async fn list_counters<C, S, Q>(
    counter: &Coordinator<C, S, Q>,
    namespace: Option<&str>,
    limit: usize,
) -> anyhow::Result<String>
where
    C: FastCache,
    S: DurableStore,
    Q: WorkQueue,
{
    let entries: Vec<CounterEntry> = top_records(counter, namespace, limit)
        .await?
        .into_iter()
        .map(|record| CounterEntry {
            key: record.full_key(),
            count: record.count.to_string(),
        })
        .collect();

    Ok(serde_json::to_string(&entries)?)
}
