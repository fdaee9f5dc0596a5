use crate::key::CounterKey;
use crate::period::PeriodType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A persisted counter value, identified by its full key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub name: String,
    pub count: u64,
    /// Bucket label, absent for simple counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_type: Option<PeriodType>,
    pub namespace: String,
}

impl CounterRecord {
    pub fn new(key: &CounterKey, count: u64) -> Self {
        Self {
            name: key.name().to_string(),
            count,
            period: key.bucket().map(str::to_string),
            period_type: key.period_type(),
            namespace: key.namespace().to_string(),
        }
    }

    pub fn key(&self) -> CounterKey {
        CounterKey::from_bucket(
            &self.namespace,
            &self.name,
            self.period_type.zip(self.period.as_deref()),
        )
    }

    pub fn full_key(&self) -> String {
        self.key().full()
    }
}

/// The long-lived home of counter values. Records are replaced wholesale, never patched.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_by_key(&self, full_key: &str) -> anyhow::Result<Option<CounterRecord>>;

    async fn upsert(&self, record: CounterRecord) -> anyhow::Result<()>;

    /// Every stored record, optionally limited to one namespace.
    async fn records(&self, namespace: Option<&str>) -> anyhow::Result<Vec<CounterRecord>>;
}

#[derive(Debug, Default)]
struct Inner {
    path: Option<PathBuf>,
    records: BTreeMap<String, CounterRecord>,
}

impl Inner {
    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let records: Vec<&CounterRecord> = self.records.values().collect();
        let content = serde_json::to_vec_pretty(&records)?;

        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .with_context(|| "counter record writer panicked")?
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("fail to create temporary file in {dir:?}"))?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .with_context(|| format!("fail to write counter records into {path:?}"))?;

    Ok(())
}

/// [`DurableStore`] keeping every record in memory and mirroring them into a JSON file.
///
/// The file is rewritten through a temporary sibling and a rename, so a crash never leaves a
/// half-written document behind. The write runs on the blocking pool; a record only becomes
/// visible once it reached the disk.
#[derive(Debug, Clone, Default)]
pub struct JsonStore {
    inner: Arc<Mutex<Inner>>,
}

impl JsonStore {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        let mut records = BTreeMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("fail to read counter records from {path:?}"))?;
            let stored: Vec<CounterRecord> = serde_json::from_str(&content)
                .with_context(|| format!("fail to parse counter records from {path:?}"))?;
            for record in stored {
                records.insert(record.full_key(), record);
            }
            tracing::info!("loaded {} counter records from {path:?}", records.len());
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                path: Some(path),
                records,
            })),
        })
    }
}

#[async_trait::async_trait]
impl DurableStore for JsonStore {
    async fn get_by_key(&self, full_key: &str) -> anyhow::Result<Option<CounterRecord>> {
        Ok(self.inner.lock().await.records.get(full_key).cloned())
    }

    async fn upsert(&self, record: CounterRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let key = record.full_key();
        let previous = inner.records.insert(key.clone(), record);

        if let Err(err) = inner.persist().await {
            match previous {
                Some(previous) => inner.records.insert(key, previous),
                None => inner.records.remove(&key),
            };
            return Err(err);
        }
        Ok(())
    }

    async fn records(&self, namespace: Option<&str>) -> anyhow::Result<Vec<CounterRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|record| namespace.map_or(true, |ns| record.namespace == ns))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::Period;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");

        let period: Period = "2011-06-13 18:11:32".parse().unwrap();
        let scoped = CounterKey::scoped("tweet", PeriodType::Day, &period, "visits");
        let simple = CounterKey::simple("site", "visits");

        let store = JsonStore::open(&path).unwrap();
        store.upsert(CounterRecord::new(&scoped, 3)).await.unwrap();
        store.upsert(CounterRecord::new(&simple, 7)).await.unwrap();
        store.upsert(CounterRecord::new(&scoped, 4)).await.unwrap();

        let reopened = JsonStore::open(&path).unwrap();
        let record = reopened.get_by_key(&scoped.full()).await.unwrap().unwrap();
        assert_eq!(record.count, 4);
        assert_eq!(record.period.as_deref(), Some("2011-06-13"));
        assert_eq!(record.key(), scoped);

        let record = reopened.get_by_key("site:visits").await.unwrap().unwrap();
        assert_eq!(record.count, 7);
        assert_eq!(record.period_type, None);

        assert_eq!(reopened.records(None).await.unwrap().len(), 2);
        assert_eq!(reopened.records(Some("tweet")).await.unwrap().len(), 1);
        assert!(reopened.records(Some("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = JsonStore::in_memory();
        let key = CounterKey::simple("default", "hits");
        assert!(store.get_by_key(&key.full()).await.unwrap().is_none());
        store.upsert(CounterRecord::new(&key, 1)).await.unwrap();
        assert_eq!(store.get_by_key("default:hits").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("counters.json");
        let store = JsonStore::open(&path).unwrap();

        let key = CounterKey::simple("site", "visits");
        assert!(store.upsert(CounterRecord::new(&key, 3)).await.is_err());
        assert!(store.get_by_key("site:visits").await.unwrap().is_none());

        std::fs::create_dir(dir.path().join("missing")).unwrap();
        store.upsert(CounterRecord::new(&key, 3)).await.unwrap();
        std::fs::remove_dir_all(dir.path().join("missing")).unwrap();

        // the previous value survives a failed overwrite
        assert!(store.upsert(CounterRecord::new(&key, 9)).await.is_err());
        assert_eq!(store.get_by_key("site:visits").await.unwrap().unwrap().count, 3);
    }
}
