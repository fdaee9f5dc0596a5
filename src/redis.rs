use crate::cache::{CacheStats, FastCache};
use anyhow::Context;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;

// Both scripts answer nil for a missing key instead of creating it, so the caller can seed the
// counter from the durable store.
const INCR_EXISTING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('INCRBY', KEYS[1], ARGV[1])
end
return false
";

const DECR_CLAMPED: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return false
end
local value = tonumber(current) - tonumber(ARGV[1])
if value < 0 then
    value = 0
end
redis.call('SET', KEYS[1], value, 'KEEPTTL')
return value
";

/// [`FastCache`] backed by a Redis server.
///
/// Redis has no namespaces, so every key is stored as `prefix:namespace:key`.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    incr_existing: Script,
    decr_clamped: Script,
}

impl RedisCache {
    pub async fn connect(addr: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
        let client =
            redis::Client::open(addr).with_context(|| format!("invalid redis address {addr}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("fail to connect to redis at {addr}"))?;
        Ok(Self::new(conn, prefix))
    }

    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            incr_existing: Script::new(INCR_EXISTING),
            decr_clamped: Script::new(DECR_CLAMPED),
        }
    }

    fn key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{namespace}:{key}", self.prefix)
    }

    /// Every key stored under this cache's prefix.
    async fn own_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.prefix);
        let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl FastCache for RedisCache {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(self.key(namespace, key)).await?;
        Ok(value)
    }

    async fn add(&self, namespace: &str, key: &str, value: u64) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let created: bool = conn.set_nx(self.key(namespace, key), value).await?;
        Ok(created)
    }

    async fn add_expiring(
        &self,
        namespace: &str,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(namespace, key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = self
            .incr_existing
            .key(self.key(namespace, key))
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("fail to increment {key} in namespace {namespace}"))?;
        Ok(value)
    }

    async fn decr(&self, namespace: &str, key: &str, delta: u64) -> anyhow::Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = self
            .decr_clamped
            .key(self.key(namespace, key))
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("fail to decrement {key} in namespace {namespace}"))?;
        Ok(value)
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(namespace, key)).await?;
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        let keys = self.own_keys().await?;
        tracing::warn!("dropping {} cached entries under {}:*", keys.len(), self.prefix);
        if !keys.is_empty() {
            let mut conn = self.conn.clone();
            let _: () = conn.del(keys).await?;
        }

        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<CacheStats> {
        let items = self.own_keys().await?.len() as u64;
        let mut conn = self.conn.clone();
        // hit and miss figures are server wide, Redis does not track them per key pattern
        let info: redis::InfoDict = redis::cmd("INFO").arg("stats").query_async(&mut conn).await?;
        Ok(CacheStats {
            items,
            hits: info.get("keyspace_hits").unwrap_or_default(),
            misses: info.get("keyspace_misses").unwrap_or_default(),
        })
    }
}
