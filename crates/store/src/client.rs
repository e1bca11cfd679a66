//! Redis-backed work queue and result store.
//!
//! The queue is a Redis list (`RPUSH` at the tail, `LRANGE`/`LTRIM` at the
//! head); results are plain string keys holding JSON with an expiry.

use crate::traits::{ResultStore, WorkQueue};
use async_trait::async_trait;
use batchline_core::config::RedisConfig;
use batchline_core::types::{RequestId, ResultValue};
use batchline_core::{BrokerError, BrokerResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

/// Push only while the list is below the cap. Returns the new length, or -1
/// when the list is full.
const BOUNDED_PUSH: &str = r#"
local depth = redis.call('LLEN', KEYS[1])
if depth >= tonumber(ARGV[2]) then
  return -1
end
return redis.call('RPUSH', KEYS[1], ARGV[1])
"#;

fn unavailable(e: redis::RedisError) -> BrokerError {
    metrics::counter!("store.redis_errors").increment(1);
    BrokerError::StoreUnavailable(e.to_string())
}

/// Open a managed connection and verify it with `PING`.
pub async fn connect(config: &RedisConfig) -> anyhow::Result<ConnectionManager> {
    info!(url = %config.url, "Connecting to Redis");

    let client = redis::Client::open(config.url.as_str())?;
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| anyhow::anyhow!("Redis connect timed out after {timeout:?}"))??;

    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(response = %pong, "Redis connection established");

    Ok(conn)
}

/// Work queue stored as a Redis list.
#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: ConnectionManager,
    key: String,
    max_depth: Option<usize>,
    bounded_push: redis::Script,
}

impl RedisWorkQueue {
    pub fn new(conn: ConnectionManager, key: impl Into<String>, max_depth: Option<usize>) -> Self {
        Self {
            conn,
            key: key.into(),
            max_depth,
            bounded_push: redis::Script::new(BOUNDED_PUSH),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, record: String) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();

        let depth = match self.max_depth {
            None => conn.rpush::<_, _, usize>(&self.key, record).await.map_err(unavailable)?,
            Some(capacity) => {
                let pushed: i64 = self
                    .bounded_push
                    .key(&self.key)
                    .arg(record)
                    .arg(capacity)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                if pushed < 0 {
                    metrics::counter!("queue.rejected").increment(1);
                    return Err(BrokerError::QueueFull {
                        depth: capacity,
                        capacity,
                    });
                }
                pushed as usize
            }
        };

        metrics::counter!("queue.enqueued").increment(1);
        Ok(depth)
    }

    async fn peek_range(&self, n: usize) -> BrokerResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        conn.lrange(&self.key, 0, n as isize - 1)
            .await
            .map_err(unavailable)
    }

    async fn trim(&self, k: usize) -> BrokerResult<()> {
        if k == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(&self.key, k as isize, -1)
            .await
            .map_err(unavailable)
    }

    async fn drain(&self, n: usize) -> BrokerResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&self.key, 0, n as isize - 1)
            .ltrim(&self.key, n as isize, -1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        debug!(key = %self.key, claimed = items.len(), "Drained work queue");
        Ok(items)
    }

    async fn requeue(&self, records: Vec<String>) -> BrokerResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        // LPUSH inserts each value at the head in turn, so push the last one first.
        let reversed: Vec<String> = records.into_iter().rev().collect();
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, reversed)
            .await
            .map_err(unavailable)
    }

    async fn len(&self) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(&self.key).await.map_err(unavailable)
    }
}

/// Result store as JSON string keys with a Redis-side expiry.
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
}

impl RedisResultStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            ttl_secs: ttl.as_secs().max(1),
        }
    }

    fn key(&self, id: &RequestId) -> String {
        format!("{}{}", self.prefix, id)
    }
}

fn parse(data: Option<String>) -> BrokerResult<Option<ResultValue>> {
    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn put(&self, id: &RequestId, value: &ResultValue) -> BrokerResult<()> {
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(id), json, self.ttl_secs)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(self.key(id)).await.map_err(unavailable)?;
        parse(data)
    }

    async fn delete(&self, id: &RequestId) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(id)).await.map_err(unavailable)
    }

    async fn take(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
        let key = self.key(id);
        let mut conn = self.conn.clone();
        let (data,): (Option<String>,) = redis::pipe()
            .atomic()
            .get(&key)
            .del(&key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        parse(data)
    }
}
