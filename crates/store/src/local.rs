//! In-process work queue and result store.
//! Used for single-process deployments and as the fake behind unit tests.

use crate::traits::{ResultStore, WorkQueue};
use async_trait::async_trait;
use batchline_core::types::{RequestId, ResultValue};
use batchline_core::{BrokerError, BrokerResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unbounded (or depth-capped) FIFO guarded by a mutex.
pub struct MemoryWorkQueue {
    items: Mutex<VecDeque<String>>,
    max_depth: Option<usize>,
}

impl MemoryWorkQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Snapshot of the queue contents, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.items.lock().iter().cloned().collect()
    }
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, record: String) -> BrokerResult<usize> {
        let mut items = self.items.lock();
        if let Some(capacity) = self.max_depth {
            if items.len() >= capacity {
                metrics::counter!("queue.rejected").increment(1);
                return Err(BrokerError::QueueFull {
                    depth: items.len(),
                    capacity,
                });
            }
        }
        items.push_back(record);
        metrics::counter!("queue.enqueued").increment(1);
        Ok(items.len())
    }

    async fn peek_range(&self, n: usize) -> BrokerResult<Vec<String>> {
        let items = self.items.lock();
        Ok(items.iter().take(n).cloned().collect())
    }

    async fn trim(&self, k: usize) -> BrokerResult<()> {
        let mut items = self.items.lock();
        let k = k.min(items.len());
        items.drain(..k);
        Ok(())
    }

    async fn drain(&self, n: usize) -> BrokerResult<Vec<String>> {
        let mut items = self.items.lock();
        let n = n.min(items.len());
        Ok(items.drain(..n).collect())
    }

    async fn requeue(&self, records: Vec<String>) -> BrokerResult<()> {
        let mut items = self.items.lock();
        for record in records.into_iter().rev() {
            items.push_front(record);
        }
        Ok(())
    }

    async fn len(&self) -> BrokerResult<usize> {
        Ok(self.items.lock().len())
    }
}

struct ResultEntry {
    value: ResultValue,
    inserted_at: Instant,
}

/// Lock-free result store backed by DashMap, with a TTL so results nobody
/// reads (abandoned or timed-out requests) do not accumulate forever.
pub struct MemoryResultStore {
    store: Arc<DashMap<RequestId, ResultEntry>>,
    ttl: Duration,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn live(&self, entry: &ResultEntry) -> bool {
        entry.inserted_at.elapsed() <= self.ttl
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn put(&self, id: &RequestId, value: &ResultValue) -> BrokerResult<()> {
        self.store.insert(
            id.clone(),
            ResultEntry {
                value: value.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
        if let Some(entry) = self.store.get(id) {
            if self.live(&entry) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Re-checked under the shard lock, so a fresh put is never removed.
        self.store.remove_if(id, |_, entry| !self.live(entry));
        Ok(None)
    }

    async fn delete(&self, id: &RequestId) -> BrokerResult<()> {
        self.store.remove(id);
        Ok(())
    }

    async fn take(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
        match self.store.remove(id) {
            Some((_, entry)) if self.live(&entry) => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    async fn evict_expired(&self) -> BrokerResult<usize> {
        let before = self.store.len();
        let ttl = self.ttl;
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        Ok(before.saturating_sub(self.store.len()))
    }
}
