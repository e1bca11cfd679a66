use async_trait::async_trait;
use batchline_core::types::{RequestId, ResultValue};
use batchline_core::BrokerResult;

/// FIFO sequence of serialized work items, shared between any number of
/// producers and exactly one consumer.
///
/// `peek_range` followed by `trim` is not atomic as a pair. Callers using
/// that pair must be the only consumer; [`WorkQueue::drain`] claims items in
/// one step instead.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a record at the tail and return the new depth.
    /// Fails with `QueueFull` when a depth bound is configured and reached.
    async fn enqueue(&self, record: String) -> BrokerResult<usize>;

    /// Up to `n` records from the head, oldest first, without removing them.
    async fn peek_range(&self, n: usize) -> BrokerResult<Vec<String>>;

    /// Remove the first `k` records.
    async fn trim(&self, k: usize) -> BrokerResult<()>;

    /// Remove and return up to `n` records from the head in one atomic step.
    async fn drain(&self, n: usize) -> BrokerResult<Vec<String>>;

    /// Put claimed records back at the head, keeping their order, so the
    /// next drain sees them first. Ignores the depth bound.
    async fn requeue(&self, records: Vec<String>) -> BrokerResult<()>;

    async fn len(&self) -> BrokerResult<usize>;

    async fn is_empty(&self) -> BrokerResult<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Rendezvous point between the processing loop (single writer) and
/// waiting gateways (readers that delete on read).
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite the value for `id`.
    async fn put(&self, id: &RequestId, value: &ResultValue) -> BrokerResult<()>;

    /// Current value for `id`, if any. Never blocks waiting for one.
    async fn get(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>>;

    async fn delete(&self, id: &RequestId) -> BrokerResult<()>;

    /// Read and delete in one step.
    async fn take(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>>;

    /// Drop entries older than the TTL. Returns how many were removed.
    /// Stores with native expiry have nothing to do here.
    async fn evict_expired(&self) -> BrokerResult<usize> {
        Ok(0)
    }
}
