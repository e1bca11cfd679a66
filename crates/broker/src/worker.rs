//! The processing loop: the single consumer of the work queue.
//!
//! Each iteration drains up to `batch_size` records, runs the collector,
//! calls the processor once, writes one result per drained id, and removes
//! exactly the drained records from the queue. Every id that leaves the
//! queue gets either predictions or an explicit error record. If that cannot
//! happen before shutdown, its record goes back to the head of the queue.

use crate::collector::BatchCollector;
use batchline_core::config::BrokerConfig;
use batchline_core::inference::BatchProcessor;
use batchline_core::types::{
    FailureKind, Prediction, RequestId, ResultRecord, ResultValue, WorkItem,
};
use batchline_core::{BrokerError, BrokerResult};
use batchline_store::{ResultStore, WorkQueue};
use ndarray::ArrayD;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Nothing in flight; waiting for work.
    Idle,
    /// A non-empty batch has been taken from the queue and is not yet resolved.
    Processing,
}

/// What one call to [`ProcessingLoop::run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Idle,
    Processed {
        /// Records removed from the queue, including ones that failed to decode.
        drained: usize,
        /// Ids that received predictions.
        resolved: usize,
        /// Ids that received an error record.
        failed: usize,
    },
}

pub struct ProcessingLoop {
    queue: Arc<dyn WorkQueue>,
    results: Arc<dyn ResultStore>,
    processor: Arc<dyn BatchProcessor>,
    collector: BatchCollector,
    config: BrokerConfig,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
}

impl ProcessingLoop {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        results: Arc<dyn ResultStore>,
        processor: Arc<dyn BatchProcessor>,
        config: BrokerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let collector = BatchCollector::new(config.input_shape.clone());
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            queue,
            results,
            processor,
            collector,
            config,
            cancel,
            state,
        }
    }

    /// Follow the loop's state. Stays valid after the loop is spawned.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Spawn the loop as a Tokio task. It exits when the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(
            provider = self.processor.provider_name(),
            batch_size = self.config.batch_size,
            atomic_drain = self.config.atomic_drain,
            "Processing loop started"
        );

        let mut backoff = self.config.retry_backoff();

        while !self.cancel.is_cancelled() {
            match self.run_once().await {
                Ok(IterationOutcome::Idle) => {
                    backoff = self.config.retry_backoff();
                    if !self.pause(self.config.server_sleep()).await {
                        break;
                    }
                }
                Ok(IterationOutcome::Processed { .. }) => {
                    backoff = self.config.retry_backoff();
                }
                Err(e) => {
                    metrics::counter!("broker.store_errors").increment(1);
                    error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Processing iteration failed");
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff());
                }
            }
        }

        info!("Processing loop stopped");
    }

    /// Run a single iteration.
    ///
    /// Returns an error only when the queue could not be read, or when a
    /// write after processing kept failing until the loop was cancelled.
    pub async fn run_once(&self) -> BrokerResult<IterationOutcome> {
        let batch_size = self.config.batch_size;
        let claimed = self.config.atomic_drain;
        let records = if claimed {
            self.queue.drain(batch_size).await?
        } else {
            self.queue.peek_range(batch_size).await?
        };

        if records.is_empty() {
            return Ok(IterationOutcome::Idle);
        }

        self.state.send_replace(LoopState::Processing);
        let outcome = self.process_records(&records, claimed).await;
        self.state.send_replace(LoopState::Idle);
        outcome
    }

    async fn process_records(
        &self,
        records: &[String],
        claimed: bool,
    ) -> BrokerResult<IterationOutcome> {
        let drained = records.len();
        debug!(drained = drained, claimed = claimed, "Collected records from queue");
        metrics::counter!("broker.batches").increment(1);
        metrics::histogram!("broker.batch_size").record(drained as f64);

        let batch = self.collector.collect(records);
        let mut outcomes: Vec<ResultRecord> = Vec::with_capacity(drained);

        for failure in batch.failures {
            metrics::counter!("broker.decode_failures").increment(1);
            if let Some(id) = failure.id {
                outcomes.push(ResultRecord {
                    id,
                    value: ResultValue::failure(FailureKind::DecodeFailure, failure.error.to_string()),
                });
            }
        }

        let mut resolved = 0;
        if let Some(tensor) = batch.tensor {
            match self.invoke(tensor, batch.ids.len()).await {
                Ok(predictions) => {
                    resolved = predictions.len();
                    outcomes.extend(batch.ids.into_iter().zip(predictions).map(|(id, preds)| {
                        ResultRecord {
                            id,
                            value: ResultValue::Predictions(preds),
                        }
                    }));
                }
                Err(e) => {
                    metrics::counter!("broker.processor_failures").increment(1);
                    error!(error = %e, batch = batch.ids.len(), "Processor failed, failing whole batch");
                    let message = e.to_string();
                    outcomes.extend(batch.ids.into_iter().map(|id| ResultRecord {
                        id,
                        value: ResultValue::failure(FailureKind::ProcessorFailure, message.clone()),
                    }));
                }
            }
        }

        let failed = outcomes.len() - resolved;
        for (written, record) in outcomes.iter().enumerate() {
            let put = self
                .with_retry("write result", claimed, || self.results.put(&record.id, &record.value))
                .await;
            if let Err(e) = put {
                if claimed {
                    self.release(records, &outcomes[written..]).await;
                }
                return Err(e);
            }
        }

        if !claimed {
            // Remove exactly what was peeked, decode failures included.
            self.with_retry("trim queue", false, || self.queue.trim(drained)).await?;
        }

        info!(
            drained = drained,
            resolved = resolved,
            failed = failed,
            "Batch complete"
        );

        Ok(IterationOutcome::Processed {
            drained,
            resolved,
            failed,
        })
    }

    /// Call the processor off the async runtime and check it answered once
    /// per item. A panic inside the processor fails the batch.
    async fn invoke(
        &self,
        tensor: ArrayD<f32>,
        expected: usize,
    ) -> BrokerResult<Vec<Vec<Prediction>>> {
        let processor = self.processor.clone();
        let outputs = tokio::task::spawn_blocking(move || processor.process(tensor))
            .await
            .map_err(|e| BrokerError::ProcessorFailure(format!("processor task failed: {e}")))??;

        if outputs.len() != expected {
            return Err(BrokerError::ProcessorFailure(format!(
                "processor returned {} results for {} inputs",
                outputs.len(),
                expected
            )));
        }
        Ok(outputs)
    }

    /// Hand the raw records of still-unresolved ids back to the queue head.
    async fn release(&self, records: &[String], unresolved: &[ResultRecord]) {
        let mut pending: HashSet<&RequestId> = unresolved.iter().map(|r| &r.id).collect();
        let returned: Vec<String> = records
            .iter()
            .filter(|raw| match WorkItem::from_record(raw) {
                Ok(item) => pending.remove(&item.id),
                Err(_) => false,
            })
            .cloned()
            .collect();

        match self.queue.requeue(returned).await {
            Ok(()) => {
                metrics::counter!("broker.requeued").increment(unresolved.len() as u64);
                for record in unresolved {
                    warn!(id = %record.id, "Unresolved work item returned to queue");
                }
            }
            Err(e) => {
                metrics::counter!("broker.abandoned").increment(unresolved.len() as u64);
                for record in unresolved {
                    error!(id = %record.id, error = %e, "Work item abandoned without a result");
                }
            }
        }
    }

    /// Retry a store operation with exponential backoff until it succeeds or
    /// fails with a non-retryable error.
    ///
    /// Unclaimed work stops retrying as soon as the loop is cancelled. For a
    /// claimed batch retries continue for `shutdown_grace` after cancellation.
    async fn with_retry<T, F, Fut>(&self, what: &str, claimed: bool, mut op: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let mut backoff = self.config.retry_backoff();
        let mut grace_until = None;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    metrics::counter!("broker.store_errors").increment(1);
                    warn!(operation = what, error = %e, retry_in_ms = backoff.as_millis() as u64, "Store operation failed, retrying");
                    let keep_going = if claimed {
                        self.pause_within_grace(backoff, &mut grace_until).await
                    } else {
                        self.pause(backoff).await
                    };
                    if !keep_going {
                        return Err(e);
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Like [`Self::pause`], but cancellation only starts the grace period.
    /// Returns `false` once the grace period has run out.
    async fn pause_within_grace(
        &self,
        duration: Duration,
        grace_until: &mut Option<Instant>,
    ) -> bool {
        if self.pause(duration).await {
            return true;
        }
        let deadline =
            *grace_until.get_or_insert_with(|| Instant::now() + self.config.shutdown_grace());
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(duration.min(deadline - now)).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use batchline_core::codec::encode_array;
    use batchline_core::inference::ProcessorError;
    use batchline_store::{MemoryResultStore, MemoryWorkQueue};
    use ndarray::{Axis, IxDyn};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Labels each item with its first element, so tests can check pairing.
    struct EchoProcessor {
        shape: Vec<usize>,
        calls: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl EchoProcessor {
        fn new(shape: Vec<usize>) -> Self {
            Self {
                shape,
                calls: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            }
        }
    }

    impl BatchProcessor for EchoProcessor {
        fn process(&self, batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.max_seen.fetch_max(batch.shape()[0], Ordering::SeqCst);
            Ok(batch
                .axis_iter(Axis(0))
                .map(|item| {
                    vec![Prediction {
                        label: format!("{}", item.iter().next().copied().unwrap_or_default()),
                        probability: 1.0,
                    }]
                })
                .collect())
        }

        fn provider_name(&self) -> &str {
            "echo"
        }

        fn input_shape(&self) -> &[usize] {
            &self.shape
        }
    }

    struct FailingProcessor;

    impl BatchProcessor for FailingProcessor {
        fn process(&self, _batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            Err(ProcessorError::ExecutionFailure("device lost".into()))
        }

        fn provider_name(&self) -> &str {
            "failing"
        }

        fn input_shape(&self) -> &[usize] {
            &[1]
        }
    }

    struct PanickingProcessor;

    impl BatchProcessor for PanickingProcessor {
        fn process(&self, _batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            panic!("kernel assertion failed");
        }

        fn provider_name(&self) -> &str {
            "panicking"
        }

        fn input_shape(&self) -> &[usize] {
            &[1]
        }
    }

    struct SlowProcessor;

    impl BatchProcessor for SlowProcessor {
        fn process(&self, batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(vec![Vec::new(); batch.shape()[0]])
        }

        fn provider_name(&self) -> &str {
            "slow"
        }

        fn input_shape(&self) -> &[usize] {
            &[1]
        }
    }

    /// Result store whose writes fail until `healed` is set.
    struct UnreachableResults {
        healed: AtomicBool,
        inner: MemoryResultStore,
    }

    impl UnreachableResults {
        fn new() -> Self {
            Self {
                healed: AtomicBool::new(false),
                inner: MemoryResultStore::new(Duration::from_secs(60)),
            }
        }
    }

    #[async_trait]
    impl ResultStore for UnreachableResults {
        async fn put(&self, id: &RequestId, value: &ResultValue) -> BrokerResult<()> {
            if !self.healed.load(Ordering::SeqCst) {
                return Err(BrokerError::StoreUnavailable("connection reset".into()));
            }
            self.inner.put(id, value).await
        }

        async fn get(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
            self.inner.get(id).await
        }

        async fn delete(&self, id: &RequestId) -> BrokerResult<()> {
            self.inner.delete(id).await
        }

        async fn take(&self, id: &RequestId) -> BrokerResult<Option<ResultValue>> {
            self.inner.take(id).await
        }
    }

    struct ShortProcessor;

    impl BatchProcessor for ShortProcessor {
        fn process(&self, _batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            Ok(vec![vec![]])
        }

        fn provider_name(&self) -> &str {
            "short"
        }

        fn input_shape(&self) -> &[usize] {
            &[1]
        }
    }

    fn broker_config(batch_size: usize, atomic_drain: bool) -> BrokerConfig {
        BrokerConfig {
            batch_size,
            atomic_drain,
            input_shape: vec![1],
            server_sleep_ms: 5,
            retry_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        }
    }

    fn item(i: usize) -> (RequestId, String) {
        let id = RequestId::from(format!("req-{i:03}"));
        let wire = encode_array(&ArrayD::from_elem(IxDyn(&[1]), i as f32));
        let record = WorkItem {
            id: id.clone(),
            payload: wire.payload,
            payload_type: wire.payload_type,
            payload_shape: wire.payload_shape,
        }
        .to_record()
        .unwrap();
        (id, record)
    }

    struct Harness {
        queue: Arc<MemoryWorkQueue>,
        results: Arc<MemoryResultStore>,
        worker: ProcessingLoop,
    }

    fn harness(processor: Arc<dyn BatchProcessor>, config: BrokerConfig) -> Harness {
        let queue = Arc::new(MemoryWorkQueue::unbounded());
        let results = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let worker = ProcessingLoop::new(
            queue.clone(),
            results.clone(),
            processor,
            config,
            CancellationToken::new(),
        );
        Harness {
            queue,
            results,
            worker,
        }
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let h = harness(Arc::new(EchoProcessor::new(vec![1])), broker_config(4, false));
        assert_eq!(h.worker.run_once().await.unwrap(), IterationOutcome::Idle);
    }

    #[tokio::test]
    async fn test_results_pair_with_ids() {
        for atomic in [false, true] {
            let h = harness(Arc::new(EchoProcessor::new(vec![1])), broker_config(8, atomic));
            let mut ids = Vec::new();
            for i in 0..5 {
                let (id, record) = item(i);
                h.queue.enqueue(record).await.unwrap();
                ids.push(id);
            }

            let outcome = h.worker.run_once().await.unwrap();
            assert_eq!(
                outcome,
                IterationOutcome::Processed { drained: 5, resolved: 5, failed: 0 }
            );
            assert!(h.queue.is_empty().await.unwrap());

            for (i, id) in ids.iter().enumerate() {
                match h.results.get(id).await.unwrap() {
                    Some(ResultValue::Predictions(preds)) => {
                        assert_eq!(preds[0].label, format!("{i}"), "atomic={atomic}");
                    }
                    other => panic!("unexpected result for {id}: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_processor_failure_resolves_every_id_with_error() {
        let h = harness(Arc::new(FailingProcessor), broker_config(8, false));
        let mut ids = Vec::new();
        for i in 0..5 {
            let (id, record) = item(i);
            h.queue.enqueue(record).await.unwrap();
            ids.push(id);
        }

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Processed { drained: 5, resolved: 0, failed: 5 }
        );
        assert!(h.queue.is_empty().await.unwrap(), "poisoned batch must not be retried");

        for id in &ids {
            match h.results.get(id).await.unwrap() {
                Some(ResultValue::Error(e)) => assert_eq!(e.kind, FailureKind::ProcessorFailure),
                other => panic!("expected error record, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_processor_panic_resolves_every_id_with_error() {
        let h = harness(Arc::new(PanickingProcessor), broker_config(8, true));
        let mut ids = Vec::new();
        for i in 0..3 {
            let (id, record) = item(i);
            h.queue.enqueue(record).await.unwrap();
            ids.push(id);
        }

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Processed { drained: 3, resolved: 0, failed: 3 }
        );
        assert!(h.queue.is_empty().await.unwrap());

        for id in &ids {
            match h.results.get(id).await.unwrap() {
                Some(ResultValue::Error(e)) => assert_eq!(e.kind, FailureKind::ProcessorFailure),
                other => panic!("expected error record for {id}, got {other:?}"),
            }
        }
        assert_eq!(h.worker.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_state_is_processing_while_batch_in_flight() {
        let h = harness(Arc::new(SlowProcessor), broker_config(8, true));
        h.queue.enqueue(item(1).1).await.unwrap();

        let worker = Arc::new(h.worker);
        let mut state = worker.subscribe();
        assert_eq!(*state.borrow(), LoopState::Idle);

        let running = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_once().await })
        };

        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == LoopState::Processing),
        )
        .await
        .expect("loop should report a batch in flight")
        .unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, IterationOutcome::Processed { drained: 1, .. }));
        assert_eq!(worker.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_claimed_batch_returns_to_queue_when_results_unreachable_at_shutdown() {
        let queue = Arc::new(MemoryWorkQueue::unbounded());
        let results = Arc::new(UnreachableResults::new());
        let cancel = CancellationToken::new();
        let config = BrokerConfig {
            shutdown_grace_ms: 30,
            ..broker_config(8, true)
        };

        let mut records = Vec::new();
        for i in 0..3 {
            let (_, record) = item(i);
            queue.enqueue(record.clone()).await.unwrap();
            records.push(record);
        }

        let handle = ProcessingLoop::new(
            queue.clone(),
            results.clone(),
            Arc::new(EchoProcessor::new(vec![1])),
            config,
            cancel.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop once the grace period ends")
            .unwrap();

        assert_eq!(queue.snapshot(), records, "claimed items are back at the head, in order");
        assert!(results.inner.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_batch_finishes_if_store_recovers_during_grace() {
        let queue = Arc::new(MemoryWorkQueue::unbounded());
        let results = Arc::new(UnreachableResults::new());
        let cancel = CancellationToken::new();
        let config = BrokerConfig {
            shutdown_grace_ms: 2_000,
            ..broker_config(8, true)
        };

        let mut ids = Vec::new();
        for i in 0..3 {
            let (id, record) = item(i);
            queue.enqueue(record).await.unwrap();
            ids.push(id);
        }

        let handle = ProcessingLoop::new(
            queue.clone(),
            results.clone(),
            Arc::new(EchoProcessor::new(vec![1])),
            config,
            cancel.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        results.healed.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should stop after the batch resolves")
            .unwrap();

        assert!(queue.is_empty().await.unwrap());
        for id in &ids {
            assert!(
                matches!(results.get(id).await.unwrap(), Some(ResultValue::Predictions(_))),
                "{id} should be resolved"
            );
        }
    }

    #[tokio::test]
    async fn test_short_processor_output_is_a_failure() {
        let h = harness(Arc::new(ShortProcessor), broker_config(8, true));
        for i in 0..3 {
            h.queue.enqueue(item(i).1).await.unwrap();
        }

        let outcome = h.worker.run_once().await.unwrap();
        assert_eq!(
            outcome,
            IterationOutcome::Processed { drained: 3, resolved: 0, failed: 3 }
        );
    }

    #[tokio::test]
    async fn test_batch_never_exceeds_batch_size() {
        let processor = Arc::new(EchoProcessor::new(vec![1]));
        let h = harness(processor.clone(), broker_config(4, false));
        for i in 0..10 {
            h.queue.enqueue(item(i).1).await.unwrap();
        }

        let mut drained = Vec::new();
        while let IterationOutcome::Processed { drained: n, .. } = h.worker.run_once().await.unwrap() {
            drained.push(n);
        }

        assert_eq!(drained, vec![4, 4, 2]);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert!(processor.max_seen.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let queue = Arc::new(MemoryWorkQueue::unbounded());
        let results = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let handle = ProcessingLoop::new(
            queue.clone(),
            results.clone(),
            Arc::new(EchoProcessor::new(vec![1])),
            broker_config(4, true),
            cancel.clone(),
        )
        .spawn();

        let (id, record) = item(7);
        queue.enqueue(record).await.unwrap();

        let mut found = None;
        for _ in 0..100 {
            if let Some(v) = results.get(&id).await.unwrap() {
                found = Some(v);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(found.is_some(), "loop should resolve queued work");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
