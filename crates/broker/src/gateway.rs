//! Request gateway: one external call becomes one enqueue plus a poll of the
//! result store until the id resolves, times out, or the caller goes away.

use batchline_core::codec::encode_array;
use batchline_core::config::GatewayConfig;
use batchline_core::types::{FailureKind, Prediction, RequestId, ResultValue, WorkItem};
use batchline_core::{BrokerError, BrokerResult};
use batchline_store::{ResultStore, WorkQueue};
use ndarray::ArrayD;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Gateway {
    queue: Arc<dyn WorkQueue>,
    results: Arc<dyn ResultStore>,
    input_shape: Vec<usize>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        results: Arc<dyn ResultStore>,
        config: &GatewayConfig,
        input_shape: Vec<usize>,
    ) -> Self {
        Self {
            queue,
            results,
            input_shape,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    /// Override the wait deadline. `None` waits until resolved or cancelled.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Current work queue depth. Also serves as a store reachability check.
    pub async fn queue_depth(&self) -> BrokerResult<usize> {
        self.queue.len().await
    }

    /// Encode `input` and append it to the work queue under a fresh id.
    pub async fn submit(&self, input: &ArrayD<f32>) -> BrokerResult<RequestId> {
        let id = RequestId::new();

        if input.shape() != self.input_shape.as_slice() {
            return Err(BrokerError::DecodeFailure {
                id,
                reason: format!(
                    "input shape {:?} does not match expected {:?}",
                    input.shape(),
                    self.input_shape
                ),
            });
        }

        let wire = encode_array(input);
        let item = WorkItem {
            id: id.clone(),
            payload: wire.payload,
            payload_type: wire.payload_type,
            payload_shape: wire.payload_shape,
        };

        let depth = self.queue.enqueue(item.to_record()?).await?;
        debug!(id = %id, depth = depth, "Work item enqueued");
        Ok(id)
    }

    /// Poll the result store for `id` until it resolves.
    ///
    /// On timeout any late result is deleted on a best-effort basis; whatever
    /// still arrives afterwards expires with the store's TTL.
    pub async fn wait(
        &self,
        id: &RequestId,
        cancel: &CancellationToken,
    ) -> BrokerResult<Vec<Prediction>> {
        let started = Instant::now();

        let outcome = match self.timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BrokerError::Cancelled { id: id.clone() }),
                polled = tokio::time::timeout(limit, self.poll(id)) => match polled {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Timeout {
                        id: id.clone(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    }),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BrokerError::Cancelled { id: id.clone() }),
                result = self.poll(id) => result,
            },
        };

        match &outcome {
            Ok(_) => metrics::counter!("gateway.resolved").increment(1),
            Err(BrokerError::Timeout { waited_ms, .. }) => {
                metrics::counter!("gateway.timeouts").increment(1);
                warn!(id = %id, waited_ms = *waited_ms, "Gave up waiting for result");
                if let Err(e) = self.results.delete(id).await {
                    debug!(id = %id, error = %e, "Could not clean up timed-out result");
                }
            }
            Err(BrokerError::Cancelled { .. }) => {
                metrics::counter!("gateway.cancelled").increment(1);
                debug!(id = %id, "Caller cancelled wait");
            }
            Err(_) => {}
        }

        outcome
    }

    /// Submit and wait.
    pub async fn classify(
        &self,
        input: &ArrayD<f32>,
        cancel: &CancellationToken,
    ) -> BrokerResult<(RequestId, Vec<Prediction>)> {
        let id = self.submit(input).await?;
        let predictions = self.wait(&id, cancel).await?;
        Ok((id, predictions))
    }

    async fn poll(&self, id: &RequestId) -> BrokerResult<Vec<Prediction>> {
        loop {
            if let Some(value) = self.results.take(id).await? {
                return resolve(id, value);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn resolve(id: &RequestId, value: ResultValue) -> BrokerResult<Vec<Prediction>> {
    match value {
        ResultValue::Predictions(predictions) => Ok(predictions),
        ResultValue::Error(record) => match record.kind {
            FailureKind::DecodeFailure => Err(BrokerError::DecodeFailure {
                id: id.clone(),
                reason: record.message,
            }),
            FailureKind::ProcessorFailure => Err(BrokerError::ProcessorFailure(record.message)),
        },
    }
}
