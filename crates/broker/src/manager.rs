//! Broker manager: builds the shared stores, runs the processing loop and the
//! result-store maintenance task, and hands out gateways.

use crate::gateway::Gateway;
use crate::worker::{LoopState, ProcessingLoop};
use batchline_core::config::{AppConfig, StoreBackend};
use batchline_core::inference::BatchProcessor;
use batchline_core::BrokerResult;
use batchline_store::client::connect;
use batchline_store::{
    MemoryResultStore, MemoryWorkQueue, RedisResultStore, RedisWorkQueue, ResultStore, WorkQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Manages the lifecycle of the processing loop on this node.
pub struct BrokerManager {
    config: AppConfig,
    queue: Arc<dyn WorkQueue>,
    results: Arc<dyn ResultStore>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    loop_state: Option<watch::Receiver<LoopState>>,
}

impl BrokerManager {
    /// Build the configured backend. Redis is contacted once up front.
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let queue: Arc<dyn WorkQueue>;
        let results: Arc<dyn ResultStore>;

        match config.broker.backend {
            StoreBackend::Memory => {
                info!("Using in-process work queue and result store");
                queue = Arc::new(MemoryWorkQueue::new(config.broker.max_queue_depth));
                results = Arc::new(MemoryResultStore::new(config.broker.result_ttl()));
            }
            StoreBackend::Redis => {
                let conn = connect(&config.redis).await?;
                info!(queue_key = %config.redis.queue_key, "Using Redis work queue and result store");
                queue = Arc::new(RedisWorkQueue::new(
                    conn.clone(),
                    config.redis.queue_key.clone(),
                    config.broker.max_queue_depth,
                ));
                results = Arc::new(RedisResultStore::new(
                    conn,
                    config.redis.result_prefix.clone(),
                    config.broker.result_ttl(),
                ));
            }
        }

        Ok(Self::with_stores(config, queue, results))
    }

    /// Use already-built stores.
    pub fn with_stores(
        config: AppConfig,
        queue: Arc<dyn WorkQueue>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            config,
            queue,
            results,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            loop_state: None,
        }
    }

    /// Spawn the processing loop and the result-store maintenance task.
    /// Only one manager per queue may call this.
    pub fn start(&mut self, processor: Arc<dyn BatchProcessor>) {
        let worker = ProcessingLoop::new(
            self.queue.clone(),
            self.results.clone(),
            processor,
            self.config.broker.clone(),
            self.cancel.child_token(),
        );
        self.loop_state = Some(worker.subscribe());
        self.handles.push(worker.spawn());
        self.handles.push(self.spawn_maintenance());

        info!(
            node = %self.config.node_id,
            batch_size = self.config.broker.batch_size,
            "Broker started"
        );
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let results = self.results.clone();
        let cancel = self.cancel.child_token();
        let period = (self.config.broker.result_ttl() / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match results.evict_expired().await {
                            Ok(0) => {}
                            Ok(evicted) => debug!(evicted = evicted, "Expired results evicted"),
                            Err(e) => warn!(error = %e, "Result store maintenance failed"),
                        }
                    }
                }
            }
        })
    }

    /// A gateway sharing this manager's stores.
    pub fn gateway(&self) -> Gateway {
        Gateway::new(
            self.queue.clone(),
            self.results.clone(),
            &self.config.gateway,
            self.config.broker.input_shape.clone(),
        )
    }

    /// Token cancelled on shutdown; gateways can derive per-request tokens from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn queue_depth(&self) -> BrokerResult<usize> {
        self.queue.len().await
    }

    /// State of the processing loop, `None` when this node does not run one.
    pub fn loop_state(&self) -> Option<LoopState> {
        self.loop_state.as_ref().map(|rx| *rx.borrow())
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop the loop and wait for it to finish its current iteration.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Broker task panicked");
            }
        }
        info!("Broker stopped");
    }
}
