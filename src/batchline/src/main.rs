//! Batchline: a micro-batching broker in front of a batch classifier.
//!
//! Main entry point that loads configuration, starts the processing loop and
//! serves the HTTP front door until interrupted.

use batchline_api::ApiServer;
use batchline_broker::BrokerManager;
use batchline_core::config::{AppConfig, StoreBackend};
use batchline_core::inference::BatchProcessor;
use batchline_model::ClassifierEngine;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "batchline")]
#[command(about = "Micro-batching broker for batch classifiers")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "BATCHLINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "BATCHLINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long)]
    http_port: Option<u16>,

    /// Store backend: memory or redis (overrides config)
    #[arg(long)]
    backend: Option<StoreBackend>,

    /// Maximum items per batch (overrides config)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Redis URL (overrides config)
    #[arg(long)]
    redis_url: Option<String>,

    /// Run only the processing loop, without the HTTP front door
    #[arg(long, default_value_t = false, conflicts_with = "api_only")]
    worker_only: bool,

    /// Serve requests without consuming the queue (needs a shared backend)
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchline=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Batchline starting up");

    let mut config = match AppConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_some() => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
    };

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.backend {
        config.broker.backend = backend;
    }
    if let Some(batch_size) = cli.batch_size {
        config.broker.batch_size = batch_size;
    }
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }
    config.validate()?;

    if cli.api_only && config.broker.backend == StoreBackend::Memory {
        warn!("API-only mode with the memory backend: nothing will consume the queue");
    }

    info!(
        node_id = %config.node_id,
        backend = ?config.broker.backend,
        batch_size = config.broker.batch_size,
        input_shape = ?config.broker.input_shape,
        http_port = config.api.http_port,
        "Configuration loaded"
    );

    let mut manager = BrokerManager::connect(config.clone()).await?;
    let shutdown = manager.cancellation_token();

    if !cli.api_only {
        let engine = ClassifierEngine::new(&config.model, &config.broker.input_shape)?;
        engine.warm_up()?;
        manager.start(Arc::new(engine));
    } else {
        info!("Running in API-only mode (no processing loop)");
    }

    let api_server = ApiServer::new(config.clone(), manager.gateway(), shutdown.clone());

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    info!("Batchline is ready");

    if cli.worker_only {
        info!("Running in worker-only mode (no HTTP server)");
        shutdown.cancelled().await;
    } else if let Err(e) = api_server.start_http().await {
        error!(error = %e, "HTTP server failed");
        manager.shutdown().await;
        return Err(e);
    }

    manager.shutdown().await;
    Ok(())
}
