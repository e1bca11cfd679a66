//! API server: the HTTP front door and the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use batchline_broker::Gateway;
use batchline_core::config::AppConfig;
use std::net::SocketAddr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    gateway: Gateway,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: AppConfig, gateway: Gateway, shutdown: CancellationToken) -> Self {
        Self {
            config,
            gateway,
            shutdown,
        }
    }

    /// Build the router without binding a socket.
    pub fn router(&self) -> Router {
        router(AppState {
            gateway: self.gateway.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Serve HTTP until the shutdown token is cancelled.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Install the Prometheus recorder and its scrape listener.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/predict", post(rest::predict))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
