//! REST handlers for classification requests and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use batchline_broker::Gateway;
use batchline_core::types::{Prediction, RequestId};
use batchline_core::BrokerError;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub node_id: String,
    pub start_time: Instant,
    /// Cancelled when the node shuts down; in-flight waits end with 503.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    /// Flattened row-major values.
    pub input: Vec<f32>,
    /// Defaults to the broker's configured item shape.
    #[serde(default)]
    pub shape: Option<Vec<usize>>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub id: RequestId,
    pub predictions: Vec<Prediction>,
}

/// POST /predict
pub async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    let started = Instant::now();
    let shape = request
        .shape
        .unwrap_or_else(|| state.gateway.input_shape().to_vec());

    let input = ArrayD::from_shape_vec(IxDyn(&shape), request.input).map_err(|e| {
        metrics::counter!("api.validation_errors").increment(1);
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_input", e.to_string())
    })?;

    let (id, predictions) = state
        .gateway
        .classify(&input, &state.shutdown.child_token())
        .await
        .map_err(ApiError::from)?;

    metrics::histogram!("api.predict_latency_ms").record(started.elapsed().as_secs_f64() * 1e3);
    Ok(Json(PredictResponse {
        success: true,
        id,
        predictions,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_depth = state.gateway.queue_depth().await.ok();
    Json(HealthResponse {
        status: if queue_depth.is_some() { "healthy" } else { "degraded" }.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_depth,
    })
}

/// GET /ready: 200 only while the queue is reachable and the node is not
/// shutting down.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.gateway.queue_depth().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                success: false,
                error: error.to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        let (status, kind) = match &e {
            BrokerError::DecodeFailure { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
            BrokerError::ProcessorFailure(_) => (StatusCode::BAD_GATEWAY, "processor_failure"),
            BrokerError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            BrokerError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            BrokerError::Cancelled { .. } => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            BrokerError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            error!(error = %e, "Predict request failed");
        } else {
            warn!(error = %e, "Predict request rejected");
        }
        metrics::counter!("api.errors", "kind" => kind).increment(1);

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal processing error".to_string()
        } else {
            e.to_string()
        };
        ApiError::new(status, kind, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use axum::body::Body;
    use axum::http::Request;
    use batchline_broker::ProcessingLoop;
    use batchline_core::config::{BrokerConfig, GatewayConfig, ModelConfig};
    use batchline_core::inference::{BatchProcessor, ProcessorError};
    use batchline_model::ClassifierEngine;
    use batchline_store::{MemoryResultStore, MemoryWorkQueue};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const SHAPE: [usize; 2] = [2, 2];

    struct Broken;

    impl BatchProcessor for Broken {
        fn process(&self, _batch: ArrayD<f32>) -> Result<Vec<Vec<Prediction>>, ProcessorError> {
            Err(ProcessorError::ModelNotLoaded("weights missing".into()))
        }

        fn provider_name(&self) -> &str {
            "broken"
        }

        fn input_shape(&self) -> &[usize] {
            &SHAPE
        }
    }

    fn engine() -> Arc<dyn BatchProcessor> {
        let config = ModelConfig {
            num_classes: 4,
            hidden_dim: 4,
            top_k: 2,
            labels: None,
        };
        Arc::new(ClassifierEngine::new(&config, &SHAPE).unwrap())
    }

    /// Build a router over in-process stores. With a processor, a loop is
    /// spawned and stopped when `shutdown` is cancelled.
    fn app(
        processor: Option<Arc<dyn BatchProcessor>>,
        max_depth: Option<usize>,
        timeout_ms: u64,
    ) -> (axum::Router, CancellationToken) {
        let queue = Arc::new(MemoryWorkQueue::new(max_depth));
        let results = Arc::new(MemoryResultStore::new(Duration::from_secs(60)));
        let shutdown = CancellationToken::new();

        if let Some(processor) = processor {
            let config = BrokerConfig {
                input_shape: SHAPE.to_vec(),
                server_sleep_ms: 2,
                ..Default::default()
            };
            ProcessingLoop::new(
                queue.clone(),
                results.clone(),
                processor,
                config,
                shutdown.child_token(),
            )
            .spawn();
        }

        let gateway = Gateway::new(
            queue,
            results,
            &GatewayConfig {
                client_sleep_ms: 2,
                timeout_ms: Some(timeout_ms),
            },
            SHAPE.to_vec(),
        );
        let state = AppState {
            gateway,
            node_id: "test-node".to_string(),
            start_time: Instant::now(),
            shutdown: shutdown.clone(),
        };
        (router(state), shutdown)
    }

    fn predict_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/predict")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_predict_returns_top_k() {
        let (app, shutdown) = app(Some(engine()), None, 2_000);

        let response = app
            .oneshot(predict_request(serde_json::json!({ "input": [0.1, 0.2, 0.3, 0.4] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert!(!body["id"].as_str().unwrap().is_empty());
        assert_eq!(body["predictions"].as_array().unwrap().len(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_length_is_bad_request() {
        let (app, _) = app(None, None, 50);
        let response = app
            .oneshot(predict_request(serde_json::json!({ "input": [0.1, 0.2, 0.3] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_wrong_shape_is_bad_request() {
        let (app, _) = app(None, None, 50);
        let response = app
            .oneshot(predict_request(
                serde_json::json!({ "input": [0.1, 0.2, 0.3, 0.4], "shape": [4] }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_processor_failure_is_bad_gateway() {
        let (app, shutdown) = app(Some(Arc::new(Broken)), None, 2_000);
        let response = app
            .oneshot(predict_request(serde_json::json!({ "input": [0.0, 0.0, 0.0, 0.0] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["error"], "processor_failure");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_full_queue_is_unavailable() {
        let (app, _) = app(None, Some(0), 50);
        let response = app
            .oneshot(predict_request(serde_json::json!({ "input": [0.0, 0.0, 0.0, 0.0] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "queue_full");
    }

    #[tokio::test]
    async fn test_no_worker_times_out() {
        let (app, _) = app(None, None, 30);
        let response = app
            .oneshot(predict_request(serde_json::json!({ "input": [0.0, 0.0, 0.0, 0.0] })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_probes() {
        let (app, shutdown) = app(None, None, 50);

        let live = app
            .clone()
            .oneshot(Request::get("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(live.status(), StatusCode::OK);

        let health = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(health).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["node_id"], "test-node");
        assert_eq!(body["queue_depth"], 0);

        let ready = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ready.status(), StatusCode::OK);

        shutdown.cancel();
        let draining = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(draining.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
