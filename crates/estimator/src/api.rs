//! HTTP API for predictions, statistics, health checks and Prometheus metrics

use base64::{engine::general_purpose::STANDARD, Engine as _};
use estimator_lib::{
    health::{ComponentStatus, HealthRegistry},
    preprocess::DecodedImage,
    DeviceCapabilities, EnsembleOrchestrator, EstimatorMetrics, MaterialType,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<EnsembleOrchestrator>,
    pub health_registry: HealthRegistry,
    pub metrics: EstimatorMetrics,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<EnsembleOrchestrator>,
        health_registry: HealthRegistry,
        metrics: EstimatorMetrics,
    ) -> Self {
        Self {
            orchestrator,
            health_registry,
            metrics,
        }
    }
}

/// Body of `POST /v1/predict`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Base64-encoded row-major 8-bit pixels
    pub pixels: String,
    /// Unknown or missing values select manual-only mode
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub manual_estimate: Option<f64>,
    #[serde(default)]
    pub accelerated: bool,
}

fn default_channels() -> u8 {
    3
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Run one prediction; malformed transport input is the only error path
async fn predict(State(state): State<Arc<AppState>>, Json(request): Json<PredictRequest>) -> Response {
    let pixels = match STANDARD.decode(request.pixels.as_bytes()) {
        Ok(pixels) => pixels,
        Err(e) => {
            warn!(error = %e, "Rejected prediction request with undecodable pixels");
            return bad_request(format!("pixels must be base64: {}", e));
        }
    };

    let image = DecodedImage::new(request.width, request.height, request.channels, pixels);
    let material = MaterialType::parse_optional(request.material.as_deref());
    let device = DeviceCapabilities {
        supports_accelerated_compute: request.accelerated,
    };

    let estimate = state
        .orchestrator
        .predict_weight(&image, material, request.manual_estimate, &device)
        .await;

    (StatusCode::OK, Json(estimate)).into_response()
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.get_performance_stats().await)
}

async fn collection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.get_collection_statistics())
}

/// Health check response - 200 unless every backend and component failed
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/predict", post(predict))
        .route("/v1/stats", get(stats))
        .route("/v1/collection", get(collection))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
