//! Integration tests for the estimator API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use estimator_lib::{
    adapter::{FallbackAdapter, InferenceAdapter},
    health::{components, HealthRegistry},
    BackendKind, EnsembleOrchestrator, EstimatorMetrics,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use weight_estimator::api::{create_router, AppState};

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let adapters: Vec<Arc<dyn InferenceAdapter>> = BackendKind::ALL
        .iter()
        .map(|&kind| Arc::new(FallbackAdapter::new(kind, 16)) as Arc<dyn InferenceAdapter>)
        .collect();
    let orchestrator = Arc::new(
        EnsembleOrchestrator::builder()
            .adapters(adapters)
            .per_backend_timeout(Duration::from_millis(500))
            .build()
            .unwrap(),
    );
    orchestrator.initialize().await;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ORCHESTRATOR).await;
    health_registry.register(components::HEALTH_MONITOR).await;

    let metrics = EstimatorMetrics::new();
    let state = Arc::new(AppState::new(orchestrator, health_registry, metrics));
    let router = create_router(state.clone());

    (router, state)
}

fn predict_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/predict")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn gray_pixels(width: usize, height: usize) -> String {
    STANDARD.encode(vec![128u8; width * height * 3])
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_predict_returns_estimate() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(predict_request(serde_json::json!({
            "width": 8,
            "height": 8,
            "pixels": gray_pixels(8, 8),
            "material": "steel"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let estimate = json_body(response).await;
    // No model files are configured, every backend answers synthetically
    assert_eq!(estimate["method"], "ensemble_fallback");
    assert_eq!(estimate["estimated_weight"], 10.0);
    assert_eq!(estimate["confidence"], 0.1);
    assert_eq!(estimate["model_count"], 0);
    assert_eq!(estimate["is_fallback"], true);
    let suggestions = estimate["suggestions"].as_array().unwrap();
    assert!(!suggestions.is_empty());
}

#[tokio::test]
async fn test_predict_without_material_uses_manual_mode() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(predict_request(serde_json::json!({
            "width": 4,
            "height": 4,
            "pixels": gray_pixels(4, 4),
            "manual_estimate": 22.5
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let estimate = json_body(response).await;
    assert_eq!(estimate["method"], "manual");
    assert_eq!(estimate["estimated_weight"], 22.5);
    assert_eq!(estimate["model_count"], 0);
}

#[tokio::test]
async fn test_predict_rejects_invalid_base64() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(predict_request(serde_json::json!({
            "width": 4,
            "height": 4,
            "pixels": "not base64!!",
            "material": "copper"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn test_stats_lists_every_backend() {
    let (app, state) = setup_test_app().await;

    // Populate metrics with one prediction
    let _ = app
        .clone()
        .oneshot(predict_request(serde_json::json!({
            "width": 4,
            "height": 4,
            "pixels": gray_pixels(4, 4),
            "material": "brass"
        })))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let stats = json_body(response).await;
    for kind in BackendKind::ALL {
        assert!(stats["backends"][kind.name()].is_object(), "missing {}", kind.name());
        assert!(stats["weights"][kind.name()].is_number());
    }
    assert_eq!(
        state.orchestrator.get_collection_statistics().total_records,
        1
    );
}

#[tokio::test]
async fn test_collection_counts_records() {
    let (app, _state) = setup_test_app().await;

    let _ = app
        .clone()
        .oneshot(predict_request(serde_json::json!({
            "width": 4,
            "height": 4,
            "pixels": gray_pixels(4, 4)
        })))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/collection")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let collection = json_body(response).await;
    assert_eq!(collection["total_records"], 1);
    assert_eq!(collection["manual_records"], 1);
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["orchestrator"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::HEALTH_MONITOR, "Probe overdue")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Degraded still returns 200 (operational)
    assert_eq!(response.status(), StatusCode::OK);

    let health = json_body(response).await;
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::ORCHESTRATOR, "Adapters released")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = json_body(response).await;
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let readiness = json_body(response).await;
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;

    state.health_registry.set_ready(true).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let readiness = json_body(response).await;
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_prediction_latency(0.002);
    state.metrics.observe_backend_latency("detector", 0.001);
    state.metrics.inc_predictions("ensemble");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("weight_estimator_prediction_latency_seconds_bucket"));
    assert!(metrics_text.contains("weight_estimator_backend_latency_seconds"));
    assert!(metrics_text.contains("weight_estimator_predictions_total"));
}
