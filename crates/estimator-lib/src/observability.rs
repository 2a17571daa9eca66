//! Observability infrastructure for the weight estimator
//!
//! Provides:
//! - Prometheus metrics (prediction latency, backend latency and failures, weights, health)
//! - Structured JSON logging with tracing

use crate::weights::EnsembleWeights;
use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EstimatorMetricsInner> = OnceLock::new();

struct EstimatorMetricsInner {
    prediction_latency_seconds: Histogram,
    backend_latency_seconds: HistogramVec,
    backend_failures: IntCounterVec,
    ensemble_fallbacks: IntCounter,
    predictions: IntCounterVec,
    ensemble_weight: GaugeVec,
    backend_healthy: GaugeVec,
    health_probes: IntCounterVec,
}

impl EstimatorMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "weight_estimator_prediction_latency_seconds",
                "End-to-end latency of a weight prediction call",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            backend_latency_seconds: register_histogram_vec!(
                "weight_estimator_backend_latency_seconds",
                "Inference latency per backend",
                &["backend"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register backend_latency_seconds"),

            backend_failures: register_int_counter_vec!(
                "weight_estimator_backend_failures_total",
                "Backend outputs replaced by fallback, by reason",
                &["backend", "reason"]
            )
            .expect("Failed to register backend_failures"),

            ensemble_fallbacks: register_int_counter!(
                "weight_estimator_ensemble_fallbacks_total",
                "Predictions answered with the conservative fallback estimate"
            )
            .expect("Failed to register ensemble_fallbacks"),

            predictions: register_int_counter_vec!(
                "weight_estimator_predictions_total",
                "Predictions served, by estimation method",
                &["method"]
            )
            .expect("Failed to register predictions"),

            ensemble_weight: register_gauge_vec!(
                "weight_estimator_ensemble_weight",
                "Current persistent ensemble weight per backend",
                &["backend"]
            )
            .expect("Failed to register ensemble_weight"),

            backend_healthy: register_gauge_vec!(
                "weight_estimator_backend_healthy",
                "1 if the most recent health probe succeeded",
                &["backend"]
            )
            .expect("Failed to register backend_healthy"),

            health_probes: register_int_counter_vec!(
                "weight_estimator_health_probes_total",
                "Health probe outcomes per backend",
                &["backend", "outcome"]
            )
            .expect("Failed to register health_probes"),
        }
    }
}

/// Estimator metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct EstimatorMetrics {
    _private: (),
}

impl Default for EstimatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimatorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EstimatorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EstimatorMetricsInner {
        GLOBAL_METRICS.get_or_init(EstimatorMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn observe_backend_latency(&self, backend: &str, duration_secs: f64) {
        self.inner()
            .backend_latency_seconds
            .with_label_values(&[backend])
            .observe(duration_secs);
    }

    pub fn inc_backend_failure(&self, backend: &str, reason: &str) {
        self.inner()
            .backend_failures
            .with_label_values(&[backend, reason])
            .inc();
    }

    pub fn inc_ensemble_fallback(&self) {
        self.inner().ensemble_fallbacks.inc();
    }

    pub fn inc_predictions(&self, method: &str) {
        self.inner().predictions.with_label_values(&[method]).inc();
    }

    /// Publish the full weight vector
    /// Publish the current vector; backends no longer in it stop being exported
    pub fn set_weights(&self, weights: &EnsembleWeights) {
        self.inner().ensemble_weight.reset();
        for (backend, weight) in weights.iter() {
            self.inner()
                .ensemble_weight
                .with_label_values(&[backend])
                .set(weight);
        }
    }

    pub fn set_backend_healthy(&self, backend: &str, healthy: bool) {
        self.inner()
            .backend_healthy
            .with_label_values(&[backend])
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn inc_probe(&self, backend: &str, outcome: &str) {
        self.inner()
            .health_probes
            .with_label_values(&[backend, outcome])
            .inc();
    }
}

/// Structured logger for estimator events
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Log a served prediction
    #[allow(clippy::too_many_arguments)]
    pub fn log_prediction(
        &self,
        material: &str,
        estimated_weight: f64,
        confidence: f64,
        method: &str,
        model_count: usize,
        fallback_backends: usize,
        duration_ms: f64,
    ) {
        info!(
            event = "prediction_served",
            service = %self.service,
            material = %material,
            estimated_weight_lbs = estimated_weight,
            confidence = confidence,
            method = %method,
            model_count = model_count,
            fallback_backends = fallback_backends,
            duration_ms = duration_ms,
            "Served weight prediction"
        );
    }

    /// Log a backend output replaced by fallback
    pub fn log_backend_fallback(&self, backend: &str, reason: &str, detail: &str) {
        warn!(
            event = "backend_fallback",
            service = %self.service,
            backend = %backend,
            reason = %reason,
            detail = %detail,
            "Backend failed, using fallback output"
        );
    }

    /// Log a request answered without running any backend
    pub fn log_manual_mode(&self, reason: &str) {
        info!(
            event = "manual_mode",
            service = %self.service,
            reason = %reason,
            "Answering in manual-only mode"
        );
    }

    /// Log a health probe outcome
    pub fn log_probe(&self, backend: &str, healthy: bool, elapsed_ms: f64, error: Option<&str>) {
        if healthy {
            info!(
                event = "health_probe",
                service = %self.service,
                backend = %backend,
                healthy = true,
                elapsed_ms = elapsed_ms,
                "Backend probe succeeded"
            );
        } else {
            warn!(
                event = "health_probe",
                service = %self.service,
                backend = %backend,
                healthy = false,
                elapsed_ms = elapsed_ms,
                error = error.unwrap_or("unknown"),
                "Backend probe failed"
            );
        }
    }

    /// Log an adaptive weight update
    pub fn log_weights_recomputed(&self, weights: &EnsembleWeights) {
        info!(
            event = "weights_recomputed",
            service = %self.service,
            weights = ?weights.as_map(),
            "Ensemble weights recomputed from performance metrics"
        );
    }

    pub fn log_startup(&self, version: &str, backends: &[String]) {
        info!(
            event = "estimator_started",
            service = %self.service,
            version = %version,
            backends = ?backends,
            "Weight estimator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "estimator_shutdown",
            service = %self.service,
            reason = %reason,
            "Weight estimator shutting down"
        );
    }
}
