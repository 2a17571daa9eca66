//! Periodic backend health probing
//!
//! Exercises every adapter with a synthetic tensor on a fixed period,
//! validates the output schema and folds the outcome into the metrics
//! store. The same task also drives adaptive re-weighting, so neither step
//! ever runs concurrently with itself.

use super::MetricsStore;
use crate::adapter::{AdapterError, InferenceAdapter};
use crate::observability::{EstimatorMetrics, StructuredLogger};
use crate::preprocess::InputPreparer;
use crate::weights::WeightStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default probe period (30 minutes)
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default adaptive re-weighting period (10 minutes)
pub const DEFAULT_REWEIGHT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Configuration for the health monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between probe cycles
    pub probe_interval: Duration,
    /// Interval between adaptive re-weighting attempts
    pub reweight_interval: Duration,
    /// Time budget for a single probe
    pub probe_timeout: Duration,
    /// Tensor side used when an adapter does not report one
    pub default_input_side: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            reweight_interval: DEFAULT_REWEIGHT_INTERVAL,
            probe_timeout: Duration::from_secs(5),
            default_input_side: 224,
        }
    }
}

/// Outcome of probing one backend
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub backend: String,
    pub healthy: bool,
    pub elapsed_ms: f64,
    pub confidence: f64,
    pub error: Option<String>,
}

/// Scheduled prober owned by the orchestrator lifecycle
pub struct HealthMonitor {
    adapters: Vec<Arc<dyn InferenceAdapter>>,
    metrics: Arc<MetricsStore>,
    weights: Arc<WeightStore>,
    config: MonitorConfig,
    preparer: InputPreparer,
    telemetry: EstimatorMetrics,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(
        adapters: Vec<Arc<dyn InferenceAdapter>>,
        metrics: Arc<MetricsStore>,
        weights: Arc<WeightStore>,
        config: MonitorConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            adapters,
            metrics,
            weights,
            config,
            preparer: InputPreparer::new(),
            telemetry: EstimatorMetrics::new(),
            logger,
        }
    }

    /// Run probe and re-weight cycles until shutdown is signalled
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            probe_interval_secs = self.config.probe_interval.as_secs(),
            reweight_interval_secs = self.config.reweight_interval.as_secs(),
            backends = self.adapters.len(),
            "Starting health monitor"
        );

        let mut probe_ticker = interval(self.config.probe_interval);
        let mut reweight_ticker = interval(self.config.reweight_interval);

        loop {
            tokio::select! {
                _ = probe_ticker.tick() => {
                    let outcomes = self.probe_all().await;
                    let healthy = outcomes.iter().filter(|o| o.healthy).count();
                    debug!(healthy = healthy, total = outcomes.len(), "Probe cycle complete");
                }
                _ = reweight_ticker.tick() => {
                    self.reweight().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health monitor");
                    break;
                }
            }
        }
    }

    /// Probe every adapter once, sequentially
    pub async fn probe_all(&self) -> Vec<ProbeOutcome> {
        let mut outcomes = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            outcomes.push(self.probe(adapter.as_ref()).await);
        }
        outcomes
    }

    /// Probe a single adapter and record the outcome
    pub async fn probe(&self, adapter: &dyn InferenceAdapter) -> ProbeOutcome {
        let name = adapter.name().to_string();
        let kind = adapter.kind();
        let side = adapter
            .metadata()
            .input_side()
            .unwrap_or(self.config.default_input_side);

        let start = Instant::now();
        let checked = match self.preparer.probe_tensor(side) {
            Ok(tensor) => {
                match tokio::time::timeout(self.config.probe_timeout, adapter.run_inference(&tensor)).await {
                    Ok(Ok(result)) if result.is_fallback() => {
                        Err("backend answered with fallback output".to_string())
                    }
                    Ok(Ok(result)) => result
                        .validate(kind)
                        .map(|_| result.number(kind.category(), "confidence").unwrap_or(0.0))
                        .map_err(|e| e.to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(AdapterError::Timeout(self.config.probe_timeout).to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let outcome = match checked {
            Ok(confidence) => ProbeOutcome {
                backend: name.clone(),
                healthy: true,
                elapsed_ms,
                confidence: confidence.clamp(0.0, 1.0),
                error: None,
            },
            Err(error) => ProbeOutcome {
                backend: name.clone(),
                healthy: false,
                elapsed_ms,
                confidence: 0.0,
                error: Some(error),
            },
        };

        self.metrics
            .record_outcome(&name, outcome.elapsed_ms, outcome.confidence, outcome.healthy)
            .await;
        self.metrics.mark_health(&name, outcome.healthy).await;

        self.telemetry.set_backend_healthy(&name, outcome.healthy);
        self.telemetry
            .inc_probe(&name, if outcome.healthy { "success" } else { "failure" });
        self.logger
            .log_probe(&name, outcome.healthy, outcome.elapsed_ms, outcome.error.as_deref());

        outcome
    }

    /// Attempt adaptive re-weighting; returns whether weights changed
    pub async fn reweight(&self) -> bool {
        let snapshot = self.metrics.snapshot().await;
        match self.weights.recompute_from(&snapshot).await {
            Ok(true) => {
                let weights = self.weights.snapshot().await;
                self.telemetry.set_weights(&weights);
                self.logger.log_weights_recomputed(&weights);
                true
            }
            Ok(false) => {
                debug!("Adaptive re-weighting skipped, sample gate not met");
                false
            }
            Err(e) => {
                // In-memory weights were still updated
                warn!(error = %e, "Failed to persist recomputed weights");
                self.telemetry.set_weights(&self.weights.snapshot().await);
                true
            }
        }
    }
}
