//! Per-backend performance tracking
//!
//! The store keeps O(1) running aggregates per backend plus a bounded ring
//! of the most recent individual outcomes for export. All mutations go
//! through the store's own methods; readers receive copies.

mod health_monitor;

pub use health_monitor::{HealthMonitor, MonitorConfig, DEFAULT_PROBE_INTERVAL, DEFAULT_REWEIGHT_INTERVAL};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// Number of recent outcomes retained per backend
pub const RECENT_SAMPLES_CAPACITY: usize = 50;

/// Running aggregates for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub prediction_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub cumulative_processing_time_ms: f64,
    pub cumulative_confidence: f64,
    /// Unix timestamp (seconds) of the last health probe
    pub last_health_check: Option<i64>,
    pub is_healthy: bool,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            prediction_count: 0,
            success_count: 0,
            failure_count: 0,
            cumulative_processing_time_ms: 0.0,
            cumulative_confidence: 0.0,
            last_health_check: None,
            is_healthy: true,
        }
    }
}

impl PerformanceMetrics {
    pub fn average_processing_time_ms(&self) -> f64 {
        if self.prediction_count == 0 {
            return 0.0;
        }
        self.cumulative_processing_time_ms / self.prediction_count as f64
    }

    pub fn average_confidence(&self) -> f64 {
        if self.prediction_count == 0 {
            return 0.0;
        }
        self.cumulative_confidence / self.prediction_count as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.prediction_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.prediction_count as f64
    }

    fn record(&mut self, processing_time_ms: f64, confidence: f64, succeeded: bool) {
        self.prediction_count += 1;
        if succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.cumulative_processing_time_ms += processing_time_ms.max(0.0);
        self.cumulative_confidence += confidence.clamp(0.0, 1.0);
    }
}

/// One recorded outcome, kept for analytics export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSample {
    pub timestamp: i64,
    pub processing_time_ms: f64,
    pub confidence: f64,
    pub succeeded: bool,
}

/// Immutable copy of every backend's aggregates
pub type MetricsSnapshot = BTreeMap<String, PerformanceMetrics>;

#[derive(Debug, Default)]
struct BackendEntry {
    metrics: PerformanceMetrics,
    recent: VecDeque<PredictionSample>,
}

/// Shared per-backend metrics store
#[derive(Debug, Default)]
pub struct MetricsStore {
    entries: RwLock<HashMap<String, BackendEntry>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given backends pre-registered
    pub fn with_backends<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = names
            .into_iter()
            .map(|n| (n.to_string(), BackendEntry::default()))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Register a backend with empty aggregates (no-op if present)
    pub async fn register(&self, name: &str) {
        let mut entries = self.entries.write().await;
        entries.entry(name.to_string()).or_default();
    }

    /// Fold one outcome into the backend's aggregates
    pub async fn record_outcome(
        &self,
        name: &str,
        processing_time_ms: f64,
        confidence: f64,
        succeeded: bool,
    ) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(name.to_string()).or_default();
        entry.metrics.record(processing_time_ms, confidence, succeeded);

        if entry.recent.len() >= RECENT_SAMPLES_CAPACITY {
            entry.recent.pop_front();
        }
        entry.recent.push_back(PredictionSample {
            timestamp: chrono::Utc::now().timestamp(),
            processing_time_ms,
            confidence,
            succeeded,
        });
    }

    /// Record the result of a health probe
    pub async fn mark_health(&self, name: &str, healthy: bool) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(name.to_string()).or_default();
        if entry.metrics.is_healthy != healthy {
            debug!(backend = %name, healthy = healthy, "Backend health changed");
        }
        entry.metrics.is_healthy = healthy;
        entry.metrics.last_health_check = Some(chrono::Utc::now().timestamp());
    }

    /// True until the most recent probe marked the backend unhealthy
    pub async fn is_healthy(&self, name: &str) -> bool {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.metrics.is_healthy).unwrap_or(true)
    }

    pub async fn get(&self, name: &str) -> Option<PerformanceMetrics> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.metrics.clone())
    }

    /// Copy of every backend's aggregates
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(name, e)| (name.clone(), e.metrics.clone()))
            .collect()
    }

    /// Most recent outcomes for a backend, oldest first
    pub async fn recent_samples(&self, name: &str) -> Vec<PredictionSample> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|e| e.recent.iter().cloned().collect())
            .unwrap_or_default()
    }
}
