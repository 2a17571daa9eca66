//! Health check infrastructure for the weight estimator
//!
//! Backend health is derived from the metrics store on every request;
//! other components report their status explicitly. Unhealthy backends
//! never make the service unready, because predictions still succeed
//! with fallback output.

use crate::metrics::{MetricsSnapshot, MetricsStore, PerformanceMetrics};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(message.into()),
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Health of one inference backend, as seen by the probes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: ComponentStatus,
    pub prediction_count: u64,
    pub success_rate: f64,
    pub average_confidence: f64,
    pub average_processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<i64>,
}

impl From<&PerformanceMetrics> for BackendHealth {
    fn from(m: &PerformanceMetrics) -> Self {
        Self {
            status: if m.is_healthy {
                ComponentStatus::Healthy
            } else {
                ComponentStatus::Unhealthy
            },
            prediction_count: m.prediction_count,
            success_rate: m.success_rate(),
            average_confidence: m.average_confidence(),
            average_processing_time_ms: m.average_processing_time_ms(),
            last_health_check: m.last_health_check,
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub backends: BTreeMap<String, BackendHealth>,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across explicitly reported components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }

    /// All backends healthy, some healthy, or none healthy
    pub fn backend_status(backends: &BTreeMap<String, BackendHealth>) -> ComponentStatus {
        if backends.is_empty() {
            return ComponentStatus::Healthy;
        }
        let healthy = backends
            .values()
            .filter(|b| b.status == ComponentStatus::Healthy)
            .count();
        if healthy == backends.len() {
            ComponentStatus::Healthy
        } else if healthy == 0 {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        }
    }

    fn build(snapshot: &MetricsSnapshot, components: HashMap<String, ComponentHealth>) -> Self {
        let backends: BTreeMap<String, BackendHealth> = snapshot
            .iter()
            .map(|(name, m)| (name.clone(), BackendHealth::from(m)))
            .collect();

        let status = match (Self::compute_status(&components), Self::backend_status(&backends)) {
            (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => ComponentStatus::Unhealthy,
            (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => ComponentStatus::Degraded,
            _ => ComponentStatus::Healthy,
        };

        Self {
            status,
            backends,
            components,
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const ORCHESTRATOR: &str = "orchestrator";
    pub const HEALTH_MONITOR: &str = "health_monitor";
    pub const WEIGHT_STORE: &str = "weight_store";
}

/// Health registry for tracking component and backend health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    metrics: Option<Arc<MetricsStore>>,
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            metrics: None,
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Derive backend health from `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let snapshot = match &self.metrics {
            Some(store) => store.snapshot().await,
            None => MetricsSnapshot::new(),
        };
        HealthResponse::build(&snapshot, components)
    }

    /// Ready once initialized while no reported component has failed
    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let components = self.components.read().await;
        let components_ok = HealthResponse::compute_status(&components) != ComponentStatus::Unhealthy;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Estimator not yet initialized".to_string()),
            }
        } else if !components_ok {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(backends: &[(&str, bool)]) -> HealthRegistry {
        let store = Arc::new(MetricsStore::new());
        for (name, healthy) in backends {
            store.register(name).await;
            store.mark_health(name, *healthy).await;
        }
        HealthRegistry::new().with_metrics(store)
    }

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(health.backends.is_empty());
    }

    #[tokio::test]
    async fn test_backend_health_rollup() {
        let all = registry_with(&[("detector", true), ("depth", true)]).await;
        assert_eq!(all.health().await.status, ComponentStatus::Healthy);

        let some = registry_with(&[("detector", true), ("depth", false)]).await;
        let health = some.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(health.backends["depth"].status, ComponentStatus::Unhealthy);
        assert!(health.backends["depth"].last_health_check.is_some());

        let none = registry_with(&[("detector", false), ("depth", false)]).await;
        assert_eq!(none.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_component_degraded_status() {
        let registry = registry_with(&[("detector", true)]).await;
        registry.register(components::ORCHESTRATOR).await;
        registry.set_degraded(components::HEALTH_MONITOR, "Not started").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_ready_even_when_backends_unhealthy() {
        let registry = registry_with(&[("detector", false), ("depth", false)]).await;
        registry.set_ready(true).await;

        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_component_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::ORCHESTRATOR).await;
        registry.set_ready(true).await;
        registry.set_unhealthy(components::ORCHESTRATOR, "Failed").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
    }
}
