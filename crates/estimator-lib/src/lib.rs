//! Ensemble weight-estimation library
//!
//! This crate provides the core functionality for:
//! - Uniform adapters over heterogeneous inference backends
//! - Deterministic fallback outputs for failing backends
//! - Per-backend performance tracking and periodic health probes
//! - Adaptive ensemble weighting and prediction fusion
//! - Health checks and observability

pub mod adapter;
pub mod combiner;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod preprocess;
pub mod sink;
pub mod weights;

pub use health::{BackendHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{EstimatorMetrics, StructuredLogger};
pub use orchestrator::{
    BackgroundHandle, EnsembleOrchestrator, OrchestratorBuilder, OrchestratorConfig,
};
