//! Weight estimator service
//!
//! Wires the ensemble orchestrator from configuration and exposes it over
//! HTTP alongside health, readiness and Prometheus endpoints.

pub mod api;
pub mod config;
pub mod records;
