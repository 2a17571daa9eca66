//! Weight Estimator - ensemble scrap-weight estimation service
//!
//! Runs every configured inference backend behind one prediction endpoint,
//! probes their health in the background and streams learning records to disk.

use anyhow::Result;
use estimator_lib::{
    health::{components, HealthRegistry},
    sink::{ChannelSink, LearningSink},
    EnsembleOrchestrator, EstimatorMetrics, StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weight_estimator::{api, config, records};

const ESTIMATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting weight-estimator");

    // Load configuration
    let config = config::EstimatorConfig::load()?;
    info!(api_port = config.api_port, service = %config.service_name, "Estimator configured");

    let (sink, records_rx) = ChannelSink::new(config.sink_capacity);
    let records_handle = tokio::spawn(records::drain(records_rx, config.records_path.clone()));

    let orchestrator = Arc::new(
        EnsembleOrchestrator::builder()
            .adapters(config.adapters())
            .weight_store(Arc::new(config.weight_store()))
            .sink(Arc::new(sink) as Arc<dyn LearningSink>)
            .config(config.orchestrator_config())
            .build()?,
    );

    let logger = StructuredLogger::new(&config.service_name);
    logger.log_startup(ESTIMATOR_VERSION, &orchestrator.backend_names());

    // Initialize health registry
    let health_registry = HealthRegistry::new().with_metrics(orchestrator.metrics_store());
    health_registry.register(components::ORCHESTRATOR).await;
    health_registry.register(components::HEALTH_MONITOR).await;
    health_registry.register(components::WEIGHT_STORE).await;

    let report = orchestrator.initialize().await;
    if !report.failed.is_empty() {
        let failed: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
        health_registry
            .set_degraded(
                components::ORCHESTRATOR,
                format!("Serving fallback output for: {}", failed.join(", ")),
            )
            .await;
    }

    let metrics = EstimatorMetrics::new();
    let background = orchestrator.start_background();

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        orchestrator.clone(),
        health_registry.clone(),
        metrics,
    ));

    // Mark estimator as ready after initialization
    health_registry.set_ready(true).await;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = stop_rx.await;
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = stop_tx.send(());
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }

    background.shutdown().await;
    orchestrator.shutdown().await;

    // The drain ends once the last sink handle is gone
    drop(orchestrator);
    match tokio::time::timeout(Duration::from_secs(5), records_handle).await {
        Ok(Ok(Ok(written))) => info!(written, "Learning records flushed"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Failed to write learning records"),
        Ok(Err(e)) => warn!(error = %e, "Record writer task panicked"),
        Err(_) => warn!("Timed out flushing learning records"),
    }

    info!("Shutting down");
    Ok(())
}
