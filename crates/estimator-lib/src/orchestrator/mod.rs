//! Ensemble orchestration
//!
//! The orchestrator owns the adapter set and drives one prediction call
//! end to end: input preparation, contextual weighting, concurrent backend
//! execution with fallback substitution, fusion, suggestions and the
//! learning-record emission. `predict_weight` never fails; every error
//! path degrades to a lower-confidence estimate.


use crate::adapter::{interpret, AdapterError, FallbackGenerator, InferenceAdapter, MaterialTable};
use crate::combiner::{blended_confidence, CombinerConfig, PredictionCombiner};
use crate::metrics::{HealthMonitor, MetricsStore, MonitorConfig, PerformanceMetrics};
use crate::models::{
    clamp_weight, DeviceCapabilities, EnsembleResult, EstimationMethod, ImageCharacteristics,
    MaterialType, ModelPrediction, WeightEstimate,
};
use crate::observability::{EstimatorMetrics, StructuredLogger};
use crate::preprocess::{analyze, DecodedImage, ImageTensor, InputPreparer};
use crate::sink::{BackendOutput, CollectionStatistics, LearningSink, NullSink, PredictionRecord, RecordCollector};
use crate::weights::{EnsembleWeights, MemoryPreferences, ReweightPolicy, WeightStore};
use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SUGGEST_SELECT_MATERIAL: &str = "Select a material type to get an AI-assisted estimate";
pub const SUGGEST_RETAKE_PHOTO: &str = "The photo could not be processed, retake it with the scrap fully in frame";
pub const SUGGEST_IMPROVE_LIGHTING: &str = "Improve lighting or move to a brighter area and retake the photo";
pub const SUGGEST_REFERENCE_OBJECT: &str = "Place a reference object such as a coin or ruler next to the scrap for scale";
pub const SUGGEST_VERIFY_ON_SCALE: &str = "Verify the final weight on a certified scale";

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on a single backend's inference
    pub per_backend_timeout: Duration,
    /// Upper bound on the whole backend phase of one call
    pub overall_budget: Duration,
    /// Tensor side for adapters that do not report one
    pub default_input_side: usize,
    /// Confidence reported for manual estimates
    pub manual_confidence: f64,
    /// Weight reported in manual mode when no value was supplied
    pub default_manual_weight: f64,
    /// Relative gap between manual and model estimates that triggers a suggestion
    pub manual_divergence_threshold: f64,
    /// Below this confidence a reference object is suggested
    pub low_confidence_threshold: f64,
    pub combiner: CombinerConfig,
    pub materials: MaterialTable,
    pub monitor: MonitorConfig,
    pub service_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            per_backend_timeout: Duration::from_secs(2),
            overall_budget: Duration::from_secs(5),
            default_input_side: 224,
            manual_confidence: 0.3,
            default_manual_weight: 10.0,
            manual_divergence_threshold: 0.25,
            low_confidence_threshold: 0.5,
            combiner: CombinerConfig::default(),
            materials: MaterialTable::default(),
            monitor: MonitorConfig::default(),
            service_name: "weight-estimator".to_string(),
        }
    }
}

/// Outcome of initializing the adapter set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitializationReport {
    pub ready: Vec<String>,
    /// Backend name and failure message
    pub failed: Vec<(String, String)>,
}

/// Per-backend entry of the performance report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    #[serde(flatten)]
    pub metrics: PerformanceMetrics,
    pub average_processing_time_ms: f64,
    pub average_confidence: f64,
    pub success_rate: f64,
    pub current_weight: f64,
}

/// Performance report across all backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub backends: BTreeMap<String, BackendStats>,
    pub weights: EnsembleWeights,
    pub total_predictions: u64,
    pub overall_average_confidence: f64,
    pub overall_average_processing_time_ms: f64,
    pub healthy_backends: usize,
}

/// Why a request skipped the backends entirely
enum ManualReason {
    MissingMaterial,
    InvalidImage(String),
}

/// One backend's result within a prediction call
struct BackendRun {
    prediction: ModelPrediction,
    error: Option<String>,
}

/// Handle to the background health monitor
pub struct BackgroundHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl BackgroundHandle {
    /// Stop the monitor and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Multi-backend weight-estimation orchestrator
pub struct EnsembleOrchestrator {
    adapters: Vec<Arc<dyn InferenceAdapter>>,
    metrics: Arc<MetricsStore>,
    weights: Arc<WeightStore>,
    collector: Arc<RecordCollector>,
    combiner: PredictionCombiner,
    preparer: InputPreparer,
    config: OrchestratorConfig,
    telemetry: EstimatorMetrics,
    logger: StructuredLogger,
    released: AtomicBool,
}

impl EnsembleOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn metrics_store(&self) -> Arc<MetricsStore> {
        self.metrics.clone()
    }

    pub fn weight_store(&self) -> Arc<WeightStore> {
        self.weights.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Initialize every adapter; failures are recorded, never fatal
    pub async fn initialize(&self) -> InitializationReport {
        let mut report = InitializationReport::default();

        for adapter in &self.adapters {
            let name = adapter.name().to_string();
            self.metrics.register(&name).await;

            match adapter.initialize().await {
                Ok(()) => {
                    debug!(backend = %name, version = %adapter.metadata().version, "Adapter initialized");
                    report.ready.push(name);
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Adapter failed to initialize, serving fallback output");
                    self.metrics.mark_health(&name, false).await;
                    self.telemetry.set_backend_healthy(&name, false);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.telemetry.set_weights(&self.weights.snapshot().await);
        info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Ensemble initialized"
        );
        report
    }

    /// Estimate the weight of the scrap in `image`
    pub async fn predict_weight(
        &self,
        image: &DecodedImage,
        material: Option<MaterialType>,
        manual_estimate: Option<f64>,
        device: &DeviceCapabilities,
    ) -> WeightEstimate {
        let start = Instant::now();
        let manual = manual_estimate
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(clamp_weight);

        let Some(material) = material else {
            return self.manual_only(None, manual, device, ManualReason::MissingMaterial, start);
        };

        let tensors = match self.prepare_tensors(image) {
            Ok(tensors) => tensors,
            Err(e) => {
                return self.manual_only(
                    Some(material),
                    manual,
                    device,
                    ManualReason::InvalidImage(e),
                    start,
                )
            }
        };

        // Largest prepared tensor drives the image characteristics
        let characteristics = tensors
            .values()
            .next_back()
            .map(analyze)
            .unwrap_or_default();
        let weights = self.weights.contextual(&characteristics, device).await;

        let runs = join_all(self.adapters.iter().map(|adapter| {
            let side = self.input_side(adapter.as_ref());
            let tensor = tensors.get(&side);
            self.run_backend(adapter.as_ref(), tensor, material)
        }))
        .await;

        let predictions: Vec<ModelPrediction> = runs.iter().map(|r| r.prediction.clone()).collect();
        let ensemble = self.fuse(&predictions, &weights);
        let fallback_count = predictions.iter().filter(|p| p.is_fallback).count();

        let mut estimate = self.surface(&ensemble, &predictions, &weights);
        self.apply_manual(&mut estimate, manual);
        estimate.suggestions = self.suggestions(&estimate, Some(&characteristics), fallback_count);

        let mut record = PredictionRecord::new(Some(material), estimate.clone(), *device);
        record.backend_outputs = runs
            .iter()
            .map(|r| BackendOutput::from_prediction(&r.prediction, r.error.clone()))
            .collect();
        record.ensemble = Some(ensemble);
        record.characteristics = Some(characteristics);
        record.manual_override = manual;
        self.collector.emit(record);

        self.finish(&estimate, material.as_str(), fallback_count, start);
        estimate
    }

    /// Per-backend metrics plus the current persistent weights
    pub async fn get_performance_stats(&self) -> PerformanceStats {
        let snapshot = self.metrics.snapshot().await;
        let weights = self.weights.snapshot().await;

        let total_predictions: u64 = snapshot.values().map(|m| m.prediction_count).sum();
        let (confidence_sum, time_sum) = snapshot.values().fold((0.0, 0.0), |(c, t), m| {
            (c + m.cumulative_confidence, t + m.cumulative_processing_time_ms)
        });
        let (overall_average_confidence, overall_average_processing_time_ms) = if total_predictions > 0 {
            (
                confidence_sum / total_predictions as f64,
                time_sum / total_predictions as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let healthy_backends = snapshot.values().filter(|m| m.is_healthy).count();
        let backends = snapshot
            .into_iter()
            .map(|(name, m)| {
                let stats = BackendStats {
                    average_processing_time_ms: m.average_processing_time_ms(),
                    average_confidence: m.average_confidence(),
                    success_rate: m.success_rate(),
                    current_weight: weights.get(&name),
                    metrics: m,
                };
                (name, stats)
            })
            .collect();

        PerformanceStats {
            backends,
            weights,
            total_predictions,
            overall_average_confidence,
            overall_average_processing_time_ms,
            healthy_backends,
        }
    }

    pub fn get_collection_statistics(&self) -> CollectionStatistics {
        self.collector.statistics()
    }

    /// Spawn the health monitor; stop it through the returned handle
    pub fn start_background(&self) -> BackgroundHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let monitor = HealthMonitor::new(
            self.adapters.clone(),
            self.metrics.clone(),
            self.weights.clone(),
            self.config.monitor.clone(),
            self.logger.clone(),
        );
        let task = tokio::spawn(monitor.run(shutdown_rx));
        BackgroundHandle { shutdown_tx, task }
    }

    /// Release every adapter; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for adapter in &self.adapters {
            adapter.release().await;
        }
        info!(backends = self.adapters.len(), "Released inference adapters");
    }

    fn input_side(&self, adapter: &dyn InferenceAdapter) -> usize {
        adapter
            .metadata()
            .input_side()
            .unwrap_or(self.config.default_input_side)
    }

    /// One tensor per distinct adapter input side
    fn prepare_tensors(&self, image: &DecodedImage) -> std::result::Result<BTreeMap<usize, ImageTensor>, String> {
        let mut sides: BTreeSet<usize> = self
            .adapters
            .iter()
            .map(|a| self.input_side(a.as_ref()))
            .collect();
        if sides.is_empty() {
            sides.insert(self.config.default_input_side);
        }

        sides
            .into_iter()
            .map(|side| {
                self.preparer
                    .prepare(image, side)
                    .map(|tensor| (side, tensor))
                    .map_err(|e| e.to_string())
            })
            .collect()
    }

    async fn run_backend(
        &self,
        adapter: &dyn InferenceAdapter,
        tensor: Option<&ImageTensor>,
        material: MaterialType,
    ) -> BackendRun {
        let name = adapter.name().to_string();
        let kind = adapter.kind();
        let budget = self.config.per_backend_timeout.min(self.config.overall_budget);
        let start = Instant::now();

        let attempt = match tensor {
            Some(tensor) if !self.released.load(Ordering::SeqCst) => {
                match tokio::time::timeout(budget, adapter.run_inference(tensor)).await {
                    Ok(Ok(result)) => interpret(kind, &result, material, &self.config.materials)
                        .map(|(weight, confidence)| (weight, confidence, result.is_fallback())),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AdapterError::Timeout(budget)),
                }
            }
            Some(_) => Err(AdapterError::Released),
            None => Err(AdapterError::InvalidInput("no tensor prepared".to_string())),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.telemetry.observe_backend_latency(&name, elapsed_ms / 1000.0);

        match attempt {
            Ok((weight, confidence, synthetic)) => {
                self.metrics
                    .record_outcome(&name, elapsed_ms, confidence, !synthetic)
                    .await;
                let prediction = ModelPrediction::new(name, weight, confidence).with_processing_time(elapsed_ms);
                BackendRun {
                    prediction: if synthetic { prediction.as_fallback() } else { prediction },
                    error: None,
                }
            }
            Err(e) => {
                self.metrics.record_outcome(&name, elapsed_ms, 0.0, false).await;
                self.telemetry.inc_backend_failure(&name, e.reason());
                self.logger.log_backend_fallback(&name, e.reason(), &e.to_string());

                let (weight, confidence) = tensor
                    .map(|t| FallbackGenerator::generate(kind, t))
                    .and_then(|result| interpret(kind, &result, material, &self.config.materials).ok())
                    .unwrap_or((self.config.combiner.fallback_weight, self.config.combiner.fallback_confidence));

                BackendRun {
                    prediction: ModelPrediction::new(name, weight, confidence)
                        .with_processing_time(elapsed_ms)
                        .as_fallback(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Combine predictions, yielding the fallback result unless a real output carries weight
    fn fuse(&self, predictions: &[ModelPrediction], weights: &EnsembleWeights) -> EnsembleResult {
        let has_real_output = predictions
            .iter()
            .any(|p| !p.is_fallback && weights.get(&p.backend_name) > 0.0);
        if !has_real_output {
            return self.combiner.fallback_result();
        }
        self.combiner.combine(predictions, weights)
    }

    /// Turn the combiner output into the surfaced estimate
    fn surface(
        &self,
        ensemble: &EnsembleResult,
        predictions: &[ModelPrediction],
        weights: &EnsembleWeights,
    ) -> WeightEstimate {
        if !ensemble.is_fallback {
            let contributing: Vec<&ModelPrediction> = predictions
                .iter()
                .filter(|p| weights.get(&p.backend_name) > 0.0)
                .collect();
            let estimates: Vec<f64> = contributing.iter().map(|p| p.weight_estimate).collect();
            let confidences: Vec<f64> = contributing.iter().map(|p| p.confidence).collect();

            return WeightEstimate {
                estimated_weight: ensemble.final_weight,
                confidence: blended_confidence(&estimates, &confidences),
                method: EstimationMethod::Ensemble,
                factors: ensemble.factors.clone(),
                suggestions: Vec::new(),
                model_count: ensemble.model_count,
                is_fallback: false,
            };
        }

        // Highest confidence real output wins, first in input order on ties
        let best = predictions
            .iter()
            .filter(|p| !p.is_fallback)
            .fold(None::<&ModelPrediction>, |best, p| match best {
                Some(b) if b.confidence >= p.confidence => Some(b),
                _ => Some(p),
            });

        match best {
            Some(p) => WeightEstimate {
                estimated_weight: clamp_weight(p.weight_estimate),
                confidence: p.confidence,
                method: EstimationMethod::SingleModel,
                factors: vec![format!("{}: {:.1}lbs (single model)", p.backend_name, p.weight_estimate)],
                suggestions: Vec::new(),
                model_count: 1,
                is_fallback: false,
            },
            None => WeightEstimate {
                estimated_weight: ensemble.final_weight,
                confidence: ensemble.confidence,
                method: EstimationMethod::EnsembleFallback,
                factors: ensemble.factors.clone(),
                suggestions: Vec::new(),
                model_count: 0,
                is_fallback: true,
            },
        }
    }

    /// Fold a user-supplied estimate into the surfaced result
    fn apply_manual(&self, estimate: &mut WeightEstimate, manual: Option<f64>) {
        let Some(manual) = manual else {
            return;
        };

        if estimate.method == EstimationMethod::EnsembleFallback {
            estimate.estimated_weight = manual;
            estimate.confidence = self.config.manual_confidence;
            estimate.method = EstimationMethod::Manual;
            estimate.factors = vec![format!("Manual estimate: {:.1}lbs", manual)];
            return;
        }

        estimate.factors.push(format!("Manual estimate: {:.1}lbs", manual));
        let divergence = (estimate.estimated_weight - manual).abs() / manual;
        if divergence > self.config.manual_divergence_threshold {
            estimate.suggestions.push(format!(
                "Manual estimate differs from the model estimate by {:.0}%, double-check the entry",
                divergence * 100.0
            ));
        }
    }

    fn suggestions(
        &self,
        estimate: &WeightEstimate,
        characteristics: Option<&ImageCharacteristics>,
        fallback_count: usize,
    ) -> Vec<String> {
        let mut suggestions = estimate.suggestions.clone();

        if characteristics.map(|c| c.is_low_light).unwrap_or(false) {
            suggestions.push(SUGGEST_IMPROVE_LIGHTING.to_string());
        }
        if estimate.confidence < self.config.low_confidence_threshold {
            suggestions.push(SUGGEST_REFERENCE_OBJECT.to_string());
        }
        if fallback_count > 0 {
            suggestions.push(format!(
                "{} of {} models unavailable, the estimate may be less accurate",
                fallback_count,
                self.adapters.len()
            ));
        }
        suggestions.push(SUGGEST_VERIFY_ON_SCALE.to_string());
        suggestions
    }

    fn manual_only(
        &self,
        material: Option<MaterialType>,
        manual: Option<f64>,
        device: &DeviceCapabilities,
        reason: ManualReason,
        start: Instant,
    ) -> WeightEstimate {
        let (reason_text, hint) = match &reason {
            ManualReason::MissingMaterial => ("material not selected".to_string(), SUGGEST_SELECT_MATERIAL),
            ManualReason::InvalidImage(e) => (format!("invalid image: {}", e), SUGGEST_RETAKE_PHOTO),
        };
        self.logger.log_manual_mode(&reason_text);

        let factor = match manual {
            Some(v) => format!("Manual estimate: {:.1}lbs", v),
            None => format!(
                "Default estimate: {:.1}lbs (no manual value provided)",
                self.config.default_manual_weight
            ),
        };
        let mut estimate = WeightEstimate {
            estimated_weight: manual.unwrap_or(self.config.default_manual_weight),
            confidence: self.config.manual_confidence,
            method: EstimationMethod::Manual,
            factors: vec![factor],
            suggestions: vec![hint.to_string()],
            model_count: 0,
            is_fallback: false,
        };
        estimate.suggestions = self.suggestions(&estimate, None, 0);

        let mut record = PredictionRecord::new(material, estimate.clone(), *device);
        record.manual_override = manual;
        self.collector.emit(record);

        let material_label = material.map(|m| m.as_str()).unwrap_or("unspecified");
        self.finish(&estimate, material_label, 0, start);
        estimate
    }

    fn finish(&self, estimate: &WeightEstimate, material: &str, fallback_count: usize, start: Instant) {
        let elapsed = start.elapsed();
        let method = estimate.method.to_string();
        self.telemetry.observe_prediction_latency(elapsed.as_secs_f64());
        self.telemetry.inc_predictions(&method);
        if estimate.method == EstimationMethod::EnsembleFallback {
            self.telemetry.inc_ensemble_fallback();
        }
        self.logger.log_prediction(
            material,
            estimate.estimated_weight,
            estimate.confidence,
            &method,
            estimate.model_count,
            fallback_count,
            elapsed.as_secs_f64() * 1000.0,
        );
    }
}

/// Builder for constructing an orchestrator with explicit collaborators
pub struct OrchestratorBuilder {
    adapters: Vec<Arc<dyn InferenceAdapter>>,
    metrics: Option<Arc<MetricsStore>>,
    weights: Option<Arc<WeightStore>>,
    sink: Option<Arc<dyn LearningSink>>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            metrics: None,
            weights: None,
            sink: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn adapter(mut self, adapter: Arc<dyn InferenceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn adapters(mut self, adapters: impl IntoIterator<Item = Arc<dyn InferenceAdapter>>) -> Self {
        self.adapters.extend(adapters);
        self
    }

    pub fn metrics_store(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn weight_store(mut self, weights: Arc<WeightStore>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn LearningSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn per_backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_backend_timeout = timeout;
        self
    }

    pub fn overall_budget(mut self, budget: Duration) -> Self {
        self.config.overall_budget = budget;
        self
    }

    pub fn build(self) -> Result<EnsembleOrchestrator> {
        if self.adapters.is_empty() {
            anyhow::bail!("At least one inference adapter is required");
        }
        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            if !seen.insert(adapter.name().to_string()) {
                anyhow::bail!("Duplicate adapter for backend {}", adapter.name());
            }
        }

        let names: Vec<String> = self.adapters.iter().map(|a| a.name().to_string()).collect();
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsStore::with_backends(names.iter().map(String::as_str))));
        let weights = self.weights.unwrap_or_else(|| {
            Arc::new(WeightStore::load(
                EnsembleWeights::defaults(),
                Arc::new(MemoryPreferences::new()),
                ReweightPolicy::default(),
            ))
        });
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(NullSink) as Arc<dyn LearningSink>);

        let logger = StructuredLogger::new(self.config.service_name.clone());
        Ok(EnsembleOrchestrator {
            adapters: self.adapters,
            metrics,
            weights,
            collector: Arc::new(RecordCollector::new(sink)),
            combiner: PredictionCombiner::new(self.config.combiner),
            preparer: InputPreparer::new(),
            config: self.config,
            telemetry: EstimatorMetrics::new(),
            logger,
            released: AtomicBool::new(false),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
