//! Estimator service configuration

use anyhow::{Context, Result};
use estimator_lib::adapter::{FallbackAdapter, InferenceAdapter, ModelSource, OnnxAdapter};
use estimator_lib::combiner::CombinerConfig;
use estimator_lib::metrics::MonitorConfig;
use estimator_lib::models::BackendKind;
use estimator_lib::weights::{
    EnsembleWeights, FilePreferences, MemoryPreferences, PreferenceStore, ReweightPolicy,
    WeightStore,
};
use estimator_lib::OrchestratorConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "ESTIMATOR_CONFIG";

/// Model settings for one backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendModelConfig {
    /// ONNX model file; the backend serves fallback output when unset
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Expected SHA-256 of the model file (hex)
    #[serde(default)]
    pub checksum: Option<String>,

    /// Square input side in pixels
    pub input_side: usize,
}

impl BackendModelConfig {
    fn with_side(input_side: usize) -> Self {
        Self {
            path: None,
            checksum: None,
            input_side,
        }
    }
}

/// Per-backend model settings
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_detector")]
    pub detector: BackendModelConfig,
    #[serde(default = "default_depth")]
    pub depth: BackendModelConfig,
    #[serde(default = "default_shape")]
    pub shape: BackendModelConfig,
    #[serde(default = "default_synthesis")]
    pub synthesis: BackendModelConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector: default_detector(),
            depth: default_depth(),
            shape: default_shape(),
            synthesis: default_synthesis(),
        }
    }
}

impl ModelsConfig {
    pub fn for_kind(&self, kind: BackendKind) -> &BackendModelConfig {
        match kind {
            BackendKind::Detector => &self.detector,
            BackendKind::Depth => &self.depth,
            BackendKind::Shape => &self.shape,
            BackendKind::Synthesis => &self.synthesis,
        }
    }
}

fn default_detector() -> BackendModelConfig {
    BackendModelConfig::with_side(320)
}

fn default_depth() -> BackendModelConfig {
    BackendModelConfig::with_side(256)
}

fn default_shape() -> BackendModelConfig {
    BackendModelConfig::with_side(224)
}

fn default_synthesis() -> BackendModelConfig {
    BackendModelConfig::with_side(224)
}

/// Estimator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EstimatorConfig {
    /// Service name attached to structured logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON file holding persisted preferences; in-memory when unset
    #[serde(default)]
    pub preferences_path: Option<PathBuf>,

    /// JSON-lines file receiving learning records; discarded when unset
    #[serde(default)]
    pub records_path: Option<PathBuf>,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default = "default_per_backend_timeout_ms")]
    pub per_backend_timeout_ms: u64,

    #[serde(default = "default_overall_budget_ms")]
    pub overall_budget_ms: u64,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_reweight_interval_secs")]
    pub reweight_interval_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Samples every backend needs before adaptive re-weighting
    #[serde(default = "default_min_predictions")]
    pub min_predictions: u64,

    /// Initial weights, normalised on load
    #[serde(default = "default_weights")]
    pub default_weights: BTreeMap<String, f64>,

    /// Conservative estimate when no backend contributed (lbs)
    #[serde(default = "default_fallback_weight_lbs")]
    pub fallback_weight_lbs: f64,

    /// Buffered learning records before new ones are dropped
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
}

fn default_service_name() -> String {
    "weight-estimator".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_per_backend_timeout_ms() -> u64 {
    2000
}

fn default_overall_budget_ms() -> u64 {
    5000
}

fn default_probe_interval_secs() -> u64 {
    30 * 60
}

fn default_reweight_interval_secs() -> u64 {
    10 * 60
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_min_predictions() -> u64 {
    10
}

fn default_weights() -> BTreeMap<String, f64> {
    EnsembleWeights::defaults().as_map().clone()
}

fn default_fallback_weight_lbs() -> f64 {
    10.0
}

fn default_sink_capacity() -> usize {
    256
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            api_port: default_api_port(),
            preferences_path: None,
            records_path: None,
            models: ModelsConfig::default(),
            per_backend_timeout_ms: default_per_backend_timeout_ms(),
            overall_budget_ms: default_overall_budget_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            reweight_interval_secs: default_reweight_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            min_predictions: default_min_predictions(),
            default_weights: default_weights(),
            fallback_weight_lbs: default_fallback_weight_lbs(),
            sink_capacity: default_sink_capacity(),
        }
    }
}

impl EstimatorConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::from_sources(file.as_deref())
    }

    /// Load from `file` (if any) overlaid with `ESTIMATOR_*` variables
    pub fn from_sources(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ESTIMATOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read estimator configuration")?;

        config
            .try_deserialize()
            .context("Invalid estimator configuration")
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            per_backend_timeout: Duration::from_millis(self.per_backend_timeout_ms),
            overall_budget: Duration::from_millis(self.overall_budget_ms),
            combiner: CombinerConfig {
                fallback_weight: self.fallback_weight_lbs,
                ..CombinerConfig::default()
            },
            monitor: MonitorConfig {
                probe_interval: Duration::from_secs(self.probe_interval_secs.max(1)),
                reweight_interval: Duration::from_secs(self.reweight_interval_secs.max(1)),
                probe_timeout: Duration::from_millis(self.probe_timeout_ms),
                ..MonitorConfig::default()
            },
            service_name: self.service_name.clone(),
            ..OrchestratorConfig::default()
        }
    }

    /// One adapter per backend: a model when configured, fallback otherwise
    pub fn adapters(&self) -> Vec<Arc<dyn InferenceAdapter>> {
        BackendKind::ALL
            .iter()
            .map(|&kind| {
                let model = self.models.for_kind(kind);
                match &model.path {
                    Some(path) => {
                        let mut adapter =
                            OnnxAdapter::new(kind, ModelSource::File(path.clone()), model.input_side);
                        if let Some(checksum) = &model.checksum {
                            adapter = adapter.with_checksum(checksum.clone());
                        }
                        Arc::new(adapter) as Arc<dyn InferenceAdapter>
                    }
                    None => Arc::new(FallbackAdapter::new(kind, model.input_side)) as Arc<dyn InferenceAdapter>,
                }
            })
            .collect()
    }

    pub fn weight_store(&self) -> WeightStore {
        let preferences: Arc<dyn PreferenceStore> = match &self.preferences_path {
            Some(path) => Arc::new(FilePreferences::new(path)),
            None => Arc::new(MemoryPreferences::new()),
        };
        let policy = ReweightPolicy {
            min_predictions: self.min_predictions,
            ..ReweightPolicy::default()
        };
        WeightStore::load(
            EnsembleWeights::from_map(self.default_weights.clone()),
            preferences,
            policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EstimatorConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.models.detector.input_side, 320);
        assert_eq!(config.models.depth.input_side, 256);
        assert_eq!(config.min_predictions, 10);
        assert!((config.default_weights["detector"] - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("estimator.json");
        std::fs::write(
            &path,
            r#"{
                "api_port": 9099,
                "per_backend_timeout_ms": 750,
                "models": { "depth": { "path": "/models/depth.onnx", "input_side": 192 } },
                "default_weights": { "detector": 1.0, "depth": 1.0 }
            }"#,
        )
        .unwrap();

        let config = EstimatorConfig::from_sources(Some(&path)).unwrap();
        assert_eq!(config.api_port, 9099);
        assert_eq!(config.per_backend_timeout_ms, 750);
        assert_eq!(config.models.depth.input_side, 192);
        assert_eq!(config.models.depth.path, Some(PathBuf::from("/models/depth.onnx")));
        assert_eq!(config.models.detector.input_side, 320);
        assert_eq!(config.sink_capacity, 256);

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.per_backend_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(EstimatorConfig::from_sources(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_adapters_fall_back_without_models() {
        let adapters = EstimatorConfig::default().adapters();
        assert_eq!(adapters.len(), 4);
        for adapter in &adapters {
            let metadata = adapter.metadata();
            assert!(!metadata.available);
            assert_eq!(metadata.version, "fallback");
        }
        assert_eq!(adapters[0].metadata().input_side(), Some(320));
    }

    #[tokio::test]
    async fn test_weight_store_uses_configured_defaults() {
        let config = EstimatorConfig {
            default_weights: BTreeMap::from([("detector".to_string(), 3.0), ("depth".to_string(), 1.0)]),
            ..EstimatorConfig::default()
        };
        let weights = config.weight_store().snapshot().await;
        assert!((weights.get("detector") - 0.75).abs() < 1e-9);
    }
}
