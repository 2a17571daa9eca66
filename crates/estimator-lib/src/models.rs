//! Core data models for weight estimation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest weight (lbs) ever surfaced to a caller
pub const MIN_WEIGHT_LBS: f64 = 0.1;

/// Largest weight (lbs) ever surfaced to a caller
pub const MAX_WEIGHT_LBS: f64 = 5000.0;

/// Clamp a raw estimate into the domain-reasonable positive range.
///
/// Non-finite values collapse to the lower bound.
pub fn clamp_weight(value: f64) -> f64 {
    if !value.is_finite() {
        return MIN_WEIGHT_LBS;
    }
    value.clamp(MIN_WEIGHT_LBS, MAX_WEIGHT_LBS)
}

/// Scrap material categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialType {
    Steel,
    Aluminum,
    Copper,
    Brass,
    MixedScrap,
}

impl MaterialType {
    pub const ALL: [MaterialType; 5] = [
        MaterialType::Steel,
        MaterialType::Aluminum,
        MaterialType::Copper,
        MaterialType::Brass,
        MaterialType::MixedScrap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialType::Steel => "steel",
            MaterialType::Aluminum => "aluminum",
            MaterialType::Copper => "copper",
            MaterialType::Brass => "brass",
            MaterialType::MixedScrap => "mixed_scrap",
        }
    }

    /// Parse an optional, user-supplied material string.
    ///
    /// Blank or unknown values yield `None`, which puts the pipeline into
    /// manual-estimate mode.
    pub fn parse_optional(value: Option<&str>) -> Option<Self> {
        value.and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for MaterialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaterialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "steel" => Ok(MaterialType::Steel),
            "aluminum" | "aluminium" => Ok(MaterialType::Aluminum),
            "copper" => Ok(MaterialType::Copper),
            "brass" => Ok(MaterialType::Brass),
            "mixed_scrap" | "mixed" => Ok(MaterialType::MixedScrap),
            other => Err(format!("unknown material type: {:?}", other)),
        }
    }
}

/// Closed set of inference backends taking part in the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Object detector estimating weight from detected scrap items
    Detector,
    /// Monocular depth estimator producing a volume estimate
    Depth,
    /// Shape classifier producing a shape factor
    Shape,
    /// Synthesis model producing a direct weight estimate
    Synthesis,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Detector,
        BackendKind::Depth,
        BackendKind::Shape,
        BackendKind::Synthesis,
    ];

    /// Backend name used as key in metrics and weight maps
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Detector => "detector",
            BackendKind::Depth => "depth",
            BackendKind::Shape => "shape",
            BackendKind::Synthesis => "synthesis",
        }
    }

    /// Result category the backend's output is filed under
    pub fn category(&self) -> &'static str {
        match self {
            BackendKind::Detector => "detection",
            BackendKind::Depth => "depth",
            BackendKind::Shape => "shape",
            BackendKind::Synthesis => "ensemble",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Single backend's contribution to one prediction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub backend_name: String,
    pub weight_estimate: f64,
    pub confidence: f64,
    pub processing_time_ms: f64,
    /// True when the value came from the fallback generator
    #[serde(default)]
    pub is_fallback: bool,
}

impl ModelPrediction {
    pub fn new(backend_name: impl Into<String>, weight_estimate: f64, confidence: f64) -> Self {
        Self {
            backend_name: backend_name.into(),
            weight_estimate,
            confidence: confidence.clamp(0.0, 1.0),
            processing_time_ms: 0.0,
            is_fallback: false,
        }
    }

    pub fn with_processing_time(mut self, ms: f64) -> Self {
        self.processing_time_ms = ms;
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.is_fallback = true;
        self
    }
}

/// Fused output of the prediction combiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub final_weight: f64,
    pub confidence: f64,
    pub model_count: usize,
    pub factors: Vec<String>,
    pub weights: Vec<f64>,
    pub is_fallback: bool,
}

/// Per-image features used for contextual weight adjustment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageCharacteristics {
    pub mean_brightness: f64,
    pub contrast: f64,
    pub edge_density: f64,
    pub foreground_ratio: f64,
    pub has_clear_metal_objects: bool,
    pub has_depth_cues: bool,
    pub is_regular_shape: bool,
    pub is_low_light: bool,
}

/// Capabilities reported by the device-capability probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub supports_accelerated_compute: bool,
}

/// How the surfaced estimate was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Weighted fusion across backends
    Ensemble,
    /// Single best backend after fusion had no usable weights
    SingleModel,
    /// Fixed conservative estimate, no backend contributed
    EnsembleFallback,
    /// User-supplied or default manual estimate
    Manual,
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimationMethod::Ensemble => write!(f, "ensemble"),
            EstimationMethod::SingleModel => write!(f, "single_model"),
            EstimationMethod::EnsembleFallback => write!(f, "ensemble_fallback"),
            EstimationMethod::Manual => write!(f, "manual"),
        }
    }
}

/// Result of `predict_weight`, the single entry point for the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEstimate {
    pub estimated_weight: f64,
    pub confidence: f64,
    pub method: EstimationMethod,
    pub factors: Vec<String>,
    pub suggestions: Vec<String>,
    pub model_count: usize,
    pub is_fallback: bool,
}
