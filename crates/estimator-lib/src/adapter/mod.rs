//! Inference adapters
//!
//! Every backend taking part in the ensemble is wrapped in an
//! [`InferenceAdapter`]: a uniform initialize/run/release capability that
//! normalizes the backend's raw output into a [`KeyedResult`]. The set of
//! variants is closed: [`OnnxAdapter`] runs a real model through tract and
//! [`FallbackAdapter`] answers with the deterministic fallback generator.

mod fallback;
mod interpret;
mod onnx;

pub use fallback::{FallbackAdapter, FallbackGenerator};
pub use interpret::{interpret, MaterialProfile, MaterialTable, SHAPE_CLASSES};
pub use onnx::{ModelSource, OnnxAdapter};

use crate::models::BackendKind;
use crate::preprocess::ImageTensor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Field tagging a synthetic (fallback) output
pub const FALLBACK_FIELD: &str = "fallback";

/// Error type for adapter operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Adapter not initialized")]
    NotInitialized,

    #[error("Adapter already released")]
    Released,

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Model checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Result missing required key {category}.{key}")]
    SchemaViolation { category: String, key: String },
}

impl AdapterError {
    /// Short label used for metrics and structured logs
    pub fn reason(&self) -> &'static str {
        match self {
            AdapterError::NotInitialized => "not_initialized",
            AdapterError::Released => "released",
            AdapterError::LoadFailed(_) => "load_failed",
            AdapterError::ChecksumMismatch { .. } => "checksum_mismatch",
            AdapterError::InferenceFailed(_) => "inference_failed",
            AdapterError::InvalidInput(_) => "invalid_input",
            AdapterError::Timeout(_) => "timeout",
            AdapterError::SchemaViolation { .. } => "schema_violation",
        }
    }
}

/// Descriptive metadata about an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub name: String,
    pub version: String,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// True when a real model is loaded and runnable
    pub available: bool,
}

impl AdapterMetadata {
    /// Square side of the NHWC input tensor
    pub fn input_side(&self) -> Option<usize> {
        self.input_shape.get(1).copied().filter(|s| *s > 0)
    }
}

/// Uniform capability wrapper around one inference backend
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    /// Which ensemble slot this adapter fills
    fn kind(&self) -> BackendKind;

    /// Backend name used in metrics and weight maps
    fn name(&self) -> &str {
        self.kind().name()
    }

    /// Current metadata snapshot
    fn metadata(&self) -> AdapterMetadata;

    /// Prepare the backend for inference
    async fn initialize(&self) -> Result<(), AdapterError>;

    /// Run inference on a prepared tensor
    async fn run_inference(&self, input: &ImageTensor) -> Result<KeyedResult, AdapterError>;

    /// Release backend resources. Must be idempotent.
    async fn release(&self);
}

/// A single named value inside a [`KeyedResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Expected type of a required field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    Text,
}

/// Required fields per backend, checked before a result is trusted
pub fn required_keys(kind: BackendKind) -> &'static [(&'static str, FieldKind)] {
    match kind {
        BackendKind::Detector => &[
            ("weight_estimate", FieldKind::Number),
            ("confidence", FieldKind::Number),
            ("object_count", FieldKind::Number),
        ],
        BackendKind::Depth => &[
            ("estimated_volume", FieldKind::Number),
            ("mean_depth", FieldKind::Number),
            ("confidence", FieldKind::Number),
        ],
        BackendKind::Shape => &[
            ("shape_class", FieldKind::Text),
            ("shape_factor", FieldKind::Number),
            ("confidence", FieldKind::Number),
        ],
        BackendKind::Synthesis => &[
            ("weight_estimate", FieldKind::Number),
            ("confidence", FieldKind::Number),
        ],
    }
}

/// Category → field → value mapping produced by every adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyedResult {
    categories: BTreeMap<String, BTreeMap<String, FieldValue>>,
}

impl KeyedResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, category: &str, key: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(category, key, value);
        self
    }

    pub fn insert(&mut self, category: &str, key: &str, value: impl Into<FieldValue>) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn category(&self, category: &str) -> Option<&BTreeMap<String, FieldValue>> {
        self.categories.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn get(&self, category: &str, key: &str) -> Option<&FieldValue> {
        self.categories.get(category).and_then(|c| c.get(key))
    }

    pub fn number(&self, category: &str, key: &str) -> Option<f64> {
        match self.get(category, key) {
            Some(FieldValue::Number(v)) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, category: &str, key: &str) -> Option<&str> {
        match self.get(category, key) {
            Some(FieldValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    pub fn flag(&self, category: &str, key: &str) -> Option<bool> {
        match self.get(category, key) {
            Some(FieldValue::Flag(v)) => Some(*v),
            _ => None,
        }
    }

    /// True when any category carries `fallback: true`
    pub fn is_fallback(&self) -> bool {
        self.categories
            .values()
            .any(|c| matches!(c.get(FALLBACK_FIELD), Some(FieldValue::Flag(true))))
    }

    /// Check the backend's required-keys contract
    pub fn validate(&self, kind: BackendKind) -> Result<(), AdapterError> {
        let category = kind.category();
        for (key, field_kind) in required_keys(kind) {
            let present = match field_kind {
                FieldKind::Number => self.number(category, key).is_some(),
                FieldKind::Text => self.text(category, key).is_some(),
            };
            if !present {
                return Err(AdapterError::SchemaViolation {
                    category: category.to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}
