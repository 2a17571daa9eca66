//! ONNX inference using tract
//!
//! Loads an ONNX model (from bytes or a memory-mapped file), optionally
//! verifies its SHA-256 checksum, and decodes the raw output vector into
//! the backend's result category.

use super::{interpret::SHAPE_CLASSES, AdapterError, AdapterMetadata, InferenceAdapter, KeyedResult};
use crate::models::BackendKind;
use crate::preprocess::{ImageTensor, TENSOR_CHANNELS};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

/// Inference latency above which a warning is logged
const SLOW_INFERENCE_MS: u128 = 250;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Where the model bytes come from
#[derive(Debug, Clone)]
pub enum ModelSource {
    Bytes(Arc<[u8]>),
    File(PathBuf),
}

/// Number of raw output values each backend's model must produce
fn expected_outputs(kind: BackendKind) -> usize {
    match kind {
        // [weight_lbs, confidence, object_count, bbox_area]
        BackendKind::Detector => 4,
        // [volume_in3, mean_depth, confidence]
        BackendKind::Depth => 3,
        // one score per shape class
        BackendKind::Shape => SHAPE_CLASSES.len(),
        // [weight_lbs, confidence]
        BackendKind::Synthesis => 2,
    }
}

/// Adapter running an ONNX model through tract
pub struct OnnxAdapter {
    kind: BackendKind,
    source: ModelSource,
    expected_sha256: Option<String>,
    input_side: usize,
    plan: RwLock<Option<Arc<TractModel>>>,
    version: RwLock<String>,
    released: AtomicBool,
}

impl OnnxAdapter {
    pub fn new(kind: BackendKind, source: ModelSource, input_side: usize) -> Self {
        Self {
            kind,
            source,
            expected_sha256: None,
            input_side,
            plan: RwLock::new(None),
            version: RwLock::new("unloaded".to_string()),
            released: AtomicBool::new(false),
        }
    }

    /// Require the model bytes to hash to `sha256` (hex) before loading
    pub fn with_checksum(mut self, sha256: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256.into().to_ascii_lowercase());
        self
    }

    fn load_plan(
        source: &ModelSource,
        expected_sha256: Option<&str>,
        input_side: usize,
    ) -> Result<(TractModel, String), AdapterError> {
        match source {
            ModelSource::Bytes(bytes) => Self::build_plan(bytes, expected_sha256, input_side),
            ModelSource::File(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| AdapterError::LoadFailed(format!("{}: {}", path.display(), e)))?;
                Self::build_plan(&bytes, expected_sha256, input_side)
            }
        }
    }

    fn build_plan(
        bytes: &[u8],
        expected_sha256: Option<&str>,
        input_side: usize,
    ) -> Result<(TractModel, String), AdapterError> {
        let digest = hex::encode(Sha256::digest(bytes));
        if let Some(expected) = expected_sha256 {
            if expected != digest {
                return Err(AdapterError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        let plan = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .map_err(|e| AdapterError::LoadFailed(format!("Failed to parse ONNX model: {}", e)))?
            .with_input_fact(0, f32::fact([1, input_side, input_side, TENSOR_CHANNELS]).into())
            .map_err(|e| AdapterError::LoadFailed(format!("Failed to set input shape: {}", e)))?
            .into_optimized()
            .map_err(|e| AdapterError::LoadFailed(format!("Failed to optimize model: {}", e)))?
            .into_runnable()
            .map_err(|e| AdapterError::LoadFailed(format!("Failed to create runnable model: {}", e)))?;

        Ok((plan, format!("sha256:{}", &digest[..12])))
    }

    fn current_plan(&self) -> Result<Arc<TractModel>, AdapterError> {
        let guard = self
            .plan
            .read()
            .map_err(|e| AdapterError::InferenceFailed(format!("Lock poisoned: {}", e)))?;
        guard.clone().ok_or(AdapterError::NotInitialized)
    }
}

/// Decode a raw model output vector into the backend's category
pub(crate) fn decode_outputs(kind: BackendKind, values: &[f32]) -> Result<KeyedResult, AdapterError> {
    let expected = expected_outputs(kind);
    if values.len() < expected {
        return Err(AdapterError::InferenceFailed(format!(
            "Model output has {} values, expected {}",
            values.len(),
            expected
        )));
    }
    let v = |i: usize| values[i] as f64;
    let category = kind.category();

    let result = match kind {
        BackendKind::Detector => KeyedResult::new()
            .with(category, "weight_estimate", v(0))
            .with(category, "confidence", v(1).clamp(0.0, 1.0))
            .with(category, "object_count", v(2).max(0.0).round())
            .with(category, "bbox_area", v(3).clamp(0.0, 1.0)),
        BackendKind::Depth => KeyedResult::new()
            .with(category, "estimated_volume", v(0).max(0.0))
            .with(category, "mean_depth", v(1))
            .with(category, "confidence", v(2).clamp(0.0, 1.0)),
        BackendKind::Shape => {
            let scores = &values[..expected];
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f64> = scores.iter().map(|s| ((s - max) as f64).exp()).collect();
            let total: f64 = exp.iter().sum();
            let (best, best_exp) = exp
                .iter()
                .enumerate()
                .fold((0usize, f64::MIN), |acc, (i, e)| if *e > acc.1 { (i, *e) } else { acc });
            let (class, factor) = SHAPE_CLASSES[best];
            KeyedResult::new()
                .with(category, "shape_class", class)
                .with(category, "shape_factor", factor)
                .with(category, "confidence", best_exp / total)
        }
        BackendKind::Synthesis => KeyedResult::new()
            .with(category, "weight_estimate", v(0))
            .with(category, "confidence", v(1).clamp(0.0, 1.0)),
    };
    Ok(result)
}

#[async_trait]
impl InferenceAdapter for OnnxAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn metadata(&self) -> AdapterMetadata {
        let available = self.plan.read().map(|p| p.is_some()).unwrap_or(false);
        let version = self
            .version
            .read()
            .map(|v| v.clone())
            .unwrap_or_else(|_| "unknown".to_string());
        AdapterMetadata {
            name: self.kind.name().to_string(),
            version,
            input_shape: vec![1, self.input_side, self.input_side, TENSOR_CHANNELS],
            output_shape: vec![1, expected_outputs(self.kind)],
            available,
        }
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AdapterError::Released);
        }

        let source = self.source.clone();
        let expected = self.expected_sha256.clone();
        let side = self.input_side;
        let (plan, version) = tokio::task::spawn_blocking(move || {
            Self::load_plan(&source, expected.as_deref(), side)
        })
        .await
        .map_err(|e| AdapterError::LoadFailed(format!("Loader task failed: {}", e)))??;

        {
            let mut guard = self
                .plan
                .write()
                .map_err(|e| AdapterError::LoadFailed(format!("Lock poisoned: {}", e)))?;
            *guard = Some(Arc::new(plan));
        }
        if let Ok(mut v) = self.version.write() {
            *v = version.clone();
        }

        info!(backend = %self.kind, version = %version, "Model loaded");
        Ok(())
    }

    async fn run_inference(&self, input: &ImageTensor) -> Result<KeyedResult, AdapterError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AdapterError::Released);
        }
        if input.side() != self.input_side {
            return Err(AdapterError::InvalidInput(format!(
                "Tensor side {} does not match model input {}",
                input.side(),
                self.input_side
            )));
        }

        let plan = self.current_plan()?;
        let side = self.input_side;
        let data = input.data().to_vec();
        let start = Instant::now();

        let values = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, AdapterError> {
            let tensor: Tensor =
                tract_ndarray::Array4::from_shape_vec((1, side, side, TENSOR_CHANNELS), data)
                    .map_err(|e| AdapterError::InvalidInput(e.to_string()))?
                    .into();
            let outputs = plan
                .run(tvec!(tensor.into()))
                .map_err(|e| AdapterError::InferenceFailed(e.to_string()))?;
            let output = outputs
                .first()
                .ok_or_else(|| AdapterError::InferenceFailed("No output from model".to_string()))?;
            let view = output
                .to_array_view::<f32>()
                .map_err(|e| AdapterError::InferenceFailed(e.to_string()))?;
            Ok(view.iter().copied().collect())
        })
        .await
        .map_err(|e| AdapterError::InferenceFailed(format!("Inference task failed: {}", e)))??;

        let elapsed = start.elapsed();
        if elapsed.as_millis() > SLOW_INFERENCE_MS {
            warn!(backend = %self.kind, elapsed_ms = elapsed.as_millis(), "Slow inference");
        } else {
            debug!(backend = %self.kind, elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        decode_outputs(self.kind, &values)
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.plan.write() {
            *guard = None;
        }
        debug!(backend = %self.kind, "Model released");
    }
}
