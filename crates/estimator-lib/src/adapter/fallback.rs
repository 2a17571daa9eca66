//! Deterministic fallback outputs
//!
//! When a backend is absent or fails, the orchestrator substitutes a
//! synthetic result derived purely from a hash of the input tensor, so the
//! combiner always receives one well-formed result per backend. Outputs are
//! tagged `fallback: true`.

use super::{AdapterError, AdapterMetadata, InferenceAdapter, KeyedResult, FALLBACK_FIELD, SHAPE_CLASSES};
use crate::models::BackendKind;
use crate::preprocess::{ImageTensor, TENSOR_CHANNELS};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Maximum number of tensor elements folded into the hash
const MAX_SAMPLES: usize = 256;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Plausible ranges for synthetic values
const WEIGHT_RANGE_LBS: (f64, f64) = (2.0, 60.0);
const VOLUME_RANGE_IN3: (f64, f64) = (10.0, 200.0);
const DEPTH_RANGE: (f64, f64) = (0.2, 0.8);
const SHAPE_FACTOR_RANGE: (f64, f64) = (0.3, 1.5);
const CONFIDENCE_RANGE: (f64, f64) = (0.2, 0.4);
const OBJECT_COUNT_RANGE: (f64, f64) = (1.0, 4.0);

/// Pure generator of synthetic backend outputs
pub struct FallbackGenerator;

impl FallbackGenerator {
    /// Hash of the backend name and sampled tensor elements
    pub fn seed(kind: BackendKind, input: &ImageTensor) -> u64 {
        let mut hash = FNV_OFFSET;
        for byte in kind.name().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }

        let data = input.data();
        for value in data.iter().step_by(sample_stride(data.len())) {
            let quantized = (value.clamp(0.0, 1.0) * 1000.0).round() as u64;
            hash ^= quantized;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Synthetic result for `kind`, tagged as fallback
    pub fn generate(kind: BackendKind, input: &ImageTensor) -> KeyedResult {
        let seed = Self::seed(kind, input);
        let category = kind.category();
        let confidence = scale(unit(seed, 1), CONFIDENCE_RANGE);

        let result = match kind {
            BackendKind::Detector => KeyedResult::new()
                .with(category, "weight_estimate", scale(unit(seed, 2), WEIGHT_RANGE_LBS))
                .with(
                    category,
                    "object_count",
                    scale(unit(seed, 3), OBJECT_COUNT_RANGE).round(),
                ),
            BackendKind::Depth => KeyedResult::new()
                .with(category, "estimated_volume", scale(unit(seed, 2), VOLUME_RANGE_IN3))
                .with(category, "mean_depth", scale(unit(seed, 3), DEPTH_RANGE)),
            BackendKind::Shape => {
                let idx = (seed % SHAPE_CLASSES.len() as u64) as usize;
                KeyedResult::new()
                    .with(category, "shape_class", SHAPE_CLASSES[idx].0)
                    .with(category, "shape_factor", scale(unit(seed, 2), SHAPE_FACTOR_RANGE))
            }
            BackendKind::Synthesis => KeyedResult::new()
                .with(category, "weight_estimate", scale(unit(seed, 2), WEIGHT_RANGE_LBS)),
        };

        result
            .with(category, "confidence", confidence)
            .with(category, FALLBACK_FIELD, true)
    }
}

/// Step that visits at most `MAX_SAMPLES` of `len` elements
fn sample_stride(len: usize) -> usize {
    len.div_ceil(MAX_SAMPLES).max(1)
}

/// Map `(seed, salt)` to a uniform value in [0, 1]
fn unit(seed: u64, salt: u64) -> f64 {
    // splitmix64 finalizer
    let mut z = seed ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

fn scale(unit: f64, (lo, hi): (f64, f64)) -> f64 {
    lo + unit * (hi - lo)
}

/// Adapter variant that always answers with fallback output
///
/// Used for backends that have no model configured on this device.
pub struct FallbackAdapter {
    kind: BackendKind,
    input_side: usize,
    released: AtomicBool,
}

impl FallbackAdapter {
    pub fn new(kind: BackendKind, input_side: usize) -> Self {
        Self {
            kind,
            input_side,
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl InferenceAdapter for FallbackAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata {
            name: self.kind.name().to_string(),
            version: "fallback".to_string(),
            input_shape: vec![1, self.input_side, self.input_side, TENSOR_CHANNELS],
            output_shape: vec![],
            available: false,
        }
    }

    async fn initialize(&self) -> Result<(), AdapterError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AdapterError::Released);
        }
        debug!(backend = %self.kind, "No model configured, serving fallback output");
        Ok(())
    }

    async fn run_inference(&self, input: &ImageTensor) -> Result<KeyedResult, AdapterError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AdapterError::Released);
        }
        Ok(FallbackGenerator::generate(self.kind, input))
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
