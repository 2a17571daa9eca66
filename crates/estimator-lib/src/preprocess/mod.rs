//! Input preparation for inference adapters
//!
//! Converts a decoded image (supplied by the capture collaborator) into the
//! fixed-size NHWC tensor each adapter expects, and extracts the image
//! characteristics that drive contextual weighting.

mod features;

pub use features::{analyze, EDGE_THRESHOLD, FOREGROUND_THRESHOLD};

use std::sync::Arc;
use thiserror::Error;

/// Neutral letterbox fill (114/255 grey) so padding does not bias detection
pub const NEUTRAL_FILL: f32 = 114.0 / 255.0;

/// Number of channels in every prepared tensor (RGB)
pub const TENSOR_CHANNELS: usize = 3;

/// Errors raised while preparing an input tensor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreparerError {
    #[error("Image has zero dimensions ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u8),

    #[error("Pixel buffer has {actual} bytes, expected {expected}")]
    BufferMismatch { expected: usize, actual: usize },

    #[error("Image dimensions overflow ({width}x{height}x{channels})")]
    DimensionsOverflow { width: u32, height: u32, channels: u8 },

    #[error("Tensor side must be positive")]
    InvalidSide,
}

/// Decoded, row-major 8-bit image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// 1 (grey), 3 (RGB) or 4 (RGBA)
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, channels: u8, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Solid RGB image, mostly useful for tests and probes
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = std::iter::repeat(rgb)
            .take(width as usize * height as usize)
            .flatten()
            .collect();
        Self::new(width, height, 3, pixels)
    }

    fn validate(&self) -> Result<(), PreparerError> {
        if self.width == 0 || self.height == 0 {
            return Err(PreparerError::EmptyImage {
                width: self.width,
                height: self.height,
            });
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(PreparerError::UnsupportedChannels(self.channels));
        }
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|n| n.checked_mul(self.channels as usize))
            .ok_or(PreparerError::DimensionsOverflow {
                width: self.width,
                height: self.height,
                channels: self.channels,
            })?;
        if self.pixels.len() != expected {
            return Err(PreparerError::BufferMismatch {
                expected,
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }

    fn rgb_at(&self, x: usize, y: usize) -> [f32; 3] {
        let channels = self.channels as usize;
        let idx = (y * self.width as usize + x) * channels;
        let px = &self.pixels[idx..idx + channels];
        match channels {
            1 => {
                let v = px[0] as f32 / 255.0;
                [v, v, v]
            }
            _ => [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ],
        }
    }
}

/// Fixed-size `[1, side, side, 3]` tensor with values in [0, 1]
///
/// Cheap to clone: the data buffer is shared between adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    side: usize,
    data: Arc<[f32]>,
}

impl ImageTensor {
    pub fn from_vec(side: usize, data: Vec<f32>) -> Result<Self, PreparerError> {
        if side == 0 {
            return Err(PreparerError::InvalidSide);
        }
        let expected = side * side * TENSOR_CHANNELS;
        if data.len() != expected {
            return Err(PreparerError::BufferMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            side,
            data: data.into(),
        })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, self.side, self.side, TENSOR_CHANNELS]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// RGB triple at pixel (x, y)
    pub fn pixel(&self, x: usize, y: usize) -> [f32; 3] {
        let idx = (y * self.side + x) * TENSOR_CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Letterboxing tensor builder
#[derive(Debug, Clone, Copy, Default)]
pub struct InputPreparer;

impl InputPreparer {
    pub fn new() -> Self {
        Self
    }

    /// Resize `image` into a `side x side` tensor, preserving aspect ratio.
    ///
    /// Nearest-neighbour sampling keeps the output a pure function of the
    /// input; padding uses [`NEUTRAL_FILL`].
    pub fn prepare(&self, image: &DecodedImage, side: usize) -> Result<ImageTensor, PreparerError> {
        if side == 0 {
            return Err(PreparerError::InvalidSide);
        }
        image.validate()?;

        let (w, h) = (image.width as usize, image.height as usize);
        let scale = (side as f64 / w as f64).min(side as f64 / h as f64);
        let new_w = ((w as f64 * scale).round() as usize).clamp(1, side);
        let new_h = ((h as f64 * scale).round() as usize).clamp(1, side);
        let pad_x = (side - new_w) / 2;
        let pad_y = (side - new_h) / 2;

        let mut data = vec![NEUTRAL_FILL; side * side * TENSOR_CHANNELS];
        for y in 0..new_h {
            let src_y = ((y as f64 / scale) as usize).min(h - 1);
            for x in 0..new_w {
                let src_x = ((x as f64 / scale) as usize).min(w - 1);
                let rgb = image.rgb_at(src_x, src_y);
                let idx = ((y + pad_y) * side + (x + pad_x)) * TENSOR_CHANNELS;
                data[idx..idx + TENSOR_CHANNELS].copy_from_slice(&rgb);
            }
        }

        ImageTensor::from_vec(side, data)
    }

    /// Deterministic synthetic input used by health probes
    pub fn probe_tensor(&self, side: usize) -> Result<ImageTensor, PreparerError> {
        if side == 0 {
            return Err(PreparerError::InvalidSide);
        }
        let mut data = Vec::with_capacity(side * side * TENSOR_CHANNELS);
        for y in 0..side {
            for x in 0..side {
                for c in 0..TENSOR_CHANNELS {
                    let v = ((x * 7 + y * 13 + c * 29) % 64) as f32 / 63.0;
                    data.push(0.25 + 0.5 * v);
                }
            }
        }
        ImageTensor::from_vec(side, data)
    }
}
