//! Image characteristics extraction
//!
//! Cheap global statistics over a prepared tensor: brightness, contrast,
//! edge density and foreground occupancy. They feed the contextual weight
//! boosts and the remediation suggestions.

use super::ImageTensor;
use crate::models::ImageCharacteristics;

/// Luminance step between horizontal neighbours counted as an edge
pub const EDGE_THRESHOLD: f64 = 0.1;

/// Luminance distance from the background counted as foreground
pub const FOREGROUND_THRESHOLD: f64 = 0.15;

const LOW_LIGHT_BRIGHTNESS: f64 = 0.25;
const MIN_CONTRAST: f64 = 0.12;
const MIN_EDGE_DENSITY: f64 = 0.02;
const MIN_FOREGROUND: f64 = 0.05;
const MIN_VERTICAL_GRADIENT: f64 = 0.08;
const MIN_BBOX_FILL: f64 = 0.6;

fn luminance(rgb: [f32; 3]) -> f64 {
    0.299 * rgb[0] as f64 + 0.587 * rgb[1] as f64 + 0.114 * rgb[2] as f64
}

/// Extract image characteristics from a prepared tensor
pub fn analyze(tensor: &ImageTensor) -> ImageCharacteristics {
    let side = tensor.side();
    let lum: Vec<f64> = (0..side * side)
        .map(|i| luminance(tensor.pixel(i % side, i / side)))
        .collect();
    let n = lum.len() as f64;

    let mean_brightness = lum.iter().sum::<f64>() / n;
    let contrast = (lum.iter().map(|l| (l - mean_brightness).powi(2)).sum::<f64>() / n).sqrt();

    let edge_density = if side > 1 {
        let mut edges = 0usize;
        for y in 0..side {
            for x in 1..side {
                if (lum[y * side + x] - lum[y * side + x - 1]).abs() > EDGE_THRESHOLD {
                    edges += 1;
                }
            }
        }
        edges as f64 / (side * (side - 1)) as f64
    } else {
        0.0
    };

    let background = border_mean(&lum, side);
    let mut fg_count = 0usize;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (side, side, 0usize, 0usize);
    for (i, l) in lum.iter().enumerate() {
        if (l - background).abs() > FOREGROUND_THRESHOLD {
            fg_count += 1;
            let (x, y) = (i % side, i / side);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    let foreground_ratio = fg_count as f64 / n;
    let bbox_fill = if fg_count > 0 {
        let area = (max_x - min_x + 1) * (max_y - min_y + 1);
        fg_count as f64 / area as f64
    } else {
        0.0
    };

    let half = side / 2;
    let vertical_gradient = if half > 0 {
        let top = lum[..half * side].iter().sum::<f64>() / (half * side) as f64;
        let bottom = lum[(side - half) * side..].iter().sum::<f64>() / (half * side) as f64;
        (top - bottom).abs()
    } else {
        0.0
    };

    ImageCharacteristics {
        mean_brightness,
        contrast,
        edge_density,
        foreground_ratio,
        has_clear_metal_objects: contrast >= MIN_CONTRAST
            && edge_density >= MIN_EDGE_DENSITY
            && foreground_ratio >= MIN_FOREGROUND,
        has_depth_cues: vertical_gradient >= MIN_VERTICAL_GRADIENT,
        is_regular_shape: foreground_ratio >= MIN_FOREGROUND && bbox_fill >= MIN_BBOX_FILL,
        is_low_light: mean_brightness < LOW_LIGHT_BRIGHTNESS,
    }
}

/// Mean luminance of the outermost ring of pixels
fn border_mean(lum: &[f64], side: usize) -> f64 {
    if side == 1 {
        return lum[0];
    }
    let mut sum = 0.0;
    let mut count = 0usize;
    for y in 0..side {
        for x in 0..side {
            if x == 0 || y == 0 || x == side - 1 || y == side - 1 {
                sum += lum[y * side + x];
                count += 1;
            }
        }
    }
    sum / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{DecodedImage, InputPreparer};

    fn square_on_background(side: u32, fg: u8, bg: u8) -> DecodedImage {
        let mut pixels = Vec::new();
        for y in 0..side {
            for x in 0..side {
                let inside = x >= side / 4 && x < 3 * side / 4 && y >= side / 4 && y < 3 * side / 4;
                let v = if inside { fg } else { bg };
                pixels.extend_from_slice(&[v, v, v]);
            }
        }
        DecodedImage::new(side, side, 3, pixels)
    }

    #[test]
    fn test_uniform_image_has_no_objects() {
        let tensor = InputPreparer::new()
            .prepare(&DecodedImage::solid(32, 32, [128, 128, 128]), 32)
            .unwrap();
        let c = analyze(&tensor);

        assert!(c.contrast < 1e-9);
        assert_eq!(c.edge_density, 0.0);
        assert_eq!(c.foreground_ratio, 0.0);
        assert!(!c.has_clear_metal_objects);
        assert!(!c.is_regular_shape);
        assert!(!c.has_depth_cues);
        assert!(!c.is_low_light);
    }

    #[test]
    fn test_dark_image_is_low_light() {
        let tensor = InputPreparer::new()
            .prepare(&DecodedImage::solid(16, 16, [10, 10, 10]), 16)
            .unwrap();
        assert!(analyze(&tensor).is_low_light);
    }

    #[test]
    fn test_bright_square_detected_as_regular_object() {
        let tensor = InputPreparer::new()
            .prepare(&square_on_background(32, 230, 20), 32)
            .unwrap();
        let c = analyze(&tensor);

        assert!((c.foreground_ratio - 0.25).abs() < 1e-9);
        assert!(c.has_clear_metal_objects);
        assert!(c.is_regular_shape);
    }

    #[test]
    fn test_vertical_gradient_gives_depth_cues() {
        let side = 16u32;
        let mut pixels = Vec::new();
        for y in 0..side {
            let v = (y * 255 / (side - 1)) as u8;
            for _ in 0..side {
                pixels.extend_from_slice(&[v, v, v]);
            }
        }
        let image = DecodedImage::new(side, side, 3, pixels);
        let tensor = InputPreparer::new().prepare(&image, 16).unwrap();
        assert!(analyze(&tensor).has_depth_cues);
    }
}
