//! Conversion of keyed adapter output into a weight estimate
//!
//! Density and reference-weight coefficients are configuration data; the
//! defaults below are only a starting point and can be replaced wholesale.

use super::{AdapterError, KeyedResult};
use crate::models::{clamp_weight, BackendKind, MaterialType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Shape classes known to the shape classifier and their weight multipliers
pub const SHAPE_CLASSES: [(&str, f64); 6] = [
    ("pipe", 0.8),
    ("sheet", 1.0),
    ("bar", 1.2),
    ("wire", 0.3),
    ("can", 0.9),
    ("other", 1.0),
];

/// Physical coefficients for one material
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaterialProfile {
    /// Density in pounds per cubic inch
    pub density_lb_per_in3: f64,
    /// Weight of a typical single item, scaled by the shape factor
    pub reference_weight_lbs: f64,
}

/// Per-material coefficient table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialTable {
    profiles: BTreeMap<MaterialType, MaterialProfile>,
}

impl Default for MaterialTable {
    fn default() -> Self {
        let profiles = [
            (MaterialType::Steel, 0.284, 15.0),
            (MaterialType::Aluminum, 0.098, 5.25),
            (MaterialType::Copper, 0.323, 14.25),
            (MaterialType::Brass, 0.307, 13.5),
            (MaterialType::MixedScrap, 0.2, 10.0),
        ]
        .into_iter()
        .map(|(m, density, reference)| {
            (
                m,
                MaterialProfile {
                    density_lb_per_in3: density,
                    reference_weight_lbs: reference,
                },
            )
        })
        .collect();
        Self { profiles }
    }
}

impl MaterialTable {
    pub fn with_profile(mut self, material: MaterialType, profile: MaterialProfile) -> Self {
        self.profiles.insert(material, profile);
        self
    }

    /// Profile for `material`, falling back to mixed scrap
    pub fn profile(&self, material: MaterialType) -> MaterialProfile {
        self.profiles
            .get(&material)
            .or_else(|| self.profiles.get(&MaterialType::MixedScrap))
            .copied()
            .unwrap_or(MaterialProfile {
                density_lb_per_in3: 0.2,
                reference_weight_lbs: 10.0,
            })
    }
}

/// Interpret a validated result as `(weight_lbs, confidence)`
pub fn interpret(
    kind: BackendKind,
    result: &KeyedResult,
    material: MaterialType,
    table: &MaterialTable,
) -> Result<(f64, f64), AdapterError> {
    result.validate(kind)?;
    let category = kind.category();
    let missing = |key: &str| AdapterError::SchemaViolation {
        category: category.to_string(),
        key: key.to_string(),
    };
    let number = |key: &str| result.number(category, key).ok_or_else(|| missing(key));

    let profile = table.profile(material);
    let raw = match kind {
        BackendKind::Detector | BackendKind::Synthesis => number("weight_estimate")?,
        BackendKind::Depth => number("estimated_volume")?.max(0.0) * profile.density_lb_per_in3,
        BackendKind::Shape => number("shape_factor")?.max(0.0) * profile.reference_weight_lbs,
    };
    let confidence = number("confidence")?.clamp(0.0, 1.0);

    Ok((clamp_weight(raw), confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_reads_weight_directly() {
        let result = KeyedResult::new()
            .with("detection", "weight_estimate", 14.5)
            .with("detection", "confidence", 0.9)
            .with("detection", "object_count", 1.0);
        let (weight, conf) = interpret(
            BackendKind::Detector,
            &result,
            MaterialType::Steel,
            &MaterialTable::default(),
        )
        .unwrap();
        assert_eq!(weight, 14.5);
        assert_eq!(conf, 0.9);
    }

    #[test]
    fn test_depth_uses_material_density() {
        let result = KeyedResult::new()
            .with("depth", "estimated_volume", 100.0)
            .with("depth", "mean_depth", 0.4)
            .with("depth", "confidence", 0.7);
        let table = MaterialTable::default();

        let (steel, _) = interpret(BackendKind::Depth, &result, MaterialType::Steel, &table).unwrap();
        let (alu, _) = interpret(BackendKind::Depth, &result, MaterialType::Aluminum, &table).unwrap();

        assert!((steel - 28.4).abs() < 1e-9);
        assert!(alu < steel);
    }

    #[test]
    fn test_shape_scales_reference_weight() {
        let result = KeyedResult::new()
            .with("shape", "shape_class", "wire")
            .with("shape", "shape_factor", 0.3)
            .with("shape", "confidence", 1.7);
        let table = MaterialTable::default().with_profile(
            MaterialType::Copper,
            MaterialProfile {
                density_lb_per_in3: 0.3,
                reference_weight_lbs: 20.0,
            },
        );
        let (weight, conf) = interpret(BackendKind::Shape, &result, MaterialType::Copper, &table).unwrap();
        assert!((weight - 6.0).abs() < 1e-9);
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn test_invalid_result_rejected() {
        let result = KeyedResult::new().with("ensemble", "confidence", 0.5);
        assert!(interpret(
            BackendKind::Synthesis,
            &result,
            MaterialType::Brass,
            &MaterialTable::default()
        )
        .is_err());
    }

    #[test]
    fn test_negative_weight_clamped() {
        let result = KeyedResult::new()
            .with("ensemble", "weight_estimate", -3.0)
            .with("ensemble", "confidence", 0.5);
        let (weight, _) = interpret(
            BackendKind::Synthesis,
            &result,
            MaterialType::Brass,
            &MaterialTable::default(),
        )
        .unwrap();
        assert!(weight > 0.0);
    }
}
