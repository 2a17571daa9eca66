//! Weighted fusion of per-backend predictions

use crate::models::{clamp_weight, EnsembleResult, ModelPrediction};
use crate::weights::EnsembleWeights;
use serde::{Deserialize, Serialize};

/// Factor reported with the designated fallback result
pub const FALLBACK_FACTOR: &str = "Fallback estimation - no models available";

/// Combiner configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CombinerConfig {
    /// Conservative weight returned when nothing usable was fused
    pub fallback_weight: f64,
    pub fallback_confidence: f64,
    /// Multiplier on the weight of fallback-generated predictions
    pub fallback_weight_factor: f64,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            fallback_weight: 10.0,
            fallback_confidence: 0.1,
            fallback_weight_factor: 0.5,
        }
    }
}

/// Stateless prediction combiner
#[derive(Debug, Clone, Default)]
pub struct PredictionCombiner {
    config: CombinerConfig,
}

impl PredictionCombiner {
    pub fn new(config: CombinerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Fuse predictions using the given weights
    ///
    /// Backends with zero weight are skipped. An empty prediction set, or
    /// one whose usable weight sums to zero, yields the fallback result.
    pub fn combine(&self, predictions: &[ModelPrediction], weights: &EnsembleWeights) -> EnsembleResult {
        let mut weighted_sum = 0.0;
        let mut weighted_confidence = 0.0;
        let mut total_weight = 0.0;
        let mut factors = Vec::new();
        let mut used_weights = Vec::new();

        for prediction in predictions {
            let mut weight = weights.get(&prediction.backend_name);
            if prediction.is_fallback {
                weight *= self.config.fallback_weight_factor;
            }
            if !(weight > 0.0) || !prediction.weight_estimate.is_finite() {
                continue;
            }

            weighted_sum += weight * prediction.weight_estimate;
            weighted_confidence += weight * prediction.confidence;
            total_weight += weight;
            factors.push(format!(
                "{}: {:.1}lbs (weight: {:.0}%)",
                prediction.backend_name,
                prediction.weight_estimate,
                weight * 100.0
            ));
            used_weights.push(weight);
        }

        if total_weight <= 0.0 {
            return self.fallback_result();
        }

        EnsembleResult {
            final_weight: clamp_weight(weighted_sum / total_weight),
            confidence: (weighted_confidence / total_weight).clamp(0.0, 1.0),
            model_count: predictions.len(),
            factors,
            weights: used_weights,
            is_fallback: false,
        }
    }

    /// The designated fallback result
    pub fn fallback_result(&self) -> EnsembleResult {
        EnsembleResult {
            final_weight: self.config.fallback_weight,
            confidence: self.config.fallback_confidence,
            model_count: 0,
            factors: vec![FALLBACK_FACTOR.to_string()],
            weights: Vec::new(),
            is_fallback: true,
        }
    }
}

/// `max(0, 1 - variance / mean²)` over raw estimates; zero mean gives 0
pub fn agreement_factor(estimates: &[f64]) -> f64 {
    if estimates.is_empty() {
        return 0.0;
    }
    let n = estimates.len() as f64;
    let mean = estimates.iter().sum::<f64>() / n;
    if mean == 0.0 || !mean.is_finite() {
        return 0.0;
    }
    let variance = estimates.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance / (mean * mean)).max(0.0)
}

/// Average confidence blended with the agreement factor, in [0, 1]
pub fn blended_confidence(estimates: &[f64], confidences: &[f64]) -> f64 {
    if confidences.is_empty() {
        return 0.0;
    }
    let average = confidences.iter().sum::<f64>() / confidences.len() as f64;
    ((average + agreement_factor(estimates)) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn weights(pairs: &[(&str, f64)]) -> EnsembleWeights {
        EnsembleWeights::from_map(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>())
    }

    #[test]
    fn test_three_backend_fusion() {
        // Synthesis present in the weight vector but did not produce a result
        let w = weights(&[("detector", 0.4), ("shape", 0.25), ("depth", 0.15), ("synthesis", 0.2)]);
        let predictions = vec![
            ModelPrediction::new("detector", 12.0, 0.8),
            ModelPrediction::new("shape", 13.0, 0.6),
            ModelPrediction::new("depth", 11.5, 0.7),
        ];

        let result = PredictionCombiner::default().combine(&predictions, &w);
        assert!((result.final_weight - 12.21875).abs() < 1e-9);
        assert!((result.confidence - 0.71875).abs() < 1e-9);
        assert_eq!(result.model_count, 3);
        assert!(!result.is_fallback);
        assert_eq!(result.factors[0], "detector: 12.0lbs (weight: 40%)");
        assert_eq!(result.factors[1], "shape: 13.0lbs (weight: 25%)");
        assert_eq!(result.weights.len(), 3);
    }

    #[test]
    fn test_empty_set_yields_fallback() {
        let result = PredictionCombiner::default().combine(&[], &EnsembleWeights::defaults());
        assert!(result.is_fallback);
        assert_eq!(result.final_weight, 10.0);
        assert_eq!(result.confidence, 0.1);
        assert_eq!(result.model_count, 0);
        assert_eq!(result.factors, vec![FALLBACK_FACTOR.to_string()]);
    }

    #[test]
    fn test_zero_total_weight_yields_fallback() {
        let w = weights(&[("detector", 1.0)]);
        let predictions = vec![ModelPrediction::new("depth", 20.0, 0.9)];
        let result = PredictionCombiner::default().combine(&predictions, &w);
        assert!(result.is_fallback);
        assert_eq!(result.model_count, 0);
    }

    #[test]
    fn test_single_backend_degeneracy() {
        for w in [0.1, 0.5, 1.0] {
            let ws = weights(&[("detector", w), ("depth", 1.0 - w + 0.1)]);
            let result = PredictionCombiner::default()
                .combine(&[ModelPrediction::new("depth", 33.0, 0.42)], &ws);
            assert!((result.final_weight - 33.0).abs() < 1e-9);
            assert!((result.confidence - 0.42).abs() < 1e-9);
        }
    }

    #[test]
    fn test_factor_order_follows_input() {
        let w = EnsembleWeights::defaults();
        let a = ModelPrediction::new("shape", 5.0, 0.5);
        let b = ModelPrediction::new("detector", 6.0, 0.5);

        let forward = PredictionCombiner::default().combine(&[a.clone(), b.clone()], &w);
        let reverse = PredictionCombiner::default().combine(&[b, a], &w);
        assert!(forward.factors[0].starts_with("shape"));
        assert!(reverse.factors[0].starts_with("detector"));
        assert!((forward.final_weight - reverse.final_weight).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_predictions_are_down_weighted() {
        let w = weights(&[("detector", 0.5), ("depth", 0.5)]);
        let real = ModelPrediction::new("detector", 10.0, 0.8);
        let synthetic = ModelPrediction::new("depth", 40.0, 0.3).as_fallback();

        let result = PredictionCombiner::default().combine(&[real, synthetic], &w);
        // weights 0.5 and 0.25
        assert!((result.final_weight - 20.0).abs() < 1e-9);
        assert_eq!(result.weights, vec![0.5, 0.25]);
    }

    #[test]
    fn test_agreement_factor() {
        assert_eq!(agreement_factor(&[12.0, 12.0, 12.0]), 1.0);
        assert_eq!(agreement_factor(&[0.0, 0.0]), 0.0);
        assert_eq!(agreement_factor(&[]), 0.0);
        assert_eq!(agreement_factor(&[1.0, 100.0, 1.0, 100.0, 1000.0]), 0.0);
        let f = agreement_factor(&[12.0, 13.0, 11.5]);
        assert!(f > 0.99 && f < 1.0);
    }

    #[test]
    fn test_agreement_monotonic_in_variance() {
        let confidences = [0.6, 0.7, 0.8];
        let mut previous = 0.0;
        // Same mean (20.0), shrinking spread
        for spread in [15.0, 10.0, 5.0, 1.0, 0.0] {
            let estimates = [20.0 - spread, 20.0, 20.0 + spread];
            let blended = blended_confidence(&estimates, &confidences);
            assert!(blended >= previous);
            assert!((0.0..=1.0).contains(&blended));
            previous = blended;
        }
    }
}
