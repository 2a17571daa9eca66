//! Ensemble weight store
//!
//! Holds the persistent backend-name → weight vector. Request-scoped
//! adjustments are applied to derived copies; only adaptive re-weighting
//! mutates (and persists) the stored vector.

mod preferences;

pub use preferences::{FilePreferences, MemoryPreferences, PreferenceStore};

use crate::metrics::MetricsSnapshot;
use crate::models::{BackendKind, DeviceCapabilities, ImageCharacteristics};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Preference key under which the weight vector is persisted
pub const ENSEMBLE_WEIGHTS_KEY: &str = "ensemble_weights";

/// Tolerance on the weight sum
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// Normalised mapping from backend name to weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnsembleWeights {
    weights: BTreeMap<String, f64>,
}

impl EnsembleWeights {
    /// Build from raw values; negative and non-finite entries count as zero
    pub fn from_map(raw: BTreeMap<String, f64>) -> Self {
        let mut weights = Self { weights: raw };
        weights.normalize();
        weights
    }

    /// Production defaults: detector 0.40, depth 0.20, shape 0.25, synthesis 0.15
    pub fn defaults() -> Self {
        let raw = [
            (BackendKind::Detector, 0.40),
            (BackendKind::Depth, 0.20),
            (BackendKind::Shape, 0.25),
            (BackendKind::Synthesis, 0.15),
        ]
        .into_iter()
        .map(|(kind, w)| (kind.name().to_string(), w))
        .collect();
        Self::from_map(raw)
    }

    /// Equal split across `names`
    pub fn uniform<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_map(names.into_iter().map(|n| (n.to_string(), 1.0)).collect())
    }

    /// Weight for a backend, zero when absent
    pub fn get(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Multiply one backend's weight and renormalise
    pub fn boosted(mut self, name: &str, factor: f64) -> Self {
        if let Some(w) = self.weights.get_mut(name) {
            *w *= factor;
        }
        self.normalize();
        self
    }

    fn normalize(&mut self) {
        for w in self.weights.values_mut() {
            if !w.is_finite() || *w < 0.0 {
                *w = 0.0;
            }
        }

        if self.weights.is_empty() {
            self.weights = BackendKind::ALL
                .iter()
                .map(|k| (k.name().to_string(), 0.0))
                .collect();
        }

        let total: f64 = self.weights.values().sum();
        if total <= 0.0 {
            let share = 1.0 / self.weights.len() as f64;
            for w in self.weights.values_mut() {
                *w = share;
            }
            return;
        }
        for w in self.weights.values_mut() {
            *w /= total;
        }
    }
}

/// Multipliers applied to per-request weight copies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextBoosts {
    pub clear_metal_objects: f64,
    pub depth_cues: f64,
    pub regular_shape: f64,
    pub accelerated_compute: f64,
}

impl Default for ContextBoosts {
    fn default() -> Self {
        Self {
            clear_metal_objects: 1.2,
            depth_cues: 1.3,
            regular_shape: 1.1,
            accelerated_compute: 1.2,
        }
    }
}

/// Adaptive re-weighting parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReweightPolicy {
    /// Every backend needs strictly more samples than this
    pub min_predictions: u64,
    pub confidence_share: f64,
    pub latency_share: f64,
    /// Average latency at which the latency score reaches zero
    pub latency_ceiling_ms: f64,
    /// Lower bound on any single weight before renormalisation
    pub weight_floor: f64,
}

impl Default for ReweightPolicy {
    fn default() -> Self {
        Self {
            min_predictions: 10,
            confidence_share: 0.7,
            latency_share: 0.3,
            latency_ceiling_ms: 5000.0,
            weight_floor: 0.01,
        }
    }
}

impl ReweightPolicy {
    /// Performance score for one backend
    pub fn score(&self, average_confidence: f64, average_processing_time_ms: f64) -> f64 {
        let latency = 1.0 - (average_processing_time_ms / self.latency_ceiling_ms).clamp(0.0, 1.0);
        self.confidence_share * average_confidence + self.latency_share * latency
    }
}

/// Shared store of the persistent weight vector
pub struct WeightStore {
    current: RwLock<EnsembleWeights>,
    defaults: EnsembleWeights,
    preferences: Arc<dyn PreferenceStore>,
    policy: ReweightPolicy,
    boosts: ContextBoosts,
}

impl WeightStore {
    /// Load persisted weights, falling back to `defaults` when absent or unreadable
    pub fn load(
        defaults: EnsembleWeights,
        preferences: Arc<dyn PreferenceStore>,
        policy: ReweightPolicy,
    ) -> Self {
        let current = match preferences.get(ENSEMBLE_WEIGHTS_KEY) {
            Ok(Some(value)) => match serde_json::from_value::<BTreeMap<String, f64>>(value) {
                Ok(raw) => {
                    // Backends missing from the persisted map keep their default share
                    let mut merged = defaults.as_map().clone();
                    merged.extend(raw);
                    let loaded = EnsembleWeights::from_map(merged);
                    info!(weights = ?loaded.as_map(), "Loaded persisted ensemble weights");
                    loaded
                }
                Err(e) => {
                    warn!(error = %e, "Persisted ensemble weights malformed, using defaults");
                    defaults.clone()
                }
            },
            Ok(None) => defaults.clone(),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted ensemble weights, using defaults");
                defaults.clone()
            }
        };

        Self {
            current: RwLock::new(current),
            defaults,
            preferences,
            policy,
            boosts: ContextBoosts::default(),
        }
    }

    pub fn with_boosts(mut self, boosts: ContextBoosts) -> Self {
        self.boosts = boosts;
        self
    }

    pub fn policy(&self) -> &ReweightPolicy {
        &self.policy
    }

    pub fn defaults(&self) -> &EnsembleWeights {
        &self.defaults
    }

    /// Copy of the stored weights
    pub async fn snapshot(&self) -> EnsembleWeights {
        self.current.read().await.clone()
    }

    /// Request-scoped copy with contextual boosts applied
    pub async fn contextual(
        &self,
        characteristics: &ImageCharacteristics,
        device: &DeviceCapabilities,
    ) -> EnsembleWeights {
        let mut weights = self.snapshot().await;
        if characteristics.has_clear_metal_objects {
            weights = weights.boosted(BackendKind::Detector.name(), self.boosts.clear_metal_objects);
        }
        if characteristics.has_depth_cues {
            weights = weights.boosted(BackendKind::Depth.name(), self.boosts.depth_cues);
        }
        if characteristics.is_regular_shape {
            weights = weights.boosted(BackendKind::Shape.name(), self.boosts.regular_shape);
        }
        if device.supports_accelerated_compute {
            weights = weights.boosted(BackendKind::Synthesis.name(), self.boosts.accelerated_compute);
        }
        weights
    }

    /// Recompute weights from performance metrics
    ///
    /// Returns `Ok(false)` without touching state unless every configured or measured
    /// backend has more than `min_predictions` samples. The in-memory
    /// vector is updated before persisting, so a persistence error still
    /// leaves the new weights in effect.
    pub async fn recompute_from(&self, snapshot: &MetricsSnapshot) -> Result<bool> {
        let mut current = self.current.write().await;

        let names: BTreeSet<&str> = current
            .names()
            .chain(snapshot.keys().map(String::as_str))
            .collect();

        let mut scores = BTreeMap::new();
        for name in names {
            match snapshot.get(name) {
                Some(m) if m.prediction_count > self.policy.min_predictions => {
                    let score = self
                        .policy
                        .score(m.average_confidence(), m.average_processing_time_ms());
                    scores.insert(name.to_string(), score.max(0.0));
                }
                _ => return Ok(false),
            }
        }

        let total: f64 = scores.values().sum();
        if total <= 0.0 {
            return Ok(false);
        }

        let floored = scores
            .into_iter()
            .map(|(name, score)| (name, (score / total).max(self.policy.weight_floor)))
            .collect();
        let updated = EnsembleWeights::from_map(floored);
        info!(weights = ?updated.as_map(), "Recomputed ensemble weights");
        *current = updated.clone();
        drop(current);

        self.persist(&updated)?;
        Ok(true)
    }

    /// Restore and persist the default weights
    pub async fn reset_to_defaults(&self) -> Result<()> {
        let mut current = self.current.write().await;
        *current = self.defaults.clone();
        drop(current);
        self.persist(&self.defaults)
    }

    fn persist(&self, weights: &EnsembleWeights) -> Result<()> {
        let value = serde_json::to_value(weights).context("Failed to serialize ensemble weights")?;
        self.preferences
            .set(ENSEMBLE_WEIGHTS_KEY, value)
            .context("Failed to persist ensemble weights")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn assert_normalized(weights: &EnsembleWeights) {
        assert!((weights.sum() - 1.0).abs() < NORMALIZATION_TOLERANCE);
        assert!(weights.iter().all(|(_, w)| w >= 0.0));
    }

    fn store(prefs: Arc<dyn PreferenceStore>) -> WeightStore {
        WeightStore::load(EnsembleWeights::defaults(), prefs, ReweightPolicy::default())
    }

    #[test]
    fn test_defaults_are_normalized() {
        let weights = EnsembleWeights::defaults();
        assert_normalized(&weights);
        assert!((weights.get("detector") - 0.40).abs() < 1e-9);
        assert!((weights.get("synthesis") - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_from_map_normalizes_and_drops_negatives() {
        let raw = BTreeMap::from([
            ("a".to_string(), 3.0),
            ("b".to_string(), 1.0),
            ("c".to_string(), -2.0),
            ("d".to_string(), f64::NAN),
        ]);
        let weights = EnsembleWeights::from_map(raw);
        assert_normalized(&weights);
        assert!((weights.get("a") - 0.75).abs() < 1e-9);
        assert_eq!(weights.get("c"), 0.0);
        assert_eq!(weights.get("d"), 0.0);
    }

    #[test]
    fn test_zero_and_empty_vectors_become_uniform() {
        let zero = EnsembleWeights::from_map(BTreeMap::from([
            ("a".to_string(), 0.0),
            ("b".to_string(), 0.0),
        ]));
        assert_eq!(zero.get("a"), 0.5);

        let empty = EnsembleWeights::from_map(BTreeMap::new());
        assert_eq!(empty.len(), BackendKind::ALL.len());
        assert_normalized(&empty);
    }

    #[test]
    fn test_boost_keeps_normalization() {
        let weights = EnsembleWeights::defaults().boosted("depth", 1.3);
        assert_normalized(&weights);
        assert!(weights.get("depth") > 0.20);

        let unknown = EnsembleWeights::defaults().boosted("nope", 5.0);
        assert_eq!(unknown, EnsembleWeights::defaults());
    }

    #[tokio::test]
    async fn test_contextual_does_not_mutate_store() {
        let store = store(Arc::new(MemoryPreferences::new()));
        let characteristics = ImageCharacteristics {
            has_clear_metal_objects: true,
            has_depth_cues: true,
            is_regular_shape: true,
            ..Default::default()
        };
        let device = DeviceCapabilities {
            supports_accelerated_compute: true,
        };

        let derived = store.contextual(&characteristics, &device).await;
        assert_normalized(&derived);
        assert_ne!(derived, EnsembleWeights::defaults());
        assert_eq!(store.snapshot().await, EnsembleWeights::defaults());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_preferences_use_defaults() {
        let store_a = store(Arc::new(MemoryPreferences::new()));
        assert_eq!(store_a.snapshot().await, EnsembleWeights::defaults());

        let prefs = MemoryPreferences::new();
        prefs.set(ENSEMBLE_WEIGHTS_KEY, json!("garbage")).unwrap();
        let store_b = store(Arc::new(prefs));
        assert_eq!(store_b.snapshot().await, EnsembleWeights::defaults());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "\u{0}\u{1}broken").unwrap();
        let store_c = store(Arc::new(FilePreferences::new(&path)));
        assert_eq!(store_c.snapshot().await, EnsembleWeights::defaults());
    }

    #[tokio::test]
    async fn test_persisted_weights_are_normalized_on_load() {
        let prefs = MemoryPreferences::new();
        prefs
            .set(ENSEMBLE_WEIGHTS_KEY, json!({"detector": 2.0, "depth": 2.0}))
            .unwrap();
        let store = store(Arc::new(prefs));
        let weights = store.snapshot().await;
        assert_normalized(&weights);
        // detector 2.0, depth 2.0, shape 0.25, synthesis 0.15
        assert!((weights.get("detector") - 2.0 / 4.4).abs() < 1e-9);
        assert!((weights.get("shape") - 0.25 / 4.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_persisted_map_keeps_every_backend_live() {
        let prefs = MemoryPreferences::new();
        prefs
            .set(ENSEMBLE_WEIGHTS_KEY, json!({"detector": 1.0}))
            .unwrap();
        let store = store(Arc::new(prefs));
        let loaded = store.snapshot().await;
        for kind in BackendKind::ALL {
            assert!(loaded.get(kind.name()) > 0.0, "{} dropped on load", kind.name());
        }

        let metrics = MetricsStore::new();
        for kind in BackendKind::ALL {
            for _ in 0..11 {
                metrics.record_outcome(kind.name(), 100.0, 0.8, true).await;
            }
        }
        assert!(store.recompute_from(&metrics.snapshot().await).await.unwrap());
        let recomputed = store.snapshot().await;
        for kind in BackendKind::ALL {
            assert!((recomputed.get(kind.name()) - 0.25).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_recompute_waits_for_backends_outside_stored_weights() {
        let prefs = MemoryPreferences::new();
        prefs
            .set(ENSEMBLE_WEIGHTS_KEY, json!({"detector": 1.0}))
            .unwrap();
        let store = WeightStore::load(
            EnsembleWeights::from_map(BTreeMap::from([("detector".to_string(), 1.0)])),
            Arc::new(prefs),
            ReweightPolicy::default(),
        );

        let metrics = MetricsStore::new();
        for _ in 0..11 {
            metrics.record_outcome("detector", 100.0, 0.8, true).await;
        }
        for _ in 0..3 {
            metrics.record_outcome("depth", 100.0, 0.8, true).await;
        }
        // depth has too few samples to be scored
        assert!(!store.recompute_from(&metrics.snapshot().await).await.unwrap());

        for _ in 0..8 {
            metrics.record_outcome("depth", 100.0, 0.8, true).await;
        }
        assert!(store.recompute_from(&metrics.snapshot().await).await.unwrap());
        let weights = store.snapshot().await;
        assert!((weights.get("depth") - 0.5).abs() < 1e-9);
        assert!((weights.get("detector") - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recompute_is_gated_on_sample_count() {
        let store = store(Arc::new(MemoryPreferences::new()));
        let metrics = MetricsStore::new();
        for kind in BackendKind::ALL {
            for _ in 0..10 {
                metrics.record_outcome(kind.name(), 100.0, 0.9, true).await;
            }
        }
        // Exactly min_predictions is not enough
        assert!(!store.recompute_from(&metrics.snapshot().await).await.unwrap());
        assert_eq!(store.snapshot().await, EnsembleWeights::defaults());

        for kind in BackendKind::ALL.iter().take(3) {
            metrics.record_outcome(kind.name(), 100.0, 0.9, true).await;
        }
        // Synthesis still at exactly ten
        assert!(!store.recompute_from(&metrics.snapshot().await).await.unwrap());

        metrics.record_outcome("synthesis", 100.0, 0.9, true).await;
        assert!(store.recompute_from(&metrics.snapshot().await).await.unwrap());
        assert_normalized(&store.snapshot().await);
    }

    #[tokio::test]
    async fn test_recompute_penalizes_failing_backend_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prefs.json");
        let store = store(Arc::new(FilePreferences::new(&path)));
        let metrics = MetricsStore::new();

        for kind in BackendKind::ALL {
            for _ in 0..11 {
                metrics.record_outcome(kind.name(), 100.0, 0.8, true).await;
            }
        }
        for _ in 0..3 {
            metrics.record_outcome("depth", 100.0, 0.0, false).await;
        }

        assert!(store.recompute_from(&metrics.snapshot().await).await.unwrap());
        let weights = store.snapshot().await;
        assert!(weights.get("depth") < weights.get("detector"));
        assert!(weights.get("depth") < weights.get("shape"));
        assert!(weights.get("depth") >= 0.01 / 1.01);

        let reloaded = WeightStore::load(
            EnsembleWeights::defaults(),
            Arc::new(FilePreferences::new(&path)),
            ReweightPolicy::default(),
        );
        let persisted = reloaded.snapshot().await;
        for (name, w) in weights.iter() {
            assert!((persisted.get(name) - w).abs() < 1e-9);
        }
    }

    #[test]
    fn test_score_formula() {
        let policy = ReweightPolicy::default();
        assert!((policy.score(1.0, 0.0) - 1.0).abs() < 1e-9);
        assert!((policy.score(0.5, 2500.0) - 0.5).abs() < 1e-9);
        assert!((policy.score(0.0, 10_000.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_to_defaults() {
        let prefs = Arc::new(MemoryPreferences::new());
        prefs
            .set(ENSEMBLE_WEIGHTS_KEY, json!({"detector": 1.0}))
            .unwrap();
        let store = store(prefs.clone());
        assert_ne!(store.snapshot().await, EnsembleWeights::defaults());

        store.reset_to_defaults().await.unwrap();
        assert_eq!(store.snapshot().await, EnsembleWeights::defaults());
        assert!(prefs.get(ENSEMBLE_WEIGHTS_KEY).unwrap().is_some());
    }
}
