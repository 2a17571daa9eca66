//! Continuous-learning record sink
//!
//! Every prediction call emits one `PredictionRecord`. Emission never
//! blocks the prediction path: the channel sink drops records when its
//! buffer is full.

use crate::models::{
    DeviceCapabilities, EnsembleResult, EstimationMethod, ImageCharacteristics, MaterialType,
    ModelPrediction, WeightEstimate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One backend's raw contribution to a prediction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    pub backend: String,
    pub weight_estimate: f64,
    pub confidence: f64,
    pub processing_time_ms: f64,
    pub is_fallback: bool,
    /// Failure that caused the fallback substitution, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendOutput {
    pub fn from_prediction(prediction: &ModelPrediction, error: Option<String>) -> Self {
        Self {
            backend: prediction.backend_name.clone(),
            weight_estimate: prediction.weight_estimate,
            confidence: prediction.confidence,
            processing_time_ms: prediction.processing_time_ms,
            is_fallback: prediction.is_fallback,
            error,
        }
    }
}

/// Training record for one prediction call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub record_id: String,
    pub created_at: DateTime<Utc>,
    pub material: Option<MaterialType>,
    pub backend_outputs: Vec<BackendOutput>,
    /// Combiner output, absent in manual-only mode
    pub ensemble: Option<EnsembleResult>,
    pub estimate: WeightEstimate,
    pub characteristics: Option<ImageCharacteristics>,
    pub device: DeviceCapabilities,
    pub manual_override: Option<f64>,
}

impl PredictionRecord {
    pub fn new(material: Option<MaterialType>, estimate: WeightEstimate, device: DeviceCapabilities) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            material,
            backend_outputs: Vec::new(),
            ensemble: None,
            estimate,
            characteristics: None,
            device,
            manual_override: None,
        }
    }
}

/// Destination for prediction records
pub trait LearningSink: Send + Sync {
    /// Hand off a record without blocking; returns whether it was accepted
    fn emit(&self, record: PredictionRecord) -> bool;
}

/// Discards every record
#[derive(Debug, Default)]
pub struct NullSink;

impl LearningSink for NullSink {
    fn emit(&self, _record: PredictionRecord) -> bool {
        true
    }
}

/// Bounded channel feeding an external consumer
pub struct ChannelSink {
    tx: mpsc::Sender<PredictionRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PredictionRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl LearningSink for ChannelSink {
    fn emit(&self, record: PredictionRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(record_id = %record.record_id, "Learning sink full, dropping record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!(record_id = %record.record_id, "Learning sink closed, dropping record");
                false
            }
        }
    }
}

/// Aggregate statistics over emitted records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub total_records: u64,
    pub records_by_material: BTreeMap<String, u64>,
    pub fallback_records: u64,
    pub manual_records: u64,
    pub average_confidence: f64,
    pub dropped_records: u64,
    pub last_record_at: Option<DateTime<Utc>>,
}

impl CollectionStatistics {
    fn observe(&mut self, record: &PredictionRecord) {
        self.total_records += 1;
        let material = record
            .material
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "unspecified".to_string());
        *self.records_by_material.entry(material).or_insert(0) += 1;

        if record.estimate.is_fallback {
            self.fallback_records += 1;
        }
        if record.estimate.method == EstimationMethod::Manual {
            self.manual_records += 1;
        }

        let n = self.total_records as f64;
        self.average_confidence += (record.estimate.confidence - self.average_confidence) / n;
        self.last_record_at = Some(record.created_at);
    }
}

/// Sink wrapper that keeps collection statistics
pub struct RecordCollector {
    downstream: Arc<dyn LearningSink>,
    stats: Mutex<CollectionStatistics>,
}

impl RecordCollector {
    pub fn new(downstream: Arc<dyn LearningSink>) -> Self {
        Self {
            downstream,
            stats: Mutex::new(CollectionStatistics::default()),
        }
    }

    pub fn statistics(&self) -> CollectionStatistics {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl LearningSink for RecordCollector {
    fn emit(&self, record: PredictionRecord) -> bool {
        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.observe(&record);
        }
        let accepted = self.downstream.emit(record);
        if !accepted {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.dropped_records += 1;
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimate(method: EstimationMethod, confidence: f64, is_fallback: bool) -> WeightEstimate {
        WeightEstimate {
            estimated_weight: 12.0,
            confidence,
            method,
            factors: vec![],
            suggestions: vec![],
            model_count: 4,
            is_fallback,
        }
    }

    fn record(material: Option<MaterialType>, method: EstimationMethod, confidence: f64) -> PredictionRecord {
        PredictionRecord::new(
            material,
            estimate(method, confidence, method == EstimationMethod::EnsembleFallback),
            DeviceCapabilities::default(),
        )
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        let r = record(Some(MaterialType::Steel), EstimationMethod::Ensemble, 0.8);
        let id = r.record_id.clone();

        assert!(sink.emit(r));
        assert_eq!(rx.recv().await.unwrap().record_id, id);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, _rx) = ChannelSink::new(1);
        assert!(sink.emit(record(None, EstimationMethod::Manual, 0.3)));
        assert!(!sink.emit(record(None, EstimationMethod::Manual, 0.3)));
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::new(2);
        drop(rx);
        assert!(!sink.emit(record(None, EstimationMethod::Manual, 0.3)));
    }

    #[test]
    fn test_collector_statistics() {
        let (sink, _rx) = ChannelSink::new(2);
        let collector = RecordCollector::new(Arc::new(sink));

        collector.emit(record(Some(MaterialType::Copper), EstimationMethod::Ensemble, 0.8));
        collector.emit(record(Some(MaterialType::Copper), EstimationMethod::EnsembleFallback, 0.1));
        collector.emit(record(None, EstimationMethod::Manual, 0.3));

        let stats = collector.statistics();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.records_by_material["copper"], 2);
        assert_eq!(stats.records_by_material["unspecified"], 1);
        assert_eq!(stats.fallback_records, 1);
        assert_eq!(stats.manual_records, 1);
        assert_eq!(stats.dropped_records, 1);
        assert!((stats.average_confidence - 0.4).abs() < 1e-9);
        assert!(stats.last_record_at.is_some());
    }

    #[test]
    fn test_record_ids_are_unique() {
        let a = record(None, EstimationMethod::Manual, 0.3);
        let b = record(None, EstimationMethod::Manual, 0.3);
        assert_ne!(a.record_id, b.record_id);
    }
}
