//! API client for communicating with the estimator service

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Non-success response from the service
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}): {body}")]
pub struct ApiError {
    pub status: StatusCode,
    pub body: String,
}

/// API client for the estimator service
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Run one prediction
    pub async fn predict(&self, request: &PredictRequest) -> Result<WeightEstimate> {
        self.post("v1/predict", request).await
    }

    pub async fn stats(&self) -> Result<PerformanceStats> {
        self.get("v1/stats").await
    }

    pub async fn collection(&self) -> Result<CollectionStatistics> {
        self.get("v1/collection").await
    }

    /// Health report; an unhealthy service still answers with a body
    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.base_url.join("healthz").context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return response.json().await.context("Failed to parse response");
        }
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError { status, body }.into());
        }

        response.json().await.context("Failed to parse response")
    }
}

// API request and response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Base64-encoded pixels
    pub pixels: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_estimate: Option<f64>,
    pub accelerated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightEstimate {
    pub estimated_weight: f64,
    pub confidence: f64,
    pub method: String,
    pub factors: Vec<String>,
    pub suggestions: Vec<String>,
    pub model_count: usize,
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub prediction_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_health_check: Option<i64>,
    pub is_healthy: bool,
    pub average_processing_time_ms: f64,
    pub average_confidence: f64,
    pub success_rate: f64,
    pub current_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub backends: BTreeMap<String, BackendStats>,
    pub weights: BTreeMap<String, f64>,
    pub total_predictions: u64,
    pub overall_average_confidence: f64,
    pub overall_average_processing_time_ms: f64,
    pub healthy_backends: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub total_records: u64,
    pub records_by_material: BTreeMap<String, u64>,
    pub fallback_records: u64,
    pub manual_records: u64,
    pub average_confidence: f64,
    pub dropped_records: u64,
    pub last_record_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: String,
    pub prediction_count: u64,
    pub success_rate: f64,
    pub average_confidence: f64,
    pub average_processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub backends: BTreeMap<String, BackendHealth>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentHealth>,
}
