//! Counter catalog service: metric definitions and instance id lookups.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Performance,
    #[serde(other)]
    Other,
}

/// One catalog entry. Diffing uses full-value equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricDefinition {
    pub alias: String,
    pub category: String,
    pub name: String,
    pub metric_id: i32,
    #[serde(default)]
    pub instance_filter: Option<String>,
    #[serde(rename = "Type")]
    pub kind: MetricType,
}

#[derive(Debug, Error)]
pub enum MetricStoreError {
    #[error("metric store unreachable")]
    Unreachable(#[source] reqwest::Error),
    #[error("metric store answered {0}")]
    Status(u16),
    #[error("malformed metric store payload")]
    Decode(#[source] reqwest::Error),
    #[error("metric store not connected")]
    NotConnected,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn connect(&self) -> Result<(), MetricStoreError>;
    /// Catalog of compute node metrics.
    async fn metric_definitions(&self) -> Result<Vec<MetricDefinition>, MetricStoreError>;
    /// Ids for `names`, in the same order.
    async fn instance_ids(&self, names: &[String]) -> Result<Vec<i32>, MetricStoreError>;
}

/// Catalog service reached over HTTP.
#[derive(Debug, Clone)]
pub struct RestMetricStore {
    client: Client,
    base_url: String,
}

impl RestMetricStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, MetricStoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(MetricStoreError::Unreachable)?;
        Ok(Self { client, base_url: url.trim_end_matches('/').to_owned() })
    }

    async fn checked(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, MetricStoreError> {
        let response = request.send().await.map_err(MetricStoreError::Unreachable)?;
        if !response.status().is_success() {
            return Err(MetricStoreError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl MetricStore for RestMetricStore {
    async fn connect(&self) -> Result<(), MetricStoreError> {
        let url = format!("{}/health", self.base_url);
        self.checked(self.client.get(&url)).await.map(|_| ())
    }

    async fn metric_definitions(&self) -> Result<Vec<MetricDefinition>, MetricStoreError> {
        let url = format!("{}/api/metrics?target=ComputeNode", self.base_url);
        let response = self.checked(self.client.get(&url)).await?;
        response.json().await.map_err(MetricStoreError::Decode)
    }

    async fn instance_ids(&self, names: &[String]) -> Result<Vec<i32>, MetricStoreError> {
        let url = format!("{}/api/instances", self.base_url);
        let response = self.checked(self.client.post(&url).json(names)).await?;
        response.json().await.map_err(MetricStoreError::Decode)
    }
}
