//! HTTP client towards the head node's callback gateway.

use crate::config::AgentConfig;
use crate::protocol::{HostEntry, NodeStatusReport, RegisterRequest, AUTH_HEADER, UPDATE_ID_HEADER};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("head node unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("head node answered {0}")]
    Status(u16),
    #[error("hosts answer without an UpdateId header")]
    MissingUpdateId,
}

/// Result of a hosts table poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostsPoll {
    Unchanged,
    Changed { version: String, entries: Vec<HostEntry> },
}

#[derive(Clone)]
pub struct HeadNodeClient {
    client: Client,
    base_url: String,
    auth_key: String,
    node: String,
}

impl HeadNodeClient {
    pub fn new(config: &AgentConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.head_node.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.head_node.url.trim_end_matches('/').to_string(),
            auth_key: config.auth_key().to_string(),
            node: config.node.name.clone(),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}/api/{}/{route}", self.base_url, self.node)
    }

    async fn post_for_int<B: serde::Serialize>(&self, route: &str, body: &B) -> Result<i64, ClientError> {
        let response = self
            .client
            .post(self.url(route))
            .header(AUTH_HEADER, &self.auth_key)
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let text = response.text().await?;
        debug!(route, answer = %text, "head node answered");
        Ok(text.trim().parse::<i64>().unwrap_or(-1))
    }

    /// Returns the head node's retry hint (-1 when none).
    pub async fn register(&self, request: &RegisterRequest) -> Result<i64, ClientError> {
        self.post_for_int("registerrequested", request).await
    }

    /// Returns the delay in ms before the next report.
    pub async fn report_status(&self, report: &NodeStatusReport) -> Result<i64, ClientError> {
        self.post_for_int("computenodereported", report).await
    }

    pub async fn poll_hosts(&self, version: Option<&str>) -> Result<HostsPoll, ClientError> {
        let mut request = self
            .client
            .get(format!("{}/api/hostsfile", self.base_url))
            .header(AUTH_HEADER, &self.auth_key);
        if let Some(version) = version {
            request = request.header(UPDATE_ID_HEADER, version);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(HostsPoll::Unchanged),
            StatusCode::OK => {
                let version = response
                    .headers()
                    .get(UPDATE_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or(ClientError::MissingUpdateId)?;
                let entries = response.json().await?;
                Ok(HostsPoll::Changed { version, entries })
            }
            other => Err(ClientError::Status(other.as_u16())),
        }
    }
}
