//! Scheduler-facing collaborators.
//!
//! The bridge never decides anything about jobs: reports are handed to
//! [`SchedulerCallbacks`] and the answer is relayed to the worker as is.
//! [`NodeDirectory`] is the authoritative node list behind the identity cache.

use crate::models::{NextOperation, NodeRecord, NodeStatusReport, RegisterRequest, TaskCompletionReport};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler unreachable")]
    Unreachable(#[source] reqwest::Error),
    #[error("scheduler answered {status}")]
    Status { status: u16 },
    #[error("malformed scheduler answer")]
    Decode(#[source] reqwest::Error),
}

#[async_trait]
pub trait SchedulerCallbacks: Send + Sync {
    /// Returns the delay in ms before the worker reports again.
    async fn compute_node_reported(&self, report: NodeStatusReport) -> Result<i32, SchedulerError>;
    async fn task_completed(&self, report: TaskCompletionReport) -> Result<NextOperation, SchedulerError>;
    async fn node_registered(&self, request: RegisterRequest) -> Result<(), SchedulerError>;
}

#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, SchedulerError>;
}

/// Scheduler reached through its HTTP API.
#[derive(Debug, Clone)]
pub struct RestScheduler {
    client: Client,
    base_url: String,
}

impl RestScheduler {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SchedulerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SchedulerError::Unreachable)?;
        Ok(Self { client, base_url: url.trim_end_matches('/').to_owned() })
    }

    async fn post<B>(&self, path: &str, body: &B) -> Result<reqwest::Response, SchedulerError>
    where
        B: Serialize + Sync,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "calling scheduler");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(SchedulerError::Unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SchedulerError::Status { status: status.as_u16() });
        }
        Ok(response)
    }
}

async fn decode<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, SchedulerError> {
    response.json().await.map_err(SchedulerError::Decode)
}

#[async_trait]
impl SchedulerCallbacks for RestScheduler {
    async fn compute_node_reported(&self, report: NodeStatusReport) -> Result<i32, SchedulerError> {
        let path = format!("/api/nodes/{}/reported", report.name);
        decode(self.post(&path, &report).await?).await
    }

    async fn task_completed(&self, report: TaskCompletionReport) -> Result<NextOperation, SchedulerError> {
        let path = format!("/api/nodes/{}/taskcompleted", report.node_name);
        decode(self.post(&path, &report).await?).await
    }

    async fn node_registered(&self, request: RegisterRequest) -> Result<(), SchedulerError> {
        let path = format!("/api/nodes/{}/registered", request.node_name);
        self.post(&path, &request).await.map(|_| ())
    }
}

#[async_trait]
impl NodeDirectory for RestScheduler {
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, SchedulerError> {
        let url = format!("{}/api/nodes", self.base_url);
        let response = self.client.get(&url).send().await.map_err(SchedulerError::Unreachable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SchedulerError::Status { status: status.as_u16() });
        }
        decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpcbridge_devkit::{FakeWorker, Reply};
    use serde_json::json;

    async fn scheduler(replies: Vec<Reply>) -> (FakeWorker, RestScheduler) {
        let service = FakeWorker::start(replies).await.unwrap();
        let client = RestScheduler::new(&service.base_url(), Duration::from_secs(2)).unwrap();
        (service, client)
    }

    #[tokio::test]
    async fn status_report_returns_interval() {
        let (service, client) = scheduler(vec![Reply::json(&json!(15000))]).await;
        let report = NodeStatusReport { name: "node01".into(), ..Default::default() };

        assert_eq!(client.compute_node_reported(report).await.unwrap(), 15000);
        let seen = service.requests();
        assert_eq!(seen[0].path, "/api/nodes/node01/reported");
        assert_eq!(seen[0].json()["Name"], "node01");
    }

    #[tokio::test]
    async fn task_completion_returns_directive() {
        let (_service, client) = scheduler(vec![Reply::json(&json!("CancelJob"))]).await;
        let report = TaskCompletionReport { node_name: "node01".into(), job_id: 3, ..Default::default() };
        assert_eq!(client.task_completed(report).await.unwrap(), NextOperation::CancelJob);
    }

    #[tokio::test]
    async fn node_list_and_failures() {
        let (service, client) = scheduler(vec![Reply::json(&json!([
            {"Name": "node01", "Id": "6f1c1c8e-4a44-4c1f-9d55-0f5b7c2a9e11", "Location": "Linux"}
        ]))])
        .await;
        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "node01");

        service.set_script(vec![Reply::status(500)]);
        assert!(matches!(client.list_nodes().await, Err(SchedulerError::Status { status: 500 })));

        service.set_script(vec![Reply::ok("not json")]);
        let report = TaskCompletionReport::default();
        assert!(matches!(client.task_completed(report).await, Err(SchedulerError::Decode(_))));
        let request = RegisterRequest { node_name: "node01".into(), ..Default::default() };
        client.node_registered(request).await.unwrap();
    }
}
