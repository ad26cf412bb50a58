/**
 * REQUEST DISPATCHER - Outbound commands to worker nodes
 *
 * ROLE:
 * Sends one logical command (`POST {worker}/api/{node}/{action}`) and reports
 * its outcome exactly once to a completion handler.
 *
 * BEHAVIOUR:
 * - Every attempt carries the cluster secret and, when given, the callback URI
 * - Connection failures, timeouts, transport errors and 5xx are retried after a fixed delay
 * - 4xx and local request errors end the loop at once
 * - The shared cancellation token stops in-flight attempts and pending retries
 * - Handler errors and panics are logged and swallowed
 */

use crate::config::KernelConfig;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const AUTH_HEADER: &str = "AuthenticationKey";
pub const CALLBACK_HEADER: &str = "CallbackUri";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("cannot connect to worker: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("worker failed with {status}: {body}")]
    Server { status: u16, body: String },
    #[error("worker rejected request with {status}")]
    Rejected { status: u16, body: String },
    #[error("cannot decode worker response: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dispatcher stopped")]
    Cancelled,
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Connect(_)
                | DispatchError::Timeout
                | DispatchError::Transport(_)
                | DispatchError::Server { .. }
        )
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DispatchError::Timeout
        } else if e.is_connect() {
            DispatchError::Connect(e.to_string())
        } else if e.is_builder() {
            DispatchError::InvalidRequest(e.to_string())
        } else {
            DispatchError::Transport(e.to_string())
        }
    }
}

pub type DispatchOutcome = Result<Bytes, DispatchError>;

/// One logical command to a worker.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub node: String,
    pub action: String,
    pub callback_uri: Option<String>,
    pub body: Bytes,
}

impl CommandRequest {
    pub fn json<T: Serialize>(
        node: &str,
        action: &str,
        callback_uri: Option<String>,
        arg: &T,
    ) -> Result<Self, DispatchError> {
        let body = serde_json::to_vec(arg).map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            node: node.to_string(),
            action: action.to_string(),
            callback_uri,
            body: Bytes::from(body),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Worker base URL with a `{node}` placeholder, e.g. `http://{node}:40000`.
    pub endpoint_template: String,
    pub auth_key: String,
    pub request_timeout: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl DispatchSettings {
    pub fn from_config(cfg: &KernelConfig) -> Self {
        Self {
            endpoint_template: cfg.worker_base("{node}"),
            auth_key: cfg.auth_key().to_string(),
            request_timeout: cfg.dispatcher.request_timeout(),
            retry_delay: cfg.dispatcher.retry_delay(),
            max_attempts: cfg.dispatcher.max_attempts.max(1),
        }
    }

    fn url(&self, node: &str, action: &str) -> String {
        let base = self.endpoint_template.replace("{node}", node);
        format!("{}/api/{node}/{action}", base.trim_end_matches('/'))
    }

    /// Worst case time for one logical request, all retries included.
    pub fn worst_case(&self) -> Duration {
        (self.request_timeout + self.retry_delay) * self.max_attempts.max(1)
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    client: reqwest::Client,
    settings: Arc<DispatchSettings>,
    cancel: CancellationToken,
}

impl RequestDispatcher {
    pub fn new(settings: DispatchSettings, cancel: CancellationToken) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        Ok(Self { client, settings: Arc::new(settings), cancel })
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Stops every in-flight request and pending retry.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Fires the request in the background. `on_complete` runs exactly once
    /// with the final body or the final error.
    pub fn send<F, Fut>(&self, request: CommandRequest, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(DispatchOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run(&request).await;
            match &outcome {
                Ok(_) => debug!(node = %request.node, action = %request.action, "request completed"),
                Err(e) => info!(node = %request.node, action = %request.action, error = %e, "request failed"),
            }

            let delivered = AssertUnwindSafe(async move { on_complete(outcome).await })
                .catch_unwind()
                .await;
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    node = %request.node,
                    action = %request.action,
                    error = %e,
                    "completion handler failed"
                ),
                Err(_) => error!(
                    node = %request.node,
                    action = %request.action,
                    "completion handler panicked"
                ),
            }
        })
    }

    async fn run(&self, request: &CommandRequest) -> DispatchOutcome {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(DispatchError::Cancelled),
                r = self.attempt(request) => r,
            };

            let err = match result {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            warn!(
                node = %request.node,
                action = %request.action,
                attempt,
                error = %err,
                "request failed, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, request: &CommandRequest) -> DispatchOutcome {
        let url = self.settings.url(&request.node, &request.action);
        debug!(%url, callback = ?request.callback_uri, "sending request");

        let mut builder = self
            .client
            .post(&url)
            .timeout(self.settings.request_timeout)
            .header(AUTH_HEADER, self.settings.auth_key.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        if let Some(callback) = &request.callback_uri {
            builder = builder.header(CALLBACK_HEADER, callback.as_str());
        }

        let response = builder.send().await.map_err(DispatchError::from_reqwest)?;
        let status = response.status();
        let body = response.bytes().await.map_err(DispatchError::from_reqwest)?;

        if status.is_server_error() {
            return Err(DispatchError::Server {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}
