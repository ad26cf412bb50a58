/**
 * CALLBACK GATEWAY - HTTP surface of the head node
 *
 * ROLE:
 * Receives what workers report (status, task completion, registration,
 * metric samples, hosts table polls) and hands each report to its handler.
 * Also exposes a small control route for the scheduler and the health views.
 *
 * CONTRACT:
 * - Worker routes never answer with a server error: every failure (bad body,
 *   handler error, panic) is logged and replaced by the route's safe default
 * - computenodereported -> fallback interval, taskcompleted -> CancelJob,
 *   registerrequested -> 5000, metricreported -> -1, getinstanceids -> null
 * - hostsfile answers 204 when the worker's UpdateId is current, 200 + table otherwise
 *
 * SECURITY:
 * - `AuthenticationKey` header compared case-insensitively with the cluster secret
 * - An empty header is accepted only when no secret is configured
 * - /health is always reachable
 */

use crate::communicator::NodeCommunicator;
use crate::config::KernelConfig;
use crate::dispatcher::AUTH_HEADER;
use crate::health::{HealthTracker, KernelHealth};
use crate::hosts::{HostsTableManager, PollAnswer};
use crate::identity::NodeIdentityCache;
use crate::metrics::{CounterTransport, MetricConfigManager};
use crate::models::{CommandArg, MetricSampleReport, NextOperation, NodeStatusReport, RegisterRequest, TaskCompletionReport};
use crate::registration::RegistrationEvent;
use crate::scheduler::SchedulerCallbacks;
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const UPDATE_ID_HEADER: &str = "UpdateId";
/// "No scheduled retry" answer.
pub const NO_RETRY: i32 = -1;
pub const REGISTRATION_RETRY_MS: i32 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<KernelConfig>,
    pub scheduler: Arc<dyn SchedulerCallbacks>,
    pub identity: Arc<NodeIdentityCache>,
    pub hosts: Arc<HostsTableManager>,
    pub metrics: Arc<MetricConfigManager>,
    pub transport: Arc<CounterTransport>,
    pub communicator: Arc<NodeCommunicator>,
    pub registrations: mpsc::Sender<RegistrationEvent>,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/health/kernel", get(kernel_health))
        .route("/api/{node}/computenodereported", post(compute_node_reported))
        .route("/api/{node}/taskcompleted", post(task_completed))
        .route("/api/{node}/registerrequested", post(register_requested))
        .route("/api/{node}/metricreported", post(metric_reported))
        .route("/api/{node}/getinstanceids", post(get_instance_ids))
        .route("/api/hostsfile", get(hosts_file))
        .route("/api/hostfile/{version}", get(hosts_file_by_path))
        .route("/control/{node}/{action}", post(control))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth_key))
        .with_state(app_state)
}

fn key_matches(expected: &str, presented: &str) -> bool {
    if presented.is_empty() && expected.is_empty() {
        return true;
    }
    presented.eq_ignore_ascii_case(expected)
}

async fn require_auth_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !key_matches(app.config.auth_key(), presented) {
        warn!(path = %req.uri().path(), "rejected request with a bad authentication key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> anyhow::Result<T> {
    serde_json::from_slice(body).context("malformed request body")
}

/// Runs a route body; errors and panics become `fallback`.
async fn guarded<T, Fut>(route: &'static str, node: &str, fallback: T, work: Fut) -> T
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            error!(route, %node, error = %format!("{e:#}"), "callback handler failed, answering default");
            fallback
        }
        Err(_) => {
            error!(route, %node, "callback handler panicked, answering default");
            fallback
        }
    }
}

// POST /api/{node}/computenodereported
async fn compute_node_reported(State(app): State<AppState>, Path(node): Path<String>, body: Bytes) -> Json<i32> {
    let fallback = app.config.gateway.status_fallback_ms;
    let interval = guarded("computenodereported", &node, fallback, async {
        let report: NodeStatusReport = parse(&body)?;
        debug!(%node, jobs = report.jobs.len(), "node status reported");
        anyhow::Ok(app.scheduler.compute_node_reported(report).await?)
    })
    .await;
    Json(interval)
}

// POST /api/{node}/taskcompleted
async fn task_completed(State(app): State<AppState>, Path(node): Path<String>, body: Bytes) -> Json<NextOperation> {
    let next = guarded("taskcompleted", &node, NextOperation::CancelJob, async {
        let report: TaskCompletionReport = parse(&body)?;
        debug!(%node, job = report.job_id, task = report.task_info.task_id, "task completed");
        anyhow::Ok(app.scheduler.task_completed(report).await?)
    })
    .await;
    Json(next)
}

// POST /api/{node}/registerrequested
async fn register_requested(State(app): State<AppState>, Path(node): Path<String>, body: Bytes) -> Json<i32> {
    let answer = guarded("registerrequested", &node, REGISTRATION_RETRY_MS, async {
        let request: RegisterRequest = parse(&body)?;
        if !request.node_name.eq_ignore_ascii_case(&node) {
            let ips: Vec<&str> = request.networks_info.iter().map(|n| n.ip_v4.as_str()).collect();
            error!(%node, reported = %request.node_name, ?ips, "registration name does not match the url");
            if !app.config.gateway.accept_mismatched_registration {
                return Ok(NO_RETRY);
            }
        }
        app.registrations
            .send(RegistrationEvent { node: node.clone(), request })
            .await
            .map_err(|_| anyhow::anyhow!("registration queue closed"))?;
        anyhow::Ok(NO_RETRY)
    })
    .await;
    Json(answer)
}

// POST /api/{node}/metricreported
async fn metric_reported(State(app): State<AppState>, Path(node): Path<String>, body: Bytes) -> Json<i32> {
    let answer = guarded("metricreported", &node, NO_RETRY, async {
        let report: MetricSampleReport = parse(&body)?;
        let node_id = match Uuid::parse_str(&node) {
            Ok(id) => Some(id),
            Err(_) => app.identity.resolve(&node).await,
        };
        let Some(node_id) = node_id else {
            warn!(%node, "metric samples from an unknown node ignored");
            return Ok(NO_RETRY);
        };
        app.transport
            .send_samples(node_id, &report.umids, &report.values, report.tick_count)
            .await?;
        anyhow::Ok(NO_RETRY)
    })
    .await;
    Json(answer)
}

// POST /api/{node}/getinstanceids
async fn get_instance_ids(State(app): State<AppState>, Path(node): Path<String>, body: Bytes) -> Json<Value> {
    let ids = guarded("getinstanceids", &node, Value::Null, async {
        let names: Vec<String> = parse(&body)?;
        let ids = app.metrics.instance_ids(&names).await?;
        anyhow::Ok(serde_json::to_value(ids)?)
    })
    .await;
    Json(ids)
}

fn hosts_answer(hosts: &HostsTableManager, token: Option<&str>) -> Response {
    match hosts.poll(token) {
        PollAnswer::NoChange(version) => {
            (StatusCode::NO_CONTENT, [(UPDATE_ID_HEADER, version.to_string())]).into_response()
        }
        PollAnswer::Table(table) => (
            StatusCode::OK,
            [(UPDATE_ID_HEADER, table.version.to_string())],
            Json(table.entries.clone()),
        )
            .into_response(),
    }
}

// GET /api/hostsfile
async fn hosts_file(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let token = headers.get(UPDATE_ID_HEADER).and_then(|v| v.to_str().ok());
    hosts_answer(&app.hosts, token)
}

// GET /api/hostfile/{version}
async fn hosts_file_by_path(State(app): State<AppState>, Path(version): Path<String>) -> Response {
    hosts_answer(&app.hosts, Some(&version))
}

// GET /health/kernel
async fn kernel_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.hosts, &app.identity, &app.metrics, &app.transport))
}

// POST /control/{node}/{action}
async fn control(
    State(app): State<AppState>,
    Path((node, action)): Path<(String, String)>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let failed = |status: StatusCode, error: String| (status, Json(json!({ "ok": false, "result": null, "error": error })));

    let arg: CommandArg = if body.is_empty() {
        CommandArg::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(arg) => arg,
            Err(e) => return failed(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };

    let reply = match app.communicator.execute(&node, &action, arg) {
        Ok(reply) => reply,
        Err(e) => return failed(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let limit = app.communicator.dispatcher().settings().worst_case();
    match tokio::time::timeout(limit, reply).await {
        Ok(Ok(Ok(result))) => (StatusCode::OK, Json(json!({ "ok": true, "result": result, "error": null }))),
        Ok(Ok(Err(e))) => failed(StatusCode::BAD_GATEWAY, e.to_string()),
        Ok(Err(_)) => failed(StatusCode::INTERNAL_SERVER_ERROR, "command outcome lost".into()),
        Err(_) => failed(StatusCode::GATEWAY_TIMEOUT, "command did not complete in time".into()),
    }
}
