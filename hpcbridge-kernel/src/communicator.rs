/**
 * NODE COMMUNICATOR - typed commands to worker nodes
 *
 * ROLE:
 * Turns scheduler intents (end job, start task, push metric config...) into
 * dispatcher requests with the right action name, callback URI and reply type.
 *
 * BEHAVIOUR:
 * - HTTP callbacks point at the gateway: `{callback_base}/api/{node}/{route}`
 * - Metric callbacks point at the UDP collector: `udp://{host}:{port}/api/{node_id}/metricreported`
 * - Replies of endjob/endtask are decoded; a bad body reaches the handler as `Decode`
 * - ping and metric pushes only log their outcome
 *
 * The pusher at the bottom re-sends the counter list to every known node
 * each time the metric manager publishes a new one.
 */

use crate::config::KernelConfig;
use crate::dispatcher::{CommandRequest, DispatchError, DispatchOutcome, RequestDispatcher};
use crate::identity::NodeIdentityCache;
use crate::metrics::MetricConfigManager;
use crate::models::{CommandArg, JobInfo, MetricCountersConfig, TaskInfo};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ROUTE_TASK_COMPLETED: &str = "taskcompleted";
pub const ROUTE_NODE_REPORTED: &str = "computenodereported";
pub const ROUTE_METRIC_REPORTED: &str = "metricreported";

pub type ControlReply = oneshot::Receiver<Result<Value, DispatchError>>;

pub struct NodeCommunicator {
    dispatcher: RequestDispatcher,
    callback_base: String,
    collector_host: String,
    collector_port: u16,
    identity: Arc<NodeIdentityCache>,
    metrics: Arc<MetricConfigManager>,
}

fn decode<T: DeserializeOwned>(outcome: DispatchOutcome) -> Result<T, DispatchError> {
    let body = outcome?;
    serde_json::from_slice(&body).map_err(|e| DispatchError::Decode(e.to_string()))
}

impl NodeCommunicator {
    pub fn new(
        dispatcher: RequestDispatcher,
        cfg: &KernelConfig,
        identity: Arc<NodeIdentityCache>,
        metrics: Arc<MetricConfigManager>,
    ) -> Self {
        Self {
            dispatcher,
            callback_base: cfg.callback_base(),
            collector_host: cfg.collector_host().to_string(),
            collector_port: cfg.monitoring.collector_port,
            identity,
            metrics,
        }
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn callback_uri(&self, node: &str, route: &str) -> String {
        format!("{}/api/{node}/{route}", self.callback_base)
    }

    pub fn metric_callback_uri(&self, node_id: Uuid) -> String {
        format!(
            "udp://{}:{}/api/{node_id}/{ROUTE_METRIC_REPORTED}",
            self.collector_host, self.collector_port
        )
    }

    fn send<A, F, Fut>(
        &self,
        node: &str,
        action: &str,
        callback_uri: Option<String>,
        arg: &A,
        on_complete: F,
    ) -> Result<JoinHandle<()>, DispatchError>
    where
        A: Serialize,
        F: FnOnce(DispatchOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let request = CommandRequest::json(node, action, callback_uri, arg)?;
        Ok(self.dispatcher.send(request, on_complete))
    }

    pub fn end_job<F, Fut>(&self, node: &str, arg: &CommandArg, on_complete: F) -> Result<JoinHandle<()>, DispatchError>
    where
        F: FnOnce(Result<JobInfo, DispatchError>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback = self.callback_uri(node, ROUTE_TASK_COMPLETED);
        self.send(node, "endjob", Some(callback), arg, move |outcome| on_complete(decode(outcome)))
    }

    pub fn end_task<F, Fut>(&self, node: &str, arg: &CommandArg, on_complete: F) -> Result<JoinHandle<()>, DispatchError>
    where
        F: FnOnce(Result<TaskInfo, DispatchError>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback = self.callback_uri(node, ROUTE_TASK_COMPLETED);
        self.send(node, "endtask", Some(callback), arg, move |outcome| on_complete(decode(outcome)))
    }

    pub fn start_job_and_task<F, Fut>(
        &self,
        node: &str,
        arg: &CommandArg,
        on_complete: F,
    ) -> Result<JoinHandle<()>, DispatchError>
    where
        F: FnOnce(Result<(), DispatchError>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback = self.callback_uri(node, ROUTE_TASK_COMPLETED);
        self.send(node, "startjobandtask", Some(callback), arg, move |outcome| on_complete(outcome.map(|_| ())))
    }

    pub fn start_task<F, Fut>(&self, node: &str, arg: &CommandArg, on_complete: F) -> Result<JoinHandle<()>, DispatchError>
    where
        F: FnOnce(Result<(), DispatchError>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback = self.callback_uri(node, ROUTE_TASK_COMPLETED);
        self.send(node, "starttask", Some(callback), arg, move |outcome| on_complete(outcome.map(|_| ())))
    }

    pub fn ping(&self, node: &str) -> Result<JoinHandle<()>, DispatchError> {
        let callback = self.callback_uri(node, ROUTE_NODE_REPORTED);
        let name = node.to_string();
        self.send(node, "ping", Some(callback), &Value::Null, move |outcome| async move {
            match outcome {
                Ok(_) => debug!(node = %name, "ping acknowledged"),
                Err(e) => warn!(node = %name, error = %e, "ping failed"),
            }
            anyhow::Ok(())
        })
    }

    /// Sends both the "metricconfig" and the "metric" action.
    pub fn set_metric_config(
        &self,
        node: &str,
        node_id: Uuid,
        config: &MetricCountersConfig,
    ) -> Result<Vec<JoinHandle<()>>, DispatchError> {
        let callback = self.metric_callback_uri(node_id);
        ["metricconfig", "metric"]
            .into_iter()
            .map(|action| {
                let name = node.to_string();
                self.send(node, action, Some(callback.clone()), config, move |outcome| async move {
                    match outcome {
                        Ok(_) => debug!(node = %name, action, "metric configuration delivered"),
                        Err(e) => warn!(node = %name, action, error = %e, "metric configuration push failed"),
                    }
                    anyhow::Ok(())
                })
            })
            .collect()
    }

    /// Remember the node's id and give it the current counter list.
    pub fn set_metric_guid(&self, node: &str, node_id: Uuid) -> Result<Vec<JoinHandle<()>>, DispatchError> {
        self.identity.insert(node, node_id);
        let config = self.metrics.current();
        info!(node, %node_id, counters = config.metric_counters.len(), "pushing metric configuration");
        self.set_metric_config(node, node_id, &config)
    }

    /// Run a command by action name and hand back its single outcome as JSON.
    pub fn execute(&self, node: &str, action: &str, arg: CommandArg) -> Result<ControlReply, DispatchError> {
        let (tx, rx) = oneshot::channel();
        match action {
            "endjob" => {
                self.end_job(node, &arg, move |r| reply_json(tx, r))?;
            }
            "endtask" => {
                self.end_task(node, &arg, move |r| reply_json(tx, r))?;
            }
            "startjobandtask" => {
                self.start_job_and_task(node, &arg, move |r| reply_json(tx, r))?;
            }
            "starttask" => {
                self.start_task(node, &arg, move |r| reply_json(tx, r))?;
            }
            "ping" => {
                let callback = self.callback_uri(node, ROUTE_NODE_REPORTED);
                self.send(node, "ping", Some(callback), &Value::Null, move |r| reply_json(tx, r.map(|_| ())))?;
            }
            other => return Err(DispatchError::InvalidRequest(format!("unknown action {other}"))),
        }
        Ok(rx)
    }
}

async fn reply_json<T: Serialize>(
    tx: oneshot::Sender<Result<Value, DispatchError>>,
    result: Result<T, DispatchError>,
) -> anyhow::Result<()> {
    let value = result.and_then(|v| serde_json::to_value(v).map_err(|e| DispatchError::Decode(e.to_string())));
    // The caller may have given up waiting.
    let _ = tx.send(value);
    Ok(())
}

/// Pushes every new counter list to all known nodes.
pub struct MetricConfigPusher {
    communicator: Arc<NodeCommunicator>,
    identity: Arc<NodeIdentityCache>,
}

impl MetricConfigPusher {
    pub fn new(communicator: Arc<NodeCommunicator>, identity: Arc<NodeIdentityCache>) -> Self {
        Self { communicator, identity }
    }

    /// Returns the number of nodes the config was sent to.
    pub fn push_all(&self, config: &MetricCountersConfig) -> usize {
        let nodes = self.identity.snapshot();
        let mut pushed = 0;
        for (node, id) in nodes.iter() {
            match self.communicator.set_metric_config(node, *id, config) {
                Ok(_) => pushed += 1,
                Err(e) => warn!(%node, error = %e, "cannot build metric configuration request"),
            }
        }
        pushed
    }

    pub async fn run(self, mut changes: watch::Receiver<Arc<MetricCountersConfig>>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        debug!("metric manager gone");
                        break;
                    }
                    let config = changes.borrow_and_update().clone();
                    let pushed = self.push_all(&config);
                    info!(nodes = pushed, counters = config.metric_counters.len(), "metric configuration broadcast");
                }
            }
        }
        debug!("metric config pusher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchSettings;
    use crate::metrics::{MetricDefinition, MetricStore, MetricStoreError};
    use crate::models::{NodeRecord, ResolvedCounter};
    use crate::scheduler::{NodeDirectory, SchedulerError};
    use async_trait::async_trait;
    use hpcbridge_devkit::{FakeWorker, Reply};
    use serde_json::json;
    use std::time::Duration;

    struct NoNodes;

    #[async_trait]
    impl NodeDirectory for NoNodes {
        async fn list_nodes(&self) -> Result<Vec<NodeRecord>, SchedulerError> {
            Ok(Vec::new())
        }
    }

    struct NoMetrics;

    #[async_trait]
    impl MetricStore for NoMetrics {
        async fn connect(&self) -> Result<(), MetricStoreError> {
            Ok(())
        }
        async fn metric_definitions(&self) -> Result<Vec<MetricDefinition>, MetricStoreError> {
            Ok(Vec::new())
        }
        async fn instance_ids(&self, _: &[String]) -> Result<Vec<i32>, MetricStoreError> {
            Ok(Vec::new())
        }
    }

    fn communicator(worker: &FakeWorker) -> NodeCommunicator {
        let mut cfg = KernelConfig::default();
        cfg.cluster.head_node = "head".into();
        let settings = DispatchSettings {
            endpoint_template: worker.base_url(),
            auth_key: "k".into(),
            request_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(10),
            max_attempts: 2,
        };
        let dispatcher = RequestDispatcher::new(settings, CancellationToken::new()).unwrap();
        let identity = Arc::new(NodeIdentityCache::new(Arc::new(NoNodes), "Linux"));
        let metrics = Arc::new(MetricConfigManager::new(Arc::new(NoMetrics)));
        NodeCommunicator::new(dispatcher, &cfg, identity, metrics)
    }

    fn arg(job_id: i32) -> CommandArg {
        CommandArg { job_id, ..Default::default() }
    }

    #[tokio::test]
    async fn end_job_decodes_job_info() {
        let worker = FakeWorker::start(vec![Reply::json(&json!({"JobId": 12, "Tasks": [{"TaskId": 1, "ExitCode": 0}]}))])
            .await
            .unwrap();
        let comm = communicator(&worker);
        let (tx, rx) = oneshot::channel();
        comm.end_job("node01", &arg(12), move |r| async move {
            let _ = tx.send(r);
            anyhow::Ok(())
        })
        .unwrap();

        let info = rx.await.unwrap().unwrap();
        assert_eq!(info.job_id, 12);
        assert_eq!(info.tasks[0].task_id, 1);

        let seen = worker.requests();
        assert_eq!(seen[0].path, "/api/node01/endjob");
        assert_eq!(seen[0].header("callbackuri"), Some("http://head:50000/api/node01/taskcompleted"));
        assert_eq!(seen[0].json()["JobId"], 12);
    }

    #[tokio::test]
    async fn undecodable_reply_is_reported() {
        let worker = FakeWorker::start(vec![Reply::ok("garbage")]).await.unwrap();
        let comm = communicator(&worker);
        let (tx, rx) = oneshot::channel();
        comm.end_task("node01", &arg(1), move |r| async move {
            let _ = tx.send(r);
            anyhow::Ok(())
        })
        .unwrap();
        assert!(matches!(rx.await.unwrap(), Err(DispatchError::Decode(_))));
        assert_eq!(worker.request_count(), 1);
    }

    #[tokio::test]
    async fn metric_config_goes_out_twice_with_udp_callback() {
        let worker = FakeWorker::start(vec![Reply::ok("")]).await.unwrap();
        let comm = communicator(&worker);
        let id = Uuid::new_v4();
        let config = MetricCountersConfig {
            metric_counters: vec![ResolvedCounter {
                path: "\\Processor\\% Processor Time".into(),
                metric_id: 1,
                instance_id: 0,
                instance_name: None,
            }],
        };

        comm.set_metric_config("node01", id, &config).unwrap();
        assert!(worker.wait_for_requests(2, Duration::from_secs(2)).await);

        let mut actions: Vec<String> = worker.requests().iter().map(|r| r.path.clone()).collect();
        actions.sort();
        assert_eq!(actions, vec!["/api/node01/metric", "/api/node01/metricconfig"]);
        let expected = format!("udp://head:9894/api/{id}/metricreported");
        for req in worker.requests() {
            assert_eq!(req.header("callbackuri"), Some(expected.as_str()));
            assert_eq!(req.json()["MetricCounters"][0]["MetricId"], 1);
        }
    }

    #[tokio::test]
    async fn set_metric_guid_records_identity() {
        let worker = FakeWorker::start(vec![Reply::ok("")]).await.unwrap();
        let comm = communicator(&worker);
        let id = Uuid::new_v4();
        comm.set_metric_guid("Node02", id).unwrap();
        assert_eq!(comm.identity.lookup("node02"), Some(id));
        assert!(worker.wait_for_requests(2, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn execute_routes_by_action() {
        let worker = FakeWorker::start(vec![Reply::ok("")]).await.unwrap();
        let comm = communicator(&worker);

        let reply = comm.execute("node01", "starttask", arg(4)).unwrap();
        assert_eq!(reply.await.unwrap(), Ok(Value::Null));
        assert_eq!(worker.requests()[0].path, "/api/node01/starttask");

        let ping = comm.execute("node01", "ping", arg(0)).unwrap();
        assert_eq!(ping.await.unwrap(), Ok(Value::Null));
        assert_eq!(
            worker.requests()[1].header("callbackuri"),
            Some("http://head:50000/api/node01/computenodereported")
        );

        assert!(matches!(
            comm.execute("node01", "format-disk", arg(0)),
            Err(DispatchError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn pusher_broadcasts_changes_to_known_nodes() {
        let worker = FakeWorker::start(vec![Reply::ok("")]).await.unwrap();
        let comm = Arc::new(communicator(&worker));
        comm.identity.insert("node01", Uuid::new_v4());
        comm.identity.insert("node02", Uuid::new_v4());

        let (tx, rx) = watch::channel(Arc::new(MetricCountersConfig::default()));
        let cancel = CancellationToken::new();
        let pusher = MetricConfigPusher::new(comm.clone(), comm.identity.clone());
        let task = tokio::spawn(pusher.run(rx, cancel.clone()));

        tx.send_replace(Arc::new(MetricCountersConfig::default()));
        assert!(worker.wait_for_requests(4, Duration::from_secs(2)).await);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
