/**
 * WIRE TYPES - JSON payloads exchanged with worker nodes
 *
 * ROLE:
 * Shapes of every body that crosses the head node <-> worker boundary:
 * status reports, task completions, registrations, metric samples, hosts table.
 *
 * CONVENTIONS:
 * - Field names are PascalCase on the wire (worker agents expect it)
 * - Unknown fields are kept in `extra` so they reach the scheduler untouched
 * - No logic here beyond small constructors
 */

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Directive returned to a worker after a task completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextOperation {
    Continue,
    CancelJob,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JobSummary {
    pub job_id: i32,
    pub tasks: Vec<i32>,
}

/// POST /api/{node}/computenodereported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeStatusReport {
    pub name: String,
    pub available_memory_megabytes: u64,
    pub cpu_usage: f32,
    pub jobs: Vec<JobSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TaskInfo {
    pub task_id: i32,
    pub exit_code: i32,
    pub exited: bool,
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JobInfo {
    pub job_id: i32,
    pub tasks: Vec<TaskInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// POST /api/{node}/taskcompleted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TaskCompletionReport {
    pub node_name: String,
    pub job_id: i32,
    pub task_info: TaskInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkInfo {
    pub name: String,
    pub mac_address: String,
    pub ip_v4: String,
    pub ip_v6: String,
    #[serde(rename = "IsIB")]
    pub is_ib: bool,
}

/// POST /api/{node}/registerrequested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegisterRequest {
    pub node_name: String,
    pub distro_info: String,
    pub core_count: u32,
    pub socket_count: u32,
    pub memory_megabytes: u64,
    pub networks_info: Vec<NetworkInfo>,
}

/// One counter stream: (metric id, instance id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Umid {
    pub metric_id: u16,
    pub instance_id: u16,
}

/// POST /api/{node}/metricreported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MetricSampleReport {
    pub umids: Vec<Umid>,
    pub values: Vec<f32>,
    pub tick_count: i32,
}

/// Counter pushed to workers with the "metricconfig" action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResolvedCounter {
    pub path: String,
    pub metric_id: u16,
    pub instance_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

/// Body of the "metricconfig"/"metric" commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricCountersConfig {
    pub metric_counters: Vec<ResolvedCounter>,
}

/// Arguments of the job/task commands. The scheduler owns their content,
/// the bridge only carries them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommandArg {
    pub job_id: i32,
    pub task_id: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A node as seen by the scheduler's node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeRecord {
    pub name: String,
    pub id: Uuid,
    pub location: String,
}
