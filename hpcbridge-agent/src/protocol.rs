//! Bodies exchanged with the head node's callback gateway (PascalCase on the wire).

use serde::{Deserialize, Serialize};

pub const AUTH_HEADER: &str = "AuthenticationKey";
pub const UPDATE_ID_HEADER: &str = "UpdateId";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInfo {
    pub name: String,
    pub mac_address: String,
    pub ip_v4: String,
    pub ip_v6: String,
    #[serde(rename = "IsIB")]
    pub is_ib: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterRequest {
    pub node_name: String,
    pub distro_info: String,
    pub core_count: u32,
    pub socket_count: u32,
    pub memory_megabytes: u64,
    pub networks_info: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobSummary {
    pub job_id: i32,
    pub tasks: Vec<i32>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatusReport {
    pub name: String,
    pub available_memory_megabytes: u64,
    pub cpu_usage: f32,
    pub jobs: Vec<JobSummary>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostEntry {
    pub name: String,
    pub address: String,
}
