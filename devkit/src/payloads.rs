/*!
Builders for the JSON bodies workers send to the head node.

Field names follow the worker wire format (PascalCase).
*/

use chrono::Utc;
use serde_json::{json, Value};

pub struct PayloadBuilder;

impl PayloadBuilder {
    /// Body of POST /api/{node}/computenodereported
    pub fn node_status(node: &str, jobs: &[(i32, &[i32])]) -> Value {
        let jobs: Vec<Value> = jobs
            .iter()
            .map(|(job_id, tasks)| json!({ "JobId": job_id, "Tasks": tasks }))
            .collect();
        json!({
            "Name": node,
            "AvailableMemoryMegabytes": 2048,
            "CpuUsage": 3.5,
            "Jobs": jobs,
            "Timestamp": Utc::now().to_rfc3339(),
        })
    }

    /// Body of POST /api/{node}/taskcompleted
    pub fn task_completed(node: &str, job_id: i32, task_id: i32, exit_code: i32) -> Value {
        json!({
            "NodeName": node,
            "JobId": job_id,
            "TaskInfo": {
                "TaskId": task_id,
                "ExitCode": exit_code,
                "Exited": true,
                "Message": null,
            }
        })
    }

    /// Body of POST /api/{node}/registerrequested
    pub fn registration(node: &str, ip_v4: &str) -> Value {
        json!({
            "NodeName": node,
            "DistroInfo": "Ubuntu 22.04",
            "CoreCount": 8,
            "SocketCount": 1,
            "MemoryMegabytes": 16384,
            "NetworksInfo": [{
                "Name": "eth0",
                "MacAddress": "00:15:5d:00:00:01",
                "IpV4": ip_v4,
                "IpV6": "",
                "IsIB": false,
            }],
        })
    }

    /// Body of POST /api/{node}/metricreported
    pub fn metric_samples(samples: &[(u16, u16, f32)], tick_count: i32) -> Value {
        let umids: Vec<Value> = samples
            .iter()
            .map(|(m, i, _)| json!({ "MetricId": m, "InstanceId": i }))
            .collect();
        let values: Vec<f32> = samples.iter().map(|(_, _, v)| *v).collect();
        json!({ "Umids": umids, "Values": values, "TickCount": tick_count })
    }

    /// Answer of the hosts table poll.
    pub fn hosts_table(entries: &[(&str, &str)]) -> Value {
        Value::Array(
            entries
                .iter()
                .map(|(name, address)| json!({ "Name": name, "Address": address }))
                .collect(),
        )
    }
}
