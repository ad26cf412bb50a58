//! Status snapshot reported to the head node on every contact
//!
//! CPU usage needs two refreshes some time apart, so the sampler keeps its
//! `System` between reports instead of rebuilding it.

use crate::protocol::NodeStatusReport;
use sysinfo::System;
use tracing::debug;

pub struct StatusSampler {
    sys: System,
}

impl Default for StatusSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }

    pub fn sample(&mut self, node_name: &str) -> NodeStatusReport {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let report = NodeStatusReport {
            name: node_name.to_string(),
            available_memory_megabytes: self.sys.available_memory() / (1024 * 1024),
            cpu_usage: self.sys.global_cpu_info().cpu_usage(),
            jobs: Vec::new(),
            uptime_seconds: System::uptime(),
        };
        debug!(cpu = report.cpu_usage, memory_mb = report.available_memory_megabytes, "status sampled");
        report
    }
}
