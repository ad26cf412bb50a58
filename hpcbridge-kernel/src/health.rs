//! Kernel health view served on `GET /health/kernel`.

use crate::hosts::HostsTableManager;
use crate::identity::NodeIdentityCache;
use crate::metrics::{CounterTransport, ManagerState, MetricConfigManager};
use serde::Serialize;
use std::time::Instant;
use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub started_at: String,
    pub uptime_seconds: u64,
    pub hosts_version: String,
    pub hosts_managed: bool,
    pub hosts_entries: usize,
    pub known_nodes: usize,
    pub published_counters: usize,
    pub metric_manager: ManagerState,
    pub udp_reconnects: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    started_at: OffsetDateTime,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now(), started_at: OffsetDateTime::now_utc() }
    }

    pub fn get_health(
        &self,
        hosts: &HostsTableManager,
        identity: &NodeIdentityCache,
        metrics: &MetricConfigManager,
        transport: &CounterTransport,
    ) -> KernelHealth {
        let table = hosts.snapshot();
        KernelHealth {
            started_at: self.started_at.format(&Iso8601::DEFAULT).unwrap_or_default(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_version: table.version.to_string(),
            hosts_managed: table.managed,
            hosts_entries: table.entries.len(),
            known_nodes: identity.snapshot().len(),
            published_counters: metrics.current().metric_counters.len(),
            metric_manager: metrics.state(),
            udp_reconnects: transport.reconnects(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

/// Resident set size; 0 where /proc is not available.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
