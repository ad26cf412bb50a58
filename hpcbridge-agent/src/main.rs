//! HPC Bridge Agent - worker side of the head node bridge
//!
//! This agent keeps a worker node known to the head node:
//! - Registration with the node's self-description at startup
//! - Status reports at the interval the head node dictates
//! - Synchronization of the local hosts file with the managed cluster table

mod client;
mod config;
mod discovery;
mod hosts_sync;
mod metrics;
mod protocol;

use anyhow::{Context, Result};
use client::HeadNodeClient;
use config::AgentConfig;
use discovery::SystemInfo;
use hosts_sync::HostsSync;
use metrics::StatusSampler;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

struct Agent {
    config: AgentConfig,
    client: HeadNodeClient,
    sampler: StatusSampler,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        let client = HeadNodeClient::new(&config).context("Failed to build head node client")?;
        Ok(Self { config, client, sampler: StatusSampler::new() })
    }

    /// Retries until the head node accepts the registration. A positive answer is
    /// the head node asking to retry after that many milliseconds. False if cancelled first.
    async fn register(&self, system: &SystemInfo, cancel: &CancellationToken) -> bool {
        let request = system.registration(&self.config.node.name);
        let retry = Duration::from_secs(self.config.node.registration_retry_secs);
        loop {
            let wait = match self.client.register(&request).await {
                Ok(ms) if ms > 0 => {
                    warn!(retry_in_ms = ms, "head node could not take the registration");
                    Duration::from_millis(ms as u64)
                }
                Ok(_) => {
                    info!(node = %self.config.node.name, "registered with head node");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, retry_in = ?retry, "registration failed");
                    retry
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Sends one status report and returns how long to wait before the next.
    async fn report_once(&mut self) -> Duration {
        let report = self.sampler.sample(&self.config.node.name);
        let answer = match self.client.report_status(&report).await {
            Ok(ms) => Some(ms),
            Err(e) => {
                warn!(error = %e, "status report failed");
                None
            }
        };
        let next = self.config.node.report_interval(answer);
        debug!(next = ?next, "next status report scheduled");
        next
    }

    async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let system = SystemInfo::discover().context("Failed to discover system information")?;
        if !self.register(&system, &cancel).await {
            return Ok(());
        }

        if self.config.hosts.enabled {
            let sync = HostsSync::new(self.client.clone(), self.config.hosts.path.clone());
            let every = Duration::from_secs(self.config.hosts.poll_interval_secs);
            tokio::spawn(sync.run(every, cancel.clone()));
        }

        loop {
            let wait = self.report_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("agent stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("HPC Bridge Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    Agent::new(config)?.run(cancel).await.context("Agent execution failed")
}
