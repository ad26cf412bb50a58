//! Keeps the local hosts file in line with the head node's managed table.
//!
//! Lines tagged `#HPC` (any case) belong to the head node and are replaced wholesale;
//! every other line of the file is kept as is, in place.

use crate::client::{HeadNodeClient, HostsPoll};
use crate::protocol::HostEntry;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static MANAGED_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([0-9A-Fa-f:.]+)\s+([^\s#]+)\s+#\s*(?i:HPC)\s*$").ok());

fn is_managed(line: &str) -> bool {
    MANAGED_LINE
        .as_ref()
        .map(|re| re.is_match(line.trim_end_matches('\r')))
        .unwrap_or(false)
}

/// New file content: unmanaged lines first, then the managed table.
pub fn render(existing: &str, entries: &[HostEntry]) -> String {
    let mut out = String::with_capacity(existing.len() + entries.len() * 64);
    for line in existing.lines().filter(|l| !is_managed(l)) {
        out.push_str(line);
        out.push('\n');
    }
    for entry in entries {
        out.push_str(&format!("{:<23} {:<29} #HPC\n", entry.address, entry.name));
    }
    out
}

pub struct HostsSync {
    client: HeadNodeClient,
    path: PathBuf,
    version: Option<String>,
}

impl HostsSync {
    pub fn new(client: HeadNodeClient, path: PathBuf) -> Self {
        Self { client, path, version: None }
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// One poll; returns true when the file was rewritten.
    pub async fn sync_once(&mut self) -> Result<bool> {
        let (version, entries) = match self.client.poll_hosts(self.version.as_deref()).await? {
            HostsPoll::Unchanged => {
                debug!("hosts table unchanged");
                return Ok(false);
            }
            HostsPoll::Changed { version, entries } => (version, entries),
        };

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let next = render(&existing, &entries);
        if next != existing {
            tokio::fs::write(&self.path, &next)
                .await
                .with_context(|| format!("writing {}", self.path.display()))?;
        }
        info!(%version, entries = entries.len(), path = %self.path.display(), "hosts file synchronized");
        self.version = Some(version);
        Ok(true)
    }

    pub async fn run(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!(error = %format!("{e:#}"), "hosts sync failed");
                    }
                }
            }
        }
        debug!("hosts sync stopped");
    }
}
