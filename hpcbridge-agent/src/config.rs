//! Agent configuration
//!
//! Handles:
//! - Head node address and shared cluster secret
//! - Node name (defaults to the host name)
//! - Report and hosts-sync timings
//! - Cross-platform storage (TOML in the OS config directory)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub head_node: HeadNodeConfig,
    pub node: NodeConfig,
    pub hosts: HostsSyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadNodeConfig {
    /// Callback gateway base URL, e.g. `http://head:50000`.
    pub url: String,
    pub auth_key: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Used when the head node answers with garbage or not at all.
    pub fallback_report_interval_ms: u64,
    pub min_report_interval_ms: u64,
    pub registration_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsSyncConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub poll_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            head_node: HeadNodeConfig::default(),
            node: NodeConfig::default(),
            hosts: HostsSyncConfig::default(),
        }
    }
}

impl Default for HeadNodeConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:50000".to_string(),
            auth_key: None,
            request_timeout_secs: 30,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            fallback_report_interval_ms: 5000,
            min_report_interval_ms: 1000,
            registration_retry_secs: 10,
        }
    }
}

impl Default for HostsSyncConfig {
    fn default() -> Self {
        let path = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self { enabled: true, path, poll_interval_secs: 60 }
    }
}

impl NodeConfig {
    /// Interval dictated by the head node, clamped; negative means "use the fallback".
    pub fn report_interval(&self, answer: Option<i64>) -> Duration {
        let ms = match answer {
            Some(ms) if ms >= 0 => (ms as u64).max(self.min_report_interval_ms),
            _ => self.fallback_report_interval_ms,
        };
        Duration::from_millis(ms)
    }
}

impl AgentConfig {
    /// Load config from the OS-specific location, defaults when absent.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("hpcbridge-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn auth_key(&self) -> &str {
        self.head_node.auth_key.as_deref().unwrap_or_default()
    }
}
