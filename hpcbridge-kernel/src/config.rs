use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "HPCBRIDGE_KERNEL_CONFIG";
pub const HEAD_NODE_ENV: &str = "HPCBRIDGE_HEAD_NODE";
pub const AUTH_KEY_ENV: &str = "HPCBRIDGE_AUTH_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cluster.head_node is not set (config file or HPCBRIDGE_HEAD_NODE)")]
    MissingHeadNode,
    #[error("dispatcher.max_attempts must be at least 1")]
    NoAttempts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub cluster: ClusterConf,
    pub gateway: GatewayConf,
    pub dispatcher: DispatcherConf,
    pub hosts: HostsConf,
    pub monitoring: MonitoringConf,
    pub identity: IdentityConf,
    pub scheduler: SchedulerConf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConf {
    pub head_node: String,
    pub auth_key: Option<String>,
    /// Talk to workers over https on 40002 instead of http on 40000.
    pub https: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConf {
    pub listen: String,
    /// Base URL workers use to call back; derived from the head node when unset.
    pub callback_base: Option<String>,
    pub status_fallback_ms: i32,
    pub accept_mismatched_registration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConf {
    pub request_timeout_secs: u64,
    pub retry_delay_secs: u64,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConf {
    pub path: PathBuf,
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConf {
    pub store_url: String,
    pub collector_host: Option<String>,
    pub collector_port: u16,
    pub poll_interval_secs: u64,
    pub connect_retry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConf {
    pub location: String,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConf {
    pub url: String,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConf {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:50000".into(),
            callback_base: None,
            status_fallback_ms: 5000,
            accept_mismatched_registration: false,
        }
    }
}

impl Default for DispatcherConf {
    fn default() -> Self {
        Self { request_timeout_secs: 40, retry_delay_secs: 3, max_attempts: 4 }
    }
}

impl DispatcherConf {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for HostsConf {
    fn default() -> Self {
        let path = if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        };
        Self { path, reload_interval_secs: 60 }
    }
}

impl Default for MonitoringConf {
    fn default() -> Self {
        Self {
            store_url: "http://localhost:9892".into(),
            collector_host: None,
            collector_port: 9894,
            poll_interval_secs: 300,
            connect_retry_secs: 30,
        }
    }
}

impl Default for IdentityConf {
    fn default() -> Self {
        Self { location: "Linux".into(), refresh_interval_secs: 300 }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self { url: "http://localhost:9890".into(), request_timeout_secs: 30 }
    }
}

impl KernelConfig {
    /// Base of the command endpoint on a worker, e.g. `http://node01:40000`.
    pub fn worker_base(&self, node: &str) -> String {
        if self.cluster.https {
            format!("https://{node}:40002")
        } else {
            format!("http://{node}:40000")
        }
    }

    pub fn callback_base(&self) -> String {
        if let Some(base) = &self.gateway.callback_base {
            return base.trim_end_matches('/').to_string();
        }
        let port = self
            .gateway
            .listen
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .unwrap_or(50000);
        format!("http://{}:{port}", self.cluster.head_node)
    }

    pub fn collector_host(&self) -> &str {
        self.monitoring
            .collector_host
            .as_deref()
            .unwrap_or(&self.cluster.head_node)
    }

    /// Empty secret means "no secret configured".
    pub fn auth_key(&self) -> &str {
        self.cluster.auth_key.as_deref().unwrap_or_default()
    }

    pub fn apply_overrides(&mut self, head_node: Option<String>, auth_key: Option<String>) {
        if let Some(head) = head_node.filter(|h| !h.trim().is_empty()) {
            self.cluster.head_node = head;
        }
        if let Some(key) = auth_key {
            self.cluster.auth_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.head_node.trim().is_empty() {
            return Err(ConfigError::MissingHeadNode);
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }
}

/// Reads the YAML file, applies env overrides and validates.
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_from(Path::new(&path)).await?;
    cfg.apply_overrides(std::env::var(HEAD_NODE_ENV).ok(), std::env::var(AUTH_KEY_ENV).ok());
    cfg.validate()?;
    info!(head_node = %cfg.cluster.head_node, https = cfg.cluster.https, "configuration loaded");
    Ok(cfg)
}

pub async fn load_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
