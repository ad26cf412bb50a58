//! Keeps the resolved counter list in sync with the catalog service.
//!
//! `Uninitialized -> Connecting -> Polling`. Connecting retries forever with
//! a fixed delay; polling refetches the catalog and republishes the counter
//! list only when the definition set changed.

use super::store::{MetricDefinition, MetricStore, MetricStoreError, MetricType};
use crate::models::{MetricCountersConfig, ResolvedCounter};
use crate::state::Published;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler-internal counter groups that are never pushed to workers.
const SCHEDULER_ALIASES: [&str; 4] = ["HPCSchedulerJobs", "HPCSchedulerNodes", "HPCSchedulerCores", "HPCPoolUsage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    Uninitialized,
    Connecting,
    Polling,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub connect_retry: Duration,
    pub poll_interval: Duration,
}

pub struct MetricConfigManager {
    store: Arc<dyn MetricStore>,
    state: Mutex<ManagerState>,
    definitions: Mutex<Option<HashSet<MetricDefinition>>>,
    counters: Published<MetricCountersConfig>,
    changes: watch::Sender<Arc<MetricCountersConfig>>,
}

impl MetricConfigManager {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        let (changes, _) = watch::channel(Arc::new(MetricCountersConfig::default()));
        Self {
            store,
            state: Mutex::new(ManagerState::Uninitialized),
            definitions: Mutex::new(None),
            counters: Published::new(MetricCountersConfig::default()),
            changes,
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    fn set_state(&self, state: ManagerState) {
        *self.state.lock() = state;
    }

    pub fn current(&self) -> Arc<MetricCountersConfig> {
        self.counters.load()
    }

    /// Notified with the new counter list after every real change.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricCountersConfig>> {
        self.changes.subscribe()
    }

    /// Instance id lookup for workers; only once the store is connected.
    pub async fn instance_ids(&self, names: &[String]) -> Result<Vec<i32>, MetricStoreError> {
        if self.state() != ManagerState::Polling {
            return Err(MetricStoreError::NotConnected);
        }
        self.store.instance_ids(names).await
    }

    /// Returns false only when cancelled.
    pub async fn connect(&self, retry: Duration, cancel: &CancellationToken) -> bool {
        self.set_state(ManagerState::Connecting);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.connect().await {
                Ok(()) => {
                    info!(attempt, "connected to metric store");
                    self.set_state(ManagerState::Polling);
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, retry_in = ?retry, "metric store connection failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    /// Fetch the catalog; publish a new counter list if the set changed.
    pub async fn check(&self) -> Result<bool, MetricStoreError> {
        let definitions = self.store.metric_definitions().await?;
        let fetched: HashSet<MetricDefinition> = definitions.iter().cloned().collect();
        {
            let mut known = self.definitions.lock();
            if known.as_ref() == Some(&fetched) {
                debug!("metric catalog unchanged");
                return Ok(false);
            }
            *known = Some(fetched);
        }

        let counters = self.resolve(&definitions).await;
        info!(definitions = definitions.len(), counters = counters.len(), "metric configuration changed");
        let config = MetricCountersConfig { metric_counters: counters };
        self.counters.publish(config);
        self.changes.send_replace(self.counters.load());
        Ok(true)
    }

    async fn resolve(&self, definitions: &[MetricDefinition]) -> Vec<ResolvedCounter> {
        let mut counters = Vec::new();
        for def in definitions.iter().filter(|d| is_node_counter(d)) {
            let Ok(metric_id) = u16::try_from(def.metric_id) else {
                warn!(alias = %def.alias, metric_id = def.metric_id, "metric id out of range, skipped");
                continue;
            };
            let path = format!("\\{}\\{}", def.category, def.name);

            let filter = def.instance_filter.as_deref().filter(|f| !f.is_empty());
            let Some(filter) = filter else {
                counters.push(ResolvedCounter { path, metric_id, instance_id: 0, instance_name: None });
                continue;
            };

            let names = vec![filter.to_string()];
            let ids = match self.store.instance_ids(&names).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(alias = %def.alias, error = %e, "instance lookup failed, definition skipped");
                    continue;
                }
            };
            if ids.len() != names.len() {
                warn!(alias = %def.alias, expected = names.len(), got = ids.len(), "instance id count mismatch, definition skipped");
                continue;
            }
            for (name, id) in names.into_iter().zip(ids) {
                match u16::try_from(id) {
                    Ok(instance_id) => counters.push(ResolvedCounter {
                        path: path.clone(),
                        metric_id,
                        instance_id,
                        instance_name: Some(name),
                    }),
                    Err(_) => warn!(alias = %def.alias, instance = %name, id, "instance id out of range, skipped"),
                }
            }
        }
        counters
    }

    /// Connect, then poll until cancelled. Poll failures are logged and retried on the next tick.
    pub async fn run(self: Arc<Self>, settings: PollSettings, cancel: CancellationToken) {
        if !self.connect(settings.connect_retry, &cancel).await {
            debug!("metric manager cancelled while connecting");
            return;
        }
        let mut ticker = tokio::time::interval(settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        warn!(error = %e, "metric catalog poll failed");
                    }
                }
            }
        }
        debug!("metric manager stopped");
    }
}

fn is_node_counter(def: &MetricDefinition) -> bool {
    def.kind == MetricType::Performance
        && !SCHEDULER_ALIASES.iter().any(|a| a.eq_ignore_ascii_case(&def.alias))
}
