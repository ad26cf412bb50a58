/**
 * NODE IDENTITY CACHE - worker name -> cluster id
 *
 * ROLE:
 * Resolves the human name a worker reports under to the stable id the
 * scheduler assigned to it (used in metric packets and callback URIs).
 *
 * BEHAVIOUR:
 * - Keys are case-insensitive (stored lowercase)
 * - A miss triggers one full refresh from the node directory, then one retry
 * - Misses that queue up behind a running refresh reuse its result
 * - A timer refreshes the whole map so renames and removals are picked up
 * - The map is swapped wholesale: readers see either the old or the new map
 * - A failed refresh keeps the previous map
 */

use crate::scheduler::NodeDirectory;
use crate::state::Published;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type IdentityMap = HashMap<String, Uuid>;

pub struct NodeIdentityCache {
    directory: Arc<dyn NodeDirectory>,
    location: String,
    map: Published<IdentityMap>,
    refreshing: Mutex<()>,
    /// Completed refresh attempts, successful or not.
    generation: AtomicU64,
}

impl NodeIdentityCache {
    pub fn new(directory: Arc<dyn NodeDirectory>, location: impl Into<String>) -> Self {
        Self {
            directory,
            location: location.into(),
            map: Published::new(HashMap::new()),
            refreshing: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<IdentityMap> {
        self.map.load()
    }

    pub fn lookup(&self, name: &str) -> Option<Uuid> {
        self.map.load().get(&name.to_lowercase()).copied()
    }

    pub fn insert(&self, name: &str, id: Uuid) {
        let key = name.to_lowercase();
        self.map.update(|current| {
            let mut next = current.clone();
            next.insert(key.clone(), id);
            next
        });
    }

    /// Cached id, or one refresh and a second look. `None` means unknown node.
    pub async fn resolve(&self, name: &str) -> Option<Uuid> {
        if let Some(id) = self.lookup(name) {
            return Some(id);
        }
        let seen = self.generation.load(Ordering::Acquire);
        let guard = self.refreshing.lock().await;
        if self.generation.load(Ordering::Acquire) == seen {
            debug!(node = %name, "identity miss, refreshing");
            if let Err(e) = self.refresh_locked().await {
                warn!(node = %name, error = %e, "identity refresh failed");
            }
        } else {
            debug!(node = %name, "identity miss, reusing the refresh that just ran");
        }
        drop(guard);

        let found = self.lookup(name);
        if found.is_none() {
            warn!(node = %name, "unknown node");
        }
        found
    }

    /// Rebuild the map from the directory. Concurrent calls run one at a time.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let _guard = self.refreshing.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> anyhow::Result<usize> {
        let listed = self.directory.list_nodes().await;
        self.generation.fetch_add(1, Ordering::Release);
        let fresh: IdentityMap = listed?
            .into_iter()
            .filter(|n| n.location.eq_ignore_ascii_case(&self.location))
            .map(|n| (n.name.to_lowercase(), n.id))
            .collect();
        let count = fresh.len();
        self.map.publish(fresh);
        debug!(nodes = count, "identity map refreshed");
        Ok(count)
    }

    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.refresh().await {
                    Ok(count) => info!(nodes = count, "node identities resynchronized"),
                    Err(e) => warn!(error = %e, "periodic identity refresh failed, keeping previous map"),
                },
            }
        }
        debug!("identity refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeRecord;
    use crate::scheduler::SchedulerError;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct FakeDirectory {
        nodes: SyncMutex<Vec<NodeRecord>>,
        calls: AtomicUsize,
        failing: AtomicBool,
        delay_ms: AtomicU64,
    }

    impl FakeDirectory {
        fn with(nodes: &[(&str, Uuid, &str)]) -> Arc<Self> {
            let dir = Self::default();
            *dir.nodes.lock() = nodes
                .iter()
                .map(|(name, id, location)| NodeRecord { name: name.to_string(), id: *id, location: location.to_string() })
                .collect();
            Arc::new(dir)
        }
    }

    #[async_trait]
    impl NodeDirectory for FakeDirectory {
        async fn list_nodes(&self) -> Result<Vec<NodeRecord>, SchedulerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SchedulerError::Status { status: 503 });
            }
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            } else {
                tokio::task::yield_now().await;
            }
            Ok(self.nodes.lock().clone())
        }
    }

    #[tokio::test]
    async fn miss_refreshes_once_case_insensitively() {
        let id = Uuid::new_v4();
        let dir = FakeDirectory::with(&[("Node01", id, "Linux"), ("winbox", Uuid::new_v4(), "Windows")]);
        let cache = NodeIdentityCache::new(dir.clone(), "linux");

        assert_eq!(cache.resolve("NODE01").await, Some(id));
        assert_eq!(cache.resolve("node01").await, Some(id));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.resolve("winbox").await, None);
        assert_eq!(dir.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_map() {
        let id = Uuid::new_v4();
        let dir = FakeDirectory::with(&[("node01", id, "Linux")]);
        let cache = NodeIdentityCache::new(dir.clone(), "Linux");
        cache.refresh().await.unwrap();

        dir.failing.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.lookup("node01"), Some(id));
        assert_eq!(cache.resolve("ghost").await, None);
    }

    #[tokio::test]
    async fn insert_is_visible_without_refresh() {
        let dir = FakeDirectory::with(&[]);
        let cache = NodeIdentityCache::new(dir.clone(), "Linux");
        let id = Uuid::new_v4();
        cache.insert("Node07", id);
        assert_eq!(cache.resolve("node07").await, Some(id));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_see_whole_maps_during_refresh() {
        let old: Vec<(String, Uuid)> = (0..50).map(|i| (format!("old{i}"), Uuid::new_v4())).collect();
        let new: Vec<(String, Uuid)> = (0..50).map(|i| (format!("new{i}"), Uuid::new_v4())).collect();
        let dir = Arc::new(FakeDirectory::default());
        let cache = Arc::new(NodeIdentityCache::new(dir.clone(), "Linux"));
        let records = |set: &[(String, Uuid)]| {
            set.iter()
                .map(|(n, id)| NodeRecord { name: n.clone(), id: *id, location: "Linux".into() })
                .collect::<Vec<_>>()
        };
        *dir.nodes.lock() = records(&old);
        cache.refresh().await.unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let snap = cache.snapshot();
                        let olds = snap.keys().filter(|k| k.starts_with("old")).count();
                        let news = snap.keys().filter(|k| k.starts_with("new")).count();
                        assert!((olds, news) == (50, 0) || (olds, news) == (0, 50));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for round in 0..20 {
            *dir.nodes.lock() = if round % 2 == 0 { records(&new) } else { records(&old) };
            cache.refresh().await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let dir = FakeDirectory::with(&[("node01", Uuid::new_v4(), "Linux")]);
        let cache = Arc::new(NodeIdentityCache::new(dir.clone(), "Linux"));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache.clone().run(Duration::from_millis(10), cancel.clone()));

        assert!(hpcbridge_devkit::wait_until(Duration::from_secs(2), || dir.calls.load(Ordering::SeqCst) >= 2).await);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(cache.lookup("node01").is_some());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_refresh() {
        let id = Uuid::new_v4();
        let dir = FakeDirectory::with(&[("node01", id, "Linux")]);
        dir.delay_ms.store(50, Ordering::SeqCst);
        let cache = Arc::new(NodeIdentityCache::new(dir.clone(), "Linux"));

        let lookups = (0..10).map(|i| {
            let cache = cache.clone();
            async move { cache.resolve(if i % 2 == 0 { "ghost" } else { "NODE01" }).await }
        });
        let found = futures::future::join_all(lookups).await;

        assert_eq!(dir.calls.load(Ordering::SeqCst), 1);
        assert_eq!(found.iter().filter(|f| **f == Some(id)).count(), 5);
        assert_eq!(found.iter().filter(|f| f.is_none()).count(), 5);

        assert_eq!(cache.resolve("ghost").await, None);
        assert_eq!(dir.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_recovers_after_directory_failures() {
        let id = Uuid::new_v4();
        let dir = FakeDirectory::with(&[("node01", id, "Linux")]);
        dir.failing.store(true, Ordering::SeqCst);
        let cache = Arc::new(NodeIdentityCache::new(dir.clone(), "Linux"));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache.clone().run(Duration::from_millis(10), cancel.clone()));

        assert!(hpcbridge_devkit::wait_until(Duration::from_secs(2), || dir.calls.load(Ordering::SeqCst) >= 2).await);
        assert_eq!(cache.lookup("node01"), None);

        dir.failing.store(false, Ordering::SeqCst);
        assert!(hpcbridge_devkit::wait_until(Duration::from_secs(2), || cache.lookup("node01") == Some(id)).await);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
