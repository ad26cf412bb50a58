/**
 * HOSTS TABLE - Cluster-wide name/address table served to workers
 *
 * ROLE:
 * Reloads the head node's hosts file on a timer, keeps the entries marked as
 * centrally managed and publishes them with an opaque version token.
 *
 * RULES:
 * - A `# ManageFile = true` comment enables management for the rest of the pass
 * - Candidate lines look like `<ip> <name> #HPC`; link-local addresses are ignored
 * - The token only changes when the entry *set* changes (order is irrelevant)
 * - Names without a dot come first, encounter order is kept inside each group
 * - No ManageFile flag: the table is emptied and marked unmanaged
 * - Turning management back on always issues a new token
 */

use crate::state::Published;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MANAGED_ENTRY_KEY: &str = "HPC";
const MANAGE_FILE_PARAMETER: &str = "ManageFile";

static COMMENT_PARAMETER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^#\s*(?P<parameter>[\w.]+)\s*=\s*(?P<value>[\w.]+)").ok());
static IP_ENTRY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?P<ip>[0-9A-Fa-f:.]+)\s+(?P<name>[^\s#]+)(\s+#(?P<comment>.*))?").ok()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid ip address '{0}'")]
    InvalidAddress(String),
    #[error("host name is empty")]
    EmptyName,
    #[error("malformed version token '{0}'")]
    MalformedToken(String),
}

/// One managed `name -> address` mapping. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostEntry {
    name: String,
    address: String,
}

impl HostEntry {
    pub fn new(name: &str, address: &str) -> Result<Self, ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        address
            .parse::<IpAddr>()
            .map_err(|_| ValidationError::InvalidAddress(address.to_string()))?;
        Ok(Self { name: name.to_string(), address: address.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn is_link_local(&self) -> bool {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_link_local(),
            Ok(IpAddr::V6(v6)) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            Err(_) => false,
        }
    }
}

/// Opaque token; only equality means anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken(Uuid);

impl VersionToken {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn initial() -> Self {
        Self(Uuid::nil())
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| ValidationError::MalformedToken(raw.to_string()))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsTable {
    pub entries: Vec<HostEntry>,
    pub version: VersionToken,
    pub managed: bool,
}

impl HostsTable {
    fn empty() -> Self {
        Self { entries: Vec::new(), version: VersionToken::initial(), managed: false }
    }

    fn same_set(&self, other: &[HostEntry]) -> bool {
        let current: HashSet<&HostEntry> = self.entries.iter().collect();
        let next: HashSet<&HostEntry> = other.iter().collect();
        current == next
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHosts {
    pub managed: bool,
    pub entries: Vec<HostEntry>,
}

/// Extracts the managed entries of a hosts file, already ordered.
pub fn parse_hosts(text: &str) -> ParsedHosts {
    let (Some(parameter_re), Some(entry_re)) = (COMMENT_PARAMETER.as_ref(), IP_ENTRY.as_ref()) else {
        return ParsedHosts { managed: false, entries: Vec::new() };
    };

    let mut managed = false;
    let mut entries: Vec<HostEntry> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(caps) = parameter_re.captures(line) {
            if caps["parameter"].eq_ignore_ascii_case(MANAGE_FILE_PARAMETER)
                && caps["value"].eq_ignore_ascii_case("true")
            {
                managed = true;
            }
            continue;
        }

        if !managed {
            continue;
        }
        let Some(caps) = entry_re.captures(line) else { continue };
        let comment = caps.name("comment").map(|c| c.as_str().trim()).unwrap_or_default();
        if !comment.eq_ignore_ascii_case(MANAGED_ENTRY_KEY) {
            continue;
        }

        match HostEntry::new(&caps["name"], &caps["ip"]) {
            Ok(entry) if entry.is_link_local() => {
                debug!(name = entry.name(), address = entry.address(), "skipping link-local entry");
            }
            Ok(entry) => {
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
            Err(e) => warn!(line, error = %e, "skipping invalid host entry"),
        }
    }

    ParsedHosts { managed, entries: order_entries(entries) }
}

fn order_entries(entries: Vec<HostEntry>) -> Vec<HostEntry> {
    let (mut plain, dotted): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| !e.name.contains('.'));
    plain.extend(dotted);
    plain
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Missing,
    NotModified,
    Unchanged,
    Updated(VersionToken),
    Unmanaged,
}

/// What a polling worker gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAnswer {
    NoChange(VersionToken),
    Table(Arc<HostsTable>),
}

pub struct HostsTableManager {
    path: PathBuf,
    table: Published<HostsTable>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl HostsTableManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: Published::new(HostsTable::empty()),
            last_modified: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<HostsTable> {
        self.table.load()
    }

    /// `client_token` is whatever the worker sent; malformed counts as stale.
    pub fn poll(&self, client_token: Option<&str>) -> PollAnswer {
        let table = self.snapshot();
        if !table.managed {
            return PollAnswer::NoChange(table.version);
        }
        match client_token.map(VersionToken::parse) {
            Some(Ok(token)) if token == table.version => PollAnswer::NoChange(table.version),
            Some(Err(e)) => {
                debug!(error = %e, "ignoring client version token");
                PollAnswer::Table(table)
            }
            _ => PollAnswer::Table(table),
        }
    }

    pub async fn reload(&self) -> std::io::Result<ReloadOutcome> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "hosts file does not exist");
                return Ok(ReloadOutcome::Missing);
            }
            Err(e) => return Err(e),
        };
        let modified = metadata.modified()?;
        if matches!(*self.last_modified.lock(), Some(last) if modified <= last) {
            debug!("hosts file not modified since last load");
            return Ok(ReloadOutcome::NotModified);
        }

        let text = tokio::fs::read_to_string(&self.path).await?;
        let parsed = parse_hosts(&text);
        let current = self.snapshot();

        let outcome = if !parsed.managed {
            warn!(path = %self.path.display(), "hosts file is not managed");
            self.table.publish(HostsTable { entries: Vec::new(), version: current.version, managed: false });
            ReloadOutcome::Unmanaged
        } else if current.managed && current.same_set(&parsed.entries) {
            ReloadOutcome::Unchanged
        } else {
            let version = VersionToken::fresh();
            info!(%version, entries = parsed.entries.len(), "managed host entries updated");
            self.table.publish(HostsTable { entries: parsed.entries, version, managed: true });
            ReloadOutcome::Updated(version)
        };

        *self.last_modified.lock() = Some(modified);
        Ok(outcome)
    }

    /// Reload loop; a failed pass is logged and the next tick tries again.
    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!(path = %self.path.display(), error = %e, "failed to reload hosts file");
                    }
                }
            }
        }
        debug!("hosts reload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn names(entries: &[HostEntry]) -> Vec<&str> {
        entries.iter().map(HostEntry::name).collect()
    }

    fn write(path: &std::path::Path, text: &str, bump_secs: u64) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(bump_secs)).unwrap();
    }

    #[test]
    fn host_entry_validation() {
        assert!(HostEntry::new("node01", "10.0.0.5").is_ok());
        assert!(HostEntry::new("node01", "fd00::5").is_ok());
        assert_eq!(
            HostEntry::new("node01", "10.0.0.300"),
            Err(ValidationError::InvalidAddress("10.0.0.300".into()))
        );
        assert_eq!(HostEntry::new("", "10.0.0.5"), Err(ValidationError::EmptyName));

        let a = HostEntry::new("n", "10.0.0.1").unwrap();
        let b = HostEntry::new("n", "10.0.0.1").unwrap();
        let set: HashSet<HostEntry> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(a, HostEntry::new("n", "10.0.0.2").unwrap());
    }

    #[test]
    fn managed_entries_dotless_first() {
        let text = "# ManageFile = true\n10.0.0.5 nodeA #HPC\n10.0.0.6 nodeB.cluster.local #HPC\n";
        let parsed = parse_hosts(text);
        assert!(parsed.managed);
        assert_eq!(names(&parsed.entries), vec!["nodeA", "nodeB.cluster.local"]);

        let text = "#managefile=TRUE\n10.0.0.6 b.cluster #hpc\n10.0.0.7 c #HPC\n10.0.0.5 a #HPC\n10.0.0.8 d.x #HPC\n";
        let parsed = parse_hosts(text);
        assert_eq!(names(&parsed.entries), vec!["c", "a", "b.cluster", "d.x"]);
    }

    #[test]
    fn filters_unwanted_lines() {
        let text = "\
127.0.0.1 localhost
10.0.0.1 early #HPC
# ManageFile = true
10.0.0.2 unmarked
10.0.0.3 other #something
169.254.1.1 linklocal #HPC
999.0.0.1 broken #HPC
10.0.0.4 good #HPC
10.0.0.4 good #HPC
";
        let parsed = parse_hosts(text);
        assert_eq!(names(&parsed.entries), vec!["good"]);
    }

    #[test]
    fn no_flag_means_unmanaged() {
        let parsed = parse_hosts("# ManageFile = false\n10.0.0.5 nodeA #HPC\n");
        assert!(!parsed.managed);
        assert!(parsed.entries.is_empty());
    }

    #[tokio::test]
    async fn reorder_keeps_version_change_bumps_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let manager = HostsTableManager::new(&path);

        assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Missing);

        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n10.0.0.2 b #HPC\n", 1);
        let ReloadOutcome::Updated(first) = manager.reload().await.unwrap() else {
            panic!("expected an update");
        };
        assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::NotModified);

        write(&path, "# ManageFile = true\n10.0.0.2 b #HPC\n10.0.0.1 a #HPC\n", 2);
        assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Unchanged);
        assert_eq!(manager.snapshot().version, first);

        write(&path, "# ManageFile = true\n10.0.0.2 b #HPC\n10.0.0.3 c.dom #HPC\n", 3);
        let ReloadOutcome::Updated(second) = manager.reload().await.unwrap() else {
            panic!("expected an update");
        };
        assert_ne!(first, second);
        assert_eq!(names(&manager.snapshot().entries), vec!["b", "c.dom"]);
    }

    #[tokio::test]
    async fn unmanaged_file_clears_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let manager = HostsTableManager::new(&path);

        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 1);
        manager.reload().await.unwrap();
        let version = manager.snapshot().version;

        write(&path, "10.0.0.1 a #HPC\n", 2);
        assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Unmanaged);
        let table = manager.snapshot();
        assert!(!table.managed);
        assert!(table.entries.is_empty());
        assert_eq!(manager.poll(None), PollAnswer::NoChange(version));
        assert_eq!(manager.poll(Some(&version.to_string())), PollAnswer::NoChange(version));

        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 3);
        assert!(matches!(manager.reload().await.unwrap(), ReloadOutcome::Updated(v) if v != version));
    }

    #[tokio::test]
    async fn poll_compares_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 1);
        let manager = HostsTableManager::new(&path);
        manager.reload().await.unwrap();
        let current = manager.snapshot();

        assert_eq!(manager.poll(Some(&current.version.to_string())), PollAnswer::NoChange(current.version));
        assert_eq!(manager.poll(None), PollAnswer::Table(current.clone()));
        assert_eq!(manager.poll(Some("not-a-guid")), PollAnswer::Table(current.clone()));
        assert_eq!(
            manager.poll(Some(&VersionToken::fresh().to_string())),
            PollAnswer::Table(current)
        );
    }

    #[tokio::test]
    async fn run_loop_loads_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 1);
        let manager = Arc::new(HostsTableManager::new(&path));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(manager.clone().run(Duration::from_millis(20), cancel.clone()));
        let loaded = hpcbridge_devkit::wait_until(Duration::from_secs(2), || manager.snapshot().managed).await;
        assert!(loaded);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reenabling_management_issues_a_new_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let manager = HostsTableManager::new(&path);

        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 1);
        let ReloadOutcome::Updated(first) = manager.reload().await.unwrap() else {
            panic!("expected an update");
        };

        write(&path, "10.0.0.1 a #HPC\n", 2);
        assert_eq!(manager.reload().await.unwrap(), ReloadOutcome::Unmanaged);

        write(&path, "# ManageFile = true\n", 3);
        let ReloadOutcome::Updated(second) = manager.reload().await.unwrap() else {
            panic!("expected an update");
        };
        assert_ne!(first, second);
        let table = manager.snapshot();
        assert!(table.managed);
        assert!(table.entries.is_empty());
        assert_eq!(manager.poll(Some(&first.to_string())), PollAnswer::Table(table));
    }

    #[tokio::test]
    async fn run_loop_survives_unreadable_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::create_dir(&path).unwrap();
        let manager = Arc::new(HostsTableManager::new(&path));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(manager.clone().run(Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.snapshot().managed);

        std::fs::remove_dir(&path).unwrap();
        write(&path, "# ManageFile = true\n10.0.0.1 a #HPC\n", 1);
        let loaded = hpcbridge_devkit::wait_until(Duration::from_secs(2), || manager.snapshot().managed).await;
        assert!(loaded);
        assert_eq!(names(&manager.snapshot().entries), vec!["a"]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
