//! Replaying transport backed by recorded device snapshots.
//!
//! A snapshot holds the walked process tables and point values of one device,
//! plus optional fault injection. Snapshots come either from a directory
//! (`<dir>/<device>.json|yaml|yml`, re-read on every session open so edits
//! between cycles are observed) or from memory. Raw captures written by the
//! collector are valid snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use super::{ConnectionInfo, Connector, OidMap, Session, TableResult, TransportError};

/// File extensions probed when looking up a device snapshot, in order.
const SNAPSHOT_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// Recorded view of one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,

    /// Walked tables keyed by table root OID
    #[serde(default)]
    pub tables: TableResult,

    /// Point values served by `get`
    #[serde(default, skip_serializing_if = "OidMap::is_empty")]
    pub values: OidMap,

    /// Fault for table walks: "timeout", "version", "unsupported-agent"
    /// (every table comes back empty), or any other text which is returned
    /// as a generic transport error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_error: Option<String>,

    /// Any `get` that includes one of these OIDs times out
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub timeout_oids: BTreeSet<String>,
}

/// Errors while loading snapshot files.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("no snapshot for device {device} in {dir}")]
    NotFound { device: String, dir: PathBuf },

    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML snapshot: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Snapshot {
    /// Wraps a raw table response (as captured from a device).
    pub fn from_tables(tables: TableResult) -> Self {
        Self {
            generated_at: Some(Utc::now()),
            tables,
            ..Self::default()
        }
    }

    /// Parses snapshot content. `.json` files and extensionless captures
    /// starting with `{` are JSON, anything else YAML.
    pub fn parse(content: &str, path: &Path) -> Result<Self, SnapshotError> {
        let is_json = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => true,
            Some(_) => false,
            None => content.trim_start().starts_with('{'),
        };
        if is_json {
            Ok(serde_json::from_str(content)?)
        } else {
            Ok(serde_yaml::from_str(content)?)
        }
    }

    /// Loads a snapshot file synchronously.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Locates the snapshot file for a device in `dir`.
    pub fn find(dir: &Path, device: &str) -> Result<PathBuf, SnapshotError> {
        SNAPSHOT_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", device, ext)))
            .find(|p| p.exists())
            .ok_or_else(|| SnapshotError::NotFound {
                device: device.to_string(),
                dir: dir.to_path_buf(),
            })
    }
}

/// Shared record of session activity, for diagnostics and tests.
#[derive(Debug, Default)]
pub struct SessionLog {
    opened: AtomicUsize,
    closed: AtomicUsize,
    table_requests: Mutex<Vec<Vec<String>>>,
    table_repetitions: Mutex<Vec<usize>>,
    get_requests: Mutex<Vec<Vec<String>>>,
}

impl SessionLog {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }

    /// OID lists of every table walk, in request order.
    pub fn table_requests(&self) -> Vec<Vec<String>> {
        self.table_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Max-repetitions of every table walk, in request order.
    pub fn table_repetitions(&self) -> Vec<usize> {
        self.table_repetitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// OID lists of every `get`, in request order.
    pub fn get_requests(&self) -> Vec<Vec<String>> {
        self.get_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(target: &Mutex<Vec<Vec<String>>>, oids: Vec<String>) {
        target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(oids);
    }
}

enum Source {
    Directory(PathBuf),
    Memory(RwLock<HashMap<String, Snapshot>>),
}

/// [`Connector`] that replays snapshots.
pub struct SnapshotConnector {
    source: Source,
    log: Arc<SessionLog>,
}

impl SnapshotConnector {
    /// Replays `<dir>/<device>.{json,yaml,yml}`.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Directory(dir.into()),
            log: Arc::new(SessionLog::default()),
        }
    }

    /// Replays snapshots registered with [`SnapshotConnector::set_snapshot`].
    pub fn in_memory() -> Self {
        Self {
            source: Source::Memory(RwLock::new(HashMap::new())),
            log: Arc::new(SessionLog::default()),
        }
    }

    /// Replaces the snapshot served for `device`. Returns false for
    /// directory-backed connectors, whose files are the source of truth.
    pub fn set_snapshot(&self, device: &str, snapshot: Snapshot) -> bool {
        match &self.source {
            Source::Memory(map) => {
                map.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(device.to_string(), snapshot);
                true
            }
            Source::Directory(_) => false,
        }
    }

    pub fn log(&self) -> Arc<SessionLog> {
        Arc::clone(&self.log)
    }

    async fn load(&self, device_id: &str) -> Result<Snapshot, TransportError> {
        match &self.source {
            Source::Memory(map) => map
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(device_id)
                .cloned()
                .ok_or_else(|| TransportError::Other(format!("no snapshot for device {}", device_id))),
            Source::Directory(dir) => {
                let path = Snapshot::find(dir, device_id)
                    .map_err(|e| TransportError::Other(e.to_string()))?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| TransportError::Other(format!("{}: {}", path.display(), e)))?;
                Snapshot::parse(&content, &path)
                    .map_err(|e| TransportError::Other(format!("{}: {}", path.display(), e)))
            }
        }
    }
}

#[async_trait]
impl Connector for SnapshotConnector {
    async fn open(
        &self,
        device_id: &str,
        manage_ip: &str,
        _connection: &ConnectionInfo,
    ) -> Result<Box<dyn Session>, TransportError> {
        let snapshot = self.load(device_id).await?;
        self.log.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Replaying snapshot for {} [{}]", device_id, manage_ip);
        Ok(Box::new(SnapshotSession {
            snapshot,
            log: Arc::clone(&self.log),
            closed: false,
        }))
    }
}

struct SnapshotSession {
    snapshot: Snapshot,
    log: Arc<SessionLog>,
    closed: bool,
}

fn total_wait(timeout: Duration, retries: u32) -> Duration {
    timeout.saturating_mul(retries.saturating_add(1))
}

#[async_trait]
impl Session for SnapshotSession {
    async fn get_table(
        &mut self,
        oids: &[&str],
        max_repetitions: usize,
        timeout: Duration,
        retries: u32,
    ) -> Result<TableResult, TransportError> {
        SessionLog::record(
            &self.log.table_requests,
            oids.iter().map(|o| o.to_string()).collect(),
        );
        self.log
            .table_repetitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(max_repetitions);

        match self.snapshot.table_error.as_deref() {
            Some("timeout") => return Err(TransportError::Timeout(total_wait(timeout, retries))),
            Some("version") => {
                return Err(TransportError::Version(
                    "authentication failure (replayed)".to_string(),
                ))
            }
            Some("unsupported-agent") => {
                return Ok(oids
                    .iter()
                    .map(|oid| (oid.to_string(), OidMap::new()))
                    .collect())
            }
            Some(other) => return Err(TransportError::Other(other.to_string())),
            None => {}
        }

        Ok(oids
            .iter()
            .map(|oid| {
                let rows = self.snapshot.tables.get(*oid).cloned().unwrap_or_default();
                (oid.to_string(), rows)
            })
            .collect())
    }

    async fn get(
        &mut self,
        oids: &[String],
        timeout: Duration,
        retries: u32,
    ) -> Result<OidMap, TransportError> {
        SessionLog::record(&self.log.get_requests, oids.to_vec());

        if oids.iter().any(|oid| self.snapshot.timeout_oids.contains(oid)) {
            return Err(TransportError::Timeout(total_wait(timeout, retries)));
        }

        Ok(oids
            .iter()
            .filter_map(|oid| {
                self.snapshot
                    .values
                    .get(oid)
                    .map(|value| (oid.clone(), value.clone()))
            })
            .collect())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.closed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OidValue;
    use tempfile::tempdir;

    fn sample_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot
            .values
            .insert(".1.2.1".to_string(), OidValue::Integer(10));
        snapshot
            .values
            .insert(".1.2.2".to_string(), OidValue::Integer(20));
        snapshot.timeout_oids.insert(".1.2.9".to_string());
        snapshot
    }

    #[tokio::test]
    async fn test_get_skips_absent_oids() {
        let connector = SnapshotConnector::in_memory();
        connector.set_snapshot("dev1", sample_snapshot());

        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");
        let values = session
            .get(
                &[".1.2.1".to_string(), ".1.2.3".to_string()],
                Duration::from_secs(1),
                0,
            )
            .await
            .expect("get succeeds");

        assert_eq!(values.len(), 1);
        assert_eq!(values[".1.2.1"], OidValue::Integer(10));
    }

    #[tokio::test]
    async fn test_get_with_timeout_oid_fails_whole_request() {
        let connector = SnapshotConnector::in_memory();
        connector.set_snapshot("dev1", sample_snapshot());

        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");
        let result = session
            .get(
                &[".1.2.1".to_string(), ".1.2.9".to_string()],
                Duration::from_secs(1),
                1,
            )
            .await;

        assert_eq!(result, Err(TransportError::Timeout(Duration::from_secs(2))));
    }

    #[tokio::test]
    async fn test_table_fault_injection() {
        let connector = SnapshotConnector::in_memory();
        connector.set_snapshot(
            "dev1",
            Snapshot {
                table_error: Some("version".to_string()),
                ..Snapshot::default()
            },
        );

        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");
        let result = session
            .get_table(&[".1.3"], 10, Duration::from_secs(1), 0)
            .await;

        assert!(matches!(result, Err(TransportError::Version(_))));
    }

    #[tokio::test]
    async fn test_unknown_device_fails_to_open() {
        let connector = SnapshotConnector::in_memory();
        let result = connector
            .open("nope", "10.0.0.1", &ConnectionInfo::default())
            .await;
        assert!(matches!(result, Err(TransportError::Other(_))));
        assert_eq!(connector.log().opened(), 0);
    }

    #[tokio::test]
    async fn test_directory_snapshot_is_reread_on_open() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("dev1.yaml");
        std::fs::write(&path, "values:\n  \".1.2.1\": 5\n").expect("write snapshot");

        let connector = SnapshotConnector::from_dir(dir.path());
        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");
        let values = session
            .get(&[".1.2.1".to_string()], Duration::from_secs(1), 0)
            .await
            .expect("get succeeds");
        assert_eq!(values[".1.2.1"], OidValue::Integer(5));
        session.close();

        std::fs::write(&path, "values:\n  \".1.2.1\": 6\n").expect("rewrite snapshot");
        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");
        let values = session
            .get(&[".1.2.1".to_string()], Duration::from_secs(1), 0)
            .await
            .expect("get succeeds");
        assert_eq!(values[".1.2.1"], OidValue::Integer(6));
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let connector = SnapshotConnector::in_memory();
        connector.set_snapshot("dev1", Snapshot::default());
        let mut session = connector
            .open("dev1", "10.0.0.1", &ConnectionInfo::default())
            .await
            .expect("session opens");

        session.close();
        session.close();

        let log = connector.log();
        assert_eq!(log.opened(), 1);
        assert_eq!(log.closed(), 1);
    }
}
