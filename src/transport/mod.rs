//! Table-query transport used by the collector.
//!
//! The collector never talks to a device directly. It opens a [`Session`]
//! through a [`Connector`] and issues two kinds of requests:
//! - `get_table`: bulk walk of one or more OID subtrees
//! - `get`: point reads of explicit OIDs
//!
//! Both can fail with a typed [`TransportError`]. The SNMP stack proper lives
//! outside this crate; [`snapshot`] provides a replaying implementation used
//! by the daemon's replay mode, the `test` command and the test-suite.

pub mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub use snapshot::{SessionLog, Snapshot, SnapshotConnector};

/// Raw value returned for a single OID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OidValue {
    Integer(i64),
    Text(String),
}

impl OidValue {
    /// Text rendering of the value (integers are formatted in decimal).
    pub fn as_text(&self) -> String {
        match self {
            OidValue::Integer(n) => n.to_string(),
            OidValue::Text(s) => s.clone(),
        }
    }

    /// Interprets the value as an unsigned counter or gauge.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            OidValue::Integer(n) => u64::try_from(*n).ok(),
            OidValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for OidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OidValue::Integer(n) => write!(f, "{}", n),
            OidValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for OidValue {
    fn from(s: &str) -> Self {
        OidValue::Text(s.to_string())
    }
}

impl From<i64> for OidValue {
    fn from(n: i64) -> Self {
        OidValue::Integer(n)
    }
}

/// OID to value mapping returned by `get` and for each walked table.
pub type OidMap = BTreeMap<String, OidValue>;

/// Result of a table walk keyed by the requested table root OID.
pub type TableResult = BTreeMap<String, OidMap>;

/// SNMP protocol version negotiated for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    #[default]
    V2c,
    V3,
}

fn default_port() -> u16 {
    161
}
fn default_community() -> String {
    "public".to_string()
}
fn default_timeout_seconds() -> f64 {
    2.5
}
fn default_retries() -> u32 {
    2
}

/// Session parameters for one device.
///
/// Two sessions are interchangeable exactly when their `ConnectionInfo`
/// compares equal; a changed value forces a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub version: SnmpVersion,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_community")]
    pub community: String,
    /// v3 security name (unused for v1/v2c)
    #[serde(default)]
    pub security_name: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Retries after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            version: SnmpVersion::default(),
            port: default_port(),
            community: default_community(),
            security_name: None,
            timeout_seconds: default_timeout_seconds(),
            retries: default_retries(),
        }
    }
}

impl ConnectionInfo {
    /// Per-request timeout.
    ///
    /// Values that are not positive or do not fit a [`Duration`] fall back to
    /// the default.
    pub fn timeout(&self) -> Duration {
        match Duration::try_from_secs_f64(self.timeout_seconds) {
            Ok(timeout) if !timeout.is_zero() => timeout,
            _ => Duration::from_secs_f64(default_timeout_seconds()),
        }
    }

    /// Upper bound for one request including all retries.
    pub fn deadline(&self) -> Duration {
        self.timeout()
            .saturating_mul(self.retries.saturating_add(1))
    }
}

/// Transport failures surfaced to the collector.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol negotiation failed: {0}")]
    Version(String),

    #[error("{0}")]
    Other(String),
}

/// An open session to one device.
#[async_trait]
pub trait Session: Send {
    /// Walks the given table roots.
    async fn get_table(
        &mut self,
        oids: &[&str],
        max_repetitions: usize,
        timeout: Duration,
        retries: u32,
    ) -> Result<TableResult, TransportError>;

    /// Reads the given OIDs. OIDs the agent has no instance for are absent
    /// from the result.
    async fn get(
        &mut self,
        oids: &[String],
        timeout: Duration,
        retries: u32,
    ) -> Result<OidMap, TransportError>;

    /// Releases the session. Must be idempotent.
    fn close(&mut self);
}

/// Opens sessions to devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        device_id: &str,
        manage_ip: &str,
        connection: &ConnectionInfo,
    ) -> Result<Box<dyn Session>, TransportError>;
}
