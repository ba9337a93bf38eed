//! Error taxonomy of one collection cycle.

use std::time::Duration;

use crate::metrics::MetricError;
use crate::transport::TransportError;

/// Why a cycle (or one of its steps) failed.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The agent returned no process name table.
    #[error("agent does not publish HOST-RESOURCES-MIB")]
    ProtocolUnsupported,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("protocol negotiation failed: {0}")]
    ProtocolVersion(String),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("failed to write metric {path}: {source}")]
    MetricWrite {
        path: String,
        #[source]
        source: MetricError,
    },

    #[error("{0}")]
    Unexpected(String),
}

impl CollectError {
    /// Short label used for logging and collector statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectError::ProtocolUnsupported => "unsupported",
            CollectError::Timeout(_) => "timeout",
            CollectError::ProtocolVersion(_) => "version",
            CollectError::MalformedData(_) => "malformed",
            CollectError::MetricWrite { .. } => "metric_write",
            CollectError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<TransportError> for CollectError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => CollectError::Timeout(d),
            TransportError::Version(msg) => CollectError::ProtocolVersion(msg),
            TransportError::Other(msg) => CollectError::Unexpected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_cycle_errors() {
        let e: CollectError = TransportError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(e, CollectError::Timeout(d) if d == Duration::from_secs(3)));

        let e: CollectError = TransportError::Version("usm".to_string()).into();
        assert_eq!(e.kind(), "version");

        let e: CollectError = TransportError::Other("refused".to_string()).into();
        assert_eq!(e.to_string(), "refused");
    }
}
