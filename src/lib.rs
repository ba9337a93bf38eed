//! Herakles Process Collector Library
//!
//! Polls the process tables of remote hosts over a table-based management
//! protocol, reconciles them against configured process groups and persists
//! per-group CPU and memory counters.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use herakles_process_collector::{
//!     CollectorStats, DeviceConfig, DeviceStore, LogEventSink, ProcessConfig, ProcessTask,
//!     RecordingMetricSink, SnapshotConnector, TaskContext, TaskOptions,
//! };
//!
//! # async fn run() {
//! let ctx = TaskContext {
//!     connector: Arc::new(SnapshotConnector::from_dir("/var/lib/herakles/snapshots")),
//!     events: Arc::new(LogEventSink),
//!     metrics: Arc::new(RecordingMetricSink::new()),
//!     store: Arc::new(DeviceStore::new()),
//!     stats: Arc::new(CollectorStats::new()),
//!     options: TaskOptions::default(),
//! };
//! let device = DeviceConfig::new(
//!     "web01",
//!     "10.0.0.1",
//!     vec![ProcessConfig::new("httpd", "httpd", "httpd")],
//! );
//! let mut task = ProcessTask::new(device, ctx);
//! let report = task.do_task().await;
//! println!("{:?}", report);
//! # }
//! ```

pub mod capture;
pub mod device;
pub mod error;
pub mod events;
pub mod metrics;
pub mod process;
pub mod stats;
pub mod task;
pub mod transport;

// Re-export main types for convenience
pub use device::{diff_device_configs, ConfigEvent, DeviceConfig, DeviceStats, DeviceStore, GroupId};
pub use error::CollectError;
pub use events::{Event, EventClass, EventSink, LogEventSink, RecordingEventSink, Severity};
pub use metrics::{MetricSample, MetricSink, PrometheusMetricSink, RecordingMetricSink};
pub use process::{ProcessConfig, ProcessEntry, ProcessStats};
pub use stats::CollectorStats;
pub use task::{CycleReport, CycleSummary, ProcessTask, TaskContext, TaskOptions, TaskState};
pub use transport::{ConnectionInfo, Connector, Session, SnapshotConnector, SnmpVersion};
