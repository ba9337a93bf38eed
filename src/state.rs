//! Application state management for the collector.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers and used by the configuration refresh loop.

use herakles_process_collector::{CollectorStats, DeviceStore, PrometheusMetricSink};
use prometheus::{Gauge, Registry};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Global application state shared across requests and background tasks.
pub struct AppState {
    pub registry: Registry,
    pub metrics: PrometheusMetricSink,
    pub scrape_duration: Gauge,
    pub devices_total: Gauge,
    pub config_refresh_success: Gauge,
    /// Latest accepted configuration.
    pub config: RwLock<Arc<Config>>,
    pub store: Arc<DeviceStore>,
    pub stats: Arc<CollectorStats>,
}
