//! HTTP endpoint handlers for the collector.
//!
//! - `/metrics`: Prometheus metrics endpoint
//! - `/health`: Collector statistics

pub mod health;
pub mod metrics;

// Re-export handlers
pub use health::health_handler;
pub use metrics::metrics_handler;
