//! Health check endpoint handler.
//!
//! Returns the collector's internal statistics as a plain-text table.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::sync::atomic::Ordering;
use tracing::{debug, instrument};

use crate::state::SharedState;

// Time conversion constants
const SECONDS_PER_HOUR: f64 = 3600.0;
const MINUTES_PER_HOUR: f64 = 60.0;
const HOURS_PER_DAY: f64 = 24.0;

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    let stats = &state.stats;
    let ok = stats.cycles_ok.load(Ordering::Relaxed);
    let total = stats.cycles_total();

    // Unhealthy only once cycles ran and none of them succeeded
    let (status, message) = if total == 0 {
        (StatusCode::OK, "OK - Waiting for first cycle")
    } else if ok == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "All collection cycles failed")
    } else if ok < total {
        (StatusCode::OK, "OK - Some collection cycles failed")
    } else {
        (StatusCode::OK, "OK")
    };

    let uptime_seconds = stats.get_uptime_seconds();
    let uptime_hours = uptime_seconds as f64 / SECONDS_PER_HOUR;
    let uptime_str = if uptime_hours < 1.0 {
        format!("{:.1} minutes", uptime_hours * MINUTES_PER_HOUR)
    } else if uptime_hours < HOURS_PER_DAY {
        format!("{:.1} hours", uptime_hours)
    } else {
        format!("{:.1} days", uptime_hours / HOURS_PER_DAY)
    };

    let table = stats.render_table(state.store.len());

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{message}\n\nUptime: {uptime_str}\n\n{table}"),
    )
}
