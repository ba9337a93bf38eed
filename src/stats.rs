//! Collector self-statistics.
//!
//! Tracks cycle outcomes and timings across all devices, plus the
//! collector-wide restarted/missing counters, for the `/health` endpoint.

use chrono::{DateTime, Local};
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock as StdRwLock};
use std::time::Instant;

use crate::error::CollectError;

/// Running statistics for a single metric.
#[derive(Clone, Copy, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            *self = Self {
                count: 1,
                sum: value,
                min: value,
                max: value,
                last: value,
            };
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

/// Thread-safe wrapper for running statistics.
#[derive(Default)]
pub struct Stat {
    inner: Mutex<RunningStat>,
}

impl Stat {
    pub fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    /// (last, avg, max, min, count)
    pub fn snapshot(&self) -> (f64, f64, f64, f64, u64) {
        if let Ok(s) = self.inner.lock() {
            (s.last, s.avg(), s.max, s.min, s.count)
        } else {
            (0.0, 0.0, 0.0, 0.0, 0)
        }
    }
}

/// Collector-wide counters and timings.
pub struct CollectorStats {
    pub cycle_duration_seconds: Stat,
    pub processes_found: Stat,
    pub cycles_ok: AtomicU64,
    pub cycles_failed: AtomicU64,

    // Failure breakdown
    pub timeouts: AtomicU64,
    pub unsupported: AtomicU64,
    pub version_errors: AtomicU64,
    pub unexpected_errors: AtomicU64,

    pub restarted_total: AtomicU64,
    pub missing_total: AtomicU64,
    pub metric_write_failures: AtomicU64,
    pub single_oid_retries: AtomicU64,
    pub metrics_endpoint_calls: AtomicU64,

    pub start_time: Instant,
    pub last_cycle_time: StdRwLock<Option<DateTime<Local>>>,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self {
            cycle_duration_seconds: Stat::default(),
            processes_found: Stat::default(),
            cycles_ok: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            unsupported: AtomicU64::new(0),
            version_errors: AtomicU64::new(0),
            unexpected_errors: AtomicU64::new(0),
            restarted_total: AtomicU64::new(0),
            missing_total: AtomicU64::new(0),
            metric_write_failures: AtomicU64::new(0),
            single_oid_retries: AtomicU64::new(0),
            metrics_endpoint_calls: AtomicU64::new(0),
            start_time: Instant::now(),
            last_cycle_time: StdRwLock::new(None),
        }
    }
}

impl CollectorStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record_cycle_duration(&self, seconds: f64) {
        self.cycle_duration_seconds.add_sample(seconds);
        if let Ok(mut guard) = self.last_cycle_time.write() {
            *guard = Some(Local::now());
        }
    }

    pub fn record_cycle_success(&self, processes: usize) {
        self.cycles_ok.fetch_add(1, Ordering::Relaxed);
        self.processes_found.add_sample(processes as f64);
    }

    pub fn record_cycle_failure(&self, error: &CollectError) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        let counter = match error {
            CollectError::Timeout(_) => &self.timeouts,
            CollectError::ProtocolUnsupported => &self.unsupported,
            CollectError::ProtocolVersion(_) => &self.version_errors,
            _ => &self.unexpected_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restarted(&self, count: usize) {
        self.restarted_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_missing(&self, count: usize) {
        self.missing_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_metric_write_failure(&self) {
        self.metric_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_single_oid_retries(&self, count: usize) {
        self.single_oid_retries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_metrics_endpoint_call(&self) {
        self.metrics_endpoint_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles_total(&self) -> u64 {
        self.cycles_ok.load(Ordering::Relaxed) + self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn get_cycle_success_rate(&self) -> f64 {
        let ok = self.cycles_ok.load(Ordering::Relaxed);
        let total = self.cycles_total();
        if total == 0 {
            100.0
        } else {
            (ok as f64 / total as f64) * 100.0
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_last_cycle_time_str(&self) -> String {
        match self.last_cycle_time.read() {
            Ok(guard) => guard
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            Err(_) => "N/A".to_string(),
        }
    }

    pub fn render_table(&self, devices: usize) -> String {
        let left_col = 26usize;
        let col_w = 12usize;
        let mut out = String::new();

        let row = |out: &mut String, label: &str, cells: [String; 4]| {
            writeln!(
                out,
                "{:left$} | {:^col$} | {:^col$} | {:^col$} | {:^col$}",
                label,
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                left = left_col,
                col = col_w
            )
            .ok();
        };
        let counter = |v: u64| [v.to_string(), "N/A".into(), "N/A".into(), "N/A".into()];

        writeln!(out, "HEALTH ENDPOINT - COLLECTOR INTERNAL STATS").ok();
        writeln!(out, "==========================================").ok();
        writeln!(out).ok();
        row(
            &mut out,
            "",
            ["current".into(), "average".into(), "max".into(), "min".into()],
        );

        writeln!(out).ok();
        writeln!(out, "CYCLES").ok();
        writeln!(out, "------").ok();

        let (d_cur, d_avg, d_max, d_min, _) = self.cycle_duration_seconds.snapshot();
        row(
            &mut out,
            "cycle_duration (s)",
            [
                format!("{:.3}", d_cur),
                format!("{:.3}", d_avg),
                format!("{:.3}", d_max),
                format!("{:.3}", d_min),
            ],
        );
        let (p_cur, p_avg, p_max, p_min, _) = self.processes_found.snapshot();
        row(
            &mut out,
            "processes_found",
            [
                format!("{:.0}", p_cur),
                format!("{:.1}", p_avg),
                format!("{:.0}", p_max),
                format!("{:.0}", p_min),
            ],
        );
        let rate = format!("{:.1}", self.get_cycle_success_rate());
        row(
            &mut out,
            "cycle_success_rate (%)",
            [rate.clone(), rate.clone(), rate.clone(), rate],
        );
        row(&mut out, "cycles_total", counter(self.cycles_total()));
        row(&mut out, "devices", counter(devices as u64));

        writeln!(out).ok();
        writeln!(out, "FAILURES").ok();
        writeln!(out, "--------").ok();
        row(&mut out, "timeouts", counter(self.timeouts.load(Ordering::Relaxed)));
        row(&mut out, "unsupported_agents", counter(self.unsupported.load(Ordering::Relaxed)));
        row(&mut out, "version_errors", counter(self.version_errors.load(Ordering::Relaxed)));
        row(&mut out, "unexpected_errors", counter(self.unexpected_errors.load(Ordering::Relaxed)));
        row(
            &mut out,
            "metric_write_failures",
            counter(self.metric_write_failures.load(Ordering::Relaxed)),
        );
        row(
            &mut out,
            "single_oid_retries",
            counter(self.single_oid_retries.load(Ordering::Relaxed)),
        );

        writeln!(out).ok();
        writeln!(out, "PROCESSES").ok();
        writeln!(out, "---------").ok();
        row(&mut out, "restarted_total", counter(self.restarted_total.load(Ordering::Relaxed)));
        row(&mut out, "missing_total", counter(self.missing_total.load(Ordering::Relaxed)));

        writeln!(out).ok();
        writeln!(
            out,
            "uptime: {}s | last cycle: {} | /metrics calls: {}",
            self.get_uptime_seconds(),
            self.get_last_cycle_time_str(),
            self.metrics_endpoint_calls.load(Ordering::Relaxed)
        )
        .ok();

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_running_stat() {
        let mut stat = RunningStat::default();
        stat.add(2.0);
        stat.add(4.0);
        stat.add(3.0);
        assert_eq!(stat.avg(), 3.0);
        assert_eq!(stat.min, 2.0);
        assert_eq!(stat.max, 4.0);
        assert_eq!(stat.last, 3.0);
    }

    #[test]
    fn test_failure_breakdown() {
        let stats = CollectorStats::new();
        stats.record_cycle_success(10);
        stats.record_cycle_failure(&CollectError::Timeout(Duration::from_secs(1)));
        stats.record_cycle_failure(&CollectError::ProtocolUnsupported);

        assert_eq!(stats.cycles_total(), 3);
        assert_eq!(stats.timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(stats.unsupported.load(Ordering::Relaxed), 1);
        assert!((stats.get_cycle_success_rate() - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_render_table_sections() {
        let stats = CollectorStats::new();
        stats.record_cycle_duration(0.25);
        stats.record_restarted(2);

        let table = stats.render_table(3);
        assert!(table.contains("CYCLES"));
        assert!(table.contains("restarted_total"));
        assert!(table.contains("0.250"));
        assert_ne!(stats.get_last_cycle_time_str(), "N/A");
    }
}
