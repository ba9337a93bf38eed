//! Per-group process metrics and the sinks that persist them.
//!
//! Every sample addresses one stat of one process group on one device; its
//! canonical path is `Devices/<device>/os/processes/<group>/<stat>`.

use prometheus::{GaugeVec, Opts, Registry};
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

/// Number of live PIDs of a group.
pub const STAT_COUNT: &str = "count_count";
/// Cumulative group CPU counter.
pub const STAT_CPU: &str = "cpu_cpu";
/// Summed group memory in bytes.
pub const STAT_MEM: &str = "mem_mem";

/// How a sample is interpreted by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricKind {
    Gauge,
    /// Counter stored as a rate; values below `min` are rejected.
    Derive { min: Option<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub device: String,
    pub process: String,
    pub stat: &'static str,
    pub value: f64,
    pub kind: MetricKind,
}

impl MetricSample {
    pub fn gauge(device: &str, process: &str, stat: &'static str, value: f64) -> Self {
        Self {
            device: device.to_string(),
            process: process.to_string(),
            stat,
            value,
            kind: MetricKind::Gauge,
        }
    }

    pub fn derive(device: &str, process: &str, stat: &'static str, value: f64, min: Option<f64>) -> Self {
        Self {
            kind: MetricKind::Derive { min },
            ..Self::gauge(device, process, stat, value)
        }
    }

    pub fn path(&self) -> String {
        format!(
            "Devices/{}/os/processes/{}/{}",
            self.device, self.process, self.stat
        )
    }

    /// Rejects values the store cannot accept.
    pub fn validate(&self) -> Result<(), MetricError> {
        if !self.value.is_finite() {
            return Err(MetricError::NotFinite { path: self.path() });
        }
        if let MetricKind::Derive { min: Some(min) } = self.kind {
            if self.value < min {
                return Err(MetricError::BelowFloor {
                    path: self.path(),
                    value: self.value,
                    min,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("{path}: value {value} below floor {min}")]
    BelowFloor { path: String, value: f64, min: f64 },

    #[error("{path}: value is not finite")]
    NotFinite { path: String },

    #[error("unknown stat {0}")]
    UnknownStat(String),

    #[error("write rejected for {0}")]
    Rejected(String),

    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Destination of process metrics. Failures are reported, never fatal.
pub trait MetricSink: Send + Sync {
    fn write(&self, sample: &MetricSample) -> Result<(), MetricError>;
}

/// Exposes the latest value of every group stat as prometheus gauges.
#[derive(Clone)]
pub struct PrometheusMetricSink {
    pub process_count: GaugeVec, // labels: device, process
    pub process_cpu: GaugeVec,   // labels: device, process
    pub process_memory_bytes: GaugeVec, // labels: device, process
}

impl PrometheusMetricSink {
    /// Creates and registers the gauges with the registry.
    pub fn new(registry: &Registry) -> Result<Self, MetricError> {
        let process_count = GaugeVec::new(
            Opts::new(
                "herakles_process_group_count",
                "Number of running processes matched by the process group",
            ),
            &["device", "process"],
        )?;
        let process_cpu = GaugeVec::new(
            Opts::new(
                "herakles_process_group_cpu_centiseconds",
                "Cumulative CPU time of the process group (32-bit wrapping counter)",
            ),
            &["device", "process"],
        )?;
        let process_memory_bytes = GaugeVec::new(
            Opts::new(
                "herakles_process_group_memory_bytes",
                "Memory allocated by all processes of the group in bytes",
            ),
            &["device", "process"],
        )?;

        registry.register(Box::new(process_count.clone()))?;
        registry.register(Box::new(process_cpu.clone()))?;
        registry.register(Box::new(process_memory_bytes.clone()))?;

        Ok(Self {
            process_count,
            process_cpu,
            process_memory_bytes,
        })
    }

    /// Drops every series of a process group.
    pub fn forget(&self, device: &str, process: &str) {
        for vec in [&self.process_count, &self.process_cpu, &self.process_memory_bytes] {
            let _ = vec.remove_label_values(&[device, process]);
        }
    }
}

impl MetricSink for PrometheusMetricSink {
    fn write(&self, sample: &MetricSample) -> Result<(), MetricError> {
        sample.validate()?;
        let vec = match sample.stat {
            STAT_COUNT => &self.process_count,
            STAT_CPU => &self.process_cpu,
            STAT_MEM => &self.process_memory_bytes,
            other => return Err(MetricError::UnknownStat(other.to_string())),
        };
        vec.get_metric_with_label_values(&[sample.device.as_str(), sample.process.as_str()])?
            .set(sample.value);
        Ok(())
    }
}

/// Keeps samples in memory; selected paths can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingMetricSink {
    samples: Mutex<Vec<MetricSample>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write to `path` fail with [`MetricError::Rejected`].
    pub fn fail_on(&self, path: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<MetricSample> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Last value written for a group stat.
    pub fn last(&self, device: &str, process: &str, stat: &str) -> Option<f64> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|s| s.device == device && s.process == process && s.stat == stat)
            .map(|s| s.value)
    }
}

impl MetricSink for RecordingMetricSink {
    fn write(&self, sample: &MetricSample) -> Result<(), MetricError> {
        let path = sample.path();
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&path)
        {
            return Err(MetricError::Rejected(path));
        }
        sample.validate()?;
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_path() {
        let sample = MetricSample::gauge("dev1", "httpd", STAT_COUNT, 2.0);
        assert_eq!(sample.path(), "Devices/dev1/os/processes/httpd/count_count");
    }

    #[test]
    fn test_derive_floor_rejected() {
        let sample = MetricSample::derive("dev1", "httpd", STAT_CPU, -1.0, Some(0.0));
        assert!(matches!(sample.validate(), Err(MetricError::BelowFloor { .. })));

        let sample = MetricSample::gauge("dev1", "httpd", STAT_MEM, f64::NAN);
        assert!(matches!(sample.validate(), Err(MetricError::NotFinite { .. })));
    }

    #[test]
    fn test_prometheus_sink_sets_gauges() {
        let registry = Registry::new();
        let sink = PrometheusMetricSink::new(&registry).expect("metrics register");

        sink.write(&MetricSample::gauge("dev1", "httpd", STAT_COUNT, 2.0))
            .expect("write");
        sink.write(&MetricSample::gauge("dev1", "httpd", STAT_MEM, 4096.0))
            .expect("write");

        assert_eq!(
            sink.process_count
                .with_label_values(&["dev1", "httpd"])
                .get(),
            2.0
        );
        let populated = |r: &Registry| {
            r.gather()
                .iter()
                .filter(|f| !f.get_metric().is_empty())
                .count()
        };
        assert_eq!(populated(&registry), 2);

        sink.forget("dev1", "httpd");
        assert_eq!(populated(&registry), 0);
    }

    #[test]
    fn test_recording_sink_failure_injection() {
        let sink = RecordingMetricSink::new();
        sink.fail_on("Devices/dev1/os/processes/httpd/mem_mem");

        assert!(sink
            .write(&MetricSample::gauge("dev1", "httpd", STAT_MEM, 1.0))
            .is_err());
        assert!(sink
            .write(&MetricSample::gauge("dev1", "httpd", STAT_COUNT, 1.0))
            .is_ok());
        assert_eq!(sink.last("dev1", "httpd", STAT_COUNT), Some(1.0));
        assert_eq!(sink.samples().len(), 1);
    }
}
