//! One polling cycle for one device.
//!
//! A cycle walks the states `CONNECTING → SCANNING_PROCESSES →
//! PARSING_TABLE_DATA → FETCH_PERF_DATA → STORE_PERF_DATA` and always ends
//! in `IDLE` with the session closed. Failures before reconciliation leave the
//! device state untouched; failures of single perf batches are retried one
//! OID at a time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::CaptureWriter;
use crate::device::{by_group, lock_stats, DeviceConfig, DeviceStore, GroupId, SharedDeviceStats};
use crate::error::CollectError;
use crate::events::{Event, EventClass, EventSink, Severity};
use crate::metrics::{MetricSample, MetricSink, STAT_COUNT, STAT_CPU, STAT_MEM};
use crate::process::table::NAME_TABLE;
use crate::process::{
    counter_value, cpu_oid, mem_oid, parse_process_tables, reconcile, ProcessEntry, Reconciliation,
    PROCESS_TABLES,
};
use crate::stats::CollectorStats;
use crate::transport::{ConnectionInfo, Connector, OidMap, Session, SnmpVersion, TableResult};

/// Agent name on clear events.
pub const AGENT_NAME: &str = "herakles-process-collector";

const EVENT_GROUP: &str = "Process";
const KEY_RESOURCE_MIB: &str = "resource_mib";
const KEY_SCAN_TIMEOUT: &str = "table_scan_timeout";
const KEY_SCAN_V3: &str = "table_scan_v3_error";

/// Where a task currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Connecting,
    ScanningProcesses,
    ParsingTableData,
    FetchPerfData,
    StorePerfData,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "IDLE",
            TaskState::Connecting => "CONNECTING",
            TaskState::ScanningProcesses => "SCANNING_PROCESSES",
            TaskState::ParsingTableData => "PARSING_TABLE_DATA",
            TaskState::FetchPerfData => "FETCH_PERF_DATA",
            TaskState::StorePerfData => "STORE_PERF_DATA",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_monitor() -> String {
    "localhost".to_string()
}

/// Collector-wide knobs shared by every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Name of this collector, used as device of collector-level events
    #[serde(default = "default_monitor")]
    pub monitor: String,
    /// Log the parsed process list of every cycle
    #[serde(default)]
    pub show_procs: bool,
    /// Log the raw process tables of every cycle
    #[serde(default)]
    pub show_raw_tables: bool,
    /// Write raw table captures to `<prefix>-<device>-<serial>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_prefix: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            monitor: default_monitor(),
            show_procs: false,
            show_raw_tables: false,
            capture_prefix: None,
        }
    }
}

/// Collaborators shared by all tasks.
#[derive(Clone)]
pub struct TaskContext {
    pub connector: Arc<dyn Connector>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<dyn MetricSink>,
    pub store: Arc<DeviceStore>,
    pub stats: Arc<CollectorStats>,
    pub options: TaskOptions,
}

/// Outcome of a successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub processes: usize,
    pub groups_up: usize,
    pub groups_missing: usize,
    pub groups_restarted: usize,
    pub metrics_written: usize,
    pub metric_failures: usize,
    pub single_oid_retries: usize,
}

pub type CycleReport = Result<CycleSummary, CollectError>;

/// Labels of one group, copied out of the device state for event emission.
struct GroupLabels {
    name: String,
    original_name: String,
    regex: String,
    process_class: String,
}

/// Scheduled collection task of one device.
pub struct ProcessTask {
    config: DeviceConfig,
    ctx: TaskContext,
    device_stats: SharedDeviceStats,
    state: TaskState,
    session: Option<Box<dyn Session>>,
    session_info: Option<ConnectionInfo>,
    capture: Option<CaptureWriter>,
}

impl ProcessTask {
    /// Creates the task and brings the device state in line with `config`.
    pub fn new(config: DeviceConfig, ctx: TaskContext) -> Self {
        let device_stats = ctx.store.get_or_create(&config);
        lock_stats(&device_stats).update(&config);
        let capture = ctx
            .options
            .capture_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(CaptureWriter::new);
        Self {
            config,
            ctx,
            device_stats,
            state: TaskState::Idle,
            session: None,
            session_info: None,
            capture,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Shared state this task reads and writes.
    pub fn device_stats(&self) -> SharedDeviceStats {
        Arc::clone(&self.device_stats)
    }

    /// Swaps in a new device configuration between cycles.
    pub fn update_config(&mut self, config: DeviceConfig) {
        if self.session_info.as_ref() != Some(&config.connection) {
            self.close_session();
        }
        lock_stats(&self.device_stats).update(&config);
        self.config = config;
    }

    fn set_state(&mut self, state: TaskState) {
        debug!("{}: {} -> {}", self.config.id, self.state, state);
        self.state = state;
    }

    /// Runs one full cycle. The session is closed on every path.
    #[instrument(skip(self), fields(device = %self.config.id))]
    pub async fn do_task(&mut self) -> CycleReport {
        let started = Instant::now();

        let result = match self.open_session().await {
            Ok(()) => {
                debug!("Opened session to {} [{}]", self.config.id, self.config.manage_ip);
                self.collect().await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(summary) => {
                debug!("Device {} [{}] scanned successfully", self.config.id, self.config.manage_ip);
                self.ctx.stats.record_cycle_success(summary.processes);
            }
            Err(e) => {
                self.send_scan_error(e);
                self.ctx.stats.record_cycle_failure(e);
            }
        }

        self.finished();
        self.ctx
            .stats
            .record_cycle_duration(started.elapsed().as_secs_f64());
        result
    }

    /// Opens a session unless an equivalent one is already open.
    async fn open_session(&mut self) -> Result<(), CollectError> {
        self.set_state(TaskState::Connecting);
        let connection = self.config.connection.clone();
        if self.session.is_some() && self.session_info.as_ref() == Some(&connection) {
            return Ok(());
        }
        self.close_session();

        let deadline = connection.deadline();
        let opened = tokio::time::timeout(
            deadline,
            self.ctx
                .connector
                .open(&self.config.id, &self.config.manage_ip, &connection),
        )
        .await;
        let session = match opened {
            Ok(result) => result?,
            Err(_) => return Err(CollectError::Timeout(deadline)),
        };
        self.session = Some(session);
        self.session_info = Some(connection);
        Ok(())
    }

    async fn collect(&mut self) -> CycleReport {
        debug!("Scanning for processes from {} [{}]", self.config.id, self.config.manage_ip);
        self.set_state(TaskState::ScanningProcesses);
        let tables = self.get_tables().await?;

        let summary = format!("Process table up for device {}", self.config.id);
        self.clear_snmp_error(&format!("{} - timeout cleared", summary), Some(KEY_SCAN_TIMEOUT));
        if self.config.connection.version == SnmpVersion::V3 {
            self.clear_snmp_error(&format!("{} - v3 error cleared", summary), Some(KEY_SCAN_V3));
        }

        let mut report = self.process_tables(&tables)?;
        self.clear_snmp_error(&summary, None);

        let results = self.fetch_perf(&mut report).await?;
        self.store_perf(&results, &mut report);
        Ok(report)
    }

    /// Parses the tables, reconciles, commits the mapping and emits process
    /// events and count metrics.
    fn process_tables(&mut self, tables: &TableResult) -> CycleReport {
        self.set_state(TaskState::ParsingTableData);
        let procs = parse_process_tables(tables, self.ctx.options.show_raw_tables)?;

        if let Some(capture) = &self.capture {
            match capture.write(&self.config.id, tables) {
                Ok(path) => info!("Captured process tables of {} to {}", self.config.id, path.display()),
                Err(e) => warn!("Unable to capture process tables of {}: {}", self.config.id, e),
            }
        }
        if self.ctx.options.show_procs {
            self.show_process_list(&procs);
        }
        self.clear_snmp_error(
            &format!("Process table up for device {}", self.config.id),
            Some(KEY_RESOURCE_MIB),
        );

        let (result, names, groups) = {
            let mut stats = lock_stats(&self.device_stats);
            let result = reconcile(&mut stats, &procs);
            stats.set_pid_to_group(result.pid_to_group.clone());
            let groups = stats.group_ids();
            let names: BTreeMap<GroupId, GroupLabels> = groups
                .iter()
                .filter_map(|g| {
                    stats.group(*g).map(|s| {
                        let c = s.config();
                        let labels = GroupLabels {
                            name: c.display_name().to_string(),
                            original_name: c.original_name.clone(),
                            regex: c.regex.clone(),
                            process_class: c.process_class.clone(),
                        };
                        (*g, labels)
                    })
                })
                .collect();
            (result, names, groups)
        };

        self.ctx.stats.record_restarted(result.restart_count);
        self.ctx.stats.record_missing(result.missing.len());

        self.send_restart_events(&result);
        self.send_found_events(&result, &names);
        for pid in &result.new_pids {
            if let Some(labels) = result.pid_to_group.get(pid).and_then(|g| names.get(g)) {
                debug!(
                    "Found new {} {} pid {} on {}",
                    labels.original_name, labels.name, pid, self.config.id
                );
            }
        }
        self.send_missing_events(&result);

        let mut report = CycleSummary {
            processes: procs.len(),
            groups_up: result.after_by_group.len(),
            groups_missing: result.missing.len(),
            groups_restarted: result.restarted.len(),
            ..CycleSummary::default()
        };
        for group_id in groups {
            let Some(labels) = names.get(&group_id) else {
                continue;
            };
            let count = result
                .after_by_group
                .get(&group_id)
                .map(Vec::len)
                .unwrap_or(0);
            self.save(
                MetricSample::gauge(&self.config.id, &labels.name, STAT_COUNT, count as f64),
                &mut report,
            );
        }
        Ok(report)
    }

    /// Reads CPU and memory of every live PID in chunks of the device's OID
    /// ceiling. Chunks failing with a timeout or negotiation error are retried
    /// one OID at a time; that downgrade lasts for the rest of the cycle.
    async fn fetch_perf(&mut self, report: &mut CycleSummary) -> Result<OidMap, CollectError> {
        self.set_state(TaskState::FetchPerfData);
        let pids = lock_stats(&self.device_stats).pids();
        let mut pending: Vec<String> = pids
            .iter()
            .flat_map(|pid| [cpu_oid(*pid), mem_oid(*pid)])
            .collect();

        let mut results = OidMap::new();
        let mut chunk_size = self.config.max_oids_per_request.max(1);
        while !pending.is_empty() {
            let mut failed = Vec::new();
            for chunk in pending.chunks(chunk_size) {
                debug!("{} fetching oid(s) {:?}", self.config.id, chunk);
                match self.get(chunk).await {
                    Ok(values) => results.extend(values),
                    Err(e @ (CollectError::Timeout(_) | CollectError::ProtocolVersion(_))) => {
                        debug!("Error reading oid(s) {:?}: {}", chunk, e);
                        failed.extend_from_slice(chunk);
                    }
                    Err(e) => return Err(e),
                }
            }

            if failed.is_empty() || chunk_size == 1 {
                if !failed.is_empty() {
                    warn!("{}: no values for oid(s) {:?}", self.config.id, failed);
                }
                break;
            }
            chunk_size = 1;
            debug!("Running oids for {} in single mode {:?}", self.config.id, failed);
            report.single_oid_retries += failed.len();
            self.ctx.stats.record_single_oid_retries(failed.len());
            pending = failed;
        }
        Ok(results)
    }

    /// Folds the fetched samples into the group counters and writes CPU and
    /// memory metrics for every group with live PIDs.
    fn store_perf(&mut self, results: &OidMap, report: &mut CycleSummary) {
        self.set_state(TaskState::StorePerfData);
        let mut samples = Vec::new();
        {
            let mut stats = lock_stats(&self.device_stats);
            for (group_id, pids) in by_group(stats.pid_to_group()) {
                let Some(group) = stats.group_mut(group_id) else {
                    continue;
                };
                if pids.len() != 1 {
                    debug!(
                        "There are {} pids by the name {}",
                        pids.len(),
                        group.config().display_name()
                    );
                }
                let mut sampled = 0;
                for pid in &pids {
                    let cpu_key = cpu_oid(*pid);
                    let mem_key = mem_oid(*pid);
                    let cpu = counter_value(&cpu_key, results.get(&cpu_key));
                    let mem = counter_value(&mem_key, results.get(&mem_key));
                    if cpu.is_some() || mem.is_some() {
                        sampled += 1;
                    }
                    group.update_cpu(*pid, cpu);
                    group.update_memory(*pid, mem);
                }

                let name = group.config().display_name().to_string();
                if sampled == 0 {
                    let e = CollectError::MalformedData(format!(
                        "no samples for {} pid(s) of {}",
                        pids.len(),
                        name
                    ));
                    warn!("{}: {}", self.config.id, e);
                    continue;
                }
                samples.push(MetricSample::derive(
                    &self.config.id,
                    &name,
                    STAT_CPU,
                    group.cpu() as f64,
                    Some(0.0),
                ));
                samples.push(MetricSample::gauge(
                    &self.config.id,
                    &name,
                    STAT_MEM,
                    group.memory().saturating_mul(1024) as f64,
                ));
            }
        }

        for sample in samples {
            self.save(sample, report);
        }
    }

    async fn get_tables(&mut self) -> Result<TableResult, CollectError> {
        let repetitions = (self.config.max_oids_per_request / PROCESS_TABLES.len()).max(1);
        let connection = &self.config.connection;
        let (timeout, retries, deadline) = (connection.timeout(), connection.retries, connection.deadline());
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CollectError::Unexpected("no open session".to_string()))?;

        match tokio::time::timeout(
            deadline,
            session.get_table(&PROCESS_TABLES, repetitions, timeout, retries),
        )
        .await
        {
            Ok(result) => result.map_err(CollectError::from),
            Err(_) => Err(CollectError::Timeout(deadline)),
        }
    }

    async fn get(&mut self, oids: &[String]) -> Result<OidMap, CollectError> {
        let connection = &self.config.connection;
        let (timeout, retries, deadline) = (connection.timeout(), connection.retries, connection.deadline());
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CollectError::Unexpected("no open session".to_string()))?;

        match tokio::time::timeout(deadline, session.get(oids, timeout, retries)).await {
            Ok(result) => result.map_err(CollectError::from),
            Err(_) => Err(CollectError::Timeout(deadline)),
        }
    }

    /// Writes one metric; failures become critical collector events.
    fn save(&self, sample: MetricSample, report: &mut CycleSummary) {
        let source = match self.ctx.metrics.write(&sample) {
            Ok(()) => {
                report.metrics_written += 1;
                return;
            }
            Err(source) => source,
        };

        let path = sample.path();
        let summary = format!("Unable to save data for process-monitor metric {}", path);
        let message = format!("Data was value={}, type={:?}", sample.value, sample.kind);
        let e = CollectError::MetricWrite { path, source };
        error!("{}: {}", summary, e);
        error!("{}", message);

        report.metric_failures += 1;
        self.ctx.stats.record_metric_write_failure();
        let monitor = &self.ctx.options.monitor;
        self.ctx.events.send(
            Event::new(EventClass::Perf, monitor, summary, Severity::Critical)
                .with_dedup_id(format!("{}|metric write failure", monitor))
                .with_component("metrics")
                .with_message(format!("{}\n{}", message, e)),
        );
    }

    fn status_event(&self, summary: String, message: String, component: &str, key: &str, severity: Severity) -> Event {
        Event::new(EventClass::OsProcess, &self.config.id, summary, severity)
            .with_group(EVENT_GROUP)
            .with_message(message)
            .with_component(component)
            .with_key(key)
    }

    fn send_restart_events(&self, result: &Reconciliation) {
        for (group_id, config) in &result.restarted {
            let dropped = result.dropped_pids(*group_id);
            let current = result
                .after_by_group
                .get(group_id)
                .cloned()
                .unwrap_or_default();
            let summary = format!("Process restarted: {}", config.original_name);
            let message = format!(
                "{}\n Using regex '{}' Discarded dead pid(s) {:?} Using new pid(s) {:?}",
                summary, config.regex, dropped, current
            );
            info!("({}) {}", self.config.id, message);
            self.ctx.events.send(self.status_event(
                summary,
                message,
                &config.original_name,
                &config.process_class,
                config.severity,
            ));
        }
    }

    fn send_found_events(
        &self,
        result: &Reconciliation,
        names: &BTreeMap<GroupId, GroupLabels>,
    ) {
        for (group_id, pids) in &result.after_by_group {
            if result.restarted.contains_key(group_id) {
                continue;
            }
            let Some(labels) = names.get(group_id) else {
                continue;
            };
            let summary = format!("Process up: {}", labels.original_name);
            let message = format!(
                "{}\n Using regex '{}' with pid's {:?}",
                summary, labels.regex, pids
            );
            debug!("({}) {}", self.config.id, message);
            self.ctx.events.send(self.status_event(
                summary,
                message,
                &labels.original_name,
                &labels.process_class,
                Severity::Clear,
            ));
        }
    }

    fn send_missing_events(&self, result: &Reconciliation) {
        let model_time = self
            .config
            .last_model_time
            .as_deref()
            .unwrap_or("unknown");
        for (_, config) in &result.missing {
            let summary = format!("Process not running: {}", config.original_name);
            let message = format!(
                "{}\n   Using regex '{}'\n   All processes have stopped since the last model occurred. Last modification time ({})",
                summary, config.regex, model_time
            );
            warn!("({}) {}", self.config.id, message);
            self.ctx.events.send(self.status_event(
                summary,
                message,
                &config.original_name,
                &config.process_class,
                config.severity,
            ));
        }
    }

    /// Maps a cycle failure to its protocol-health event.
    fn send_scan_error(&self, e: &CollectError) {
        let device = &self.config.id;
        let scan_error = format!("Unable to read processes on device {}", device);
        let event = match e {
            CollectError::ProtocolUnsupported => {
                let summary = format!("Device {} does not publish HOST-RESOURCES-MIB", device);
                warn!("{}", summary);
                self.snmp_event(summary, Severity::Error, Some(KEY_RESOURCE_MIB))
                    .with_resolution(format!("Verify with snmpwalk {} {}", device, NAME_TABLE))
            }
            CollectError::Timeout(_) => {
                debug!("Timeout fetching tables on device {}", device);
                self.snmp_event(
                    format!("{}; Timeout on device", scan_error),
                    Severity::Error,
                    Some(KEY_SCAN_TIMEOUT),
                )
            }
            CollectError::ProtocolVersion(msg) => {
                let msg = format!("Cannot connect to SNMP agent on {}: {}", device, msg);
                debug!("{}", msg);
                self.snmp_event(
                    format!("{}; {}", scan_error, msg),
                    Severity::Error,
                    Some(KEY_SCAN_V3),
                )
            }
            other => {
                error!("Unexpected error on device {}: {:?}", device, other);
                self.snmp_event(format!("{}; error: {}", scan_error, other), Severity::Error, None)
            }
        };
        self.ctx.events.send(event);
    }

    fn snmp_event(&self, summary: String, severity: Severity, key: Option<&str>) -> Event {
        let event = Event::new(EventClass::Snmp, &self.config.id, summary, severity).with_group(EVENT_GROUP);
        match key {
            Some(key) => event.with_key(key),
            None => event,
        }
    }

    fn clear_snmp_error(&self, summary: &str, key: Option<&str>) {
        self.ctx.events.send(
            self.snmp_event(summary.to_string(), Severity::Clear, key)
                .with_agent(AGENT_NAME),
        );
    }

    fn show_process_list(&self, procs: &[ProcessEntry]) {
        let list: Vec<String> = procs
            .iter()
            .map(|p| format!("{} {} {}", p.pid, p.name, p.args))
            .collect();
        info!("#===== Processes on {}:\n{}\n", self.config.id, list.join("\n"));
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.session_info = None;
    }

    /// Terminal cleanup of every cycle.
    fn finished(&mut self) {
        self.close_session();
        self.set_state(TaskState::Idle);
    }
}

impl Drop for ProcessTask {
    fn drop(&mut self) {
        self.close_session();
    }
}
