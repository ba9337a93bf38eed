//! Test command implementation.
//!
//! Runs collection cycles against the snapshot directory with in-memory
//! sinks and prints what a live run would have emitted.

use herakles_process_collector::{
    CollectorStats, DeviceStore, ProcessTask, RecordingEventSink, RecordingMetricSink,
    SnapshotConnector, TaskContext,
};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;

/// Runs `iterations` cycles per configured device.
pub async fn command_test(
    iterations: usize,
    verbose: bool,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 Herakles Process Collector - Test Mode");
    println!("=========================================");

    if config.devices.is_empty() {
        return Err("no devices configured".into());
    }

    let events = Arc::new(RecordingEventSink::new());
    let metrics = Arc::new(RecordingMetricSink::new());
    let stats = Arc::new(CollectorStats::new());
    let ctx = TaskContext {
        connector: Arc::new(SnapshotConnector::from_dir(config.snapshot_dir())),
        events: events.clone(),
        metrics: metrics.clone(),
        store: Arc::new(DeviceStore::new()),
        stats: stats.clone(),
        options: config.task_options(),
    };

    for device in &config.devices {
        println!("\n🖥️  Device {} [{}]", device.id, device.manage_ip);
        let mut task = ProcessTask::new(device.clone(), ctx.clone());

        for iteration in 1..=iterations {
            let start = Instant::now();
            let report = task.do_task().await;
            let elapsed = start.elapsed();
            let events = events.take();
            let samples = metrics.take();

            match &report {
                Ok(summary) => println!(
                    "   🔄 Cycle {}/{}: {} processes, {} up, {} missing, {} restarted, {} metrics ({} failed), {} single-OID retries in {:.2}ms",
                    iteration,
                    iterations,
                    summary.processes,
                    summary.groups_up,
                    summary.groups_missing,
                    summary.groups_restarted,
                    summary.metrics_written,
                    summary.metric_failures,
                    summary.single_oid_retries,
                    elapsed.as_secs_f64() * 1000.0
                ),
                Err(e) => println!(
                    "   ❌ Cycle {}/{}: {} ({})",
                    iteration,
                    iterations,
                    e,
                    e.kind()
                ),
            }

            if verbose {
                for event in &events {
                    println!(
                        "      📣 [{}] {:<8} {}",
                        event.event_class, event.severity, event.summary
                    );
                }
                for sample in &samples {
                    println!("      📈 {} = {}", sample.path(), sample.value);
                }
            } else {
                println!(
                    "      {} event(s), {} metric sample(s)",
                    events.len(),
                    samples.len()
                );
            }
        }
    }

    println!("\n{}", stats.render_table(config.devices.len()));
    Ok(())
}
