//! Per-device collection loops.
//!
//! Every configured device gets one tokio task that runs a cycle on each
//! tick. Configuration changes reach the loop through a watch channel and are
//! only applied between cycles; a running cycle is never cancelled.

use ahash::AHashMap as HashMap;
use herakles_process_collector::{ConfigEvent, DeviceConfig, ProcessTask, TaskContext};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

struct DeviceHandle {
    updates: watch::Sender<Option<DeviceConfig>>,
    join: JoinHandle<()>,
}

/// Owns the collection loop of every device.
pub struct Scheduler {
    ctx: TaskContext,
    cycle_interval: Duration,
    devices: HashMap<String, DeviceHandle>,
}

impl Scheduler {
    pub fn new(ctx: TaskContext, cycle_interval: Duration) -> Self {
        Self {
            ctx,
            cycle_interval,
            devices: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Dispatches one configuration notification.
    pub fn apply(&mut self, event: ConfigEvent) {
        match event {
            ConfigEvent::Added(config) => self.start(config),
            ConfigEvent::Updated(config) => match self.devices.get(&config.id) {
                Some(handle) => {
                    debug!("Device {}: configuration update queued", config.id);
                    if handle.updates.send(Some(config.clone())).is_err() {
                        warn!("Device {}: collection loop is gone, restarting", config.id);
                        self.start(config);
                    }
                }
                None => self.start(config),
            },
            ConfigEvent::Deleted(device_id) => {
                self.ctx.store.apply(&ConfigEvent::Deleted(device_id.clone()));
                if let Some(handle) = self.devices.remove(&device_id) {
                    // The loop notices on its next wake-up and exits after any
                    // cycle already in progress.
                    let _ = handle.updates.send(None);
                    info!("Device {}: collection stopped", device_id);
                }
            }
        }
    }

    fn start(&mut self, config: DeviceConfig) {
        let device_id = config.id.clone();
        let (updates, receiver) = watch::channel(Some(config.clone()));
        let task = ProcessTask::new(config, self.ctx.clone());
        let join = tokio::spawn(run_device(task, receiver, self.cycle_interval));
        info!(
            "Device {}: collecting every {}s",
            device_id,
            self.cycle_interval.as_secs()
        );
        if let Some(previous) = self.devices.insert(device_id, DeviceHandle { updates, join }) {
            let _ = previous.updates.send(None);
        }
    }

    /// Stops every loop and waits for running cycles to finish.
    pub async fn shutdown(&mut self) {
        let handles: Vec<DeviceHandle> = self.devices.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            let _ = handle.updates.send(None);
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!("Collection loop ended abnormally: {}", e);
            }
        }
    }
}

async fn run_device(
    mut task: ProcessTask,
    mut updates: watch::Receiver<Option<DeviceConfig>>,
    cycle_interval: Duration,
) {
    let mut ticker = interval(cycle_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match task.do_task().await {
                    Ok(summary) => debug!(
                        "Device {}: {} processes, {} groups up, {} missing, {} restarted",
                        task.device_id(),
                        summary.processes,
                        summary.groups_up,
                        summary.groups_missing,
                        summary.groups_restarted
                    ),
                    Err(e) => debug!("Device {}: cycle failed ({})", task.device_id(), e.kind()),
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = updates.borrow_and_update().clone();
                match next {
                    Some(config) => {
                        info!("Device {}: configuration updated", config.id);
                        task.update_config(config);
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Device {}: collection loop finished", task.device_id());
}
