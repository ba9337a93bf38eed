//! Per-device process state and the process-wide device store.
//!
//! `DeviceStats` owns one [`ProcessStats`] per configured rule, addressed by
//! an opaque [`GroupId`], plus the PID → group mapping of the last successful
//! cycle. The [`DeviceStore`] keeps one shared `DeviceStats` per device and
//! applies configuration notifications to it.

use ahash::AHashMap as HashMap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::process::{ProcessConfig, ProcessStats};
use crate::transport::ConnectionInfo;

/// Handle of a process group within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u32);

fn default_max_oids() -> usize {
    40
}

/// Device descriptor supplied by the configuration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub manage_ip: String,

    /// Upper bound on OIDs per request
    #[serde(default = "default_max_oids")]
    pub max_oids_per_request: usize,

    /// When the device was last modeled (shown in missing-process events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model_time: Option<String>,

    #[serde(default)]
    pub connection: ConnectionInfo,

    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

impl DeviceConfig {
    pub fn new(id: &str, manage_ip: &str, processes: Vec<ProcessConfig>) -> Self {
        Self {
            id: id.to_string(),
            manage_ip: manage_ip.to_string(),
            max_oids_per_request: default_max_oids(),
            last_model_time: None,
            connection: ConnectionInfo::default(),
            processes,
        }
    }
}

/// Cross-cycle process state of one device.
#[derive(Debug)]
pub struct DeviceStats {
    device_id: String,
    groups: HashMap<GroupId, ProcessStats>,
    /// config id → group, in declared order
    order: Vec<(String, GroupId)>,
    pid_to_group: BTreeMap<u32, GroupId>,
    next_id: u32,
}

impl DeviceStats {
    pub fn new(config: &DeviceConfig) -> Self {
        let mut stats = Self {
            device_id: config.id.clone(),
            groups: HashMap::new(),
            order: Vec::new(),
            pid_to_group: BTreeMap::new(),
            next_id: 0,
        };
        stats.update(config);
        stats
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Applies a new configuration in place.
    ///
    /// Continuing rules keep their counters, new rules get fresh trackers,
    /// removed rules are dropped together with any live PID pointing at them.
    pub fn update(&mut self, config: &DeviceConfig) {
        let mut previous: HashMap<String, GroupId> = self.order.drain(..).collect();
        let mut order = Vec::with_capacity(config.processes.len());

        for process in &config.processes {
            if order.iter().any(|(id, _): &(String, GroupId)| id == &process.id) {
                warn!(
                    "Device {}: duplicate process config id {}, ignoring",
                    self.device_id, process.id
                );
                continue;
            }
            let group_id = match previous.remove(&process.id) {
                Some(group_id) => {
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.update(process.clone());
                    }
                    group_id
                }
                None => {
                    let group_id = GroupId(self.next_id);
                    self.next_id += 1;
                    self.groups
                        .insert(group_id, ProcessStats::new(process.clone()));
                    group_id
                }
            };
            order.push((process.id.clone(), group_id));
        }

        for (config_id, group_id) in previous {
            debug!("Device {}: dropping process group {}", self.device_id, config_id);
            self.groups.remove(&group_id);
        }
        let groups = &self.groups;
        self.pid_to_group.retain(|_, group_id| groups.contains_key(group_id));
        self.order = order;
    }

    pub fn group(&self, id: GroupId) -> Option<&ProcessStats> {
        self.groups.get(&id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut ProcessStats> {
        self.groups.get_mut(&id)
    }

    /// Group ids in declared configuration order.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.order.iter().map(|(_, id)| *id).collect()
    }

    pub fn group_by_config_id(&self, config_id: &str) -> Option<GroupId> {
        self.order
            .iter()
            .find(|(id, _)| id == config_id)
            .map(|(_, group_id)| *group_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live PID → group mapping from the last successful cycle.
    pub fn pid_to_group(&self) -> &BTreeMap<u32, GroupId> {
        &self.pid_to_group
    }

    pub fn pids(&self) -> BTreeSet<u32> {
        self.pid_to_group.keys().copied().collect()
    }

    /// Commits a reconciled mapping. Entries for unknown groups are dropped.
    pub fn set_pid_to_group(&mut self, mapping: BTreeMap<u32, GroupId>) {
        let groups = &self.groups;
        self.pid_to_group = mapping
            .into_iter()
            .filter(|(_, group_id)| groups.contains_key(group_id))
            .collect();
    }
}

/// Inverts a PID mapping into group → sorted PIDs.
pub fn by_group(mapping: &BTreeMap<u32, GroupId>) -> BTreeMap<GroupId, Vec<u32>> {
    let mut groups: BTreeMap<GroupId, Vec<u32>> = BTreeMap::new();
    for (pid, group_id) in mapping {
        groups.entry(*group_id).or_default().push(*pid);
    }
    groups
}

/// Device state shared between the store and running cycles.
pub type SharedDeviceStats = Arc<Mutex<DeviceStats>>;

/// Locks device state. A cycle that panicked while holding the lock leaves
/// consistent data behind (mutations are single assignments), so poisoning
/// is ignored.
pub fn lock_stats(stats: &SharedDeviceStats) -> MutexGuard<'_, DeviceStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration change notification for one device.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    Added(DeviceConfig),
    Updated(DeviceConfig),
    Deleted(String),
}

impl ConfigEvent {
    pub fn device_id(&self) -> &str {
        match self {
            ConfigEvent::Added(config) | ConfigEvent::Updated(config) => &config.id,
            ConfigEvent::Deleted(id) => id,
        }
    }
}

/// Process-wide cache of device state keyed by device id.
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: DashMap<String, SharedDeviceStats>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `config.id`, creating it on first use.
    pub fn get_or_create(&self, config: &DeviceConfig) -> SharedDeviceStats {
        Arc::clone(
            self.devices
                .entry(config.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(DeviceStats::new(config))))
                .value(),
        )
    }

    pub fn get(&self, device_id: &str) -> Option<SharedDeviceStats> {
        self.devices.get(device_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Applies a configuration notification.
    ///
    /// Deleting only unlinks the entry: a cycle still holding the state keeps
    /// it alive until the cycle ends.
    pub fn apply(&self, event: &ConfigEvent) {
        match event {
            ConfigEvent::Added(config) | ConfigEvent::Updated(config) => {
                match self.get(&config.id) {
                    Some(stats) => lock_stats(&stats).update(config),
                    None => {
                        self.get_or_create(config);
                    }
                }
                info!(
                    "Device {}: {} process groups configured",
                    config.id,
                    config.processes.len()
                );
            }
            ConfigEvent::Deleted(device_id) => {
                if self.remove(device_id) {
                    info!("Device {}: state removed", device_id);
                }
            }
        }
    }

    pub fn remove(&self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Known device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

/// Computes the notifications that turn `previous` into `next`.
///
/// Deletions come first, then additions and updates in `next` order.
pub fn diff_device_configs(previous: &[DeviceConfig], next: &[DeviceConfig]) -> Vec<ConfigEvent> {
    let old: HashMap<&str, &DeviceConfig> =
        previous.iter().map(|d| (d.id.as_str(), d)).collect();
    let new_ids: BTreeSet<&str> = next.iter().map(|d| d.id.as_str()).collect();

    let mut events: Vec<ConfigEvent> = previous
        .iter()
        .filter(|d| !new_ids.contains(d.id.as_str()))
        .map(|d| ConfigEvent::Deleted(d.id.clone()))
        .collect();

    for device in next {
        match old.get(device.id.as_str()) {
            None => events.push(ConfigEvent::Added(device.clone())),
            Some(prev) if *prev != device => events.push(ConfigEvent::Updated(device.clone())),
            Some(_) => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(processes: Vec<ProcessConfig>) -> DeviceConfig {
        DeviceConfig::new("dev1", "10.0.0.1", processes)
    }

    #[test]
    fn test_update_preserves_continuing_groups() {
        let mut stats = DeviceStats::new(&device(vec![
            ProcessConfig::new("a", "httpd", "httpd"),
            ProcessConfig::new("b", "sshd", "sshd"),
        ]));
        let a = stats.group_by_config_id("a").expect("group a");
        let b = stats.group_by_config_id("b").expect("group b");
        stats.group_mut(a).expect("group a").update_cpu(1, Some(10));
        stats.group_mut(a).expect("group a").update_cpu(1, Some(25));
        stats.set_pid_to_group(BTreeMap::from([(1, a), (2, b)]));

        stats.update(&device(vec![
            ProcessConfig::new("c", "cron", "cron"),
            ProcessConfig::new("a", "httpd", "^httpd"),
        ]));

        assert_eq!(stats.group_by_config_id("a"), Some(a));
        assert_eq!(stats.group(a).map(|g| g.cpu()), Some(15));
        assert!(stats.group(b).is_none());
        assert_eq!(stats.pid_to_group(), &BTreeMap::from([(1, a)]));

        let c = stats.group_by_config_id("c").expect("group c");
        assert_eq!(stats.group_ids(), vec![c, a]);
        assert_ne!(c, b);
    }

    #[test]
    fn test_duplicate_config_ids_are_ignored() {
        let stats = DeviceStats::new(&device(vec![
            ProcessConfig::new("a", "httpd", "httpd"),
            ProcessConfig::new("a", "nginx", "nginx"),
        ]));
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn test_store_apply_and_deferred_delete() {
        let store = DeviceStore::new();
        let config = device(vec![ProcessConfig::new("a", "httpd", "httpd")]);
        store.apply(&ConfigEvent::Added(config.clone()));
        let held = store.get("dev1").expect("device state");

        let mut updated = config.clone();
        updated.processes.push(ProcessConfig::new("b", "sshd", "sshd"));
        store.apply(&ConfigEvent::Updated(updated));
        assert_eq!(lock_stats(&held).len(), 2);

        store.apply(&ConfigEvent::Deleted("dev1".to_string()));
        assert!(store.get("dev1").is_none());
        assert!(store.is_empty());
        // in-flight holder still sees its state
        assert_eq!(lock_stats(&held).device_id(), "dev1");
    }

    #[test]
    fn test_diff_device_configs() {
        let a = DeviceConfig::new("a", "10.0.0.1", vec![]);
        let b = DeviceConfig::new("b", "10.0.0.2", vec![]);
        let mut b2 = b.clone();
        b2.max_oids_per_request = 10;
        let c = DeviceConfig::new("c", "10.0.0.3", vec![]);

        let events = diff_device_configs(&[a.clone(), b.clone()], &[b2.clone(), c.clone()]);
        assert_eq!(
            events,
            vec![
                ConfigEvent::Deleted("a".to_string()),
                ConfigEvent::Updated(b2),
                ConfigEvent::Added(c),
            ]
        );
        assert!(diff_device_configs(&[a.clone()], &[a]).is_empty());
    }

    #[test]
    fn test_by_group() {
        let g0 = GroupId(0);
        let g1 = GroupId(1);
        let mapping = BTreeMap::from([(5, g1), (3, g0), (9, g1)]);
        let grouped = by_group(&mapping);
        assert_eq!(grouped[&g0], vec![3]);
        assert_eq!(grouped[&g1], vec![5, 9]);
    }
}
