//! Reconciliation of a fresh process listing against the previous cycle.
//!
//! Every observed PID is attributed to at most one configured group:
//! 1. its previous group, if that group still matches with digest checking;
//! 2. its previous group, if it matches without digest checking (agents
//!    truncate long argument strings);
//! 3. the first argument-fingerprinted group matching with digest checking;
//! 4. the first name-only group matching without digest checking.
//!
//! Afterwards every still unmatched group, ordered by name, may claim one
//! leftover PID that matches it without digest checking.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::table::ProcessEntry;
use super::ProcessConfig;
use crate::device::{by_group, DeviceStats, GroupId};

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// New live mapping, to be committed to the device state
    pub pid_to_group: BTreeMap<u32, GroupId>,
    pub after_by_group: BTreeMap<GroupId, Vec<u32>>,
    pub before_by_group: BTreeMap<GroupId, Vec<u32>>,
    pub new_pids: BTreeSet<u32>,
    pub dead_pids: BTreeSet<u32>,
    /// Groups that lost a PID, still have one, and want restart events
    pub restarted: BTreeMap<GroupId, ProcessConfig>,
    /// Groups without any live PID, in declared order
    pub missing: Vec<(GroupId, ProcessConfig)>,
    /// Dead PIDs whose group is still alive, regardless of restart flags
    pub restart_count: usize,
}

impl Reconciliation {
    /// PIDs of `group` that existed before and are gone now.
    pub fn dropped_pids(&self, group: GroupId) -> Vec<u32> {
        let after = self.after_by_group.get(&group);
        self.before_by_group
            .get(&group)
            .map(|before| {
                before
                    .iter()
                    .filter(|pid| after.map(|a| !a.contains(pid)).unwrap_or(true))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Splits groups into argument-fingerprinted and name-only matchers.
fn split_matchers(stats: &DeviceStats) -> (Vec<GroupId>, Vec<GroupId>) {
    let mut with_sums = Vec::new();
    let mut without_args = Vec::new();
    for group_id in stats.group_ids() {
        let Some(group) = stats.group(group_id) else {
            continue;
        };
        if group.config().ignore_parameters {
            without_args.push(group_id);
        } else if group.has_args_fingerprint() {
            with_sums.push(group_id);
        }
    }
    (with_sums, without_args)
}

fn matches(stats: &DeviceStats, group_id: GroupId, entry: &ProcessEntry, use_digest: bool) -> bool {
    stats
        .group(group_id)
        .map(|g| g.matches(Some(&entry.name), &entry.args, use_digest))
        .unwrap_or(false)
}

fn assign_pids(
    stats: &DeviceStats,
    before: &BTreeMap<u32, GroupId>,
    procs: &[ProcessEntry],
) -> BTreeMap<u32, GroupId> {
    let device = stats.device_id();
    let (with_sums, without_args) = split_matchers(stats);
    let mut after: BTreeMap<u32, GroupId> = BTreeMap::new();

    for entry in procs {
        if let Some(&previous) = before.get(&entry.pid) {
            if matches(stats, previous, entry, true) {
                debug!("{}: pid {} still matches {:?} with digest", device, entry.pid, previous);
                after.insert(entry.pid, previous);
                continue;
            }
            if matches(stats, previous, entry, false) {
                debug!("{}: pid {} still matches {:?} without digest", device, entry.pid, previous);
                after.insert(entry.pid, previous);
                continue;
            }
        }

        let found = with_sums
            .iter()
            .find(|g| matches(stats, **g, entry, true))
            .or_else(|| without_args.iter().find(|g| matches(stats, **g, entry, false)));
        if let Some(&group_id) = found {
            debug!("{}: found process {} {} as {:?}", device, entry.pid, entry.name, group_id);
            after.insert(entry.pid, group_id);
        }
    }

    // Digests garbled by the agent: let unmatched groups claim a leftover.
    let matched: BTreeSet<GroupId> = after.values().copied().collect();
    let mut unmatched: Vec<GroupId> = stats
        .group_ids()
        .into_iter()
        .filter(|g| !matched.contains(g))
        .collect();
    unmatched.sort_by(|a, b| {
        let name = |g: &GroupId| stats.group(*g).and_then(|s| s.config().name.clone());
        name(a).cmp(&name(b))
    });
    if !unmatched.is_empty() {
        info!("{}: searching for possible matches for {} groups", device, unmatched.len());
    }
    for group_id in unmatched {
        let claim = procs
            .iter()
            .filter(|entry| !after.contains_key(&entry.pid))
            .find(|entry| matches(stats, group_id, entry, false));
        if let Some(entry) = claim {
            debug!("{}: unmatched group {:?} claims pid {}", device, group_id, entry.pid);
            after.insert(entry.pid, group_id);
        }
    }
    after
}

/// Attributes `procs` to the configured groups of `stats`.
///
/// The only mutation is discarding counter trackers of dead PIDs and of PIDs
/// that moved to another group; the new mapping is returned, not committed.
pub fn reconcile(stats: &mut DeviceStats, procs: &[ProcessEntry]) -> Reconciliation {
    let before = stats.pid_to_group().clone();
    let after = assign_pids(stats, &before, procs);

    let before_pids: BTreeSet<u32> = before.keys().copied().collect();
    let after_pids: BTreeSet<u32> = after.keys().copied().collect();
    let new_pids: BTreeSet<u32> = after_pids.difference(&before_pids).copied().collect();
    let dead_pids: BTreeSet<u32> = before_pids.difference(&after_pids).copied().collect();
    let after_by_group = by_group(&after);

    let mut restarted = BTreeMap::new();
    let mut restart_count = 0;
    for pid in &dead_pids {
        let Some(&group_id) = before.get(pid) else {
            continue;
        };
        let Some(group) = stats.group_mut(group_id) else {
            continue;
        };
        group.discard_pid(*pid);
        if after_by_group.contains_key(&group_id) {
            restart_count += 1;
            if group.config().restart {
                restarted.insert(group_id, group.config().clone());
            }
        }
    }

    // A live PID that changed group no longer belongs to the old tracker.
    for (pid, old_group) in &before {
        match after.get(pid) {
            Some(new_group) if new_group != old_group => {
                debug!("pid {} moved from {:?} to {:?}", pid, old_group, new_group);
                if let Some(group) = stats.group_mut(*old_group) {
                    group.discard_pid(*pid);
                }
            }
            _ => {}
        }
    }

    let missing = stats
        .group_ids()
        .into_iter()
        .filter(|g| !after_by_group.contains_key(g))
        .filter_map(|g| stats.group(g).map(|s| (g, s.config().clone())))
        .collect();

    Reconciliation {
        before_by_group: by_group(&before),
        pid_to_group: after,
        after_by_group,
        new_pids,
        dead_pids,
        restarted,
        missing,
        restart_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::process::md5_hex;

    fn device(processes: Vec<ProcessConfig>) -> DeviceStats {
        DeviceStats::new(&DeviceConfig::new("dev1", "10.0.0.1", processes))
    }

    fn name_only(id: &str, regex: &str) -> ProcessConfig {
        let mut cfg = ProcessConfig::new(id, id, regex);
        cfg.ignore_parameters = true;
        cfg
    }

    #[test]
    fn test_name_only_group_matches_all_instances() {
        let mut stats = device(vec![name_only("httpd", "httpd")]);
        let httpd = stats.group_by_config_id("httpd").expect("group");
        let procs = vec![ProcessEntry::new(101, "httpd", ""), ProcessEntry::new(102, "httpd", "")];

        let result = reconcile(&mut stats, &procs);

        assert_eq!(result.pid_to_group, BTreeMap::from([(101, httpd), (102, httpd)]));
        assert!(result.missing.is_empty());
        assert!(result.restarted.is_empty());
        assert_eq!(result.new_pids, BTreeSet::from([101, 102]));
    }

    #[test]
    fn test_fingerprinted_groups_split_same_regex() {
        let a = ProcessConfig::new("a", &format!("java {}", md5_hex("-jar a.jar")), "java");
        let b = ProcessConfig::new("b", &format!("java {}", md5_hex("-jar b.jar")), "java");
        let mut stats = device(vec![a, b]);
        let ga = stats.group_by_config_id("a").expect("group a");
        let gb = stats.group_by_config_id("b").expect("group b");

        let procs = vec![
            ProcessEntry::new(10, "java", "-jar b.jar"),
            ProcessEntry::new(11, "java", "-jar a.jar"),
        ];
        let result = reconcile(&mut stats, &procs);

        assert_eq!(result.pid_to_group, BTreeMap::from([(10, gb), (11, ga)]));
    }

    #[test]
    fn test_previous_group_kept_when_args_truncated() {
        let a = ProcessConfig::new("a", &format!("java {}", md5_hex("-jar a.jar")), "java");
        let mut stats = device(vec![a]);
        let ga = stats.group_by_config_id("a").expect("group a");
        stats.set_pid_to_group(BTreeMap::from([(10, ga)]));

        let result = reconcile(&mut stats, &[ProcessEntry::new(10, "java", "-jar a.j")]);

        assert_eq!(result.pid_to_group, BTreeMap::from([(10, ga)]));
        assert!(result.new_pids.is_empty());
    }

    #[test]
    fn test_unmatched_group_claims_leftover_once() {
        // fingerprint does not match any observed args
        let a = ProcessConfig::new("a", &format!("java {}", md5_hex("garbled")), "java");
        let mut stats = device(vec![a]);
        let ga = stats.group_by_config_id("a").expect("group a");

        let procs = vec![
            ProcessEntry::new(20, "java", "-jar x.jar"),
            ProcessEntry::new(21, "java", "-jar y.jar"),
        ];
        let result = reconcile(&mut stats, &procs);

        assert_eq!(result.pid_to_group, BTreeMap::from([(20, ga)]));
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_leftover_claimed_in_name_order() {
        let zed = ProcessConfig::new("z", &format!("zed {}", md5_hex("nope")), "worker");
        let alpha = ProcessConfig::new("a", &format!("alpha {}", md5_hex("nope")), "worker");
        let mut stats = device(vec![zed, alpha]);
        let ga = stats.group_by_config_id("a").expect("group a");
        let gz = stats.group_by_config_id("z").expect("group z");

        let result = reconcile(&mut stats, &[ProcessEntry::new(5, "worker", "-x")]);

        assert_eq!(result.pid_to_group, BTreeMap::from([(5, ga)]));
        assert_eq!(result.missing.len(), 1);
        assert_eq!(result.missing[0].0, gz);
    }

    #[test]
    fn test_restart_detected_and_dead_pid_discarded() {
        let mut cfg = name_only("sshd", "sshd");
        cfg.restart = true;
        let mut stats = device(vec![cfg]);
        let g = stats.group_by_config_id("sshd").expect("group");
        stats.group_mut(g).expect("group").update_cpu(101, Some(10));
        stats.set_pid_to_group(BTreeMap::from([(101, g)]));

        let result = reconcile(&mut stats, &[ProcessEntry::new(205, "sshd", "-D")]);

        assert_eq!(result.pid_to_group, BTreeMap::from([(205, g)]));
        assert_eq!(result.dead_pids, BTreeSet::from([101]));
        assert_eq!(result.new_pids, BTreeSet::from([205]));
        assert!(result.restarted.contains_key(&g));
        assert_eq!(result.dropped_pids(g), vec![101]);
        assert_eq!(result.restart_count, 1);
        assert!(result.missing.is_empty());
        let tracked: Vec<u32> = stats.group(g).expect("group").tracked_pids().collect();
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_restart_without_flag_is_counted_not_reported() {
        let mut stats = device(vec![name_only("sshd", "sshd")]);
        let g = stats.group_by_config_id("sshd").expect("group");
        stats.set_pid_to_group(BTreeMap::from([(101, g)]));

        let result = reconcile(&mut stats, &[ProcessEntry::new(205, "sshd", "")]);

        assert!(result.restarted.is_empty());
        assert_eq!(result.restart_count, 1);
    }

    #[test]
    fn test_moved_pid_leaves_previous_group() {
        let mut stats = device(vec![name_only("a", "^worker$"), name_only("b", "^other$")]);
        let a = stats.group_by_config_id("a").expect("group");
        let b = stats.group_by_config_id("b").expect("group");
        stats.group_mut(a).expect("group").update_memory(5, Some(1000));
        stats.group_mut(a).expect("group").update_memory(6, Some(10));
        stats.set_pid_to_group(BTreeMap::from([(5, a), (6, a)]));

        let procs = vec![ProcessEntry::new(5, "other", ""), ProcessEntry::new(6, "worker", "")];
        let result = reconcile(&mut stats, &procs);

        assert_eq!(result.pid_to_group, BTreeMap::from([(5, b), (6, a)]));
        assert!(result.dead_pids.is_empty());
        assert_eq!(result.restart_count, 0);
        let group_a = stats.group(a).expect("group");
        assert_eq!(group_a.tracked_pids().collect::<Vec<_>>(), vec![6]);
        assert_eq!(group_a.memory(), 10);
    }

    #[test]
    fn test_group_without_pids_is_missing() {
        let mut stats = device(vec![name_only("httpd", "httpd"), name_only("cron", "^crond$")]);
        let cron = stats.group_by_config_id("cron").expect("group");

        let result = reconcile(&mut stats, &[ProcessEntry::new(1, "httpd", "")]);

        assert_eq!(result.missing.len(), 1);
        assert_eq!(result.missing[0].0, cron);
        assert_eq!(result.missing[0].1.id, "cron");
    }

    #[test]
    fn test_stable_snapshot_is_idempotent() {
        let mut stats = device(vec![name_only("httpd", "httpd"), name_only("sshd", "sshd")]);
        let procs = vec![
            ProcessEntry::new(1, "httpd", ""),
            ProcessEntry::new(2, "sshd", "-D"),
            ProcessEntry::new(3, "bash", ""),
        ];

        let first = reconcile(&mut stats, &procs);
        stats.set_pid_to_group(first.pid_to_group.clone());
        let second = reconcile(&mut stats, &procs);

        assert_eq!(first.pid_to_group, second.pid_to_group);
        assert!(second.new_pids.is_empty());
        assert!(second.dead_pids.is_empty());
    }
}
