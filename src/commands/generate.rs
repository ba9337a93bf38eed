//! Generate snapshot command implementation.
//!
//! Writes one synthetic snapshot per configured device so the collector can
//! run without a live agent.

use herakles_process_collector::process::table::{ARGS_TABLE, NAME_TABLE, PATH_TABLE};
use herakles_process_collector::process::{cpu_oid, md5_hex, mem_oid};
use herakles_process_collector::transport::{OidMap, OidValue, Snapshot, TableResult};
use herakles_process_collector::{DeviceConfig, ProcessConfig};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;

const OTHER_NAMES: [&str; 10] = [
    "systemd", "kthreadd", "rsyslogd", "crond", "dbus-daemon", "agetty", "chronyd", "polkitd",
    "udevd", "auditd",
];

const MAX_CPU_CENTISECONDS: i64 = 5_000_000;
const MAX_MEMORY_KB: i64 = 4 * 1024 * 1024;

struct Generated {
    pid: u32,
    name: String,
    path: String,
    args: String,
}

/// Process name and arguments for a member of `config`'s group. The first
/// token of the rule name becomes the process name.
fn process_for_group(config: &ProcessConfig, index: usize) -> (String, String) {
    let name = config
        .display_name()
        .split_whitespace()
        .next()
        .unwrap_or(&config.original_name)
        .to_string();
    let args = if config.ignore_parameters {
        format!("--worker {}", index)
    } else {
        String::new()
    };
    (name, args)
}

fn generate_device(
    device: &DeviceConfig,
    per_group: usize,
    others_count: usize,
    rng: &mut impl Rng,
) -> Snapshot {
    let mut pids = BTreeSet::new();
    let mut procs = Vec::new();
    for group in &device.processes {
        for index in 0..per_group {
            let (name, args) = process_for_group(group, index);
            debug!(
                "{}: {} pid for {} (args digest {})",
                device.id,
                group.id,
                name,
                md5_hex(&args)
            );
            procs.push(Generated {
                pid: unused_pid(&mut pids, rng),
                path: format!("/usr/sbin/{}", name),
                name,
                args,
            });
        }
    }
    for _ in 0..others_count {
        let name = OTHER_NAMES.choose(rng).copied().unwrap_or("init").to_string();
        procs.push(Generated {
            pid: unused_pid(&mut pids, rng),
            path: format!("/usr/bin/{}", name),
            name,
            args: String::new(),
        });
    }

    let mut names = OidMap::new();
    let mut paths = OidMap::new();
    let mut args = OidMap::new();
    let mut values = OidMap::new();
    for p in &procs {
        names.insert(format!("{}.{}", NAME_TABLE, p.pid), OidValue::from(p.name.as_str()));
        paths.insert(format!("{}.{}", PATH_TABLE, p.pid), OidValue::from(p.path.as_str()));
        args.insert(format!("{}.{}", ARGS_TABLE, p.pid), OidValue::from(p.args.as_str()));
        values.insert(
            cpu_oid(p.pid),
            OidValue::from(rng.gen_range(0..MAX_CPU_CENTISECONDS)),
        );
        values.insert(
            mem_oid(p.pid),
            OidValue::from(rng.gen_range(1024..MAX_MEMORY_KB)),
        );
    }

    let mut tables = TableResult::new();
    tables.insert(NAME_TABLE.to_string(), names);
    tables.insert(PATH_TABLE.to_string(), paths);
    tables.insert(ARGS_TABLE.to_string(), args);

    Snapshot {
        values,
        ..Snapshot::from_tables(tables)
    }
}

fn unused_pid(taken: &mut BTreeSet<u32>, rng: &mut impl Rng) -> u32 {
    loop {
        let pid = rng.gen_range(2..65_535u32);
        if taken.insert(pid) {
            return pid;
        }
    }
}

/// Generates one snapshot file per configured device.
pub fn command_generate_snapshot(
    output: Option<PathBuf>,
    per_group: usize,
    others_count: usize,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = output.unwrap_or_else(|| config.snapshot_dir());
    if config.devices.is_empty() {
        return Err("no devices configured".into());
    }
    fs::create_dir_all(&dir)?;

    let mut rng = rand::thread_rng();
    for device in &config.devices {
        let snapshot = generate_device(device, per_group, others_count, &mut rng);
        let path = snapshot_path(&dir, &device.id);
        fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
        info!("Generated snapshot for {}", device.id);
        println!(
            "✅ {}: {} processes written to {}",
            device.id,
            snapshot.tables.get(NAME_TABLE).map_or(0, |t| t.len()),
            path.display()
        );
    }
    Ok(())
}

fn snapshot_path(dir: &Path, device: &str) -> PathBuf {
    dir.join(format!("{}.json", device))
}
