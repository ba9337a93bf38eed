//! Check command implementation.
//!
//! Validates the configuration and, optionally, every device snapshot.

use herakles_process_collector::process::parse_process_tables;
use herakles_process_collector::transport::Snapshot;

use crate::config::{validate_effective_config, Config};

/// Validates configuration and device snapshots.
pub fn command_check(snapshots: bool, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Herakles Process Collector - Configuration Check");
    println!("===================================================");

    let mut all_ok = true;

    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(()) => println!("   ✅ Configuration valid"),
        Err(e) => {
            println!("   ❌ {}", e);
            all_ok = false;
        }
    }
    for device in &config.devices {
        println!(
            "   • {} [{}]: {} process group(s), {} OIDs per request",
            device.id,
            device.manage_ip,
            device.processes.len(),
            device.max_oids_per_request
        );
    }

    if snapshots {
        let dir = config.snapshot_dir();
        println!("\n📁 Checking snapshots in {}...", dir.display());
        if !dir.is_dir() {
            println!("   ❌ Snapshot directory not found");
            all_ok = false;
        }
        for device in &config.devices {
            let loaded = Snapshot::find(&dir, &device.id).and_then(|path| Snapshot::load(&path));
            match loaded {
                Ok(snapshot) => match parse_process_tables(&snapshot.tables, false) {
                    Ok(procs) => println!("   ✅ {}: {} processes", device.id, procs.len()),
                    Err(e) if snapshot.table_error.is_some() => println!(
                        "   ⚠️  {}: {} (fault injected: {})",
                        device.id,
                        e,
                        snapshot.table_error.as_deref().unwrap_or_default()
                    ),
                    Err(e) => {
                        println!("   ❌ {}: {}", device.id, e);
                        all_ok = false;
                    }
                },
                Err(e) => {
                    println!("   ❌ {}: {}", device.id, e);
                    all_ok = false;
                }
            }
        }
    }

    println!();
    if all_ok {
        println!("✅ All checks passed");
        Ok(())
    } else {
        Err("one or more checks failed".into())
    }
}
