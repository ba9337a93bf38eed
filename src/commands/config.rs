//! Config command implementation.
//!
//! Generates configuration files in various formats.

use herakles_process_collector::{DeviceConfig, ProcessConfig, Severity};
use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::{render_config, Config};

/// Default configuration plus one example device.
pub fn sample_config() -> Config {
    let mut httpd = ProcessConfig::new("httpd", "httpd", "^/usr/sbin/httpd");
    httpd.ignore_parameters = true;
    httpd.restart = true;
    httpd.severity = Severity::Error;

    let mut java = ProcessConfig::new(
        "java-tomcat",
        "java 0d3c8e2bd8b9f6ba3fe0f4a5bb5f7b1c",
        "java.*org\\.apache\\.catalina",
    );
    java.original_name = "tomcat".to_string();

    let sshd = ProcessConfig::new("sshd", "sshd", "sshd");

    Config {
        devices: vec![DeviceConfig::new("web01", "192.0.2.10", vec![httpd, java, sshd])],
        ..Config::default()
    }
}

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = sample_config();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("herakles-process-collector.yaml"),
    };

    let commented = commented && matches!(format, ConfigFormat::Yaml);
    let mut content = render_config(&config, format)?;
    if commented {
        content = add_config_comments(content);
    }

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles Process Collector Configuration
# ========================================
#
# Server Configuration
# --------------------
# bind: "0.0.0.0"              # Bind IP (0.0.0.0 = all interfaces)
# port: 9216                   # HTTP port
# enable_health: true          # Enable /health endpoint
#
# Scheduling
# ----------
# cycle_interval: 300          # Seconds between two cycles of a device
# config_cycle_interval: 1200  # Seconds between two config file reloads
#
# Transport
# ---------
# snapshot_dir: /var/lib/herakles/snapshots   # <device>.json|yaml snapshots
#
# Diagnostics
# -----------
# monitor: localhost           # Device name of collector-level events
# show_procs: false            # Log parsed process list each cycle
# show_raw_tables: false       # Log raw process tables each cycle
# capture_prefix: null         # Write raw tables to <prefix>-<device>-<serial>
#
# Devices
# -------
# id, manage_ip                # Device id and management address
# max_oids_per_request: 40     # OIDs per request (table walks use a third)
# last_model_time              # Shown in "Process not running" events
# connection:                  # version v1|v2c|v3, port, community,
#                              # security_name, timeout_seconds, retries
# processes:                   # One entry per process group:
#   id                         #   stable id, unique per device
#   name                       #   modeled name, optionally "<name> <md5 of args>"
#   original_name              #   name shown in events
#   regex                      #   searched in "<name> <args>"
#   ignore_parameters          #   match the name only
#   restart                    #   send an event when a pid is replaced
#   severity                   #   severity of missing/restart events
#   process_class              #   event key of the group's events
#
"#;
    format!("{}\n{}", comments, yaml)
}
