//! Configuration management for herakles-process-collector.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use ahash::AHashSet as HashSet;
use herakles_process_collector::{DeviceConfig, TaskOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::cli::{Args, ConfigFormat};

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9216;
pub const DEFAULT_CYCLE_INTERVAL: u64 = 300;
pub const DEFAULT_CONFIG_CYCLE_INTERVAL: u64 = 1200;
pub const DEFAULT_SNAPSHOT_DIR: &str = "/var/lib/herakles/snapshots";

const DEFAULT_LOCATIONS: [&str; 6] = [
    "/etc/herakles/process-collector.yaml",
    "/etc/herakles/process-collector.yml",
    "/etc/herakles/process-collector.json",
    "./herakles-process-collector.yaml",
    "./herakles-process-collector.yml",
    "./herakles-process-collector.json",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unable to render configuration: {0}")]
    Render(String),

    #[error("{0}")]
    Invalid(String),
}

/// Collector configuration: server settings, cycle timing and the devices
/// to collect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub enable_health: Option<bool>,

    // Logging
    pub log_level: Option<String>,

    // Scheduling
    /// Seconds between two cycles of one device
    #[serde(alias = "cycle-interval")]
    pub cycle_interval: Option<u64>,
    /// Seconds between two configuration refreshes
    #[serde(alias = "config-cycle-interval")]
    pub config_cycle_interval: Option<u64>,

    // Transport
    /// Directory holding `<device>.{json,yaml}` snapshots
    #[serde(alias = "snapshot-dir")]
    pub snapshot_dir: Option<PathBuf>,

    // Task options
    /// Collector name used on collector-level events
    pub monitor: Option<String>,
    #[serde(alias = "show-procs")]
    pub show_procs: Option<bool>,
    #[serde(alias = "show-raw-tables")]
    pub show_raw_tables: Option<bool>,
    #[serde(alias = "capture-prefix")]
    pub capture_prefix: Option<String>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            enable_health: Some(true),
            log_level: Some("info".into()),
            cycle_interval: Some(DEFAULT_CYCLE_INTERVAL),
            config_cycle_interval: Some(DEFAULT_CONFIG_CYCLE_INTERVAL),
            snapshot_dir: Some(PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            monitor: Some("localhost".into()),
            show_procs: Some(false),
            show_raw_tables: Some(false),
            capture_prefix: None,
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn task_options(&self) -> TaskOptions {
        let defaults = TaskOptions::default();
        TaskOptions {
            monitor: self.monitor.clone().unwrap_or(defaults.monitor),
            show_procs: self.show_procs.unwrap_or(false),
            show_raw_tables: self.show_raw_tables.unwrap_or(false),
            capture_prefix: self.capture_prefix.clone().filter(|p| !p.is_empty()),
        }
    }

    pub fn cycle_interval(&self) -> u64 {
        self.cycle_interval.unwrap_or(DEFAULT_CYCLE_INTERVAL).max(1)
    }

    pub fn config_cycle_interval(&self) -> u64 {
        self.config_cycle_interval
            .unwrap_or(DEFAULT_CONFIG_CYCLE_INTERVAL)
            .max(1)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR))
    }

    /// Keeps only `device` when a device filter is given.
    pub fn retain_device(&mut self, device: Option<&str>) {
        if let Some(device) = device {
            self.devices.retain(|d| d.id == device);
        }
    }
}

/// Validate effective config (used by --check-config, at startup and on refresh)
pub fn validate_effective_config(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.snapshot_dir.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
        return Err(ConfigError::Invalid("snapshot_dir is not set".into()));
    }
    if cfg.cycle_interval == Some(0) {
        return Err(ConfigError::Invalid("cycle_interval must be positive".into()));
    }

    let mut ids = HashSet::new();
    for device in &cfg.devices {
        if device.id.is_empty() {
            return Err(ConfigError::Invalid("device with empty id".into()));
        }
        if !ids.insert(device.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate device id '{}'",
                device.id
            )));
        }
        if device.max_oids_per_request == 0 {
            return Err(ConfigError::Invalid(format!(
                "device '{}': max_oids_per_request must be positive",
                device.id
            )));
        }
        let timeout = device.connection.timeout_seconds;
        if timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
            return Err(ConfigError::Invalid(format!(
                "device '{}': timeout_seconds must be a positive number of seconds, got {}",
                device.id, timeout
            )));
        }

        let mut process_ids = HashSet::new();
        for process in &device.processes {
            if !process_ids.insert(process.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}': duplicate process id '{}'",
                    device.id, process.id
                )));
            }
            if let Err(e) = regex::Regex::new(&process.regex) {
                return Err(ConfigError::Invalid(format!(
                    "device '{}': process '{}' has an invalid regex '{}': {}",
                    device.id, process.id, process.regex, e
                )));
            }
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    // Override with CLI args
    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(cli_port) = args.port {
        config.port = Some(cli_port);
    }
    if args.disable_health {
        config.enable_health = Some(false);
    }

    if let Some(dir) = &args.snapshot_dir {
        config.snapshot_dir = Some(dir.clone());
    }
    if let Some(interval) = args.cycle_interval {
        config.cycle_interval = Some(interval);
    }
    if let Some(interval) = args.config_cycle_interval {
        config.config_cycle_interval = Some(interval);
    }

    if args.show_procs {
        config.show_procs = Some(true);
    }
    if args.show_raw_tables {
        config.show_raw_tables = Some(true);
    }
    if let Some(prefix) = &args.capture_prefix {
        config.capture_prefix = Some(prefix.clone());
    }

    config.retain_device(args.device.as_deref());
    Ok(config)
}

/// First existing default config location.
pub fn default_config_path() -> Option<PathBuf> {
    DEFAULT_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Loads a config file by extension; falls back to the defaults when no
/// file is found.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) if path.exists() => path,
        _ => return Ok(Config::default()),
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.clone(),
        message,
    };

    let config: Config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        Some("toml") => toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
        // Default to YAML
        _ => serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?,
    };
    info!(
        "Loaded configuration with {} device(s) from: {}",
        config.devices.len(),
        path.display()
    );
    Ok(config)
}

pub fn render_config(config: &Config, format: ConfigFormat) -> Result<String, ConfigError> {
    match format {
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Render(e.to_string()))
        }
        ConfigFormat::Toml => {
            toml::to_string_pretty(config).map_err(|e| ConfigError::Render(e.to_string()))
        }
        ConfigFormat::Yaml => {
            serde_yaml::to_string(config).map_err(|e| ConfigError::Render(e.to_string()))
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), ConfigError> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use herakles_process_collector::ProcessConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig::new(id, "10.0.0.1", vec![ProcessConfig::new("httpd", "httpd", "httpd")])
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_effective_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_duplicate_device_ids_rejected() {
        let config = Config {
            devices: vec![device("dev1"), device("dev1")],
            ..Config::default()
        };
        let err = validate_effective_config(&config).expect_err("duplicate ids");
        assert!(err.to_string().contains("duplicate device id"));
    }

    #[test]
    fn test_zero_oid_ceiling_rejected() {
        let mut dev = device("dev1");
        dev.max_oids_per_request = 0;
        let config = Config {
            devices: vec![dev],
            ..Config::default()
        };
        assert!(validate_effective_config(&config).is_err());
    }

    #[test]
    fn test_out_of_range_timeout_rejected() {
        for timeout in [0.0, -1.0, f64::NAN, 1e300] {
            let mut dev = device("dev1");
            dev.connection.timeout_seconds = timeout;
            let config = Config {
                devices: vec![dev],
                ..Config::default()
            };
            let err = validate_effective_config(&config).expect_err("timeout rejected");
            assert!(err.to_string().contains("timeout_seconds"), "{}", err);
        }
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let dev = DeviceConfig::new(
            "dev1",
            "10.0.0.1",
            vec![ProcessConfig::new("broken", "broken", "httpd(")],
        );
        let config = Config {
            devices: vec![dev],
            ..Config::default()
        };
        let err = validate_effective_config(&config).expect_err("invalid regex");
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn test_load_yaml_devices() {
        let mut file = NamedTempFile::with_suffix(".yaml").expect("temp file");
        writeln!(
            file,
            r#"
port: 9300
cycle_interval: 60
snapshot_dir: /tmp/snapshots
devices:
  - id: web01
    manage_ip: 10.0.0.5
    max_oids_per_request: 10
    connection:
      version: v3
      timeout_seconds: 1.5
    processes:
      - id: httpd
        name: httpd
        original_name: httpd
        regex: "^/usr/sbin/httpd"
        restart: true
        severity: error
"#
        )
        .expect("write config");

        let config = load_config(Some(file.path())).expect("valid yaml");
        assert_eq!(config.port, Some(9300));
        assert_eq!(config.cycle_interval(), 60);
        assert_eq!(config.devices.len(), 1);
        let dev = &config.devices[0];
        assert_eq!(dev.max_oids_per_request, 10);
        assert!(dev.processes[0].restart);
        assert!(validate_effective_config(&config).is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/collector.yaml"))).expect("defaults");
        assert_eq!(config.port, Some(DEFAULT_PORT));
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_render_roundtrips_through_yaml() {
        let config = Config {
            devices: vec![device("dev1")],
            ..Config::default()
        };
        let yaml = render_config(&config, ConfigFormat::Yaml).expect("render");
        let parsed: Config = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(parsed.devices, config.devices);
    }
}
