//! CLI arguments and subcommands for herakles-process-collector.

use clap::{Parser, Subcommand, ValueEnum};
use once_cell::sync::Lazy;
use std::net::IpAddr;
use std::path::PathBuf;

/// Version plus the git revision and build date recorded by the build script.
pub static LONG_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{} (git {}, built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown")
    )
});

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "herakles-process-collector",
    about = "Process inventory and performance collector for remote hosts",
    long_about = "Process inventory and performance collector for remote hosts.\n\n\
                  Polls the host-resources process tables of every configured device, tracks \
                  configured process groups across polling cycles (up, missing, restarted) and \
                  exports per-group process count, CPU and memory as Prometheus metrics.",
    version = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION.as_str(),
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Disable /health endpoint
    #[arg(long)]
    pub disable_health: bool,

    /// Directory holding per-device process table snapshots
    #[arg(short = 's', long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Seconds between two collection cycles of a device
    #[arg(long)]
    pub cycle_interval: Option<u64>,

    /// Seconds between two configuration refreshes
    #[arg(long)]
    pub config_cycle_interval: Option<u64>,

    /// Log the parsed process list of every cycle
    #[arg(long)]
    pub show_procs: bool,

    /// Log the raw process tables of every cycle
    #[arg(long)]
    pub show_raw_tables: bool,

    /// Write raw process tables to <PREFIX>-<device>-<serial>
    #[arg(long)]
    pub capture_prefix: Option<String>,

    /// Only collect this device
    #[arg(short = 'd', long)]
    pub device: Option<String>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and device snapshots
    Check {
        /// Also load the snapshot of every configured device
        #[arg(long)]
        snapshots: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Run collection cycles against the snapshots and print the results
    Test {
        /// Number of cycles per device
        #[arg(short = 'n', long, default_value_t = 2)]
        iterations: usize,

        /// Print every event and metric
        #[arg(long)]
        verbose: bool,
    },

    /// Generate synthetic snapshots for the configured devices
    GenerateSnapshot {
        /// Output directory (defaults to the configured snapshot dir)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Processes per configured process group
        #[arg(long, default_value_t = 2)]
        per_group: usize,

        /// Unrelated processes per device
        #[arg(long, default_value_t = 20)]
        others_count: usize,
    },
}
