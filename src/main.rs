//! herakles-process-collector
//!
//! Process inventory collector with tracing logging.
//! This is the main entry point that starts the device schedulers, the
//! configuration refresh loop and the HTTP server, and handles subcommands.

mod cli;
mod commands;
mod config;
mod handlers;
mod scheduler;
mod state;

use ahash::AHashSet as HashSet;
use axum::{routing::get, Router};
use clap::Parser;
use herakles_process_collector::{
    diff_device_configs, ConfigEvent, CollectorStats, DeviceConfig, DeviceStore, LogEventSink,
    PrometheusMetricSink, SnapshotConnector, TaskContext,
};
use prometheus::{Gauge, Registry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::TcpListener,
    signal,
    sync::{watch, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn, Level};

use cli::{Args, Commands, LogLevel, LONG_VERSION};
use commands::{command_check, command_config, command_generate_snapshot, command_test};
use config::{
    default_config_path, load_config, resolve_config, show_config, validate_effective_config,
    Config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
};
use handlers::{health_handler, metrics_handler};
use scheduler::Scheduler;
use state::{AppState, SharedState};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    info!("Logging initialized with level: {:?}", args.log_level);
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Drops the exported series of every group that is no longer configured.
fn forget_removed_groups(sink: &PrometheusMetricSink, previous: &[DeviceConfig], next: &[DeviceConfig]) {
    let remaining: HashSet<(&str, &str)> = next
        .iter()
        .flat_map(|d| d.processes.iter().map(move |p| (d.id.as_str(), p.display_name())))
        .collect();
    for device in previous {
        for process in &device.processes {
            let key = (device.id.as_str(), process.display_name());
            if !remaining.contains(&key) {
                debug!("Forgetting series of {}/{}", key.0, key.1);
                sink.forget(key.0, key.1);
            }
        }
    }
}

/// Re-reads the configuration file periodically and turns device changes
/// into scheduler notifications.
async fn config_refresh_loop(
    state: SharedState,
    mut scheduler: Scheduler,
    path: Option<PathBuf>,
    device_filter: Option<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = state.config.read().await.config_cycle_interval();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    // The first tick fires immediately; the initial devices are already running.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(path) = path.as_deref() else {
            continue;
        };
        let mut next = match load_config(Some(path)) {
            Ok(config) => config,
            Err(e) => {
                warn!("Configuration refresh failed: {}", e);
                state.config_refresh_success.set(0.0);
                continue;
            }
        };
        next.retain_device(device_filter.as_deref());
        if let Err(e) = validate_effective_config(&next) {
            warn!("Configuration refresh rejected, keeping previous devices: {}", e);
            state.config_refresh_success.set(0.0);
            continue;
        }
        state.config_refresh_success.set(1.0);

        let current = state.config.read().await.clone();
        let events = diff_device_configs(&current.devices, &next.devices);
        if events.is_empty() {
            debug!("Configuration refresh: no device changes");
            continue;
        }
        info!("Configuration refresh: {} device change(s)", events.len());
        forget_removed_groups(&state.metrics, &current.devices, &next.devices);
        for event in events {
            if let ConfigEvent::Deleted(id) = &event {
                info!("Device {} removed from configuration", id);
            }
            scheduler.apply(event);
        }

        let mut merged = (*current).clone();
        merged.devices = next.devices;
        *state.config.write().await = Arc::new(merged);
    }

    info!("Stopping {} device collection loop(s)", scheduler.len());
    scheduler.shutdown().await;
}

/// Main application entry point.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return Ok(show_config(&config, args.config_format)?);
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        if let Commands::Config {
            output,
            format,
            commented,
        } = command
        {
            return command_config(output.clone(), format.clone(), *commented);
        }

        setup_logging(&args);
        if let Commands::Check { snapshots } = command {
            // Reports validation problems itself instead of exiting early
            return command_check(*snapshots, &resolve_config(&args)?);
        }

        let config = load_validated_config(&args)?;
        return match command {
            Commands::Test {
                iterations,
                verbose,
            } => command_test(*iterations, *verbose, &config).await,
            Commands::GenerateSnapshot {
                output,
                per_group,
                others_count,
            } => command_generate_snapshot(output.clone(), *per_group, *others_count, &config),
            Commands::Config { .. } | Commands::Check { .. } => {
                unreachable!("handled above")
            }
        };
    }

    // Load configuration for main server mode
    let config = load_validated_config(&args)?;
    setup_logging(&args);
    info!("Starting herakles-process-collector {}", LONG_VERSION.as_str());

    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);

    // Initialize Prometheus metrics registry
    let registry = Registry::new();
    debug!("Prometheus registry initialized");

    let metrics = PrometheusMetricSink::new(&registry)?;
    let scrape_duration = Gauge::new(
        "herakles_collector_scrape_duration_seconds",
        "Time spent serving /metrics request",
    )?;
    let devices_total = Gauge::new(
        "herakles_collector_devices_total",
        "Number of devices with process state in the collector",
    )?;
    let config_refresh_success = Gauge::new(
        "herakles_collector_config_refresh_success",
        "Whether the last configuration refresh was accepted (1) or rejected (0)",
    )?;
    registry.register(Box::new(scrape_duration.clone()))?;
    registry.register(Box::new(devices_total.clone()))?;
    registry.register(Box::new(config_refresh_success.clone()))?;
    config_refresh_success.set(1.0);
    debug!("All metrics registered successfully");

    let store = Arc::new(DeviceStore::new());
    let stats = Arc::new(CollectorStats::new());
    let snapshot_dir = config.snapshot_dir();
    if !snapshot_dir.is_dir() {
        warn!(
            "⚠️  Snapshot directory {} does not exist - every cycle will fail until it does",
            snapshot_dir.display()
        );
    }

    let ctx = TaskContext {
        connector: Arc::new(SnapshotConnector::from_dir(snapshot_dir)),
        events: Arc::new(LogEventSink),
        metrics: Arc::new(metrics.clone()),
        store: Arc::clone(&store),
        stats: Arc::clone(&stats),
        options: config.task_options(),
    };

    let mut scheduler = Scheduler::new(ctx, Duration::from_secs(config.cycle_interval()));
    for device in &config.devices {
        scheduler.apply(ConfigEvent::Added(device.clone()));
    }
    info!(
        "✅ Collecting {} device(s) every {}s",
        scheduler.len(),
        config.cycle_interval()
    );

    let state = Arc::new(AppState {
        registry,
        metrics,
        scrape_duration,
        devices_total,
        config_refresh_success,
        config: RwLock::new(Arc::new(config.clone())),
        store,
        stats,
    });

    let config_path = if args.no_config {
        None
    } else {
        args.config.clone().or_else(default_config_path)
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh: JoinHandle<()> = tokio::spawn(config_refresh_loop(
        Arc::clone(&state),
        scheduler,
        config_path,
        args.device.clone(),
        shutdown_rx,
    ));

    // Setup graceful shutdown signal handlers
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!("Failed to install signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    // Configure HTTP server routes
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port).parse()?;
    let mut app = Router::new().route("/metrics", get(metrics_handler));
    if config.enable_health.unwrap_or(true) {
        app = app.route("/health", get(health_handler));
    }
    let app = app.with_state(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;
    info!("🌐 Listening on http://{}", addr);

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal => {}
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = refresh.await {
        error!("Configuration refresh loop ended abnormally: {}", e);
    }
    info!("Server shutdown complete");
    Ok(())
}
