mod config;
mod reporter;

use anyhow::{Context, Result};
use clap::Parser;
use reporter::{JsonLineReporter, LogReporter};
use sideload_core::{
    BridgePushExecutor, DeviceBridge, DeviceMonitor, StagingArea, StatusReporter,
    TransferCoordinator,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;

/// Retry delays when the device tracking stream dies
const RESTART_BACKOFF_START: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Sideload daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "sideload-daemon")]
#[command(about = "Pushes staged files to every attached device", long_about = None)]
#[command(version)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Staging directory to scan, overriding the configuration
    #[arg(long, value_name = "DIR")]
    staging_dir: Option<PathBuf>,

    /// Bridge program to invoke, overriding the configuration
    #[arg(long, value_name = "PROGRAM")]
    bridge: Option<String>,

    /// Emit status events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,
}

/// Initialize logging based on CLI configuration
fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Main daemon state
struct Daemon {
    /// Configuration
    config: Config,

    /// Transfer engine
    coordinator: TransferCoordinator,

    /// Device tracking stream
    monitor: Arc<DeviceMonitor>,

    /// Set once shutdown begins, so the monitor is not restarted
    shutting_down: Arc<AtomicBool>,

    /// Task forwarding device transitions into the coordinator
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Create a new daemon
    fn new(config: Config, json_events: bool) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to create directories")?;

        let bridge = DeviceBridge::new(&config.bridge.program);
        let executor =
            BridgePushExecutor::new(bridge.clone()).with_idle_timeout(config.push_idle_timeout());

        let reporter: Arc<dyn StatusReporter> = if json_events {
            Arc::new(JsonLineReporter)
        } else {
            Arc::new(LogReporter)
        };

        let coordinator = TransferCoordinator::new(
            StagingArea::new(&config.staging.dir),
            Arc::new(executor),
            reporter,
        );
        let monitor = Arc::new(DeviceMonitor::new(bridge));

        Ok(Self {
            config,
            coordinator,
            monitor,
            shutting_down: Arc::new(AtomicBool::new(false)),
            forwarder: Mutex::new(None),
        })
    }

    /// Start device tracking and keep it alive
    ///
    /// The forwarding task feeds every transition into the coordinator. If
    /// the tracking stream ends while the daemon is still running (bridge
    /// server killed, binary replaced), it is restarted with a growing
    /// delay; a transition arriving resets the delay.
    async fn start_monitoring(&self) -> Result<()> {
        let mut rx = self
            .monitor
            .start()
            .await
            .context("Failed to start device tracking")?;

        let monitor = self.monitor.clone();
        let coordinator = self.coordinator.clone();
        let shutting_down = self.shutting_down.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = RESTART_BACKOFF_START;
            loop {
                while let Some(transition) = rx.recv().await {
                    backoff = RESTART_BACKOFF_START;
                    coordinator.on_device_transition(transition).await;
                }
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }

                warn!("device tracking stream ended, restarting in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }

                monitor.stop().await;
                match monitor.start().await {
                    Ok(new_rx) => rx = new_rx,
                    Err(e) => error!("failed to restart device tracking: {}", e),
                }
            }
        });
        *self.forwarder.lock().await = Some(handle);

        Ok(())
    }

    /// Run the daemon
    async fn run(&self) -> Result<()> {
        info!("sideload daemon running");
        info!("Staging directory: {}", self.config.staging.dir.display());
        info!("Bridge program: {}", self.config.bridge.program);

        self.start_monitoring()
            .await
            .context("Failed to start device monitoring")?;

        self.coordinator
            .start_run()
            .await
            .context("Failed to start transfer run")?;

        info!("Press Ctrl+C to stop");

        // Wait for shutdown signal
        tokio::signal::ctrl_c().await?;

        info!("Received shutdown signal");

        Ok(())
    }

    /// Shutdown the daemon
    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down daemon...");
        self.shutting_down.store(true, Ordering::SeqCst);

        self.coordinator.stop_run().await;
        self.monitor.stop().await;

        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }

        let devices = self.coordinator.devices().await;
        info!(
            "Daemon shutdown complete, {} device(s) still attached",
            devices.len()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    info!("Starting sideload daemon...");

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).context("Failed to load configuration")?,
        None => Config::load().context("Failed to load configuration")?,
    };

    // Apply command-line overrides
    if let Some(dir) = cli.staging_dir {
        config.staging.dir = dir;
    }
    if let Some(program) = cli.bridge {
        config.bridge.program = program;
    }
    let json_events = cli.json_events || config.events.json;

    info!("Configuration loaded");

    // Create daemon
    let daemon = Daemon::new(config, json_events).context("Failed to create daemon")?;

    // Run daemon
    let result = daemon.run().await;

    // Shutdown
    daemon.shutdown().await?;

    result
}
