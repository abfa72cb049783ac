pub mod aggregator;     // Device snapshot and derived totals
pub mod channels;       // Inter-component communication channels
pub mod config;         // Configuration management
pub mod coordinator;    // Frame ingestion, single writer of device state
pub mod datalog_writer; // Snapshot logging to a JSON lines file
pub mod ecoflow;        // EcoFlow wire format, envelope and payloads
pub mod energy;         // Power to energy integration
pub mod error;          // Error handling and types
pub mod liveness;       // Connection state tracking
pub mod mqtt;           // Cloud MQTT transport
pub mod options;        // Command line options parsing
pub mod prelude;        // Common imports and types
pub mod scheduler;      // Periodic persistence
pub mod store;          // Energy totals persistence backends

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use std::time::Duration;

use crate::coordinator::Coordinator;
use crate::datalog_writer::DatalogWriter;
use crate::mqtt::Mqtt;
use crate::scheduler::Scheduler;

/// Everything `app()` starts, kept together so shutdown can run in order.
#[derive(Clone)]
pub struct Components {
    pub coordinator: Coordinator,
    pub scheduler: Scheduler,
    pub mqtt: Mqtt,
    pub datalog_writer: Option<DatalogWriter>,
    pub channels: Channels,
}

impl Components {
    /// The shutdown sequence is:
    /// 1. MQTT, so no new frames arrive
    /// 2. Coordinator, which logs final statistics
    /// 3. Datalog writer
    /// 4. Scheduler, which flushes the latest energy totals
    pub async fn stop(&self) {
        info!("Stopping all components...");

        let _ = self.mqtt.stop().await;
        self.coordinator.stop();
        if let Some(writer) = &self.datalog_writer {
            writer.stop();
        }
        self.scheduler.stop();
    }
}

fn init_logging(level: &str) -> std::result::Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
}

/// Main application entry point. Runs until `shutdown_rx` fires or the
/// optional runtime limit passes.
pub async fn app(
    mut shutdown_rx: broadcast::Receiver<()>,
    config: ConfigWrapper,
    runtime: Option<Duration>,
) -> Result<()> {
    if let Err(e) = init_logging(&config.loglevel()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    info!("powerocean-bridge {} starting", CARGO_PKG_VERSION);
    config.log();

    info!("Initializing channels...");
    let channels = Channels::new();

    info!("Initializing components...");

    info!("  Opening energy store...");
    let store = store::open(&config.energy()).await?;
    let totals = store.load().await?;

    info!("  Creating Coordinator...");
    let coordinator = Coordinator::new(config.clone(), channels.clone());
    coordinator.restore(&totals);

    // subscribe before the transport can emit anything
    let coordinator_handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.start().await {
                error!("Coordinator task failed: {}", e);
            }
        })
    };

    info!("  Creating Scheduler...");
    let scheduler = Scheduler::new(config.clone(), channels.clone(), coordinator.clone(), store);
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.start().await {
                error!("Scheduler task failed: {}", e);
            }
        })
    };

    let datalog_writer = match config.datalog_file() {
        Some(path) => {
            info!("  Creating DatalogWriter...");
            Some(DatalogWriter::new(&path, channels.clone())?)
        }
        None => None,
    };
    let datalog_handle = datalog_writer.clone().map(|writer| {
        let coordinator = coordinator.clone();
        let serial = config.mqtt().serial().to_owned();
        tokio::spawn(async move {
            if let Err(e) = writer.start(coordinator, serial).await {
                error!("DatalogWriter task failed: {}", e);
            }
        })
    });

    // give the receivers a chance to subscribe
    tokio::task::yield_now().await;

    info!("  Creating MQTT client...");
    let mqtt = Mqtt::new(config.clone(), channels.clone());
    let mqtt_handle = {
        let mqtt = mqtt.clone();
        tokio::spawn(async move {
            if let Err(e) = mqtt.start().await {
                error!("MQTT task failed: {}", e);
            }
        })
    };

    let components = Components {
        coordinator,
        scheduler,
        mqtt,
        datalog_writer,
        channels,
    };

    info!("Waiting for shutdown signal...");
    match runtime {
        Some(limit) => {
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = tokio::time::sleep(limit) => info!("runtime limit of {}s reached", limit.as_secs()),
            }
        }
        None => {
            let _ = shutdown_rx.recv().await;
        }
    }

    info!("Shutdown signal received, stopping components...");
    components.stop().await;

    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }
    if let Err(e) = coordinator_handle.await {
        error!("Error waiting for coordinator task: {}", e);
    }
    if let Some(handle) = datalog_handle {
        if let Err(e) = handle.await {
            error!("Error waiting for datalog task: {}", e);
        }
    }
    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Loads the config named on the command line, wires up Ctrl-C and runs
/// `app()` to completion.
pub async fn run(options: Options) -> Result<()> {
    let config = ConfigWrapper::new(options.config_file.clone())?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        let _ = shutdown_tx.send(());
    });

    app(shutdown_rx, config, options.runtime.map(Duration::from_secs)).await
}
