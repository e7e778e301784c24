//! via-hud - In-vehicle dashboard head unit
//!
//! Composition root: loads configuration, opens the telemetry database,
//! starts the Bluetooth core and the engine/GPS loops, and wires the
//! cross-component subscriptions (driving-session id into the Bluetooth
//! session bridge). The UI layer subscribes to the same event bus and is an
//! external collaborator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod engine;
mod gps;

use engine::{EngineMonitor, SimulatedEngineLink};
use gps::{GpsLogger, SimulatedFixSource};
use via_bt::BluetoothService;
use via_common::config::Config;
use via_common::events::{EventBus, ViaEvent};

/// Command-line arguments for via-hud
#[derive(Parser, Debug)]
#[command(name = "via-hud")]
#[command(about = "In-vehicle dashboard head unit")]
#[command(version)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides config and DATABASE_URL)
    #[arg(long)]
    database: Option<PathBuf>,

    /// OBD-II adapter port (overrides config and OBD_PORT)
    #[arg(long)]
    obd_port: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(port) = args.obd_port {
        config.obd_port = Some(port);
    }

    // Initialize tracing
    let default_filter = format!(
        "via_hud={0},via_bt={0},via_common={0}",
        config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting via dashboard");
    info!("Database: {}", config.database_path.display());

    let pool = via_common::db::init::init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let events = EventBus::new(256);

    // Bluetooth core: degrades to a no-op handle without a bus transport
    let bluetooth = Arc::new(
        BluetoothService::start(
            events.clone(),
            Duration::from_millis(config.bt_poll_interval_ms),
            Duration::from_millis(config.media_poll_interval_ms),
        )
        .await,
    );

    // Session bridge: forward driving-session changes to the Bluetooth core
    {
        let bluetooth = bluetooth.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ViaEvent::SessionChanged { session_id, .. }) => {
                        bluetooth.session_changed(session_id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(port) = &config.obd_port {
        info!("OBD port {} configured; using simulated link", port);
    }
    let monitor = EngineMonitor::new(
        SimulatedEngineLink::new(),
        pool.clone(),
        events.clone(),
        Duration::from_secs_f64(config.obd_log_interval_s),
    );
    let engine_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let gps_task = if config.gps_simulate {
        let logger = GpsLogger::new(SimulatedFixSource::new(), pool.clone(), events.clone());
        Some(tokio::spawn(logger.run(
            Duration::from_millis(config.gps_update_interval_ms),
            shutdown_rx.clone(),
        )))
    } else {
        warn!("Hardware GPS source not implemented; GPS disabled (set gps_simulate = true)");
        None
    };

    shutdown_signal().await;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    engine_task.await.ok();
    if let Some(task) = gps_task {
        task.await.ok();
    }
    pool.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
