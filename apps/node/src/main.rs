//! Senseye Node - standalone passive RF sensing daemon.
//!
//! Runs one mesh node: scans WiFi/BLE (and, optionally, acoustic chirps),
//! filters and infers locally, floods its belief across the gossip mesh,
//! fuses its view with its peers', and maintains a shared floor plan and
//! live occupancy overlay. The `calibrate` subcommand runs the calibration
//! pipeline once and exits instead of starting the sense loop.
//!
//! The WiFi/BLE scanner and audio backends are platform collaborators this
//! binary does not implement (see the crate's `ScannerBackend`/
//! `AudioBackend` traits) — the node runs against the null backends until a
//! platform-specific scanner/audio implementation is wired in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use senseye_core::config::{parse_acoustic_mode, NodeRole, SenseyeConfig};
use senseye_core::{bootstrap_node, calibration, AudioBackend, NullAudioBackend, NullScanner, ScannerBackend};
use senseye_core::world_state::{LoggingWorldStateSink, WorldStateSink};
use tokio::signal;

/// Senseye - a distributed passive RF sensing daemon.
#[derive(Parser, Debug)]
#[command(name = "senseye-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the configuration file (TOML). Defaults to `~/.senseye/config.toml`.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run with no dashboard output at all.
    #[arg(long)]
    headless: bool,

    /// Join the mesh and render the dashboard without scanning locally.
    #[arg(long)]
    ui_only: bool,

    /// Override this node's human-readable name.
    #[arg(long)]
    name: Option<String>,

    /// Override this node's role.
    #[arg(long)]
    role: Option<NodeRole>,

    /// Override the acoustic sampling mode: `off`, `on-demand`, or a duration
    /// like `10m`/`1h` (implies interval mode).
    #[arg(long)]
    acoustic: Option<String>,

    /// Override the mesh TCP port.
    #[arg(long)]
    port: Option<u16>,

    /// Disable the WiFi scanner.
    #[arg(long)]
    no_wifi: bool,

    /// Disable the BLE scanner.
    #[arg(long)]
    no_ble: bool,

    /// Enable debug logging (equivalent to `--log-level debug`).
    #[arg(long)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", env = "SENSEYE_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the calibration pipeline once against the current mesh and scans, then exits.
    Calibrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { log::LevelFilter::Debug } else { args.log_level };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Senseye node v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| SenseyeConfig::default().config_path());
    let mut config = SenseyeConfig::load(&config_path).context("failed to load configuration")?;
    apply_cli_overrides(&mut config, &args)?;
    config.normalize();

    if let Some(Command::Calibrate) = args.command {
        return run_calibrate(config).await;
    }

    let sink: Option<Arc<dyn WorldStateSink>> = if args.headless {
        None
    } else {
        Some(Arc::new(LoggingWorldStateSink))
    };
    let scanner: Arc<dyn ScannerBackend> = Arc::new(NullScanner);
    let audio: Arc<dyn AudioBackend> = Arc::new(NullAudioBackend);
    let node_id = config.node_id.clone();

    let node = bootstrap_node(config, Some(scanner), Some(audio), sink)
        .context("failed to bootstrap node")?;

    log::info!("node {node_id} listening, advertising {}", node.advertise_ip);

    let node = Arc::new(node);
    let run_node = Arc::clone(&node);
    let run_handle = tokio::spawn(async move {
        if let Err(e) = run_node.run().await {
            log::error!("orchestrator exited with an error: {e}");
        }
    });

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");
    node.shutdown();
    run_handle.abort();

    log::info!("shutdown complete");
    Ok(())
}

async fn run_calibrate(config: SenseyeConfig) -> Result<()> {
    let scanner = NullScanner;
    let audio = NullAudioBackend;
    let now = senseye_core::utils::now_secs();
    let own_position = config.position.map(|p| (p.x, p.y));
    let peer_ids: Vec<String> = Vec::new();
    let peer_ranges = std::collections::BTreeMap::new();

    let (plan, _baseline) = calibration::run(
        &config.node_id,
        own_position,
        &scanner,
        &audio,
        config.chirp_freq_start,
        config.chirp_freq_end,
        config.chirp_duration,
        48_000,
        &peer_ids,
        &peer_ranges,
        3,
        now,
    )
    .await
    .context("calibration failed")?;

    plan.save(&config.floorplan_path()).context("failed to persist floor plan")?;
    log::info!("calibration complete, floor plan written to {}", config.floorplan_path().display());
    Ok(())
}

fn apply_cli_overrides(config: &mut SenseyeConfig, args: &Args) -> Result<()> {
    if let Some(name) = &args.name {
        config.node_name = name.clone();
    }
    if let Some(role) = args.role {
        config.node_role = role;
    }
    if let Some(acoustic) = &args.acoustic {
        let (mode, interval) = parse_acoustic_mode(acoustic);
        config.acoustic_mode = mode;
        if let Some(interval) = interval {
            config.acoustic_interval = interval;
        }
    }
    if let Some(port) = args.port {
        config.mesh_port = port;
    }
    if args.no_wifi {
        config.wifi_enabled = false;
    }
    if args.no_ble {
        config.ble_enabled = false;
    }
    if args.ui_only {
        config.wifi_enabled = false;
        config.ble_enabled = false;
        config.acoustic_mode = senseye_core::config::AcousticMode::Off;
    }
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
