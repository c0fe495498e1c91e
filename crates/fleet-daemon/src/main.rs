//! fleet-daemon: runs the health, assignment, spawn and review sweeps on an
//! interval, or once with `--once`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::config::{expand_home, Config};
use fleet_core::store::FleetStore;
use fleet_daemon::daemon::Daemon;
use fleet_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "fleet-daemon", version, about = "Agent fleet coordinator daemon")]
struct Args {
    /// Run a single cycle and exit with its health code (0/1/2).
    #[arg(long)]
    once: bool,

    /// Config file (default: ~/.fleet/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the sweep interval in seconds.
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(secs) = args.interval {
        config.daemon.sweep_interval_secs = secs;
    }

    logging::init(
        "fleet-daemon",
        &config.general.log_level,
        LogFormat::from_flag(config.general.log_json),
    );

    let db_path = expand_home(&config.general.db_path);
    let store = FleetStore::new(&db_path)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    info!(db = %db_path.display(), "fleet store opened");

    let daemon = Daemon::from_config(&config, store);

    if args.once {
        let report = daemon.run_once_settled().await.context("sweep cycle failed")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        std::process::exit(report.exit_code());
    }

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await;
    Ok(())
}
