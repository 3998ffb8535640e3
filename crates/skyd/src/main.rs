//! skyd — the SkyGrid daemon.
//!
//! Single binary that assembles the fleet orchestrator:
//! - Job store (redb, or in-memory)
//! - Slot pool + fleet registry
//! - Job scheduler + mission executor
//! - Telemetry aggregator
//!
//! # Usage
//!
//! ```text
//! skyd run --config skygrid.toml --data-dir /var/lib/skygrid
//! skyd scaffold > skygrid.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sky_core::config::UnitConfig;
use sky_core::{Shutdown, SkyConfig, spawn_periodic};
use skygrid_control::Orchestrator;
use skygrid_state::JobStore;

#[derive(Parser)]
#[command(name = "skyd", about = "SkyGrid fleet orchestrator daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted.
    Run {
        /// Path to skygrid.toml. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for the job store. In-memory when omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Override the fleet with this many default units.
        #[arg(long)]
        units: Option<usize>,

        /// Override the first slot number.
        #[arg(long)]
        base_slot: Option<u16>,

        /// Seconds between fleet status log lines.
        #[arg(long, default_value = "30")]
        status_interval: u64,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Print a default skygrid.toml.
    Scaffold,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            units,
            base_slot,
            status_interval,
            log_format,
        } => {
            init_tracing(log_format);
            let mut config = match config {
                Some(path) => SkyConfig::from_file(&path)?,
                None => SkyConfig::default(),
            };
            apply_overrides(&mut config, units, base_slot);
            run(config, data_dir, status_interval).await
        }
        Command::Scaffold => {
            print!("{}", SkyConfig::scaffold().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skyd=debug,skygrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn apply_overrides(config: &mut SkyConfig, units: Option<usize>, base_slot: Option<u16>) {
    if let Some(base) = base_slot {
        config.slots.base = base;
    }
    if let Some(count) = units {
        config.fleet.units = (1..=count)
            .map(|i| UnitConfig {
                id: format!("unit-{i}"),
                name: None,
                lat_offset: 0.0,
                lon_offset: 0.0,
            })
            .collect();
        let wanted = u16::try_from(count).unwrap_or(u16::MAX);
        if config.slots.count < wanted {
            config.slots.count = wanted;
        }
    }
}

async fn run(config: SkyConfig, data_dir: Option<PathBuf>, status_interval: u64) -> anyhow::Result<()> {
    info!("SkyGrid daemon starting");

    let store = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let path = dir.join("skygrid.redb");
            let store = JobStore::open(&path)?;
            info!(path = ?path, "job store opened");
            store
        }
        None => {
            warn!("no data directory, jobs are kept in memory");
            JobStore::open_in_memory()?
        }
    };

    let orchestrator = Orchestrator::from_config(config, store)?;
    orchestrator.start().await?;

    // ── Periodic status line ───────────────────────────────────
    let status_shutdown = Shutdown::new();
    let status = {
        let telemetry = orchestrator.telemetry().clone();
        spawn_periodic(
            "fleet-status",
            Duration::from_secs(status_interval.max(1)),
            status_shutdown.signal(),
            move || {
                let telemetry = telemetry.clone();
                async move {
                    let stats = telemetry.statistics().await;
                    info!(
                        online = stats.fleet.online,
                        total = stats.fleet.total,
                        active_missions = stats.fleet.active_missions,
                        healthy = stats.healthy,
                        with_errors = stats.with_errors,
                        average_battery = stats.fleet.average_battery,
                        "fleet status"
                    );
                    Ok(())
                }
            },
        )
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    status_shutdown.trigger();
    let _ = status.await;
    orchestrator.shutdown().await;

    let summary = serde_json::to_string(&orchestrator.dispatch_stats().await)?;
    info!(%summary, "SkyGrid daemon stopped");
    Ok(())
}
