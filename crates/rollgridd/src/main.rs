//! rollgridd — the rollgrid daemon.
//!
//! Opens the state store and drives every rollout through its lifecycle:
//! - State store (redb)
//! - Rollout and deployment managers
//! - Rollout scheduler
//!
//! # Usage
//!
//! ```text
//! rollgridd run --data-dir /var/lib/rollgrid --config /etc/rollgrid.toml
//! rollgridd inspect --data-dir /var/lib/rollgrid
//! ```

mod inspect;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rollgrid_core::GridConfig;
use rollgrid_rollout::{LogSink, RolloutManager, SystemClock};
use rollgrid_scheduler::RolloutScheduler;
use rollgrid_state::StateStore;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DB_FILE: &str = "rollgrid.redb";

#[derive(Parser)]
#[command(name = "rollgridd", about = "rollgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rollout scheduler until interrupted.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/rollgrid")]
        data_dir: PathBuf,

        /// Path to rollgrid.toml; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Print every rollout with its groups as JSON.
    Inspect {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/rollgrid")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            json,
        } => {
            init_tracing(json);
            run(data_dir, config.as_deref()).await
        }
        Command::Inspect { data_dir } => {
            init_tracing(false);
            let store = StateStore::open(&data_dir.join(DB_FILE))?;
            let report = inspect::report(&store)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,rollgridd=debug,rollgrid_rollout=debug,rollgrid_scheduler=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(data_dir: PathBuf, config_path: Option<&Path>) -> anyhow::Result<()> {
    info!("rollgrid daemon starting");

    let config = match config_path {
        Some(path) => {
            let config = GridConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => GridConfig::default(),
    };

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let manager = RolloutManager::new(store, config, Arc::new(SystemClock), Arc::new(LogSink));
    let scheduler = RolloutScheduler::new(manager);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;

    info!("rollgrid daemon stopped");
    Ok(())
}
