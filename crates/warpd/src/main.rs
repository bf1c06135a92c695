//! warpd — the WarpGrid controller daemon.
//!
//! Assembles the controller's data layer:
//! - State store (redb)
//! - Schema version check and upgrade
//! - Object caches, loaded from the store and kept current by its change feed
//! - Free reservable cluster index
//!
//! # Usage
//!
//! ```text
//! warpd run --data-dir /var/lib/warpgrid
//! warpd --config /etc/warpgrid/controller.toml upgrade
//! warpd version
//! ```

mod config;
mod controller;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use warpgrid_state::{KvStore, StateStore};
use warpgrid_upgrade::{default_registry, read_version, upgrade_to_latest};

use crate::config::ControllerConfig;
use crate::controller::{Controller, prepare_store};

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid controller daemon")]
struct Cli {
    /// Path to controller.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check the schema version, load caches, and follow the store.
    Run {
        /// Upgrade an out-of-date store instead of refusing to start.
        #[arg(long)]
        auto_upgrade: bool,

        /// Start without checking the store's schema version.
        #[arg(long)]
        skip_version_check: bool,
    },
    /// Upgrade the store to the latest schema version and exit.
    Upgrade,
    /// Print the store's schema version and the latest known one.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ControllerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    // Initialize tracing. RUST_LOG wins over the config file.
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(&config.log_filter)?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            auto_upgrade,
            skip_version_check,
        } => {
            config.auto_upgrade |= auto_upgrade;
            config.skip_version_check |= skip_version_check;
            run(config).await
        }
        Command::Upgrade => upgrade(&config),
        Command::Version => version(&config),
    }
}

fn open_store(config: &ControllerConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    info!("WarpGrid controller starting");

    let store = open_store(&config)?;
    let registry = default_registry()?;
    prepare_store(&store, &registry, &config)?;

    // ── Caches ─────────────────────────────────────────────────

    let mut controller = Controller::new(store.clone())?;
    let events = store.subscribe();
    controller.bootstrap()?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle = tokio::spawn(controller.run(events, shutdown_rx, config.resync_on_lag));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    sync_handle.await??;
    info!("WarpGrid controller stopped");
    Ok(())
}

fn upgrade(config: &ControllerConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let registry = default_registry()?;
    let Some(from) = read_version(&store)? else {
        anyhow::bail!("store has no schema version; start the controller once to initialize it");
    };
    let to = upgrade_to_latest(&store, &registry, &from)?;
    info!(%from, %to, "upgrade complete");
    Ok(())
}

fn version(config: &ControllerConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let registry = default_registry()?;
    let current = read_version(&store)?.unwrap_or_else(|| "(none)".to_string());
    println!("store:  {current}");
    println!("latest: {}", registry.latest().hash);
    Ok(())
}
