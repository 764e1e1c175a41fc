//! stash — self-hosted anonymous file sharing
//!
//! Usage:
//!   stash serve --config stash.toml     # run the HTTP service
//!   stash sweep --config stash.toml     # one-shot expiry + housekeeping (cron)
//!   stash ls    --config stash.toml     # print live entries

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stash::api::{self, AppState};
use stash::config::Config;
use stash::engine::{ListFilter, StorageEngine};

#[derive(Parser)]
#[command(name = "stash", about = "Anonymous file sharing with expiring uploads", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve {
        /// Optional TOML settings file (falls back to $STASH_SETTINGS).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Remove expired entries, stale staging files and orphan blobs, then exit.
    Sweep {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List live entries.
    Ls {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::Sweep { config } => run_sweep(config),
        Command::Ls { config } => run_ls(config),
    };

    if let Err(e) = result {
        error!(error = format!("{e:#}"), "Fatal");
        std::process::exit(1);
    }
}

fn load_engine(config_path: Option<PathBuf>) -> anyhow::Result<(Config, StorageEngine)> {
    let cfg = Config::load(config_path.as_deref()).context("Failed to load config")?;
    info!("Checking directories...");
    cfg.prepare_directories().context("Directory check failed")?;
    info!("Directories OK");

    let engine = StorageEngine::open(cfg.storage.clone()).context("Failed to open storage")?;
    Ok((cfg, engine))
}

async fn run_serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (cfg, engine) = load_engine(config_path)?;

    warn!(
        upload_folder = ?cfg.storage.upload_folder,
        tmp_folder = ?cfg.storage.tmp_folder,
        file_list = ?cfg.storage.file_list,
        expire_secs = cfg.storage.expire_secs,
        bind = cfg.server.bind,
        port = cfg.server.port,
        disabled = ?cfg.server.disabled_features,
        display_for = ?cfg.server.display_for,
        "===== Running config ====="
    );

    let state = Arc::new(AppState { engine: Arc::new(engine), server: cfg.server });
    api::start_server(state).await.context("HTTP server error")
}

fn run_sweep(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (_, engine) = load_engine(config_path)?;
    let expired = engine.sweep().context("Sweep failed")?;
    let report = engine.housekeep().context("Housekeeping failed")?;
    println!("Expired entries removed : {}", expired.len());
    println!("Staging files removed   : {}", report.staging_removed);
    println!("Orphan blobs removed    : {}", report.orphans_removed.len());
    Ok(())
}

fn run_ls(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (_, engine) = load_engine(config_path)?;
    let entries = engine.list(&ListFilter::default()).context("Listing failed")?;
    println!("{:<10} {:>12}  {:<24} name", "id", "bytes", "expires");
    for e in &entries {
        let expires = chrono::DateTime::from_timestamp(e.expires_at(), 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{:<10} {:>12}  {:<24} {}", e.id, e.size_bytes, expires, e.original_name);
    }
    println!("{} live file(s)", entries.len());
    Ok(())
}
