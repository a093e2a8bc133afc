use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use cloudsync::config::{AgentConfig, TomlConfigStore};
use cloudsync::fs::backend_from_config;
use cloudsync::logging;
use cloudsync::sync::{NotifyWatcher, SyncOrchestrator};

#[derive(Debug, Parser)]
#[command(name = "cloudsync", version, about = "Background folder sync to object storage")]
struct Cli {
    /// Config file (defaults to $CLOUDSYNC_CONFIG, then the user config dir)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync agent until interrupted
    Run,
    /// Validate the configuration and print the effective settings
    Check {
        /// Print the configuration as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = AgentConfig::resolve_path(cli.config.as_deref());
    let config = AgentConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    match cli.command {
        Command::Run => run(path, config).await,
        Command::Check { json } => check(&path, &config, json),
    }
}

async fn run(path: PathBuf, config: AgentConfig) -> Result<()> {
    logging::init(&config.log_level)?;
    info!(config = %path.display(), version = env!("CARGO_PKG_VERSION"), "Starting cloudsync");

    let backend = backend_from_config(&config.storage)?;
    let watcher = Arc::new(NotifyWatcher::new()?);
    let store = Arc::new(TomlConfigStore::new(path, config.clone()));
    let orchestrator = SyncOrchestrator::new(&config, backend, watcher, store);

    orchestrator.start()?;

    shutdown_signal().await;

    orchestrator.stop().await;
    let health = orchestrator.health();
    info!(
        uploaded = health.files_uploaded,
        downloaded = health.files_downloaded,
        errors = health.errors,
        "cloudsync stopped"
    );
    Ok(())
}

fn check(path: &std::path::Path, config: &AgentConfig, json: bool) -> Result<()> {
    // Fails on an unknown provider or incomplete provider settings.
    config.storage.selection()?;

    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    } else {
        println!("# {}", path.display());
        println!("{}", toml::to_string_pretty(config)?);
    }

    let enabled = config.folders.iter().filter(|f| f.enabled).count();
    eprintln!(
        "provider: {}, folders: {} ({} enabled)",
        config.storage.provider,
        config.folders.len(),
        enabled
    );
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
