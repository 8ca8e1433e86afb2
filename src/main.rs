use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LoggingConfig, StoreBackend, WardenConfig};
use ratewarden::ratelimit::RateLimiter;
use ratewarden::store::{MemoryStore, RedisStore, StateStore};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Adaptive multi-strategy rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate one request and consume a permit if admitted
    Check { identifier: String, rule: String },
    /// Show usage for a client key without consuming a permit
    Info { identifier: String, rule: String },
    /// Show the limit a client would currently be measured against
    Limit { identifier: String, rule: String },
    /// Clear the counter and block for a client key
    Reset { identifier: String, rule: String },
    /// Manage the whitelist
    Whitelist {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Manage the blacklist
    Blacklist {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Print aggregate statistics
    Stats,
    /// Purge expired state once
    Cleanup,
    /// Purge expired state periodically until interrupted
    Sweep {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },
}

#[derive(Debug, Subcommand)]
enum ListAction {
    Add { identifier: String },
    Remove { identifier: String },
}

#[derive(Serialize)]
struct Changed {
    changed: bool,
}

#[derive(Serialize)]
struct Removed {
    removed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => WardenConfig::load(path)?,
        None => WardenConfig::default(),
    };
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    let store = build_store(&config).await?;
    let limiter = RateLimiter::from_config(&config, store)?;
    info!(rules = limiter.rules().len(), "Rate limiter initialized");

    match cli.command {
        Command::Check { identifier, rule } => print(&limiter.check(&identifier, &rule).await?)?,
        Command::Info { identifier, rule } => print(&limiter.get_info(&identifier, &rule).await?)?,
        Command::Limit { identifier, rule } => {
            print(&limiter.effective_limit(&identifier, &rule).await?)?
        }
        Command::Reset { identifier, rule } => print(&Changed {
            changed: limiter.reset(&identifier, &rule).await?,
        })?,
        Command::Whitelist { action } => {
            let changed = match action {
                ListAction::Add { identifier } => limiter.add_to_whitelist(&identifier).await?,
                ListAction::Remove { identifier } => {
                    limiter.remove_from_whitelist(&identifier).await?
                }
            };
            print(&Changed { changed })?
        }
        Command::Blacklist { action } => {
            let changed = match action {
                ListAction::Add { identifier } => limiter.add_to_blacklist(&identifier).await?,
                ListAction::Remove { identifier } => {
                    limiter.remove_from_blacklist(&identifier).await?
                }
            };
            print(&Changed { changed })?
        }
        Command::Stats => print(&limiter.get_global_stats().await?)?,
        Command::Cleanup => print(&Removed {
            removed: limiter.cleanup_expired_data().await?,
        })?,
        Command::Sweep { interval } => {
            tokio::select! {
                _ = sweep(&limiter, Duration::from_secs(interval.max(1))) => {}
                _ = shutdown_signal() => {}
            }
        }
    }

    info!("Ratewarden stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(config: &WardenConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, state is not shared between processes");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.redis_url is not set"))?;
            Arc::new(RedisStore::connect(url, config.store.key_prefix.clone()).await?)
        }
    };
    store.ping().await?;
    info!(backend = store.backend_name(), "Store initialized");
    Ok(store)
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn sweep(limiter: &RateLimiter, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "Starting periodic cleanup");
    let mut ticks = IntervalStream::new(tokio::time::interval(interval));
    while ticks.next().await.is_some() {
        if let Err(e) = limiter.cleanup_expired_data().await {
            warn!(error = %e, "Cleanup failed, retrying next interval");
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
