//! Blocks Deleter
//!
//! Applies a retention window to the blocks of an object store bucket: blocks
//! outside the window are marked for deletion and deleted once their mark is
//! older than the delete delay.

use anyhow::{Context, Result};
use clap::Parser;
use common::config::{Configuration, DEFAULT_CONFIG_FILE};
use common::storage::create_object_store;
use deleter::{BlocksDeleter, DeleterError, ObjectStoreBucket};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log what would be marked or deleted without changing the bucket
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}

fn init_tracing(args: &Args) {
    let default_level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &Args) -> Result<Configuration> {
    let mut config = match &args.config {
        Some(path) => Configuration::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            if !std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
                tracing::info!(
                    "{} not found, using defaults and environment",
                    DEFAULT_CONFIG_FILE
                );
            }
            Configuration::load().context("Failed to load configuration")?
        }
    };

    if args.dry_run {
        config.deletion.dry_run = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = load_config(&args)?;

    tracing::info!(
        dsn = %config.storage.dsn,
        prefix = %config.storage.prefix,
        min_time = %config.retention.min_time,
        max_time = %config.retention.max_time,
        delete_delay = ?config.deletion.delete_delay,
        dry_run = config.deletion.dry_run,
        "Starting blocks deleter"
    );

    let store = create_object_store(&config.storage).context("Failed to create object store")?;
    let bucket = Arc::new(ObjectStoreBucket::new(store));
    let deleter =
        BlocksDeleter::from_config(bucket, &config).context("Failed to initialize deleter")?;

    let cancel = CancellationToken::new();
    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!(error = %e, "Signal handling failed");
            }
            tracing::info!("Shutting down after the current block");
            cancel.cancel();
        })
    };

    let result = match config.run.interval {
        None => run_once(&deleter, &cancel).await,
        Some(interval) => run_periodically(&deleter, interval, &cancel).await,
    };

    signal_task.abort();
    deleter.metrics().summary().log();
    result
}

async fn run_once(deleter: &BlocksDeleter, cancel: &CancellationToken) -> Result<()> {
    match deleter.run(cancel).await {
        Ok(_) => Ok(()),
        Err(DeleterError::Cancelled) => {
            tracing::info!("Run cancelled before completion");
            Ok(())
        }
        Err(e) => Err(e).context("Deleter run failed"),
    }
}

async fn run_periodically(
    deleter: &BlocksDeleter,
    interval: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tracing::info!(interval = ?interval, "Running on a fixed interval");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match deleter.run(cancel).await {
            Ok(_) => {}
            Err(DeleterError::Cancelled) => break,
            // A failed run is retried on the next tick.
            Err(e) => tracing::error!(error = %e, "Deleter run failed"),
        }
    }

    tracing::info!("Blocks deleter stopped");
    Ok(())
}
