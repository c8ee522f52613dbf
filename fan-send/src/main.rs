//! fan-send - Dispatcher daemon for the fanout queue
//!
//! Polls the queue for due posts and publishes them to every enabled
//! platform, retrying with backoff. Any number of instances can share one
//! database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use libfanout::accounting::SqliteAccountant;
use libfanout::logging::{LogFormat, LoggingConfig};
use libfanout::platforms::build_publishers;
use libfanout::service::events::EventReceiver;
use libfanout::{Config, Database, Dispatcher, FanoutError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fan-send")]
#[command(version)]
#[command(about = "Dispatcher daemon for the fanout posting queue")]
#[command(long_about = "\
fan-send - Dispatcher daemon for the fanout posting queue

DESCRIPTION:
    fan-send is a long-running worker that polls the fanout queue, claims
    posts that are due, and publishes them to every enabled platform.
    Platforms that fail are retried with exponential backoff until the
    post's retry budget runs out. Posts left in 'processing' by a crashed
    worker are returned to the queue.

    Several fan-send processes may run against the same database; each
    post is claimed by exactly one of them.

USAGE:
    # Run in foreground (logs to stderr)
    fan-send

    # Poll every 30 seconds
    fan-send --poll-interval 30s

    # Process whatever is due once and exit
    fan-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current cycle)

CONFIGURATION:
    Configuration file: ~/.config/fanout/config.toml
    Database location:  ~/.local/share/fanout/queue.db

    [dispatcher]
    poll_interval = \"60s\"
    batch_size = 50
    publish_timeout = \"30s\"
    stale_after = \"10m\"
    concurrency = 4

    [retry]
    max_retries = 3
    base_delay = \"5m\"
    backoff_multiplier = 2.0
    max_delay = \"24h\"

    Override with environment variables:
        FANOUT_CONFIG      - Path to config file
        FANOUT_DB_PATH     - Path to database file
        FANOUT_LOG_FORMAT  - Log format (text, json, pretty)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval, e.g. "30s" or "2m" (overrides config)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose logging to stderr, including every dispatch event
    #[arg(short, long)]
    verbose: bool,

    /// Log format: text, json or pretty
    #[arg(long, env = "FANOUT_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<FanoutError>()
            .map_or(1, FanoutError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(poll_interval) = cli.poll_interval {
        config.dispatcher.poll_interval = poll_interval;
        config.validate()?;
    }

    info!("fanout dispatcher starting");
    info!(
        "Poll interval: {}",
        humantime::format_duration(config.dispatcher.poll_interval)
    );

    let db = Database::new(&config.database.path).await?;

    let publishers = build_publishers(&config).await;
    if publishers.is_empty() {
        warn!("No platforms configured; due posts will fail until one is enabled");
    } else {
        info!(platforms = ?publishers.names(), "Publishers loaded");
    }

    let accountant = Arc::new(SqliteAccountant::new(db.clone()));
    let dispatcher = Dispatcher::new(
        Arc::new(db),
        publishers,
        accountant,
        config.retry.clone(),
        config.dispatcher.clone(),
    );

    let event_log = cli
        .verbose
        .then(|| spawn_event_logger(dispatcher.events().subscribe()));

    if cli.once {
        let report = dispatcher.run_cycle(Utc::now()).await?;
        info!(%report, "fan-send: processed due posts once, exiting");
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;
        dispatcher.run(shutdown).await;
    }

    // Closing the bus lets the logger drain what is left and return
    drop(dispatcher);
    if let Some(handle) = event_log {
        let _ = handle.await;
    }

    info!("fanout dispatcher stopped");
    Ok(())
}

/// Log every dispatch event at debug level until the bus closes
fn spawn_event_logger(mut receiver: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => debug!(post_id = %event.post_id(), ?event, "Dispatch event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
