//! PrepSync CLI - Command line interface for the sync engine.
//!
//! This tool runs offline/online sync simulations against an in-memory
//! remote and inspects or prunes the local SQLite store.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use prepsync_common::{AttemptId, OwnerId, ProgressRecord, SystemClock};
use prepsync_storage::{Collection, DurableStore, IndexQuery, SqliteStore};
use prepsync_sync::{EngineConfig, MemoryRemote, NetworkMonitor, SyncEvent};

#[derive(Parser)]
#[command(name = "prepsync")]
#[command(about = "PrepSync - Offline-first progress synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Engine configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate an offline burst of saves followed by reconnection.
    Simulate {
        /// Owner of the attempt.
        #[arg(short, long, default_value = "demo-user")]
        owner: String,

        /// Attempt identifier.
        #[arg(short, long, default_value = "demo-attempt")]
        attempt: String,

        /// Exam the attempt belongs to.
        #[arg(short, long, default_value = "demo-exam")]
        exam: String,

        /// Number of answers saved while offline.
        #[arg(short, long, default_value_t = 5)]
        saves: u32,

        /// Remote calls that fail before the remote recovers.
        #[arg(long, default_value_t = 0)]
        fail: u32,

        /// Complete the attempt after the last save.
        #[arg(long)]
        complete: bool,

        /// SQLite database for the durable store (overrides the config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// List stored attempts for an owner.
    Inspect {
        /// Owner whose attempts to list.
        #[arg(short, long)]
        owner: String,

        /// SQLite database (overrides the config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Delete stored records not updated for a number of days.
    Purge {
        /// Retention window in days.
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,

        /// SQLite database (overrides the config).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print the effective engine configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            owner,
            attempt,
            exam,
            saves,
            fail,
            complete,
            db,
        } => {
            let mut config = config;
            if db.is_some() {
                config.database_path = db;
            }
            cmd_simulate(&config, &owner, &attempt, &exam, saves, fail, complete).await
        }

        Commands::Inspect { owner, db } => {
            let path = database_path(&config, db)?;
            cmd_inspect(&path, &owner).await
        }

        Commands::Purge { older_than_days, db } => {
            let path = database_path(&config, db)?;
            cmd_purge(&path, older_than_days).await
        }

        Commands::Config => cmd_config(&config),
    }
}

fn database_path(config: &EngineConfig, db: Option<PathBuf>) -> Result<PathBuf> {
    db.or_else(|| config.database_path.clone())
        .context("No database given. Use --db or set database_path in the config")
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    SqliteStore::open(path, Arc::new(SystemClock))
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Run an offline burst and reconnect.
async fn cmd_simulate(
    config: &EngineConfig,
    owner: &str,
    attempt: &str,
    exam: &str,
    saves: u32,
    fail: u32,
    complete: bool,
) -> Result<()> {
    let owner_id = OwnerId::new(owner).context("Invalid owner id")?;
    let attempt_id = AttemptId::new(attempt).context("Invalid attempt id")?;

    let remote = MemoryRemote::new();
    remote.fail_next(fail);

    let orchestrator = config.assemble(
        remote.registry(),
        Some(Arc::new(remote.clone())),
        Arc::new(SystemClock),
    );
    let monitor = NetworkMonitor::new(false);
    let forwarder = monitor.attach(orchestrator.queue().clone());
    let mut events = orchestrator.queue().subscribe();
    orchestrator.start();

    let mut record = orchestrator
        .load_progress(&attempt_id, &owner_id)
        .await
        .unwrap_or_else(|| ProgressRecord::new(attempt_id.clone(), owner_id.clone(), exam, Utc::now()));
    if record.is_completed() {
        anyhow::bail!("Attempt {} is already completed", attempt_id);
    }

    info!("Offline: saving {} answer(s) for attempt {}", saves, attempt_id);
    let first = record.answered_count() as u32;
    for question in first..first + saves {
        record.answer(question, [question % 4], Utc::now())?;
        record.navigate(question + 1, Utc::now())?;
        orchestrator
            .save_progress(record.clone())
            .await
            .context("Failed to save progress")?;
    }

    if complete {
        record = orchestrator
            .complete_progress(record)
            .await
            .context("Failed to complete attempt")?;
    } else {
        orchestrator.flush_pending();
    }
    info!("{} task(s) waiting for connectivity", orchestrator.queue().pending_count());

    monitor.set_online(true);
    if orchestrator.queue().pending_count() > 0 {
        wait_until_idle(&mut events).await;
    }

    orchestrator.stop().await;
    drop(monitor);
    if let Err(e) = forwarder.await {
        warn!("Connectivity forwarder ended abnormally: {}", e);
    }

    println!("\nSimulation finished:");
    println!("  Deliveries: {}", remote.deliveries().len());
    match remote.progress(&owner_id, &attempt_id) {
        Some(synced) => {
            println!("  Remote status: {}", synced.status.as_str());
            println!("  Remote answers: {}", synced.answered_count());
            println!("  In sync: {}", synced == record);
        }
        None => println!("  Remote has no copy of attempt {}", attempt_id),
    }
    println!("  Still queued: {}", orchestrator.queue().pending_count());

    Ok(())
}

async fn wait_until_idle(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(120), events.recv()).await {
            Ok(Ok(event)) => {
                let task = event
                    .task()
                    .map(|t| format!("{} {}", t.kind, t.id))
                    .unwrap_or_default();
                println!("  {:<10} {}", event.name(), task);
                if matches!(event, SyncEvent::Idle) {
                    return;
                }
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!("Missed {} event(s)", skipped);
            }
            Ok(Err(RecvError::Closed)) => return,
            Err(_) => {
                warn!("Timed out waiting for the queue to drain");
                return;
            }
        }
    }
}

/// List attempts stored for an owner.
async fn cmd_inspect(path: &Path, owner: &str) -> Result<()> {
    let store = open_store(path)?;
    let attempts = store
        .query_by_index(Collection::Attempts, &IndexQuery::Owner(owner.to_string()))
        .await
        .context("Failed to query attempts")?;

    if attempts.is_empty() {
        println!("No attempts stored for {}", owner);
    } else {
        println!("Attempts for {}:", owner);
        for entity in &attempts {
            match entity.to_progress() {
                Ok(record) => println!(
                    "  {}  {:<11}  {:>3} answered  question {:<4} updated {}",
                    record.attempt_id,
                    record.status.as_str(),
                    record.answered_count(),
                    record.current_index,
                    record.updated_at.to_rfc3339()
                ),
                Err(e) => println!("  {}  (unreadable: {})", entity.id, e),
            }
        }
    }

    println!("\nCollections:");
    for collection in Collection::ALL {
        let count = store.count(collection).await?;
        println!("  {:<14} {}", collection.to_string(), count);
    }

    Ok(())
}

/// Remove stale records from every collection.
async fn cmd_purge(path: &Path, older_than_days: i64) -> Result<()> {
    if older_than_days < 0 {
        anyhow::bail!("Retention window cannot be negative");
    }

    let store = open_store(path)?;
    let cutoff = Utc::now() - ChronoDuration::days(older_than_days);
    info!("Purging records last updated before {}", cutoff.to_rfc3339());

    let mut total = 0;
    for collection in Collection::ALL {
        let removed = store
            .purge_before(collection, cutoff)
            .await
            .with_context(|| format!("Failed to purge {}", collection))?;
        println!("  {:<14} {} removed", collection.to_string(), removed);
        total += removed;
    }
    println!("Purged {} record(s)", total);

    Ok(())
}

/// Print the effective configuration.
fn cmd_config(config: &EngineConfig) -> Result<()> {
    println!("{}", config.to_json()?);
    Ok(())
}
