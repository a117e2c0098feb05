// ABOUTME: CLI entry point for change-sync
// ABOUTME: Checkpoint administration and the hosted polling loop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use change_sync::{
    ChangeSource, ChangeStore, CheckpointStore, LogChangesProcessor, SyncConfig, SyncEngine,
    SyncService, TrackedTable, DEFAULT_SYNC_CONTEXT,
};

#[derive(Parser)]
#[command(name = "change-sync")]
#[command(about = "Version-checkpointed change synchronization for SQLite-backed stores", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the change tracking store database
    #[arg(long, global = true, env = "CHANGE_SYNC_DB", default_value = "changes.db")]
    db: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sync checkpoint for a table (no-op if it already exists)
    Init {
        #[arg(long)]
        table: String,
        #[arg(long, default_value = DEFAULT_SYNC_CONTEXT)]
        context: String,
        /// Seed the checkpoint to the store's current version instead of 0,
        /// marking pre-existing rows as already synchronized
        #[arg(long)]
        seed_current: bool,
    },
    /// Show all sync checkpoints
    Status,
    /// Print the store's current change version
    Version,
    /// Show pending changes for a table since its checkpoint
    Changes {
        #[arg(long)]
        table: String,
        #[arg(long, default_value = DEFAULT_SYNC_CONTEXT)]
        context: String,
    },
    /// Poll tracked tables and log their changes until interrupted
    Run {
        /// Table to track (repeatable)
        #[arg(long = "table", required = true)]
        tables: Vec<String>,
        #[arg(long, default_value = DEFAULT_SYNC_CONTEXT)]
        context: String,
        /// Seconds between polling ticks
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Maximum concurrent table cycles
        #[arg(long, default_value_t = 4)]
        max_concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let store = ChangeStore::open(&cli.db)
        .with_context(|| format!("failed to open change store at {}", cli.db.display()))?;

    match cli.command {
        Commands::Init {
            table,
            context,
            seed_current,
        } => {
            let key = TrackedTable::with_context(&table, &context);
            store.initialize(&key, seed_current).await?;
            println!("Initialized checkpoint for {key}");
        }
        Commands::Status => {
            let rows = store.checkpoints()?;
            if rows.is_empty() {
                println!("No sync checkpoints.");
            }
            for row in rows {
                println!(
                    "{}  version {}  updated {}",
                    row.key, row.last_synced_version, row.updated_at
                );
            }
        }
        Commands::Version => {
            println!("{}", store.version()?);
        }
        Commands::Changes { table, context } => {
            let key = TrackedTable::with_context(&table, &context);
            let batch = store.next_batch(&key).await?;
            if batch.is_empty() {
                println!("No pending changes for {key}");
            }
            for entry in &batch.entries {
                println!(
                    "v{}  {}  {}",
                    entry.version,
                    entry.op.as_str(),
                    entry.entity
                );
            }
        }
        Commands::Run {
            tables,
            context,
            interval,
            max_concurrency,
        } => {
            let engine = Arc::new(SyncEngine::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
            ));

            let mut builder = SyncService::builder(engine).config(SyncConfig {
                poll_interval: Duration::from_secs(interval),
                max_concurrency,
                sync_context: context.clone(),
            });
            for table in &tables {
                let key = TrackedTable::with_context(table, &context);
                store.initialize(&key, false).await?;
                builder =
                    builder.track::<serde_json::Value>(table, vec![Arc::new(LogChangesProcessor)]);
            }
            let service = builder.build()?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
            tokio::spawn(async move {
                tokio::signal::ctrl_c()
                    .await
                    .expect("Failed to listen for Ctrl+C");
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
            });

            tracing::info!("Press Ctrl+C to stop");
            service.run(shutdown_rx).await?;
        }
    }

    Ok(())
}
