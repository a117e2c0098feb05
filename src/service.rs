// ABOUTME: Hosted polling loop driving sync cycles across tracked tables
// ABOUTME: Bounded concurrency, per-table non-overlap, graceful shutdown

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;

use crate::engine::{CancelFlag, CycleOutcome, SyncEngine, TableBinding};
use crate::error::SyncError;
use crate::model::{TrackedTable, DEFAULT_SYNC_CONTEXT};
use crate::processor::ChangeSetProcessor;

/// Configuration for the hosted sync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between polling ticks.
    pub poll_interval: Duration,
    /// Maximum number of cycles in flight across all tracked tables.
    pub max_concurrency: usize,
    /// Sync context tables are registered under unless one is named.
    pub sync_context: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrency: 4,
            sync_context: DEFAULT_SYNC_CONTEXT.to_string(),
        }
    }
}

struct TableEntry {
    binding: TableBinding,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a manually triggered cycle finishes,
/// whichever way it exits.
struct InFlightGuard<'a>(&'a TableEntry);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

struct PendingTable {
    table: String,
    context: Option<String>,
    make: Box<dyn FnOnce(TrackedTable) -> TableBinding + Send>,
}

pub struct SyncServiceBuilder {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    pending: Vec<PendingTable>,
}

impl SyncServiceBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Track `table` under the configured sync context, fanning every batch
    /// out to `processors` in the given order.
    pub fn track<T>(self, table: &str, processors: Vec<Arc<dyn ChangeSetProcessor<T>>>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.track_pending(table, None, processors)
    }

    /// Track `table` under an explicit sync context.
    pub fn track_in_context<T>(
        self,
        table: &str,
        sync_context: &str,
        processors: Vec<Arc<dyn ChangeSetProcessor<T>>>,
    ) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.track_pending(table, Some(sync_context.to_string()), processors)
    }

    fn track_pending<T>(
        mut self,
        table: &str,
        context: Option<String>,
        processors: Vec<Arc<dyn ChangeSetProcessor<T>>>,
    ) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.pending.push(PendingTable {
            table: table.to_string(),
            context,
            make: Box::new(move |key| TableBinding::new(key, processors)),
        });
        self
    }

    /// Validate the registration set and assemble the service. Duplicate
    /// (table, context) registrations and an empty set are configuration
    /// errors, fatal at startup.
    pub fn build(self) -> Result<SyncService> {
        if self.pending.is_empty() {
            bail!("at least one table must be registered");
        }
        if self.config.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }

        let mut seen = HashSet::new();
        let mut tables = Vec::with_capacity(self.pending.len());
        for pending in self.pending {
            let context = pending
                .context
                .unwrap_or_else(|| self.config.sync_context.clone());
            let key = TrackedTable::with_context(&pending.table, &context);
            if !seen.insert(key.clone()) {
                bail!("{key} is registered twice");
            }
            tables.push(Arc::new(TableEntry {
                binding: (pending.make)(key),
                in_flight: AtomicBool::new(false),
            }));
        }

        Ok(SyncService {
            engine: self.engine,
            limiter: Arc::new(Semaphore::new(self.config.max_concurrency)),
            cancel: CancelFlag::new(),
            config: self.config,
            tables,
        })
    }
}

/// Drives the engine repeatedly on a timer across every registered table.
///
/// Cycles for one key never overlap: a tick that finds a previous cycle for
/// a table still in flight skips that table. Cycles for different keys run
/// concurrently up to `max_concurrency`. Cycle failures are logged and never
/// stop the loop.
pub struct SyncService {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    tables: Vec<Arc<TableEntry>>,
    limiter: Arc<Semaphore>,
    cancel: CancelFlag,
}

impl SyncService {
    pub fn builder(engine: Arc<SyncEngine>) -> SyncServiceBuilder {
        SyncServiceBuilder {
            engine,
            config: SyncConfig::default(),
            pending: Vec::new(),
        }
    }

    /// Run the polling loop until a shutdown signal arrives. No new cycles
    /// start after the signal; in-flight cycles are cancelled at their next
    /// step boundary and drained before this returns.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval);
        let mut cycles: JoinSet<()> = JoinSet::new();

        tracing::info!(
            "starting sync service: {} tables, poll interval {:?}, max concurrency {}",
            self.tables.len(),
            self.config.poll_interval,
            self.config.max_concurrency
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping sync service");
                    break;
                }
                Some(_) = cycles.join_next(), if !cycles.is_empty() => {}
                _ = ticker.tick() => {
                    for entry in &self.tables {
                        self.schedule(entry, &mut cycles);
                    }
                }
            }
        }

        self.cancel.cancel();
        while cycles.join_next().await.is_some() {}
        tracing::info!("sync service stopped");
        Ok(())
    }

    /// Run one cycle now for a registered key; administrative trigger. Fails
    /// if a scheduled cycle for the key is already in flight.
    pub async fn run_table_once(&self, key: &TrackedTable) -> Result<CycleOutcome> {
        let entry = self
            .tables
            .iter()
            .find(|entry| entry.binding.key() == key)
            .ok_or_else(|| anyhow!("{key} is not registered"))?;

        if entry
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("a sync cycle is already in flight for {key}");
        }
        let _guard = InFlightGuard(entry);

        let outcome = entry.binding.run(&self.engine, &self.cancel).await?;
        Ok(outcome)
    }

    fn schedule(&self, entry: &Arc<TableEntry>, cycles: &mut JoinSet<()>) {
        if entry
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                "skipping {}: previous cycle still in flight",
                entry.binding.key()
            );
            return;
        }

        let engine = Arc::clone(&self.engine);
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        let entry = Arc::clone(entry);

        cycles.spawn(async move {
            let _guard = InFlightGuard(&entry);
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let key = entry.binding.key().clone();
            match entry.binding.run(&engine, &cancel).await {
                Ok(CycleOutcome::NoChanges) => {}
                Ok(CycleOutcome::Committed { version, entries }) => {
                    tracing::info!(
                        "synced {} entries for {}, checkpoint now {}",
                        entries,
                        key,
                        version
                    );
                }
                Err(err @ SyncError::Cancelled { .. }) => {
                    tracing::debug!("{err}");
                }
                Err(err) => {
                    tracing::error!("sync cycle failed: {:#}", anyhow::Error::new(err));
                }
            }
        });
    }
}
