// ABOUTME: Sync cycle orchestration: fetch, dispatch, commit
// ABOUTME: Advances a key's checkpoint only after every processor succeeds

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::checkpoint::CheckpointStore;
use crate::error::{CycleStep, SyncError};
use crate::model::{ChangeBatch, TrackedTable};
use crate::processor::ChangeSetProcessor;
use crate::source::ChangeSource;

/// Cooperative cancellation flag, observed at step boundaries only. A step
/// already underway runs to completion; the cycle fails before the next one.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-step time limits. `None` waits indefinitely. A timed-out step fails
/// the cycle with the checkpoint unchanged.
#[derive(Debug, Clone, Default)]
pub struct StepTimeouts {
    pub fetch: Option<Duration>,
    pub dispatch: Option<Duration>,
    pub commit: Option<Duration>,
}

/// Terminal state of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing past the checkpoint; nothing dispatched, checkpoint untouched.
    NoChanges,
    /// Every processor succeeded and the checkpoint advanced to `version`.
    Committed { version: i64, entries: usize },
}

/// Orchestrates one synchronization cycle per (table, sync context):
/// read checkpoint, fetch the next batch, dispatch it to every registered
/// processor, and only then advance the checkpoint to the batch maximum.
///
/// At-least-once per batch, exactly-once checkpoint advance: any failure
/// between dispatch and commit leaves the cursor untouched, so the next
/// cycle refetches the same range.
pub struct SyncEngine {
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn ChangeSource>,
    timeouts: StepTimeouts,
}

impl SyncEngine {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, source: Arc<dyn ChangeSource>) -> Self {
        Self {
            checkpoints,
            source,
            timeouts: StepTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Create the checkpoint for a key if absent. Convenience passthrough for
    /// bootstrap code; see [`CheckpointStore::initialize`].
    pub async fn initialize(
        &self,
        key: &TrackedTable,
        seed_to_current_version: bool,
    ) -> anyhow::Result<()> {
        self.checkpoints
            .initialize(key, seed_to_current_version)
            .await
    }

    /// Run one cycle for `key`, dispatching to `processors` in order.
    pub async fn run_cycle<T>(
        &self,
        key: &TrackedTable,
        processors: &[Arc<dyn ChangeSetProcessor<T>>],
        cancel: &CancelFlag,
    ) -> Result<CycleOutcome, SyncError>
    where
        T: DeserializeOwned + Send + Sync,
    {
        self.ensure_live(key, CycleStep::Fetch, cancel)?;
        let checkpoint = self
            .checkpoints
            .last_version(key)
            .await
            .map_err(|source| SyncError::Fetch {
                key: key.clone(),
                source,
            })?;
        if checkpoint.is_none() {
            return Err(SyncError::NotInitialized { key: key.clone() });
        }

        let raw = self
            .bounded(key, CycleStep::Fetch, self.timeouts.fetch, async {
                self.source
                    .next_batch(key)
                    .await
                    .map_err(|source| SyncError::Fetch {
                        key: key.clone(),
                        source,
                    })
            })
            .await?;
        if raw.is_empty() {
            tracing::debug!("no changes for {}", key);
            return Ok(CycleOutcome::NoChanges);
        }

        let batch: ChangeBatch<T> = raw.decode().map_err(|err| SyncError::Decode {
            key: key.clone(),
            version: err.version,
            source: err.source,
        })?;

        self.ensure_live(key, CycleStep::Dispatch, cancel)?;
        self.bounded(key, CycleStep::Dispatch, self.timeouts.dispatch, async {
            for processor in processors {
                processor
                    .process(&batch)
                    .await
                    .map_err(|source| SyncError::Processor {
                        key: key.clone(),
                        processor: processor.name().to_string(),
                        source,
                    })?;
            }
            Ok(())
        })
        .await?;

        self.ensure_live(key, CycleStep::Commit, cancel)?;
        let version = match batch.max_version() {
            Some(version) => version,
            None => return Ok(CycleOutcome::NoChanges),
        };
        self.bounded(key, CycleStep::Commit, self.timeouts.commit, async {
            self.checkpoints
                .set_last_version(key, version)
                .await
                .map_err(|source| SyncError::CheckpointWrite {
                    key: key.clone(),
                    version,
                    source,
                })
        })
        .await?;

        tracing::debug!(
            "advanced checkpoint for {} to version {} ({} entries)",
            key,
            version,
            batch.len()
        );
        Ok(CycleOutcome::Committed {
            version,
            entries: batch.len(),
        })
    }

    fn ensure_live(
        &self,
        key: &TrackedTable,
        step: CycleStep,
        cancel: &CancelFlag,
    ) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            Err(SyncError::Cancelled {
                key: key.clone(),
                step,
            })
        } else {
            Ok(())
        }
    }

    async fn bounded<O>(
        &self,
        key: &TrackedTable,
        step: CycleStep,
        limit: Option<Duration>,
        fut: impl Future<Output = Result<O, SyncError>>,
    ) -> Result<O, SyncError> {
        match limit {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::StepTimeout {
                    key: key.clone(),
                    step,
                    timeout,
                }),
            },
            None => fut.await,
        }
    }
}

/// Type-erased binding of one tracked table to its typed processor set. Lets
/// the hosted service drive cycles without knowing the entity type.
pub struct TableBinding {
    key: TrackedTable,
    runner: Box<dyn ErasedRunner>,
}

impl TableBinding {
    pub fn new<T>(key: TrackedTable, processors: Vec<Arc<dyn ChangeSetProcessor<T>>>) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            key,
            runner: Box::new(TypedRunner { processors }),
        }
    }

    pub fn key(&self) -> &TrackedTable {
        &self.key
    }

    pub(crate) fn run<'a>(
        &'a self,
        engine: &'a SyncEngine,
        cancel: &'a CancelFlag,
    ) -> BoxFuture<'a, Result<CycleOutcome, SyncError>> {
        self.runner.run(engine, &self.key, cancel)
    }
}

trait ErasedRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        engine: &'a SyncEngine,
        key: &'a TrackedTable,
        cancel: &'a CancelFlag,
    ) -> BoxFuture<'a, Result<CycleOutcome, SyncError>>;
}

struct TypedRunner<T> {
    processors: Vec<Arc<dyn ChangeSetProcessor<T>>>,
}

impl<T> ErasedRunner for TypedRunner<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn run<'a>(
        &'a self,
        engine: &'a SyncEngine,
        key: &'a TrackedTable,
        cancel: &'a CancelFlag,
    ) -> BoxFuture<'a, Result<CycleOutcome, SyncError>> {
        Box::pin(engine.run_cycle(key, &self.processors, cancel))
    }
}
