// ABOUTME: Typed failure taxonomy for sync cycles
// ABOUTME: Every failure leaves the checkpoint where the last commit put it

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::TrackedTable;

/// The step of a sync cycle a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    Fetch,
    Dispatch,
    Commit,
}

impl CycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStep::Fetch => "fetch",
            CycleStep::Dispatch => "dispatch",
            CycleStep::Commit => "commit",
        }
    }
}

impl fmt::Display for CycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one sync cycle. None of these advance the checkpoint; the
/// variants differ in what has to happen before a retry can succeed.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No checkpoint row exists for the key. The caller must initialize the
    /// tracked table before cycles can run.
    #[error("no sync checkpoint for {key}; initialize it before syncing")]
    NotInitialized { key: TrackedTable },

    /// Collaborator I/O failure while reading the checkpoint or the change
    /// batch. The next scheduled cycle retries the same range.
    #[error("failed to fetch changes for {key}")]
    Fetch {
        key: TrackedTable,
        #[source]
        source: anyhow::Error,
    },

    /// A raw change row did not materialize into the registered entity type.
    #[error("failed to decode change entity for {key} at version {version}")]
    Decode {
        key: TrackedTable,
        version: i64,
        #[source]
        source: serde_json::Error,
    },

    /// A processor rejected the batch. Effects of processors that already ran
    /// in this cycle are not rolled back; the whole batch is redelivered.
    #[error("processor {processor} failed for {key}")]
    Processor {
        key: TrackedTable,
        processor: String,
        #[source]
        source: anyhow::Error,
    },

    /// Processing succeeded but the cursor could not be advanced. The next
    /// cycle redelivers the same batch.
    #[error("failed to advance checkpoint for {key} to version {version}")]
    CheckpointWrite {
        key: TrackedTable,
        version: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} step for {key} timed out after {timeout:?}")]
    StepTimeout {
        key: TrackedTable,
        step: CycleStep,
        timeout: Duration,
    },

    #[error("cycle for {key} cancelled before the {step} step")]
    Cancelled { key: TrackedTable, step: CycleStep },
}

impl SyncError {
    /// True when the next scheduled cycle can retry the same range without
    /// operator intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::NotInitialized { .. } | SyncError::Decode { .. }
        )
    }
}
