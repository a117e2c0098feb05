// ABOUTME: Version-checkpointed change synchronization engine
// ABOUTME: Checkpoint store, change batch source, processor fan-out, hosted polling loop

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod model;
pub mod processor;
pub mod service;
pub mod source;
pub mod store;

pub use checkpoint::CheckpointStore;
pub use engine::{CancelFlag, CycleOutcome, StepTimeouts, SyncEngine, TableBinding};
pub use error::{CycleStep, SyncError};
pub use model::{
    ChangeBatch, ChangeEntry, ChangeOperation, EntryDecodeError, TrackedTable,
    DEFAULT_SYNC_CONTEXT,
};
pub use processor::{ChangeSetProcessor, LogChangesProcessor};
pub use service::{SyncConfig, SyncService, SyncServiceBuilder};
pub use source::{decode_stream, ChangeSource, RawChangeStream};
pub use store::{ChangeStore, ChangeWrite, CheckpointRow};
