// ABOUTME: Checkpoint persistence contract for sync cursors
// ABOUTME: One row per (table, sync context), upserted never appended

use anyhow::Result;
use async_trait::async_trait;

use crate::model::TrackedTable;

/// Persists the last fully synchronized change version per tracked table and
/// sync context.
///
/// At most one cursor exists per key. The cursor is created by `initialize`,
/// advanced only by the sync engine's commit step, and never deleted by the
/// engine. Writers for different keys never conflict; writes for the same key
/// are serialized by the engine's non-overlap rule.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The persisted cursor, or `None` when the key was never initialized.
    async fn last_version(&self, key: &TrackedTable) -> Result<Option<i64>>;

    /// Atomic conditional-update-or-insert of the cursor, as a single
    /// parameterized statement. Safe to call repeatedly with a non-decreasing
    /// version from a single writer.
    async fn set_last_version(&self, key: &TrackedTable, version: i64) -> Result<()>;

    /// Create the cursor if absent; a no-op when it already exists. Seeds to
    /// 0, or to the store's current version when `seed_to_current_version` is
    /// set — that marks every pre-existing row as already synchronized, so
    /// the first cycle only sees rows changed after initialization.
    async fn initialize(&self, key: &TrackedTable, seed_to_current_version: bool) -> Result<()>;
}
