// ABOUTME: Change retrieval contract over the tracking store
// ABOUTME: Checkpoint-relative next batch plus a lazy full-history stream

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{ChangeBatch, ChangeEntry, TrackedTable};

/// Stream of raw change entries in non-decreasing version order. Single-pass;
/// call `change_stream` again to restart from the current checkpoint.
pub type RawChangeStream = BoxStream<'static, Result<ChangeEntry<Value>>>;

/// Read side of the change tracking store.
///
/// Both operations capture their own version ceiling at call time: no version
/// visible to the store when the call is made may be silently omitted, and
/// two non-overlapping calls made at the same cursor never duplicate entries.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// All changes for the key's table with version strictly greater than its
    /// checkpoint (an absent checkpoint reads as 0) and no greater than the
    /// store version observed at call time, ordered by version. A row-capped
    /// implementation must cap on a version boundary so one store
    /// transaction's rows are never split across batches.
    async fn next_batch(&self, key: &TrackedTable) -> Result<ChangeBatch<Value>>;

    /// Lazy variant of `next_batch` for full catch-up: pages through the same
    /// range instead of materializing it at once.
    async fn change_stream(&self, key: &TrackedTable) -> Result<RawChangeStream>;

    /// The store-wide change version observed now. Each call captures its own
    /// independent ceiling; no cross-table snapshot is implied.
    async fn current_version(&self) -> Result<i64>;
}

/// Materialize a raw change stream into typed entries.
pub fn decode_stream<T>(stream: RawChangeStream) -> BoxStream<'static, Result<ChangeEntry<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    stream
        .map(|item| item.and_then(|entry| entry.decode::<T>().map_err(Into::into)))
        .boxed()
}
