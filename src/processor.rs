// ABOUTME: Processor contract for consuming change batches
// ABOUTME: All processors registered for a table run for every batch

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::model::ChangeBatch;

/// Consumes one batch of changes for one entity type and performs a side
/// effect: propagate, index, invalidate a cache.
///
/// A failed cycle is redelivered in full on the next cycle, and sibling
/// processors' effects are never rolled back, so implementations must be
/// idempotent with respect to (operation, version, key) or tolerate duplicate
/// delivery.
#[async_trait]
pub trait ChangeSetProcessor<T>: Send + Sync {
    /// Name used in logs and failure attribution.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn process(&self, batch: &ChangeBatch<T>) -> Result<()>;
}

/// Processor that logs every entry it receives. Used by the CLI `run`
/// command; also handy as a smoke-test consumer.
pub struct LogChangesProcessor;

#[async_trait]
impl ChangeSetProcessor<Value> for LogChangesProcessor {
    fn name(&self) -> &str {
        "log-changes"
    }

    async fn process(&self, batch: &ChangeBatch<Value>) -> Result<()> {
        for entry in &batch.entries {
            tracing::info!(
                "{} v{} {}: {}",
                batch.table,
                entry.version,
                entry.op.as_str(),
                entry.entity
            );
        }
        Ok(())
    }
}
