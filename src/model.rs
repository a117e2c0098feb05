// ABOUTME: Core data model for change synchronization
// ABOUTME: Tracked table keys, change operations, entries, and batches

use std::fmt;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync context used when a consumer does not name one.
pub const DEFAULT_SYNC_CONTEXT: &str = "Default";

/// Identifies one independent sync cursor: a tracked table plus the named
/// consumer (sync context) following it. Distinct contexts never share a
/// cursor, so multiple consumers can track the same table independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedTable {
    pub table: String,
    pub sync_context: String,
}

impl TrackedTable {
    /// Key for `table` under the default sync context.
    pub fn new(table: &str) -> Self {
        Self::with_context(table, DEFAULT_SYNC_CONTEXT)
    }

    pub fn with_context(table: &str, sync_context: &str) -> Self {
        Self {
            table: table.to_string(),
            sync_context: sync_context.to_string(),
        }
    }
}

impl fmt::Display for TrackedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.table, self.sync_context)
    }
}

/// The kind of row-level change a change log entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "insert" => Ok(ChangeOperation::Insert),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            other => Err(anyhow!("unknown change op: {other}")),
        }
    }
}

/// One row-level change, tagged with the store version at which it became
/// visible. For deletes the entity projection typically carries only key
/// columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry<T> {
    pub version: i64,
    pub op: ChangeOperation,
    pub entity: T,
}

/// Failure to materialize one raw change row into a typed entity.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode change entity at version {version}")]
pub struct EntryDecodeError {
    pub version: i64,
    #[source]
    pub source: serde_json::Error,
}

impl ChangeEntry<Value> {
    /// Materialize the raw JSON projection into a typed entity.
    pub fn decode<T: DeserializeOwned>(self) -> Result<ChangeEntry<T>, EntryDecodeError> {
        let ChangeEntry {
            version,
            op,
            entity,
        } = self;
        match serde_json::from_value(entity) {
            Ok(entity) => Ok(ChangeEntry {
                version,
                op,
                entity,
            }),
            Err(source) => Err(EntryDecodeError { version, source }),
        }
    }
}

/// An ordered batch of change entries for one table, as returned by a single
/// fetch. Entries are non-decreasing in version; several entries may share a
/// version when one store transaction touched several rows.
#[derive(Debug, Clone)]
pub struct ChangeBatch<T> {
    pub table: String,
    pub entries: Vec<ChangeEntry<T>>,
}

impl<T> ChangeBatch<T> {
    pub fn empty(table: &str) -> Self {
        Self {
            table: table.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Highest version present in the batch, or `None` when empty. This is
    /// the only value a checkpoint is ever advanced to.
    pub fn max_version(&self) -> Option<i64> {
        self.entries.last().map(|entry| entry.version)
    }
}

impl ChangeBatch<Value> {
    /// Materialize every raw entry into a typed entity. Fails on the first
    /// entry that does not fit `T`, naming its version.
    pub fn decode<T: DeserializeOwned>(self) -> Result<ChangeBatch<T>, EntryDecodeError> {
        let ChangeBatch { table, entries } = self;
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            decoded.push(entry.decode()?);
        }
        Ok(ChangeBatch {
            table,
            entries: decoded,
        })
    }
}
