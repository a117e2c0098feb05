// ABOUTME: SQLite-backed change tracking store
// ABOUTME: Change log, per-transaction version counter, and sync checkpoints

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::checkpoint::CheckpointStore;
use crate::model::{ChangeBatch, ChangeEntry, ChangeOperation, TrackedTable};
use crate::source::{ChangeSource, RawChangeStream};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    change_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    version       INTEGER NOT NULL,
    table_name    TEXT NOT NULL,
    op            TEXT NOT NULL,
    entity        TEXT NOT NULL,
    recorded_at   TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_change_log_table_version
    ON change_log(table_name, version);

CREATE TABLE IF NOT EXISTS change_tracking_version (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    version  INTEGER NOT NULL
);

INSERT OR IGNORE INTO change_tracking_version (id, version) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS sync_checkpoints (
    table_name           TEXT NOT NULL,
    sync_context         TEXT NOT NULL,
    last_synced_version  INTEGER NOT NULL,
    updated_at           TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (table_name, sync_context)
);
"#;

const STREAM_PAGE_SIZE: usize = 256;

/// One row-level change to record. The entity projection is an arbitrary JSON
/// document; for deletes it should carry the key columns.
#[derive(Debug, Clone)]
pub struct ChangeWrite {
    pub table: String,
    pub op: ChangeOperation,
    pub entity: Value,
}

impl ChangeWrite {
    pub fn insert(table: &str, entity: Value) -> Self {
        Self::new(table, ChangeOperation::Insert, entity)
    }

    pub fn update(table: &str, entity: Value) -> Self {
        Self::new(table, ChangeOperation::Update, entity)
    }

    pub fn delete(table: &str, key_projection: Value) -> Self {
        Self::new(table, ChangeOperation::Delete, key_projection)
    }

    fn new(table: &str, op: ChangeOperation, entity: Value) -> Self {
        Self {
            table: table.to_string(),
            op,
            entity,
        }
    }
}

/// One persisted checkpoint row, for status listings.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub key: TrackedTable,
    pub last_synced_version: i64,
    pub updated_at: DateTime<Utc>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    max_batch_rows: Mutex<Option<usize>>,
}

/// Change tracking store backed by a single SQLite database.
///
/// Holds the append-only change log, the store-wide version counter, and the
/// sync checkpoint table. Cloning is cheap and shares the underlying
/// connection.
#[derive(Clone)]
pub struct ChangeStore {
    inner: Arc<StoreInner>,
}

impl ChangeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open change store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for change store")?;
        conn.pragma_update(None, "synchronous", &"normal").ok();
        Self::from_connection(conn)
    }

    /// Open a private in-memory store. Used by tests and throwaway tooling.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize change store schema")?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                max_batch_rows: Mutex::new(None),
            }),
        })
    }

    /// Cap the number of rows a single `next_batch` call returns. A capped
    /// batch is always extended to a version boundary, so it may exceed the
    /// cap by the tail of the last version group. `None` removes the cap.
    pub fn set_max_batch_rows(&self, cap: Option<usize>) {
        *self.inner.max_batch_rows.lock() = cap;
    }

    /// Record a set of row changes as one store transaction: the version
    /// counter advances exactly once and every row shares the new version.
    /// Returns that version.
    pub fn record(&self, changes: &[ChangeWrite]) -> Result<i64> {
        anyhow::ensure!(
            !changes.is_empty(),
            "a change transaction must contain at least one row"
        );

        let mut conn = self.inner.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to begin change transaction")?;
        tx.execute(
            "UPDATE change_tracking_version SET version = version + 1 WHERE id = 1",
            [],
        )
        .context("failed to advance change version")?;
        let version: i64 = tx
            .query_row(
                "SELECT version FROM change_tracking_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .context("failed to read change version")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO change_log (version, table_name, op, entity) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for change in changes {
                stmt.execute(params![
                    version,
                    change.table,
                    change.op.as_str(),
                    change.entity.to_string(),
                ])
                .with_context(|| format!("failed to record change for {}", change.table))?;
            }
        }
        tx.commit().context("failed to commit change transaction")?;
        Ok(version)
    }

    pub fn record_one(&self, change: ChangeWrite) -> Result<i64> {
        self.record(std::slice::from_ref(&change))
    }

    /// The store-wide change version: the version assigned to the most recent
    /// recording transaction, 0 when nothing was ever recorded.
    pub fn version(&self) -> Result<i64> {
        let conn = self.inner.conn.lock();
        conn.query_row(
            "SELECT version FROM change_tracking_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .context("failed to read change version")
    }

    /// All checkpoint rows, ordered by table then context.
    pub fn checkpoints(&self) -> Result<Vec<CheckpointRow>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT table_name, sync_context, last_synced_version, updated_at
             FROM sync_checkpoints ORDER BY table_name, sync_context",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, NaiveDateTime>(3)?,
            ))
        })?;
        let mut checkpoints = Vec::new();
        for row in rows {
            let (table, sync_context, last_synced_version, updated_at) =
                row.context("failed to read checkpoint row")?;
            checkpoints.push(CheckpointRow {
                key: TrackedTable {
                    table,
                    sync_context,
                },
                last_synced_version,
                updated_at: DateTime::from_naive_utc_and_offset(updated_at, Utc),
            });
        }
        Ok(checkpoints)
    }

    fn last_version_for(&self, key: &TrackedTable) -> Result<Option<i64>> {
        let conn = self.inner.conn.lock();
        conn.query_row(
            "SELECT last_synced_version FROM sync_checkpoints
             WHERE table_name = ?1 AND sync_context = ?2",
            params![key.table, key.sync_context],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to read checkpoint for {key}"))
    }

    /// Fetch rows with `after < version <= ceiling` for a table, oldest
    /// first. A capped page is extended so the last version group is always
    /// complete.
    fn fetch_page(
        &self,
        key: &TrackedTable,
        after: i64,
        ceiling: i64,
        cap: Option<usize>,
    ) -> Result<Vec<ChangeEntry<Value>>> {
        let conn = self.inner.conn.lock();
        let mut entries = match cap {
            Some(cap) => {
                let mut stmt = conn.prepare(
                    "SELECT version, op, entity FROM change_log
                     WHERE table_name = ?1 AND version > ?2 AND version <= ?3
                     ORDER BY version, change_id LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![key.table, after, ceiling, cap as i64],
                    Self::raw_row,
                )?;
                Self::collect_entries(key, rows)?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT version, op, entity FROM change_log
                     WHERE table_name = ?1 AND version > ?2 AND version <= ?3
                     ORDER BY version, change_id",
                )?;
                let rows = stmt.query_map(params![key.table, after, ceiling], Self::raw_row)?;
                Self::collect_entries(key, rows)?
            }
        };

        // A cap may have cut a version group in half; replace the tail with
        // the complete group so no row of that version is lost.
        if let Some(cap) = cap {
            if entries.len() == cap {
                if let Some(last_version) = entries.last().map(|entry| entry.version) {
                    entries.retain(|entry| entry.version < last_version);
                    let mut stmt = conn.prepare(
                        "SELECT version, op, entity FROM change_log
                         WHERE table_name = ?1 AND version = ?2
                         ORDER BY change_id",
                    )?;
                    let rows = stmt.query_map(params![key.table, last_version], Self::raw_row)?;
                    entries.extend(Self::collect_entries(key, rows)?);
                }
            }
        }

        Ok(entries)
    }

    fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String)> {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }

    fn collect_entries(
        key: &TrackedTable,
        rows: impl Iterator<Item = rusqlite::Result<(i64, String, String)>>,
    ) -> Result<Vec<ChangeEntry<Value>>> {
        let mut entries = Vec::new();
        for row in rows {
            let (version, op, entity) =
                row.with_context(|| format!("failed to read change row for {key}"))?;
            entries.push(ChangeEntry {
                version,
                op: ChangeOperation::parse(&op)?,
                entity: serde_json::from_str(&entity).with_context(|| {
                    format!("malformed entity projection for {key} at version {version}")
                })?,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl CheckpointStore for ChangeStore {
    async fn last_version(&self, key: &TrackedTable) -> Result<Option<i64>> {
        self.last_version_for(key)
    }

    async fn set_last_version(&self, key: &TrackedTable, version: i64) -> Result<()> {
        let conn = self.inner.conn.lock();
        conn.execute(
            "INSERT INTO sync_checkpoints (table_name, sync_context, last_synced_version)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name, sync_context) DO UPDATE
             SET last_synced_version = excluded.last_synced_version,
                 updated_at = CURRENT_TIMESTAMP",
            params![key.table, key.sync_context, version],
        )
        .with_context(|| format!("failed to advance checkpoint for {key}"))?;
        Ok(())
    }

    async fn initialize(&self, key: &TrackedTable, seed_to_current_version: bool) -> Result<()> {
        let seed = if seed_to_current_version {
            self.version()?
        } else {
            0
        };
        let conn = self.inner.conn.lock();
        conn.execute(
            "INSERT INTO sync_checkpoints (table_name, sync_context, last_synced_version)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name, sync_context) DO NOTHING",
            params![key.table, key.sync_context, seed],
        )
        .with_context(|| format!("failed to initialize checkpoint for {key}"))?;
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for ChangeStore {
    async fn next_batch(&self, key: &TrackedTable) -> Result<ChangeBatch<Value>> {
        let cursor = self.last_version_for(key)?.unwrap_or(0);
        let ceiling = self.version()?;
        let cap = *self.inner.max_batch_rows.lock();
        let entries = self.fetch_page(key, cursor, ceiling, cap)?;
        Ok(ChangeBatch {
            table: key.table.clone(),
            entries,
        })
    }

    async fn change_stream(&self, key: &TrackedTable) -> Result<RawChangeStream> {
        let cursor = self.last_version_for(key)?.unwrap_or(0);
        let ceiling = self.version()?;
        let page_size = (*self.inner.max_batch_rows.lock()).unwrap_or(STREAM_PAGE_SIZE);
        let store = self.clone();
        let key = key.clone();

        let pages = stream::try_unfold(cursor, move |after| {
            let store = store.clone();
            let key = key.clone();
            async move {
                let page = store.fetch_page(&key, after, ceiling, Some(page_size))?;
                Ok::<_, anyhow::Error>(match page.last() {
                    Some(last) => {
                        let next = last.version;
                        Some((page, next))
                    }
                    None => None,
                })
            }
        });

        Ok(pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, anyhow::Error>)))
            .try_flatten()
            .boxed())
    }

    async fn current_version(&self) -> Result<i64> {
        self.version()
    }
}
