// ABOUTME: Integration tests for the sync engine cycle
// ABOUTME: Checkpoint advancement, redelivery, and failure isolation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tempfile::tempdir;

use change_sync::{
    decode_stream, CancelFlag, ChangeBatch, ChangeOperation, ChangeSetProcessor, ChangeSource,
    ChangeStore, ChangeWrite, CheckpointStore, CycleOutcome, CycleStep, StepTimeouts, SyncEngine,
    SyncError, TrackedTable,
};

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct Account {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    balance: i64,
}

/// Captures every batch it is handed as (version, op, id) triples.
#[derive(Default)]
struct RecordingProcessor {
    batches: Mutex<Vec<Vec<(i64, ChangeOperation, i64)>>>,
}

impl RecordingProcessor {
    fn seen(&self) -> Vec<Vec<(i64, ChangeOperation, i64)>> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ChangeSetProcessor<Account> for RecordingProcessor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn process(&self, batch: &ChangeBatch<Account>) -> Result<()> {
        let rows = batch
            .entries
            .iter()
            .map(|entry| (entry.version, entry.op, entry.entity.id))
            .collect();
        self.batches.lock().push(rows);
        Ok(())
    }
}

struct FailingProcessor;

#[async_trait]
impl ChangeSetProcessor<Account> for FailingProcessor {
    fn name(&self) -> &str {
        "failing-indexer"
    }

    async fn process(&self, _batch: &ChangeBatch<Account>) -> Result<()> {
        Err(anyhow!("index rebuild failed"))
    }
}

/// Checkpoint store wrapper that can be told to reject writes.
struct FlakyCheckpoints {
    inner: ChangeStore,
    fail_writes: AtomicBool,
}

impl FlakyCheckpoints {
    fn new(inner: ChangeStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpoints {
    async fn last_version(&self, key: &TrackedTable) -> Result<Option<i64>> {
        self.inner.last_version(key).await
    }

    async fn set_last_version(&self, key: &TrackedTable, version: i64) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("checkpoint table unavailable"));
        }
        self.inner.set_last_version(key, version).await
    }

    async fn initialize(&self, key: &TrackedTable, seed_to_current_version: bool) -> Result<()> {
        self.inner.initialize(key, seed_to_current_version).await
    }
}

fn engine_for(store: &ChangeStore) -> SyncEngine {
    SyncEngine::new(Arc::new(store.clone()), Arc::new(store.clone()))
}

fn account_row(id: i64) -> serde_json::Value {
    json!({"id": id, "name": format!("account-{id}"), "balance": 100 * id})
}

#[tokio::test]
async fn cycle_fails_when_checkpoint_was_never_initialized() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![Arc::new(RecordingProcessor::default())];

    let err = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotInitialized { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn empty_batch_skips_commit_and_keeps_seed() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    let processor = Arc::new(RecordingProcessor::default());
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![processor.clone()];

    engine.initialize(&key, false).await.unwrap();
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome, CycleOutcome::NoChanges);
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));
    assert!(processor.seen().is_empty());
}

#[tokio::test]
async fn batch_is_ordered_and_checkpoint_advances_to_batch_max() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");

    // Push the store version to 10, then mark everything before as synced.
    for i in 0..10 {
        store
            .record_one(ChangeWrite::insert("seed", json!({"id": i})))
            .unwrap();
    }
    engine.initialize(&key, true).await.unwrap();
    assert_eq!(store.last_version(&key).await.unwrap(), Some(10));

    // One transaction touching two rows, an unrelated table, then one more row.
    store
        .record(&[
            ChangeWrite::insert("accounts", account_row(1)),
            ChangeWrite::insert("accounts", account_row(2)),
        ])
        .unwrap();
    store
        .record_one(ChangeWrite::insert("audit", json!({"id": 99})))
        .unwrap();
    store
        .record_one(ChangeWrite::update("accounts", account_row(3)))
        .unwrap();

    let batch = store.next_batch(&key).await.unwrap();
    assert_eq!(batch.max_version(), Some(13));
    assert!(batch.max_version().unwrap() <= store.current_version().await.unwrap());

    let processor = Arc::new(RecordingProcessor::default());
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![processor.clone()];
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            version: 13,
            entries: 3
        }
    );
    assert_eq!(
        processor.seen(),
        vec![vec![
            (11, ChangeOperation::Insert, 1),
            (11, ChangeOperation::Insert, 2),
            (13, ChangeOperation::Update, 3),
        ]]
    );
    assert_eq!(store.last_version(&key).await.unwrap(), Some(13));

    // The committed range is gone; a fresh cycle is a no-op.
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(outcome, CycleOutcome::NoChanges);
}

#[tokio::test]
async fn processor_failure_leaves_checkpoint_untouched_and_redelivers() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    store
        .record_one(ChangeWrite::insert("accounts", account_row(1)))
        .unwrap();

    let recording = Arc::new(RecordingProcessor::default());
    let failing: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![recording.clone(), Arc::new(FailingProcessor)];

    let err = engine
        .run_cycle(&key, &failing, &CancelFlag::new())
        .await
        .unwrap_err();
    match &err {
        SyncError::Processor { processor, .. } => assert_eq!(processor.as_str(), "failing-indexer"),
        other => panic!("expected processor failure, got {other}"),
    }
    // The recording processor ran before the failure; its effect stays, the
    // checkpoint does not move.
    assert_eq!(recording.seen().len(), 1);
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));

    // Without the failing processor the same batch is delivered again.
    let ok: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![recording.clone()];
    let outcome = engine.run_cycle(&key, &ok, &CancelFlag::new()).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            version: 1,
            entries: 1
        }
    );
    let seen = recording.seen();
    assert_eq!(seen[0], seen[1]);
}

#[tokio::test]
async fn checkpoint_write_failure_redelivers_the_identical_batch() {
    let store = ChangeStore::in_memory().unwrap();
    let checkpoints = Arc::new(FlakyCheckpoints::new(store.clone()));
    let engine = SyncEngine::new(checkpoints.clone(), Arc::new(store.clone()));
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    store
        .record(&[
            ChangeWrite::insert("accounts", account_row(1)),
            ChangeWrite::update("accounts", account_row(2)),
        ])
        .unwrap();

    let recording = Arc::new(RecordingProcessor::default());
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![recording.clone()];

    checkpoints.fail_writes(true);
    let err = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::CheckpointWrite { version: 1, .. }
    ));
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));

    checkpoints.fail_writes(false);
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            version: 1,
            entries: 2
        }
    );

    let seen = recording.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(store.last_version(&key).await.unwrap(), Some(1));
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let store = ChangeStore::in_memory().unwrap();
    let key = TrackedTable::new("accounts");

    store.initialize(&key, false).await.unwrap();
    store
        .record_one(ChangeWrite::insert("accounts", account_row(1)))
        .unwrap();

    // A second initialize, even seeded-to-current, must not move the cursor.
    store.initialize(&key, true).await.unwrap();
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));
    assert_eq!(store.next_batch(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn seeded_initialize_hides_preexisting_rows() {
    let store = ChangeStore::in_memory().unwrap();
    let key = TrackedTable::new("accounts");

    store
        .record_one(ChangeWrite::insert("accounts", account_row(1)))
        .unwrap();
    store.initialize(&key, true).await.unwrap();

    assert_eq!(store.last_version(&key).await.unwrap(), Some(1));
    assert!(store.next_batch(&key).await.unwrap().is_empty());
}

#[tokio::test]
async fn contexts_keep_independent_cursors() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let primary = TrackedTable::new("accounts");
    let search = TrackedTable::with_context("accounts", "Search");
    engine.initialize(&primary, false).await.unwrap();
    engine.initialize(&search, false).await.unwrap();

    store
        .record_one(ChangeWrite::insert("accounts", account_row(1)))
        .unwrap();

    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![Arc::new(RecordingProcessor::default())];
    engine
        .run_cycle(&primary, &processors, &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(store.last_version(&primary).await.unwrap(), Some(1));
    assert_eq!(store.last_version(&search).await.unwrap(), Some(0));
    assert_eq!(store.next_batch(&search).await.unwrap().len(), 1);
}

#[tokio::test]
async fn checkpoint_is_monotonic_across_cycles() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![Arc::new(RecordingProcessor::default())];
    let mut last = 0;
    for round in 1..=5 {
        store
            .record_one(ChangeWrite::update("accounts", account_row(round)))
            .unwrap();
        let outcome = engine
            .run_cycle(&key, &processors, &CancelFlag::new())
            .await
            .unwrap();
        let committed = match outcome {
            CycleOutcome::Committed { version, .. } => version,
            other => panic!("expected a commit, got {other:?}"),
        };
        assert!(committed >= last);
        assert_eq!(store.last_version(&key).await.unwrap(), Some(committed));
        last = committed;
    }
}

#[tokio::test]
async fn undecodable_entity_fails_the_cycle_with_its_version() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    store
        .record_one(ChangeWrite::insert("accounts", json!({"id": "not-a-number"})))
        .unwrap();

    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![Arc::new(RecordingProcessor::default())];
    let err = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Decode { version: 1, .. }));
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));
}

#[tokio::test]
async fn cancelled_flag_stops_the_cycle_before_fetch() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> =
        vec![Arc::new(RecordingProcessor::default())];
    let err = engine
        .run_cycle(&key, &processors, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Cancelled {
            step: CycleStep::Fetch,
            ..
        }
    ));
}

#[tokio::test]
async fn slow_dispatch_times_out_and_keeps_checkpoint() {
    struct SlowProcessor;

    #[async_trait]
    impl ChangeSetProcessor<Account> for SlowProcessor {
        async fn process(&self, _batch: &ChangeBatch<Account>) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store).with_timeouts(StepTimeouts {
        dispatch: Some(Duration::from_millis(50)),
        ..StepTimeouts::default()
    });
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();
    store
        .record_one(ChangeWrite::insert("accounts", account_row(1)))
        .unwrap();

    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![Arc::new(SlowProcessor)];
    let err = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::StepTimeout {
            step: CycleStep::Dispatch,
            ..
        }
    ));
    assert_eq!(store.last_version(&key).await.unwrap(), Some(0));
}

#[tokio::test]
async fn capped_batches_cover_the_full_range_without_splitting_versions() {
    let store = ChangeStore::in_memory().unwrap();
    let engine = engine_for(&store);
    let key = TrackedTable::new("accounts");
    engine.initialize(&key, false).await.unwrap();

    store
        .record(&[
            ChangeWrite::insert("accounts", account_row(1)),
            ChangeWrite::insert("accounts", account_row(2)),
        ])
        .unwrap();
    store
        .record_one(ChangeWrite::insert("accounts", account_row(3)))
        .unwrap();

    store.set_max_batch_rows(Some(1));

    // First capped batch: the whole version-1 group, nothing of version 2.
    let processor = Arc::new(RecordingProcessor::default());
    let processors: Vec<Arc<dyn ChangeSetProcessor<Account>>> = vec![processor.clone()];
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            version: 1,
            entries: 2
        }
    );

    // Second cycle picks up where the cap stopped.
    let outcome = engine
        .run_cycle(&key, &processors, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Committed {
            version: 2,
            entries: 1
        }
    );
    assert_eq!(store.last_version(&key).await.unwrap(), Some(2));
}

#[tokio::test]
async fn change_stream_pages_match_the_unbounded_batch() {
    use futures::TryStreamExt;

    let store = ChangeStore::in_memory().unwrap();
    let key = TrackedTable::new("accounts");
    store.initialize(&key, false).await.unwrap();

    for id in 1..=5 {
        store
            .record_one(ChangeWrite::insert("accounts", account_row(id)))
            .unwrap();
    }

    let batch = store.next_batch(&key).await.unwrap();

    store.set_max_batch_rows(Some(2));
    let stream = store.change_stream(&key).await.unwrap();
    let streamed: Vec<_> = stream.try_collect().await.unwrap();

    assert_eq!(streamed.len(), batch.len());
    for (streamed, fetched) in streamed.iter().zip(batch.entries.iter()) {
        assert_eq!(streamed.version, fetched.version);
        assert_eq!(streamed.entity, fetched.entity);
    }

    // A stream is single-pass, but a fresh call restarts from the cursor.
    let stream = store.change_stream(&key).await.unwrap();
    let again: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(again.len(), streamed.len());
}

#[tokio::test]
async fn decoded_stream_yields_typed_entities() {
    use futures::TryStreamExt;

    let store = ChangeStore::in_memory().unwrap();
    let key = TrackedTable::new("accounts");
    store.initialize(&key, false).await.unwrap();
    store
        .record_one(ChangeWrite::insert("accounts", account_row(7)))
        .unwrap();

    let stream = store.change_stream(&key).await.unwrap();
    let typed: Vec<_> = decode_stream::<Account>(stream).try_collect().await.unwrap();
    assert_eq!(typed.len(), 1);
    assert_eq!(typed[0].entity.id, 7);
    assert_eq!(typed[0].entity.name, "account-7");
}

#[tokio::test]
async fn store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("changes.db");
    let key = TrackedTable::new("accounts");

    {
        let store = ChangeStore::open(&path).unwrap();
        store.initialize(&key, false).await.unwrap();
        store
            .record_one(ChangeWrite::insert("accounts", account_row(1)))
            .unwrap();
        store.set_last_version(&key, 1).await.unwrap();
    }

    let store = ChangeStore::open(&path).unwrap();
    assert_eq!(store.version().unwrap(), 1);
    assert_eq!(store.last_version(&key).await.unwrap(), Some(1));
    assert!(store.next_batch(&key).await.unwrap().is_empty());
}
