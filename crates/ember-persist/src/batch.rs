//! Eventually-consistent write accumulator.
//!
//! A [`Batch`] collects dirty entities. [`Batch::commit`] swaps the collected
//! set out for a fresh one, so the batch is reusable at once, and drains the
//! swapped-out set on the runtime: pass after pass, every pending entity is
//! committed; recoverable failures stay for the next pass, everything else
//! leaves. A pass that overruns its watchdog drops whatever is left.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use ember_types::EntityId;

use crate::database::Database;
use crate::error::{PersistError, PersistResult};
use crate::log::LogLevel;

/// Result of one commit attempt of one entity.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Written, or nothing needed writing.
    Committed,
    /// Failed; the entity keeps its change and should be retried.
    Recoverable(PersistError),
    /// Failed for good; the change is lost.
    Unrecoverable(PersistError),
}

/// Something a [`Batch`] can drive to storage.
#[async_trait]
pub trait Committable: Send + Sync {
    fn entity_id(&self) -> EntityId;

    /// Human-readable `cache/id` used in log messages.
    fn describe(&self) -> String;

    /// Push the current state to storage. `timeout` bounds the wait, not the
    /// write itself.
    async fn commit(&self, timeout: Duration) -> CommitOutcome;

    /// Give up on unwritten changes. Returns `true` if any were lost.
    fn abandon(&self) -> bool;
}

/// Summary of a drained batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    pub batch: Uuid,
    pub passes: u32,
    pub committed: usize,
    pub failed: usize,
    pub dropped: usize,
    pub timed_out: bool,
}

impl BatchReport {
    fn new(batch: Uuid) -> Self {
        Self {
            batch,
            passes: 0,
            committed: 0,
            failed: 0,
            dropped: 0,
            timed_out: false,
        }
    }

    /// Every entity reached storage.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dropped == 0
    }
}

type Pending = HashMap<EntityId, Arc<dyn Committable>>;

struct Delegate {
    id: Uuid,
    items: Pending,
}

impl Delegate {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            items: HashMap::new(),
        }
    }
}

/// Accumulates dirty entities and commits them together.
///
/// Dropping a batch that still holds entities is a lost update: each one is
/// logged at error level and its change is discarded.
pub struct Batch {
    database: Arc<Database>,
    delegate: Mutex<Delegate>,
}

impl Batch {
    pub fn new(database: &Arc<Database>) -> Self {
        Self {
            database: Arc::clone(database),
            delegate: Mutex::new(Delegate::new()),
        }
    }

    /// Id of the delegate currently collecting entities. Changes on every commit.
    pub fn id(&self) -> Uuid {
        self.delegate.lock().expect("batch lock poisoned").id
    }

    pub fn len(&self) -> usize {
        self.delegate.lock().expect("batch lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.delegate
            .lock()
            .expect("batch lock poisoned")
            .items
            .contains_key(id)
    }

    /// Add `entity`, replacing any entry with the same id.
    pub fn insert<E: Committable + 'static>(&self, entity: Arc<E>) {
        let id = entity.entity_id();
        let previous = self
            .delegate
            .lock()
            .expect("batch lock poisoned")
            .items
            .insert(id, entity);
        // Released outside the lock: the last handle may run a destructor.
        drop(previous);
    }

    fn take(&self) -> Delegate {
        let mut delegate = self.delegate.lock().expect("batch lock poisoned");
        std::mem::replace(&mut *delegate, Delegate::new())
    }

    /// Start draining everything collected so far.
    pub fn commit(&self) -> JoinHandle<BatchReport> {
        let Delegate { id, items } = self.take();
        let database = Arc::clone(&self.database);
        self.database.runtime().spawn(drain(database, id, items))
    }

    /// Like [`commit`](Self::commit), invoking `completion` once drained.
    pub fn commit_with<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(BatchReport) + Send + 'static,
    {
        let Delegate { id, items } = self.take();
        let database = Arc::clone(&self.database);
        self.database.runtime().spawn(async move {
            completion(drain(database, id, items).await);
        })
    }

    pub async fn commit_and_wait(&self) -> PersistResult<BatchReport> {
        self.commit()
            .await
            .map_err(|e| PersistError::TaskFailed(e.to_string()))
    }

    /// Commit and block the calling thread until drained.
    ///
    /// Inside a runtime this needs the multi-threaded flavor.
    pub fn commit_sync(&self) -> PersistResult<BatchReport> {
        self.database
            .block_on(self.commit())?
            .map_err(|e| PersistError::TaskFailed(e.to_string()))
    }
}

async fn drain(database: Arc<Database>, batch: Uuid, mut pending: Pending) -> BatchReport {
    let config = database.config().clone();
    let mut report = BatchReport::new(batch);

    while !pending.is_empty() {
        report.passes += 1;
        let deadline = Instant::now() + config.pass_timeout();
        let mut pass = JoinSet::new();
        for (id, entity) in &pending {
            let id = *id;
            let entity = Arc::clone(entity);
            let timeout = config.commit_timeout();
            pass.spawn(async move { (id, entity.commit(timeout).await) });
        }

        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, pass.join_next()).await {
                Ok(Some(Ok((id, outcome)))) => settle(&database, &mut pending, &mut report, id, outcome),
                Ok(Some(Err(e))) => {
                    // The entity stays pending and is retried next pass.
                    database.log(
                        LogLevel::Error,
                        "Batch",
                        "commit",
                        &format!("commit task failed: {e}"),
                        json!({ "batch": batch.to_string() }),
                    );
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            pass.abort_all();
            let err = PersistError::BatchTimeout {
                batch,
                timeout: config.pass_timeout(),
            };
            database.log(
                LogLevel::Error,
                "Batch",
                "commit",
                &err.to_string(),
                json!({ "batch": batch.to_string(), "remaining": pending.len() }),
            );
            report.timed_out = true;
            drop_remaining(&database, &mut pending, &mut report, "timeout");
            break;
        }
        if pending.is_empty() {
            break;
        }
        if let Some(max) = config.max_batch_passes {
            if report.passes >= max {
                for entity in pending.values() {
                    let err = PersistError::RetriesExhausted {
                        id: entity.entity_id(),
                        passes: report.passes,
                    };
                    database.log(
                        LogLevel::Error,
                        "Batch",
                        "commit",
                        &err.to_string(),
                        json!({ "batch": batch.to_string() }),
                    );
                }
                drop_remaining(&database, &mut pending, &mut report, "retries");
                break;
            }
        }
        tokio::time::sleep(config.batch_retry_interval()).await;
    }

    debug!(
        batch = %batch,
        passes = report.passes,
        committed = report.committed,
        failed = report.failed,
        dropped = report.dropped,
        "batch drained"
    );
    report
}

fn settle(database: &Database, pending: &mut Pending, report: &mut BatchReport, id: EntityId, outcome: CommitOutcome) {
    match outcome {
        CommitOutcome::Committed => {
            pending.remove(&id);
            report.committed += 1;
        }
        CommitOutcome::Unrecoverable(e) => {
            if let Some(entity) = pending.remove(&id) {
                database.log(
                    LogLevel::Error,
                    "Batch",
                    "commit",
                    &format!("{} not committed: {e}", entity.describe()),
                    json!({ "batch": report.batch.to_string(), "id": id.to_string() }),
                );
            }
            report.failed += 1;
        }
        CommitOutcome::Recoverable(e) => {
            let what = pending
                .get(&id)
                .map(|entity| entity.describe())
                .unwrap_or_else(|| id.to_string());
            database.log(
                LogLevel::Emergency,
                "Batch",
                "commit",
                &format!("{what} commit failed, retrying: {e}"),
                json!({ "batch": report.batch.to_string(), "id": id.to_string(), "pass": report.passes }),
            );
        }
    }
}

fn drop_remaining(database: &Database, pending: &mut Pending, report: &mut BatchReport, reason: &str) {
    for (id, entity) in pending.drain() {
        report.dropped += 1;
        if entity.abandon() {
            database.log(
                LogLevel::Error,
                "Batch",
                "commit",
                &format!("{} not committed: lost data", entity.describe()),
                json!({ "batch": report.batch.to_string(), "id": id.to_string(), "reason": reason }),
            );
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        let delegate = self.delegate.get_mut().unwrap_or_else(|e| e.into_inner());
        let batch = delegate.id;
        let items = std::mem::take(&mut delegate.items);
        for (id, entity) in items {
            if entity.abandon() {
                self.database.log(
                    LogLevel::Error,
                    "Batch",
                    "drop",
                    &format!("{} not committed: lost data", entity.describe()),
                    json!({ "batch": batch.to_string(), "id": id.to_string() }),
                );
            }
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delegate = self.delegate.lock().expect("batch lock poisoned");
        f.debug_struct("Batch")
            .field("id", &delegate.id)
            .field("pending", &delegate.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use ember_store::StorageAdapter;
    use ember_types::PersistenceState;

    use crate::config::PersistConfig;
    use crate::testing::{fixture, fixture_with, flaky_fixture, test_config, Note};

    /// Never finishes a commit within any reasonable watchdog.
    struct Stalled {
        id: EntityId,
        abandoned: AtomicBool,
    }

    #[async_trait]
    impl Committable for Stalled {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn describe(&self) -> String {
            format!("stalled/{}", self.id)
        }

        async fn commit(&self, _timeout: Duration) -> CommitOutcome {
            tokio::time::sleep(Duration::from_secs(30)).await;
            CommitOutcome::Committed
        }

        fn abandon(&self) -> bool {
            !self.abandoned.swap(true, Ordering::SeqCst)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_commit_finishes_without_passes() {
        let fx = fixture();
        let report = fx.db.batch().commit_and_wait().await.unwrap();
        assert_eq!(report.passes, 0);
        assert!(report.is_clean());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_writes_every_entity() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let _a = notes.new(&batch, Note::new("a"));
        let _b = notes.new(&batch, Note::new("b"));

        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(report.passes, 1);
        assert!(report.is_clean());
        assert_eq!(fx.storage.count("notes"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_is_idempotent() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("once"));
        batch.insert(Arc::clone(&note));
        note.update(&batch, |n| n.text.push('!')).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains(&note.id()));
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_swaps_delegate() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let first = batch.id();
        let _a = notes.new(&batch, Note::new("a"));

        let pending = batch.commit();
        assert!(batch.is_empty());
        assert_ne!(batch.id(), first);

        let _b = notes.new(&batch, Note::new("b"));
        assert_eq!(batch.len(), 1);
        assert_eq!(pending.await.unwrap().batch, first);
        batch.commit_and_wait().await.unwrap();
        assert_eq!(fx.storage.count("notes"), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_with_runs_completion() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let _a = notes.new(&batch, Note::new("a"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        batch
            .commit_with(move |report| {
                let _ = tx.send(report.committed);
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_sync_inside_runtime() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("sync"));
        let report = batch.commit_sync().unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(note.state(), PersistenceState::Persistent);
    }

    #[test]
    fn commit_sync_outside_runtime() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let fx = rt.block_on(async { fixture() });
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let _note = notes.new(&batch, Note::new("outside"));
        let report = batch.commit_sync().unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(fx.storage.count("notes"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recoverable_failures_are_retried_without_duplicates() {
        let (fx, flaky) = flaky_fixture(test_config(), true);
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("retry"));
        flaky.fail_next_writes(2);

        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.passes, 3);
        assert_eq!(report.committed, 1);
        assert!(report.is_clean());
        assert_eq!(flaky.applied_writes(), 1);
        assert_eq!(note.version(), 1);
        assert_eq!(fx.logger.at(LogLevel::Emergency).len(), 2);
        assert!(fx.logger.at(LogLevel::Error).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unrecoverable_failure_is_logged_once_and_not_retried() {
        let (fx, flaky) = flaky_fixture(test_config(), true);
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("a"));
        batch.commit_and_wait().await.unwrap();

        flaky.set_recoverable(false);
        flaky.fail_next_writes(1);
        note.update(&batch, |n| n.text = "b".into()).unwrap();
        let report = batch.commit_and_wait().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.passes, 1);
        assert_eq!(fx.logger.at(LogLevel::Error).len(), 1);
        // Still usable for later updates.
        assert_eq!(note.state(), PersistenceState::Persistent);
        note.update(&batch, |n| n.text = "c".into()).unwrap();
        assert!(batch.commit_and_wait().await.unwrap().is_clean());
        assert_eq!(fx.storage.get("notes", &note.id()).unwrap().item["text"], "c");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_passes_drop_the_entity() {
        let config = PersistConfig {
            max_batch_passes: Some(2),
            ..test_config()
        };
        let (fx, flaky) = flaky_fixture(config, true);
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("doomed"));
        flaky.fail_next_writes(10);

        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(note.state(), PersistenceState::Abandoned);
        assert_eq!(fx.logger.count_containing("still failing after 2 batch passes"), 1);
        assert_eq!(fx.logger.count_containing("lost data"), 1);
        assert_eq!(flaky.applied_writes(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_writes_time_out_then_settle_once() {
        let config = PersistConfig {
            commit_timeout_ms: 40,
            max_batch_passes: None,
            ..test_config()
        };
        let (fx, flaky) = flaky_fixture(config, false);
        flaky.set_write_delay(Duration::from_millis(200));
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("slow"));

        let report = batch.commit_and_wait().await.unwrap();
        assert!(report.passes > 1);
        assert_eq!(report.committed, 1);
        assert!(!report.timed_out);
        assert_eq!(flaky.applied_writes(), 1);
        assert_eq!(note.version(), 1);
        assert_eq!(note.state(), PersistenceState::Persistent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutation_during_write_is_saved_again() {
        let (fx, flaky) = flaky_fixture(test_config(), false);
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("a"));
        let id = note.id();
        batch.commit_and_wait().await.unwrap();

        flaky.set_write_delay(Duration::from_millis(150));
        note.update(&batch, |n| n.text = "b".into()).unwrap();
        let draining = batch.commit();
        let mut saving = false;
        for _ in 0..100 {
            if note.state() == PersistenceState::Saving {
                saving = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(saving);
        note.update(&batch, |n| n.text = "c".into()).unwrap();

        let report = draining.await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(note.state(), PersistenceState::Dirty);
        assert_eq!(note.version(), 2);
        assert!(batch.contains(&id));
        assert_eq!(fx.storage.get("notes", &id).unwrap().item["text"], "b");

        flaky.set_write_delay(Duration::ZERO);
        batch.commit_and_wait().await.unwrap();
        assert_eq!(note.state(), PersistenceState::Persistent);
        assert_eq!(note.version(), 3);
        assert_eq!(fx.storage.get("notes", &id).unwrap().item["text"], "c");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pass_watchdog_drops_stalled_entities() {
        let config = PersistConfig {
            commit_timeout_ms: 20,
            ..test_config()
        };
        let fx = fixture_with(config);
        let batch = fx.db.batch();
        let stalled = Arc::new(Stalled {
            id: EntityId::random(),
            abandoned: AtomicBool::new(false),
        });
        batch.insert(Arc::clone(&stalled));

        let report = batch.commit_and_wait().await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.dropped, 1);
        assert!(stalled.abandoned.load(Ordering::SeqCst));
        assert_eq!(fx.logger.count_containing("pass timed out"), 1);
        assert_eq!(fx.logger.count_containing("lost data"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropping_uncommitted_batch_reports_lost_update_once() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let setup = fx.db.batch();
        let note = notes.new(&setup, Note::new("stored"));
        let id = note.id();
        setup.commit_and_wait().await.unwrap();

        let batch = fx.db.batch();
        note.update(&batch, |n| n.text = "unsaved".into()).unwrap();
        drop(note);
        drop(batch);

        assert_eq!(fx.logger.count_containing("not committed: lost data"), 1);
        assert_eq!(fx.logger.at(LogLevel::Error).len(), 1);
        assert_eq!(fx.storage.get("notes", &id).unwrap().item["text"], "stored");
    }
}
