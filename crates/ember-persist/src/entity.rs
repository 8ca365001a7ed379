//! The persistence wrapper around one domain object.
//!
//! An [`Entity`] owns the item, its id, its version and its
//! [`PersistenceState`]. All access to the item goes through [`Entity::read`]
//! and [`Entity::update`], which run under the entity's item lock.
//!
//! Writes are driven by a [`Batch`]: the batch calls
//! [`Committable::commit`], which snapshots the item synchronously and then
//! pushes the snapshot to storage. At most one write per entity is in flight
//! at any time.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;

use ember_store::{EntityRecord, StoreResult};
use ember_types::{EntityId, PersistenceState, QualifiedCacheName, ReferenceData};

use crate::batch::{Batch, CommitOutcome, Committable};
use crate::cache::Cache;
use crate::database::Database;
use crate::error::{PersistError, PersistResult};
use crate::log::LogLevel;
use crate::reference::ReferenceContainer;

/// A domain type that can live in a [`Cache`].
///
/// Types holding [`Reference`](crate::Reference) fields must report them
/// from `visit_references`, otherwise those references are never bound to
/// their parent, never resolved eagerly, and not reached by
/// [`Entity::break_references`].
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn visit_references(&self, _visitor: &mut dyn FnMut(&dyn ReferenceContainer)) {}
}

/// What a reference needs from the entity that contains it.
pub trait ParentEntity: Send + Sync {
    fn entity_id(&self) -> EntityId;

    /// Flag a structural change and enqueue into `batch`.
    fn mark_dirty(&self, batch: &Batch);

    /// Break this entity's references and those of everything they reached.
    /// `visited` stops the walk on cycles.
    fn break_references_from(&self, visited: &mut HashSet<EntityId>);
}

/// Lightweight descriptor of the entity a reference lives in.
///
/// Handed to item factories by [`Cache::new_with`] so an item can build its
/// references before the entity that will own it exists.
#[derive(Clone)]
pub struct ParentBinding {
    database: Weak<Database>,
    cache: QualifiedCacheName,
    id: EntityId,
}

impl ParentBinding {
    pub(crate) fn new(database: &Arc<Database>, cache: QualifiedCacheName, id: EntityId) -> Self {
        Self {
            database: Arc::downgrade(database),
            cache,
            id,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn cache(&self) -> &QualifiedCacheName {
        &self.cache
    }

    pub fn database(&self) -> Option<Arc<Database>> {
        self.database.upgrade()
    }
}

impl fmt::Debug for ParentBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParentBinding({}/{})", self.cache, self.id.short_id())
    }
}

struct Status {
    state: PersistenceState,
    version: u64,
    created: DateTime<Utc>,
    saved: Option<DateTime<Utc>>,
    writing: bool,
    removed: bool,
    loss_reported: bool,
}

impl Status {
    /// Record a change to the item. Removal wins over a concurrent mutation.
    fn touch(&mut self) -> bool {
        if self.removed || self.state == PersistenceState::PendingRemoval {
            return false;
        }
        if self.state != PersistenceState::New {
            self.state = PersistenceState::Dirty;
        }
        self.loss_reported = false;
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Add,
    Update,
    Remove,
}

enum WriteOp {
    Add(EntityRecord),
    Update(EntityRecord),
    Remove,
}

struct WritePlan {
    kind: WriteKind,
    version: u64,
    prior: PersistenceState,
}

enum WriteStart {
    Nothing,
    Failed(CommitOutcome),
    Write(WritePlan, WriteOp),
}

/// The single live in-memory representation of one persisted object.
///
/// Two locks guard an entity, always taken in this order: `item`, then
/// `status`. Code running inside [`read`](Self::read) or
/// [`update`](Self::update) holds the item lock and may therefore still
/// mark the entity dirty (which is what [`Reference::set`](crate::Reference::set)
/// does).
pub struct Entity<T: Persistable> {
    id: EntityId,
    database: Arc<Database>,
    cache: Arc<Cache<T>>,
    cache_name: QualifiedCacheName,
    this: Weak<Entity<T>>,
    item: Mutex<T>,
    status: Mutex<Status>,
}

impl<T: Persistable> Entity<T> {
    /// A fresh, never-stored entity.
    pub(crate) fn create_new(cache: &Arc<Cache<T>>, id: EntityId, item: T) -> Arc<Self> {
        Self::build(cache, id, item, PersistenceState::New, 0, Utc::now(), None)
    }

    /// An entity decoded from a stored record.
    pub(crate) fn from_record(cache: &Arc<Cache<T>>, record: EntityRecord) -> PersistResult<Arc<Self>> {
        let item: T = serde_json::from_value(record.item)
            .map_err(|e| PersistError::Serialization(format!("{}: {e}", record.id)))?;
        Ok(Self::build(
            cache,
            record.id,
            item,
            PersistenceState::Persistent,
            record.version,
            record.created,
            record.saved,
        ))
    }

    fn build(
        cache: &Arc<Cache<T>>,
        id: EntityId,
        item: T,
        state: PersistenceState,
        version: u64,
        created: DateTime<Utc>,
        saved: Option<DateTime<Utc>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            database: Arc::clone(cache.database()),
            cache: Arc::clone(cache),
            cache_name: cache.qualified_name().clone(),
            this: this.clone(),
            item: Mutex::new(item),
            status: Mutex::new(Status {
                state,
                version,
                created,
                saved,
                writing: false,
                removed: false,
                loss_reported: false,
            }),
        })
    }

    // User closures run under the item lock; a panic in one must not brick
    // the entity for every other holder.
    fn lock_item(&self) -> MutexGuard<'_, T> {
        self.item.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.lock_status().version
    }

    pub fn state(&self) -> PersistenceState {
        self.lock_status().state
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.lock_status().created
    }

    pub fn saved(&self) -> Option<DateTime<Utc>> {
        self.lock_status().saved
    }

    /// Returns `true` once the entity has been deleted from storage (or was
    /// dropped before it ever reached it).
    pub fn is_removed(&self) -> bool {
        self.lock_status().removed
    }

    /// The cache this entity lives in. Held strongly, so the cache stays
    /// registered while any of its entities is alive.
    pub fn cache(&self) -> &Arc<Cache<T>> {
        &self.cache
    }

    pub fn cache_name(&self) -> &QualifiedCacheName {
        &self.cache_name
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Descriptor that lets a reference find this entity again later.
    pub fn reference_data(&self) -> ReferenceData {
        ReferenceData {
            backend_identity: self.cache_name.backend_identity().to_string(),
            cache_name: self.cache_name.cache_name().to_string(),
            id: self.id,
            version: self.version(),
        }
    }

    /// Run `f` against the item.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock_item())
    }

    /// Run `f` against the item on the blocking pool.
    pub async fn read_async<R, F>(&self, f: F) -> PersistResult<R>
    where
        F: FnOnce(&T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| PersistError::TaskFailed("entity released".into()))?;
        self.database
            .runtime()
            .spawn_blocking(move || this.read(f))
            .await
            .map_err(|e| PersistError::TaskFailed(e.to_string()))
    }

    /// Mutate the item and enqueue the entity into `batch`.
    pub fn update<R>(&self, batch: &Batch, f: impl FnOnce(&mut T) -> R) -> PersistResult<R> {
        let mut item = self.lock_item();
        {
            let status = self.lock_status();
            if status.removed {
                return Err(PersistError::Removed { id: self.id });
            }
            if status.state == PersistenceState::PendingRemoval {
                return Err(PersistError::PendingRemoval { id: self.id });
            }
        }
        let result = f(&mut item);
        let touched = self.lock_status().touch();
        drop(item);
        if touched {
            self.enqueue(batch);
        }
        Ok(result)
    }

    /// Mark the entity for deletion and enqueue it into `batch`.
    pub fn remove(&self, batch: &Batch) -> PersistResult<()> {
        {
            let mut status = self.lock_status();
            if status.removed {
                return Ok(());
            }
            status.state = PersistenceState::PendingRemoval;
            status.loss_reported = false;
        }
        self.enqueue(batch);
        Ok(())
    }

    /// Turn every reference held by the item into its descriptor.
    pub fn break_references(&self) {
        let _released = self.detach_references();
    }

    /// Like [`break_references`](Self::break_references), following every
    /// released target.
    pub fn break_references_recursive(&self) {
        let mut visited = HashSet::new();
        self.break_references_from(&mut visited);
    }

    /// Serialize the current item as it would be written.
    pub fn to_record(&self) -> PersistResult<EntityRecord> {
        let item = self.lock_item();
        let status = self.lock_status();
        self.encode(&item, &status, status.version)
    }

    fn detach_references(&self) -> Vec<Arc<dyn ParentEntity>> {
        let mut released = Vec::new();
        let item = self.lock_item();
        item.visit_references(&mut |reference| {
            if let Some(target) = reference.detach_target() {
                released.push(target);
            }
        });
        released
    }

    /// Hand every reference in the item its parent. Called once the entity
    /// is resident in its cache.
    pub(crate) fn bind_references(&self) {
        let binding = ParentBinding::new(&self.database, self.cache_name.clone(), self.id);
        let parent: Weak<dyn ParentEntity> = self.this.clone();
        let item = self.lock_item();
        item.visit_references(&mut |reference| reference.attach(&binding, parent.clone()));
    }

    fn enqueue(&self, batch: &Batch) {
        if let Some(this) = self.this.upgrade() {
            batch.insert(this);
        }
    }

    fn evict(&self) {
        self.cache.forget(&self.id, self as *const Self);
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.cache_name, self.id)
    }

    fn encode(&self, item: &T, status: &Status, version: u64) -> PersistResult<EntityRecord> {
        let item = serde_json::to_value(item)
            .map_err(|e| PersistError::Serialization(format!("{}: {e}", self.describe())))?;
        Ok(EntityRecord {
            id: self.id,
            schema_version: self.database.config().schema_version,
            created: status.created,
            saved: Some(Utc::now()),
            item,
            persistence_state: PersistenceState::Persistent,
            version,
        })
    }

    /// Decide what to write and snapshot the item. Both locks are held so
    /// the snapshot and the state flip are atomic.
    fn begin_write(&self) -> WriteStart {
        let item = self.lock_item();
        let mut status = self.lock_status();
        if status.removed {
            return WriteStart::Nothing;
        }
        if status.writing {
            return WriteStart::Failed(CommitOutcome::Recoverable(PersistError::WriteInFlight {
                id: self.id,
            }));
        }

        let state = status.state;
        match state {
            PersistenceState::Persistent
            | PersistenceState::Saving
            | PersistenceState::Abandoned => WriteStart::Nothing,
            PersistenceState::PendingRemoval => {
                if status.version == 0 {
                    // Never stored: nothing to delete.
                    status.removed = true;
                    drop(status);
                    drop(item);
                    self.evict();
                    return WriteStart::Nothing;
                }
                status.writing = true;
                let plan = WritePlan {
                    kind: WriteKind::Remove,
                    version: status.version,
                    prior: PersistenceState::PendingRemoval,
                };
                WriteStart::Write(plan, WriteOp::Remove)
            }
            PersistenceState::New | PersistenceState::Dirty => {
                let version = status.version + 1;
                match self.encode(&item, &status, version) {
                    Ok(record) => {
                        let kind = if status.version == 0 {
                            WriteKind::Add
                        } else {
                            WriteKind::Update
                        };
                        let plan = WritePlan {
                            kind,
                            version,
                            prior: state,
                        };
                        status.writing = true;
                        status.state = PersistenceState::Saving;
                        let op = match kind {
                            WriteKind::Add => WriteOp::Add(record),
                            _ => WriteOp::Update(record),
                        };
                        WriteStart::Write(plan, op)
                    }
                    Err(e) => {
                        let never_stored = status.version == 0;
                        if never_stored {
                            status.state = PersistenceState::Abandoned;
                            status.removed = true;
                            status.loss_reported = true;
                        } else {
                            status.state = PersistenceState::Persistent;
                        }
                        drop(status);
                        drop(item);
                        if never_stored {
                            self.evict();
                        }
                        WriteStart::Failed(CommitOutcome::Unrecoverable(e))
                    }
                }
            }
        }
    }

    /// Settle the state after the storage write returned.
    fn finish_write(&self, plan: &WritePlan, result: StoreResult<()>) -> CommitOutcome {
        let mut evict = false;
        let outcome = {
            let mut status = self.lock_status();
            status.writing = false;
            match result {
                Ok(()) => {
                    if plan.kind == WriteKind::Remove {
                        status.removed = true;
                        evict = true;
                    } else {
                        status.version = plan.version;
                        status.saved = Some(Utc::now());
                        // A mutation during the write left the state dirty.
                        if status.state == PersistenceState::Saving {
                            status.state = PersistenceState::Persistent;
                        }
                    }
                    CommitOutcome::Committed
                }
                Err(e) if e.is_recoverable() => {
                    if status.state == PersistenceState::Saving {
                        status.state = plan.prior;
                    }
                    CommitOutcome::Recoverable(PersistError::Storage(e))
                }
                Err(e) => {
                    match plan.kind {
                        WriteKind::Add => {
                            status.state = PersistenceState::Abandoned;
                            status.removed = true;
                            status.loss_reported = true;
                            evict = true;
                        }
                        WriteKind::Update => {
                            if status.state == PersistenceState::Saving {
                                status.state = PersistenceState::Persistent;
                            }
                        }
                        WriteKind::Remove => {
                            status.state = PersistenceState::Persistent;
                        }
                    }
                    CommitOutcome::Unrecoverable(PersistError::Storage(e))
                }
            }
        };
        if evict {
            self.evict();
        }
        outcome
    }

    /// A write finished after its commit call had already timed out.
    fn report_late(&self, outcome: &CommitOutcome) {
        match outcome {
            CommitOutcome::Unrecoverable(e) => self.database.log(
                LogLevel::Error,
                "Entity",
                "commit",
                &format!("{} not committed: {e}", self.describe()),
                json!({ "id": self.id.to_string(), "late": true }),
            ),
            CommitOutcome::Recoverable(e) => self.database.log(
                LogLevel::Fine,
                "Entity",
                "commit",
                &format!("late write of {} failed, will retry: {e}", self.describe()),
                json!({ "id": self.id.to_string(), "late": true }),
            ),
            CommitOutcome::Committed => {}
        }
    }
}

#[async_trait]
impl<T: Persistable> Committable for Entity<T> {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn describe(&self) -> String {
        Entity::describe(self)
    }

    async fn commit(&self, timeout: Duration) -> CommitOutcome {
        let Some(this) = self.this.upgrade() else {
            return CommitOutcome::Committed;
        };
        let (plan, op) = match self.begin_write() {
            WriteStart::Nothing => return CommitOutcome::Committed,
            WriteStart::Failed(outcome) => return outcome,
            WriteStart::Write(plan, op) => (plan, op),
        };

        let adapter = Arc::clone(self.database.adapter());
        let cache = self.cache_name.cache_name();
        let prepared = match op {
            WriteOp::Add(record) => adapter.add_action(cache, record),
            WriteOp::Update(record) => adapter.update_action(cache, record),
            WriteOp::Remove => adapter.remove_action(cache, &self.id),
        };
        let action = match prepared {
            Ok(action) => action,
            Err(e) => return self.finish_write(&plan, Err(e)),
        };

        if adapter.is_synchronous() {
            return self.finish_write(&plan, action());
        }

        let (tx, rx) = oneshot::channel();
        self.database.runtime().spawn_blocking(move || {
            let outcome = this.finish_write(&plan, action());
            if let Err(outcome) = tx.send(outcome) {
                this.report_late(&outcome);
            }
        });
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommitOutcome::Recoverable(PersistError::TaskFailed(
                "write worker ended without reporting".into(),
            )),
            Err(_) => CommitOutcome::Recoverable(PersistError::Timeout {
                id: self.id,
                timeout,
            }),
        }
    }

    fn abandon(&self) -> bool {
        let mut status = self.lock_status();
        if status.removed || !status.state.has_unsaved_changes() {
            return false;
        }
        status.state = PersistenceState::Abandoned;
        status.loss_reported = true;
        true
    }
}

impl<T: Persistable> ParentEntity for Entity<T> {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn mark_dirty(&self, batch: &Batch) {
        if self.lock_status().touch() {
            self.enqueue(batch);
        }
    }

    fn break_references_from(&self, visited: &mut HashSet<EntityId>) {
        if !visited.insert(self.id) {
            return;
        }
        for target in self.detach_references() {
            target.break_references_from(visited);
        }
    }
}

impl<T: Persistable> Drop for Entity<T> {
    fn drop(&mut self) {
        let status = self.status.get_mut().unwrap_or_else(PoisonError::into_inner);
        let lost = status.state.has_unsaved_changes() && !status.removed && !status.loss_reported;
        let state = status.state;
        if lost {
            let err = PersistError::LostUpdate {
                cache: self.cache_name.to_string(),
                id: self.id,
            };
            self.database.log(
                LogLevel::Error,
                "Entity",
                "drop",
                &err.to_string(),
                json!({ "id": self.id.to_string(), "state": state.to_string() }),
            );
        }
        let this: *const Self = self;
        self.cache.forget(&self.id, this);
    }
}

impl<T: Persistable> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.lock_status();
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("cache", &self.cache_name)
            .field("state", &status.state)
            .field("version", &status.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Failing, Note};
    use ember_store::StorageAdapter;

    #[tokio::test(flavor = "multi_thread")]
    async fn new_entity_starts_new_at_version_zero() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("hello"));

        assert_eq!(note.state(), PersistenceState::New);
        assert_eq!(note.version(), 0);
        assert_eq!(note.read(|n| n.text.clone()), "hello");
        assert_eq!(batch.len(), 1);
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_settles_to_persistent_and_bumps_version() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("a"));
        batch.commit_and_wait().await.unwrap();

        assert_eq!(note.state(), PersistenceState::Persistent);
        assert_eq!(note.version(), 1);
        assert!(note.saved().is_some());

        note.update(&batch, |n| n.text = "b".into()).unwrap();
        assert_eq!(note.state(), PersistenceState::Dirty);
        batch.commit_and_wait().await.unwrap();
        assert_eq!(note.version(), 2);
        assert_eq!(fx.storage.get("notes", &note.id()).unwrap().item["text"], "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_on_new_stays_new() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("a"));
        note.update(&batch, |n| n.text.push('!')).unwrap();
        assert_eq!(note.state(), PersistenceState::New);
        batch.commit_and_wait().await.unwrap();
        assert_eq!(fx.storage.get("notes", &note.id()).unwrap().item["text"], "a!");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_returns_closure_result() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("abc"));
        let len = note.update(&batch, |n| n.text.len()).unwrap();
        assert_eq!(len, 3);
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_async_sees_item() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("async"));
        let text = note.read_async(|n| n.text.clone()).await.unwrap();
        assert_eq!(text, "async");
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_deletes_and_evicts() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("bye"));
        batch.commit_and_wait().await.unwrap();
        let id = note.id();

        note.remove(&batch).unwrap();
        assert_eq!(note.state(), PersistenceState::PendingRemoval);
        assert!(matches!(
            note.update(&batch, |_| ()),
            Err(PersistError::PendingRemoval { .. })
        ));
        batch.commit_and_wait().await.unwrap();

        assert!(note.is_removed());
        assert!(!notes.has_cached(&id));
        assert!(fx.storage.get("notes", &id).unwrap_err().is_not_found());
        assert!(matches!(note.update(&batch, |_| ()), Err(PersistError::Removed { .. })));
        assert!(fx.logger.at(LogLevel::Error).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removing_a_never_stored_entity_skips_storage() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("draft"));
        note.remove(&batch).unwrap();
        let report = batch.commit_and_wait().await.unwrap();

        assert_eq!(report.committed, 1);
        assert!(note.is_removed());
        assert!(fx.storage.is_empty());
        drop(note);
        assert!(fx.logger.at(LogLevel::Error).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serialization_failure_on_new_evicts_and_loses_data() {
        let fx = fixture();
        let cache = fx.db.cache::<Failing>("failing").unwrap();
        let batch = fx.db.batch();
        let entity = cache.new(&batch, Failing { explode: true });
        let id = entity.id();

        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(entity.state(), PersistenceState::Abandoned);
        assert!(!cache.has_cached(&id));
        assert!(fx.storage.is_empty());
        // Logged once by the batch, not again when the entity goes away.
        drop(entity);
        assert_eq!(fx.logger.at(LogLevel::Error).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serialization_failure_on_update_keeps_entity_usable() {
        let fx = fixture();
        let cache = fx.db.cache::<Failing>("failing").unwrap();
        let batch = fx.db.batch();
        let entity = cache.new(&batch, Failing { explode: false });
        batch.commit_and_wait().await.unwrap();

        entity.update(&batch, |f| f.explode = true).unwrap();
        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(entity.state(), PersistenceState::Persistent);
        assert_eq!(entity.version(), 1);

        entity.update(&batch, |f| f.explode = false).unwrap();
        let report = batch.commit_and_wait().await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(entity.version(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reference_data_describes_entity() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("x"));
        let data = note.reference_data();
        assert_eq!(data.id, note.id());
        assert_eq!(data.cache_name, "notes");
        assert_eq!(data.backend_identity, fx.db.backend_identity());
        assert_eq!(data.version, 0);
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn to_record_uses_wire_shape() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("wire"));
        let record = note.to_record().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["item"]["text"], "wire");
        assert_eq!(json["schemaVersion"], 1);
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_reader_does_not_poison_entity() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("sturdy"));
        let cloned = Arc::clone(&note);
        let result = std::thread::spawn(move || cloned.read(|_| panic!("boom"))).join();
        assert!(result.is_err());
        assert_eq!(note.read(|n| n.text.clone()), "sturdy");
        batch.commit_and_wait().await.unwrap();
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn versions_only_grow(edits in proptest::collection::vec("[a-z]{0,8}", 1..6)) {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let fx = fixture();
                let notes = fx.db.cache::<Note>("notes").unwrap();
                let batch = fx.db.batch();
                let note = notes.new(&batch, Note::new(""));
                batch.commit_and_wait().await.unwrap();

                let mut last = note.version();
                for text in edits {
                    note.update(&batch, |n| n.text = text).unwrap();
                    batch.commit_and_wait().await.unwrap();
                    assert!(note.version() > last);
                    last = note.version();
                }
                assert_eq!(fx.storage.get("notes", &note.id()).unwrap().version, last);
            });
        }
    }
}
