//! Identity-mapped cache of entities.
//!
//! A [`Cache`] guarantees at most one live [`Entity`] per id. It holds
//! entities weakly: an entity leaves the cache when its last strong holder
//! lets go, and the next `get` loads a fresh instance from storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use ember_store::EntityRecord;
use ember_types::{EntityId, QualifiedCacheName};

use crate::batch::Batch;
use crate::database::Database;
use crate::entity::{Entity, ParentBinding, Persistable};
use crate::error::{PersistError, PersistResult};
use crate::log::LogLevel;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Named collection of entities of one item type over one database.
pub struct Cache<T: Persistable> {
    name: String,
    qualified: QualifiedCacheName,
    database: Arc<Database>,
    entries: Mutex<HashMap<EntityId, Weak<Entity<T>>>>,
}

impl<T: Persistable> Cache<T> {
    /// The live cache registered under `name`, or a new one.
    ///
    /// Reusing the registered cache keeps one entity per id for as long as
    /// any entity of that cache is held.
    pub fn open(database: &Arc<Database>, name: &str) -> PersistResult<Arc<Self>> {
        database.adapter().validate_cache_name(name)?;
        let qualified = QualifiedCacheName::new(database.backend_identity(), name);
        match database.registry().cache::<T>(&qualified) {
            Ok(cache) => {
                debug!(cache = %qualified, "reusing live cache");
                Ok(cache)
            }
            Err(PersistError::CacheUnavailable { .. }) => Self::create(database, name),
            Err(e) => Err(e),
        }
    }

    /// Validate `name` with the adapter, then create and register a new cache.
    ///
    /// A second live cache under the same qualified name is still returned,
    /// but only the first stays registered; the conflict is logged.
    pub fn create(database: &Arc<Database>, name: &str) -> PersistResult<Arc<Self>> {
        database.adapter().validate_cache_name(name)?;
        let cache = Arc::new(Self {
            name: name.to_string(),
            qualified: QualifiedCacheName::new(database.backend_identity(), name),
            database: Arc::clone(database),
            entries: Mutex::new(HashMap::new()),
        });
        if let Err(e) = database.registry().register_cache(&cache) {
            database.log(
                LogLevel::Error,
                "Cache",
                "open",
                &e.to_string(),
                json!({ "cache": cache.qualified.to_string() }),
            );
        }
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `backend.name`, the key references and the registry use.
    pub fn qualified_name(&self) -> &QualifiedCacheName {
        &self.qualified
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Wrap `item` in a new entity and enqueue it into `batch`.
    pub fn new(self: &Arc<Self>, batch: &Batch, item: T) -> Arc<Entity<T>> {
        self.new_with(batch, |_| item)
    }

    /// Like [`new`](Self::new), building the item from the binding of the
    /// entity about to hold it. Items that own references need this.
    pub fn new_with(self: &Arc<Self>, batch: &Batch, factory: impl FnOnce(&ParentBinding) -> T) -> Arc<Entity<T>> {
        let id = EntityId::random();
        let binding = ParentBinding::new(&self.database, self.qualified.clone(), id);
        let entity = Entity::create_new(self, id, factory(&binding));
        entity.bind_references();
        self.lock_entries().insert(id, Arc::downgrade(&entity));
        batch.insert(Arc::clone(&entity));
        entity
    }

    /// The live entity for `id`, loading it from storage if needed.
    pub async fn get(self: &Arc<Self>, id: EntityId) -> PersistResult<Arc<Entity<T>>> {
        if let Some(entity) = self.cached(&id) {
            return Ok(entity);
        }
        let name = self.name.clone();
        let record = match self
            .database
            .call_storage(move |adapter| adapter.get(&name, &id))
            .await
        {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let err = PersistError::NotFound {
                    cache: self.qualified.to_string(),
                    id,
                };
                self.database.log(
                    LogLevel::Warning,
                    "Cache",
                    "get",
                    &err.to_string(),
                    json!({ "id": id.to_string() }),
                );
                return Err(err);
            }
            Err(e) => {
                self.database.log(
                    LogLevel::Emergency,
                    "Cache",
                    "get",
                    &format!("loading {}/{id} failed: {e}", self.qualified),
                    json!({ "id": id.to_string() }),
                );
                return Err(e);
            }
        };
        self.adopt(record, "get")
    }

    /// Blocking [`get`](Self::get).
    pub fn get_sync(self: &Arc<Self>, id: EntityId) -> PersistResult<Arc<Entity<T>>> {
        self.database.block_on(self.get(id))?
    }

    /// Every stored entity of this cache. Unsaved new entities are not included.
    pub async fn scan(self: &Arc<Self>) -> PersistResult<Vec<Arc<Entity<T>>>> {
        self.scan_where(|_| true).await
    }

    /// Stored entities whose current in-memory item satisfies `predicate`.
    ///
    /// Records that fail to decode are logged and skipped.
    pub async fn scan_where<P>(self: &Arc<Self>, predicate: P) -> PersistResult<Vec<Arc<Entity<T>>>>
    where
        P: Fn(&T) -> bool,
    {
        let name = self.name.clone();
        let records = match self
            .database
            .call_storage(move |adapter| adapter.scan(&name))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                self.database.log(
                    LogLevel::Emergency,
                    "Cache",
                    "scan",
                    &format!("scanning {} failed: {e}", self.qualified),
                    json!({}),
                );
                return Err(e);
            }
        };

        let mut found = Vec::with_capacity(records.len());
        for record in records {
            if let Ok(entity) = self.adopt(record, "scan") {
                if entity.read(&predicate) {
                    found.push(entity);
                }
            }
        }
        debug!(cache = %self.qualified, found = found.len(), "scan");
        Ok(found)
    }

    /// Returns `true` if a live entity for `id` is resident.
    pub fn has_cached(&self, id: &EntityId) -> bool {
        self.lock_entries()
            .get(id)
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Poll until `id` leaves the cache. Returns `false` on timeout.
    pub async fn wait_while_cached(&self, id: &EntityId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.has_cached(id) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        true
    }

    /// Number of live resident entities.
    pub fn cached_count(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<EntityId, Weak<Entity<T>>>> {
        self.entries.lock().expect("cache lock poisoned")
    }

    fn cached(&self, id: &EntityId) -> Option<Arc<Entity<T>>> {
        self.lock_entries().get(id).and_then(Weak::upgrade)
    }

    /// Decode `record` and make it the resident entity, unless another
    /// instance won the race in the meantime.
    fn adopt(self: &Arc<Self>, record: EntityRecord, feature: &str) -> PersistResult<Arc<Entity<T>>> {
        let id = record.id;
        let candidate = match Entity::from_record(self, record) {
            Ok(entity) => entity,
            Err(e) => {
                self.database.log(
                    LogLevel::Error,
                    "Cache",
                    feature,
                    &format!("cannot decode {}/{id}: {e}", self.qualified),
                    json!({ "id": id.to_string() }),
                );
                return Err(e);
            }
        };

        let resident = {
            let mut entries = self.lock_entries();
            match entries.get(&id).and_then(Weak::upgrade) {
                Some(existing) => Some(existing),
                None => {
                    entries.insert(id, Arc::downgrade(&candidate));
                    None
                }
            }
        };
        match resident {
            // The loser is dropped here, outside the lock.
            Some(existing) => {
                if existing.version() != candidate.version() {
                    self.database.log(
                        LogLevel::Fine,
                        "Cache",
                        feature,
                        &format!("{}/{id} resident at v{}, storage at v{}", self.qualified, existing.version(), candidate.version()),
                        json!({ "id": id.to_string() }),
                    );
                }
                Ok(existing)
            }
            None => {
                candidate.bind_references();
                Ok(candidate)
            }
        }
    }

    /// Drop the entry for `id` if it still points at `entity`.
    pub(crate) fn forget(&self, id: &EntityId, entity: *const Entity<T>) {
        let mut entries = self.lock_entries();
        if entries.get(id).is_some_and(|w| std::ptr::eq(w.as_ptr(), entity)) {
            entries.remove(id);
        }
    }
}

impl<T: Persistable> Drop for Cache<T> {
    fn drop(&mut self) {
        self.database.registry().deregister_cache(&self.qualified);
    }
}

impl<T: Persistable> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.qualified)
            .field("cached", &self.cached_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ember_store::StorageAdapter;
    use ember_types::PersistenceState;

    use crate::testing::{fixture, flaky_fixture, test_config, Failing, Note};

    #[tokio::test(flavor = "multi_thread")]
    async fn create_two_commit_scan_two() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        notes.new(&batch, Note::new("one"));
        notes.new(&batch, Note::new("two"));
        batch.commit_and_wait().await.unwrap();

        let all = notes.scan().await.unwrap();
        assert_eq!(all.len(), 2);
        let mut texts: Vec<String> = all.iter().map(|e| e.read(|n| n.text.clone())).collect();
        texts.sort();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_excludes_uncommitted_entities() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let _draft = notes.new(&batch, Note::new("draft"));
        assert!(notes.scan().await.unwrap().is_empty());
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_where_filters_on_items() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        for text in ["apple", "avocado", "banana"] {
            notes.new(&batch, Note::new(text));
        }
        batch.commit_and_wait().await.unwrap();

        let a = notes.scan_where(|n| n.text.starts_with('a')).await.unwrap();
        assert_eq!(a.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_unknown_id_is_not_found_with_one_warning() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let err = notes.get(EntityId::random()).await.unwrap_err();

        assert!(matches!(err, PersistError::NotFound { .. }));
        assert_eq!(fx.logger.at(LogLevel::Warning).len(), 1);
        assert_eq!(fx.logger.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_returns_resident_instance() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("same"));
        let found = notes.get(note.id()).await.unwrap();
        assert!(Arc::ptr_eq(&note, &found));
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn released_entities_leave_and_reload() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("reload"));
        let id = note.id();
        batch.commit_and_wait().await.unwrap();

        drop(note);
        assert!(notes.wait_while_cached(&id, Duration::from_secs(1)).await);
        assert_eq!(notes.cached_count(), 0);

        let reloaded = notes.get(id).await.unwrap();
        assert_eq!(reloaded.state(), PersistenceState::Persistent);
        assert_eq!(reloaded.version(), 1);
        assert_eq!(reloaded.read(|n| n.text.clone()), "reload");
        assert!(notes.has_cached(&id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_while_cached_times_out_for_held_entity() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let note = notes.new(&batch, Note::new("held"));
        assert!(!notes.wait_while_cached(&note.id(), Duration::from_millis(30)).await);
        batch.commit_and_wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_gets_share_one_instance() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let id = notes.new(&batch, Note::new("shared")).id();
        batch.commit_and_wait().await.unwrap();
        assert!(notes.wait_while_cached(&id, Duration::from_secs(1)).await);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let notes = Arc::clone(&notes);
                tokio::spawn(async move { notes.get(id).await.unwrap() })
            })
            .collect();
        let mut loaded = Vec::new();
        for task in tasks {
            loaded.push(task.await.unwrap());
        }
        assert!(loaded.iter().all(|e| Arc::ptr_eq(e, &loaded[0])));
        assert_eq!(notes.cached_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn storage_errors_are_logged_at_emergency() {
        let (fx, flaky) = flaky_fixture(test_config(), true);
        let notes = fx.db.cache::<Note>("notes").unwrap();
        flaky.fail_next_reads(2);

        let err = notes.get(EntityId::random()).await.unwrap_err();
        assert!(matches!(err, PersistError::Storage(_)));
        assert!(err.is_recoverable());
        assert!(notes.scan().await.is_err());
        assert_eq!(fx.logger.at(LogLevel::Emergency).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undecodable_records_fail_get_and_are_skipped_by_scan() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        notes.new(&batch, Note::new("good"));
        batch.commit_and_wait().await.unwrap();

        let bad = EntityRecord {
            id: EntityId::random(),
            schema_version: 1,
            created: Utc::now(),
            saved: None,
            item: json!(42),
            persistence_state: PersistenceState::Persistent,
            version: 1,
        };
        let bad_id = bad.id;
        fx.storage.add_action("notes", bad).unwrap()().unwrap();

        let err = notes.get(bad_id).await.unwrap_err();
        assert!(matches!(err, PersistError::Serialization(_)));
        assert_eq!(notes.scan().await.unwrap().len(), 1);
        assert_eq!(fx.logger.at(LogLevel::Error).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_sync_loads() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let id = notes.new(&batch, Note::new("blocking")).id();
        batch.commit_and_wait().await.unwrap();

        let loaded = notes.get_sync(id).unwrap();
        assert_eq!(loaded.read(|n| n.text.clone()), "blocking");
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let fx = fixture();
        assert!(fx.db.cache::<Note>("").is_err());
        assert!(fx.db.cache::<Note>("has.dot").is_err());
        assert!(fx.db.cache::<Note>("9lives").is_err());
    }

    #[tokio::test]
    async fn caches_register_under_qualified_name() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let name = notes.qualified_name().clone();
        assert_eq!(name.to_string(), format!("{}.notes", fx.db.backend_identity()));

        let found = fx.registry.cache::<Note>(&name).unwrap();
        assert!(Arc::ptr_eq(&found, &notes));
        assert!(matches!(
            fx.registry.cache::<Failing>(&name),
            Err(PersistError::CacheTypeMismatch { .. })
        ));

        drop(found);
        drop(notes);
        assert!(matches!(
            fx.registry.cache::<Note>(&name),
            Err(PersistError::CacheUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_cache_is_logged_and_still_usable() {
        let fx = fixture();
        let first = fx.db.cache::<Note>("notes").unwrap();
        let second = Cache::<Note>::create(&fx.db, "notes").unwrap();

        assert_eq!(fx.logger.count_containing("duplicate registration"), 1);
        let registered = fx.registry.cache::<Note>(first.qualified_name()).unwrap();
        assert!(Arc::ptr_eq(&registered, &first));
        assert!(!Arc::ptr_eq(&second, &first));
        assert_eq!(second.name(), "notes");
    }

    #[tokio::test]
    async fn open_reuses_the_live_cache() {
        let fx = fixture();
        let first = fx.db.cache::<Note>("notes").unwrap();
        let again = fx.db.cache::<Note>("notes").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(fx.logger.is_empty());
        assert!(matches!(
            fx.db.cache::<Failing>("notes"),
            Err(PersistError::CacheTypeMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn held_entities_keep_their_cache_registered() {
        let fx = fixture();
        let notes = fx.db.cache::<Note>("notes").unwrap();
        let batch = fx.db.batch();
        let held = notes.new(&batch, Note::new("kept"));
        batch.commit_and_wait().await.unwrap();
        let name = notes.qualified_name().clone();
        drop(notes);

        assert!(fx.registry.cache::<Note>(&name).is_ok());
        let notes = fx.db.cache::<Note>("notes").unwrap();
        assert!(Arc::ptr_eq(held.cache(), &notes));
        let found = notes.get(held.id()).await.unwrap();
        assert!(Arc::ptr_eq(&found, &held));
        assert_eq!(notes.cached_count(), 1);

        drop(found);
        drop(held);
        drop(notes);
        assert!(matches!(
            fx.registry.cache::<Note>(&name),
            Err(PersistError::CacheUnavailable { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_backed_entities_survive_reopen() {
        use crate::log::MemoryLogger;
        use crate::registry::Registry;
        use ember_store::FileStorage;

        let dir = tempfile::tempdir().unwrap();
        let open = || {
            Database::builder(Arc::new(FileStorage::open(dir.path()).unwrap()))
                .registry(Registry::new())
                .logger(Arc::new(MemoryLogger::new()))
                .config(test_config())
                .open()
                .unwrap()
        };

        let id = {
            let db = open();
            let notes = db.cache::<Note>("notes").unwrap();
            let batch = db.batch();
            let note = notes.new(&batch, Note::new("on disk"));
            let report = batch.commit_and_wait().await.unwrap();
            assert!(report.is_clean());
            note.id()
        };

        let db = open();
        let notes = db.cache::<Note>("notes").unwrap();
        let note = notes.get(id).await.unwrap();
        assert_eq!(note.read(|n| n.text.clone()), "on disk");
        assert_eq!(note.version(), 1);
        assert_eq!(notes.scan().await.unwrap().len(), 1);
    }
}
