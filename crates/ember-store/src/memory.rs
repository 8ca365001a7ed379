use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use ember_types::EntityId;

use crate::error::{StoreError, StoreResult};
use crate::record::EntityRecord;
use crate::traits::{StorageAdapter, StoreAction};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

type RecordMap = HashMap<(String, EntityId), EntityRecord>;

/// In-memory, HashMap-based storage backend.
///
/// Intended for tests and embedding. All records are held behind a `RwLock`
/// shared with the prepared actions, so an action stays valid after the
/// call that produced it returns. Records are cloned on read/write.
pub struct InMemoryStorage {
    identity: String,
    records: Arc<RwLock<RecordMap>>,
}

impl InMemoryStorage {
    /// Create a new empty store with a process-unique identity.
    pub fn new() -> Self {
        let n = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self::with_identity(format!("memory:{n}"))
    }

    /// Create a new empty store with an explicit backend identity.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of records across all caches.
    pub fn len(&self) -> usize {
        self.records.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().expect("lock poisoned").is_empty()
    }

    /// Number of records stored for one cache.
    pub fn count(&self, cache: &str) -> usize {
        self.records
            .read()
            .expect("lock poisoned")
            .keys()
            .filter(|(c, _)| c == cache)
            .count()
    }

    /// Remove all records from the store.
    pub fn clear(&self) {
        self.records.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn backend_identity(&self) -> &str {
        &self.identity
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn get(&self, cache: &str, id: &EntityId) -> StoreResult<EntityRecord> {
        let map = self.records.read().expect("lock poisoned");
        map.get(&(cache.to_string(), *id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                cache: cache.to_string(),
                id: *id,
            })
    }

    fn scan(&self, cache: &str) -> StoreResult<Vec<EntityRecord>> {
        let map = self.records.read().expect("lock poisoned");
        let mut records: Vec<EntityRecord> = map
            .iter()
            .filter(|((c, _), _)| c == cache)
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    fn add_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        let records = Arc::clone(&self.records);
        let key = (cache.to_string(), record.id);
        Ok(Box::new(move || {
            let mut map = records.write().expect("lock poisoned");
            if map.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    cache: key.0,
                    id: key.1,
                });
            }
            map.insert(key, record);
            Ok(())
        }))
    }

    fn update_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        let records = Arc::clone(&self.records);
        let key = (cache.to_string(), record.id);
        Ok(Box::new(move || {
            let mut map = records.write().expect("lock poisoned");
            // An update of a record that was never added is written as-is:
            // the version check is the only ordering guard.
            if let Some(stored) = map.get(&key) {
                if record.version <= stored.version {
                    return Err(StoreError::VersionConflict {
                        cache: key.0,
                        id: key.1,
                        stored: stored.version,
                        attempted: record.version,
                    });
                }
            }
            map.insert(key, record);
            Ok(())
        }))
    }

    fn remove_action(&self, cache: &str, id: &EntityId) -> StoreResult<StoreAction> {
        let records = Arc::clone(&self.records);
        let key = (cache.to_string(), *id);
        Ok(Box::new(move || {
            records.write().expect("lock poisoned").remove(&key);
            Ok(())
        }))
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("identity", &self.identity)
            .field("record_count", &self.len())
            .finish()
    }
}
