use ember_types::EntityId;

use crate::error::StoreResult;
use crate::names::validate_cache_name;
use crate::record::EntityRecord;

/// A prepared write.
///
/// Returned by the `*_action` methods once the backend has accepted the
/// request; running it performs the actual I/O. The persistence layer runs
/// it inline for synchronous backends and on a worker thread otherwise.
pub type StoreAction = Box<dyn FnOnce() -> StoreResult<()> + Send + 'static>;

/// Storage backend consumed by the persistence layer.
///
/// All implementations must satisfy these invariants:
/// - Records are keyed by `(cache, id)`; caches never see each other's records.
/// - `update_action` rejects a record whose version is not greater than the
///   stored version.
/// - Removing an absent record succeeds.
/// - Every error reports through [`StoreError::is_recoverable`] whether a
///   later retry may succeed.
///
/// [`StoreError::is_recoverable`]: crate::StoreError::is_recoverable
pub trait StorageAdapter: Send + Sync {
    /// Stable identity of this storage instance.
    ///
    /// Used to qualify cache names and to detect two live databases over
    /// the same backend.
    fn backend_identity(&self) -> &str;

    /// Returns `true` if operations are cheap enough to run inline.
    fn is_synchronous(&self) -> bool;

    /// Check a cache name before a cache is opened on it.
    fn validate_cache_name(&self, name: &str) -> StoreResult<()> {
        validate_cache_name(name)
    }

    /// Read one record. Returns `StoreError::NotFound` if absent.
    fn get(&self, cache: &str, id: &EntityId) -> StoreResult<EntityRecord>;

    /// Read every record stored for `cache`.
    fn scan(&self, cache: &str) -> StoreResult<Vec<EntityRecord>>;

    /// Prepare the first write of a record.
    fn add_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction>;

    /// Prepare an overwrite of a stored record.
    fn update_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction>;

    /// Prepare the deletion of a record.
    fn remove_action(&self, cache: &str, id: &EntityId) -> StoreResult<StoreAction>;
}
