use std::sync::Arc;
use std::time::Duration;

use ember_store::StoreError;
use ember_types::EntityId;

/// Errors produced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// No record with this id exists in the cache's storage.
    #[error("{cache}/{id} not found")]
    NotFound { cache: String, id: EntityId },

    /// The storage adapter failed. Recoverability is the adapter's call.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The item could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single entity write did not finish in time. The write keeps running.
    #[error("commit of {id} timed out after {timeout:?}")]
    Timeout { id: EntityId, timeout: Duration },

    /// A whole batch pass exceeded its watchdog; outstanding entities were dropped.
    #[error("batch {batch} pass timed out after {timeout:?}")]
    BatchTimeout { batch: uuid::Uuid, timeout: Duration },

    /// Unwritten changes were discarded because their holders were released.
    #[error("{cache}/{id} not committed: lost data")]
    LostUpdate { cache: String, id: EntityId },

    /// Another live object already owns this name.
    #[error("duplicate registration: {name}")]
    DuplicateRegistration { name: String },

    /// A previous write of the same entity is still outstanding.
    #[error("write of {id} already in flight")]
    WriteInFlight { id: EntityId },

    /// The entity was removed from storage and can no longer be changed.
    #[error("{id} has been removed")]
    Removed { id: EntityId },

    /// The entity is marked for removal; updates are rejected until it is gone.
    #[error("{id} is pending removal")]
    PendingRemoval { id: EntityId },

    /// No live cache is registered under this qualified name.
    #[error("cache unavailable: {name}")]
    CacheUnavailable { name: String },

    /// A cache is registered under this name but for another item type.
    #[error("cache {name} holds a different item type")]
    CacheTypeMismatch { name: String },

    /// Exceeded the configured number of batch passes.
    #[error("{id} still failing after {passes} batch passes")]
    RetriesExhausted { id: EntityId, passes: u32 },

    /// No tokio runtime was available to run background work.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// A background task ended without reporting.
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PersistError {
    /// Returns `true` if the failed operation should be retried later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_recoverable(),
            Self::Timeout { .. } | Self::WriteInFlight { .. } => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors from resolving a [`Reference`](crate::Reference).
///
/// Cloneable so one cached retrieval failure can be handed to every caller
/// that queued behind it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReferenceError {
    /// The reference was broken with `dereference()`.
    #[error("reference has been dereferenced")]
    Dereferenced,

    /// The reference is not attached to a database yet.
    #[error("reference is not bound to a database")]
    Unbound,

    /// Loading the target failed; the same error is returned until the
    /// retry interval elapses.
    #[error("reference retrieval failed: {0}")]
    Retrieval(Arc<PersistError>),
}

impl ReferenceError {
    /// The underlying persistence error, for retrieval failures.
    pub fn cause(&self) -> Option<&PersistError> {
        match self {
            Self::Retrieval(cause) => Some(cause),
            _ => None,
        }
    }
}
