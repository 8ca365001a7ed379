use std::path::PathBuf;

use ember_types::EntityId;

/// Errors from storage adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found: {cache}/{id}")]
    NotFound { cache: String, id: EntityId },

    /// An add targeted an id that is already stored.
    #[error("record already exists: {cache}/{id}")]
    AlreadyExists { cache: String, id: EntityId },

    /// An update carried a version that is not newer than the stored one.
    #[error("stale write for {cache}/{id}: stored version {stored}, attempted {attempted}")]
    VersionConflict {
        cache: String,
        id: EntityId,
        stored: u64,
        attempted: u64,
    },

    /// The cache name is not acceptable to this backend.
    #[error("invalid cache name {name:?}: {reason}")]
    InvalidCacheName { name: String, reason: String },

    /// Backend-specific failure. The backend decides whether a retry can help.
    #[error("backend error: {message}")]
    Backend { message: String, recoverable: bool },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored document could not be decoded.
    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// A recoverable failure that the caller should retry later.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            recoverable: true,
        }
    }

    /// A failure that will not go away on retry.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            recoverable: false,
        }
    }

    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Backend { recoverable, .. } => *recoverable,
            Self::Io(_) => true,
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::VersionConflict { .. }
            | Self::InvalidCacheName { .. }
            | Self::Serialization(_)
            | Self::CorruptRecord { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
