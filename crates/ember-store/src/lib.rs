//! Storage adapter contract for Ember.
//!
//! The persistence layer never talks to a database directly. It goes through
//! the narrow [`StorageAdapter`] contract defined here: point reads, full
//! scans of one cache, and add/update/remove *actions* that are prepared
//! synchronously and executed either inline or on a worker thread,
//! depending on [`StorageAdapter::is_synchronous`].
//!
//! # Backends
//!
//! - [`InMemoryStorage`] -- `HashMap`-based store for tests and embedding
//! - [`FileStorage`] -- one JSON document per entity under a root directory
//! - [`FlakyStorage`] -- fault-injecting wrapper around any other backend
//!
//! # Design Rules
//!
//! 1. Records are keyed by `(cache name, entity id)`.
//! 2. An update is rejected unless its version is greater than the stored one.
//! 3. Removal of an absent record succeeds.
//! 4. Every error states whether retrying can help ([`StoreError::is_recoverable`]).
//! 5. The store never interprets the `item` payload of a record.

pub mod error;
pub mod file;
pub mod flaky;
pub mod memory;
pub mod names;
pub mod record;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{StoreError, StoreResult};
pub use file::FileStorage;
pub use flaky::FlakyStorage;
pub use memory::InMemoryStorage;
pub use names::validate_cache_name;
pub use record::EntityRecord;
pub use traits::{StorageAdapter, StoreAction};
