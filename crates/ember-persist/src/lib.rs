//! Identity-mapped object persistence for Ember.
//!
//! Applications keep their domain objects in [`Cache`]s. Every object lives
//! in exactly one [`Entity`], which tracks whether it has unsaved changes.
//! Changes are collected in a [`Batch`] and pushed to a
//! [`StorageAdapter`](ember_store::StorageAdapter) in the background, with
//! recoverable failures retried pass after pass. Objects point at each other
//! through [`Reference`]s that load their targets lazily or eagerly.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use serde::{Deserialize, Serialize};
//! # use ember_persist::{Database, Persistable};
//! # use ember_store::InMemoryStorage;
//! #[derive(Serialize, Deserialize)]
//! struct Person {
//!     name: String,
//! }
//!
//! impl Persistable for Person {}
//!
//! # async fn demo() -> ember_persist::PersistResult<()> {
//! let db = Database::open(Arc::new(InMemoryStorage::new()))?;
//! let people = db.cache::<Person>("people")?;
//! let batch = db.batch();
//! let ada = people.new(&batch, Person { name: "Ada".into() });
//! batch.commit_and_wait().await?;
//! assert_eq!(ada.version(), 1);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod log;
pub mod reference;
pub mod registrar;
pub mod registry;

#[cfg(test)]
mod testing;

pub use batch::{Batch, BatchReport, CommitOutcome, Committable};
pub use cache::Cache;
pub use config::PersistConfig;
pub use database::{Database, DatabaseBuilder};
pub use entity::{Entity, ParentBinding, ParentEntity, Persistable};
pub use error::{PersistError, PersistResult, ReferenceError};
pub use log::{LogLevel, LogRecord, Logger, MemoryLogger, TracingLogger};
pub use reference::{Reference, ReferenceContainer, ReferencePhase, Resolved};
pub use registrar::WeakRegistrar;
pub use registry::Registry;

// Re-export the types applications handle directly.
pub use ember_store::{FileStorage, InMemoryStorage, StorageAdapter, StoreError};
pub use ember_types::{EntityId, PersistenceState, QualifiedCacheName, ReferenceData};
