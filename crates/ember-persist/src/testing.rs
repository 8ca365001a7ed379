//! Shared fixtures for the unit tests of this crate.

use std::sync::Arc;

use serde::ser::{Error as _, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};

use ember_store::{FlakyStorage, InMemoryStorage, StorageAdapter};

use crate::config::PersistConfig;
use crate::database::Database;
use crate::entity::{Entity, ParentBinding, Persistable};
use crate::log::MemoryLogger;
use crate::reference::{Reference, ReferenceContainer};
use crate::registry::Registry;

/// Short intervals so retry paths finish quickly.
pub(crate) fn test_config() -> PersistConfig {
    PersistConfig {
        commit_timeout_ms: 1_000,
        batch_retry_interval_ms: 10,
        reference_retry_interval_ms: 100,
        max_batch_passes: Some(8),
        schema_version: 1,
    }
}

pub(crate) struct Fixture {
    pub db: Arc<Database>,
    /// The backing store, bypassing any fault injection.
    pub storage: Arc<InMemoryStorage>,
    pub logger: Arc<MemoryLogger>,
    pub registry: Arc<Registry>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(test_config())
}

pub(crate) fn fixture_with(config: PersistConfig) -> Fixture {
    let storage = Arc::new(InMemoryStorage::new());
    build(storage.clone(), storage, config)
}

/// A database over a [`FlakyStorage`]; `synchronous` picks inline or
/// worker-thread writes.
pub(crate) fn flaky_fixture(config: PersistConfig, synchronous: bool) -> (Fixture, Arc<FlakyStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let mut flaky = FlakyStorage::new(storage.clone());
    if !synchronous {
        flaky = flaky.asynchronous();
    }
    let flaky = Arc::new(flaky);
    (build(flaky.clone(), storage, config), flaky)
}

fn build(adapter: Arc<dyn StorageAdapter>, storage: Arc<InMemoryStorage>, config: PersistConfig) -> Fixture {
    let registry = Registry::new();
    let logger = Arc::new(MemoryLogger::new());
    let db = Database::builder(adapter)
        .registry(registry.clone())
        .logger(logger.clone())
        .config(config)
        .open()
        .expect("open test database");
    Fixture {
        db,
        storage,
        logger,
        registry,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Note {
    pub text: String,
}

impl Note {
    pub fn new(text: &str) -> Self {
        Self { text: text.into() }
    }
}

impl Persistable for Note {}

/// Refuses to serialize while `explode` is set.
#[derive(Debug, Deserialize)]
pub(crate) struct Failing {
    pub explode: bool,
}

impl Serialize for Failing {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.explode {
            return Err(S::Error::custom("refusing to serialize"));
        }
        let mut s = serializer.serialize_struct("Failing", 1)?;
        s.serialize_field("explode", &self.explode)?;
        s.end()
    }
}

impl Persistable for Failing {}

/// Linked-list node with one outgoing reference.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Node {
    pub label: String,
    pub next: Reference<Node>,
}

impl Node {
    pub fn new(parent: &ParentBinding, label: &str) -> Self {
        Self {
            label: label.into(),
            next: Reference::nil(parent),
        }
    }

    pub fn linked(parent: &ParentBinding, label: &str, next: &Arc<Entity<Node>>, eager: bool) -> Self {
        let next = if eager {
            Reference::eager(parent, next)
        } else {
            Reference::new(parent, next)
        };
        Self {
            label: label.into(),
            next,
        }
    }
}

impl Persistable for Node {
    fn visit_references(&self, visitor: &mut dyn FnMut(&dyn ReferenceContainer)) {
        visitor(&self.next);
    }
}
