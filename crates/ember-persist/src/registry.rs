use std::any::Any;
use std::sync::{Arc, OnceLock};

use ember_types::QualifiedCacheName;

use crate::cache::Cache;
use crate::database::Database;
use crate::entity::Persistable;
use crate::error::{PersistError, PersistResult};
use crate::registrar::WeakRegistrar;

/// Process-level directory of live databases and caches.
///
/// Databases are keyed by backend identity, caches by qualified cache name.
/// A `Registry` is passed to [`Database`] at construction; tests create a
/// private one (or call [`Registry::reset`]) for isolation.
#[derive(Debug, Default)]
pub struct Registry {
    databases: WeakRegistrar<Database>,
    caches: WeakRegistrar<dyn Any + Send + Sync>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The shared default registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(Registry::new))
    }

    /// Forget every registration.
    pub fn reset(&self) {
        self.databases.reset();
        self.caches.reset();
    }

    /// The live database over `backend_identity`, if any.
    pub fn database(&self, backend_identity: &str) -> Option<Arc<Database>> {
        self.databases.lookup(backend_identity)
    }

    /// The live cache registered under `name`, typed.
    pub fn cache<T: Persistable>(&self, name: &QualifiedCacheName) -> PersistResult<Arc<Cache<T>>> {
        let key = name.to_string();
        let any = self
            .caches
            .lookup(&key)
            .ok_or_else(|| PersistError::CacheUnavailable { name: key.clone() })?;
        any.downcast::<Cache<T>>()
            .map_err(|_| PersistError::CacheTypeMismatch { name: key })
    }

    /// Qualified names of every live cache.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.names()
    }

    pub fn database_identities(&self) -> Vec<String> {
        self.databases.names()
    }

    pub(crate) fn register_database(&self, database: &Arc<Database>) -> PersistResult<()> {
        self.databases
            .register(database.backend_identity(), database)
    }

    pub(crate) fn deregister_database(&self, backend_identity: &str) {
        self.databases.deregister_dead(backend_identity);
    }

    pub(crate) fn register_cache<T: Persistable>(&self, cache: &Arc<Cache<T>>) -> PersistResult<()> {
        let any: Arc<dyn Any + Send + Sync> = cache.clone();
        self.caches
            .register(&cache.qualified_name().to_string(), &any)
    }

    pub(crate) fn deregister_cache(&self, name: &QualifiedCacheName) {
        self.caches.deregister_dead(&name.to_string());
    }
}
