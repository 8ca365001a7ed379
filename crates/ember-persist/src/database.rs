use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use ember_store::{StorageAdapter, StoreResult};

use crate::batch::Batch;
use crate::cache::Cache;
use crate::config::PersistConfig;
use crate::entity::Persistable;
use crate::error::{PersistError, PersistResult};
use crate::log::{LogLevel, Logger, TracingLogger};
use crate::registry::Registry;

/// Binds a storage adapter to the policy and services the persistence layer
/// runs with: logger, configuration, runtime and registry.
///
/// Caches and batches are created from a database and keep it alive.
pub struct Database {
    adapter: Arc<dyn StorageAdapter>,
    logger: Arc<dyn Logger>,
    config: PersistConfig,
    registry: Arc<Registry>,
    runtime: Handle,
}

/// Builder for [`Database`].
pub struct DatabaseBuilder {
    adapter: Arc<dyn StorageAdapter>,
    logger: Option<Arc<dyn Logger>>,
    config: PersistConfig,
    registry: Option<Arc<Registry>>,
    runtime: Option<Handle>,
}

impl DatabaseBuilder {
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Runtime for background work. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build and register the database.
    ///
    /// If another live database already uses the same backend identity the
    /// new one is still returned, but it is not registered and the conflict
    /// is logged at error level.
    pub fn open(self) -> PersistResult<Arc<Database>> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| PersistError::NoRuntime(e.to_string()))?,
        };
        let database = Arc::new(Database {
            adapter: self.adapter,
            logger: self.logger.unwrap_or_else(|| Arc::new(TracingLogger::default())),
            config: self.config,
            registry: self.registry.unwrap_or_else(Registry::global),
            runtime,
        });

        if let Err(e) = database.registry.register_database(&database) {
            database.log(
                LogLevel::Error,
                "Database",
                "open",
                &e.to_string(),
                json!({ "backendIdentity": database.backend_identity() }),
            );
        } else {
            debug!(backend = database.backend_identity(), "database opened");
        }
        Ok(database)
    }
}

impl Database {
    pub fn builder(adapter: Arc<dyn StorageAdapter>) -> DatabaseBuilder {
        DatabaseBuilder {
            adapter,
            logger: None,
            config: PersistConfig::default(),
            registry: None,
            runtime: None,
        }
    }

    /// Open with default configuration, the global registry and the current runtime.
    pub fn open(adapter: Arc<dyn StorageAdapter>) -> PersistResult<Arc<Self>> {
        Self::builder(adapter).open()
    }

    /// Open (and register) the cache named `name` for items of type `T`.
    pub fn cache<T: Persistable>(self: &Arc<Self>, name: &str) -> PersistResult<Arc<Cache<T>>> {
        Cache::open(self, name)
    }

    /// A new, empty batch.
    pub fn batch(self: &Arc<Self>) -> Batch {
        Batch::new(self)
    }

    pub fn backend_identity(&self) -> &str {
        self.adapter.backend_identity()
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn log(&self, level: LogLevel, source: &str, feature: &str, message: &str, data: Value) {
        self.logger.log(level, source, feature, message, &data);
    }

    /// Run a storage call inline for synchronous adapters, on the blocking
    /// pool otherwise.
    pub(crate) async fn call_storage<R, F>(&self, f: F) -> PersistResult<R>
    where
        F: FnOnce(&dyn StorageAdapter) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.adapter.is_synchronous() {
            return f(self.adapter.as_ref()).map_err(PersistError::from);
        }
        let adapter = Arc::clone(&self.adapter);
        let result = self
            .runtime
            .spawn_blocking(move || f(adapter.as_ref()))
            .await
            .map_err(|e| PersistError::TaskFailed(e.to_string()))?;
        result.map_err(PersistError::from)
    }

    /// Drive `future` to completion from synchronous code.
    ///
    /// Inside a runtime this needs the multi-threaded flavor, since the
    /// calling worker is parked for the duration.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> PersistResult<F::Output> {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| current.block_on(future)))
            }
            Ok(_) => Err(PersistError::TaskFailed(
                "blocking call inside a current-thread runtime".into(),
            )),
            Err(_) => Ok(self.runtime.block_on(future)),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.registry.deregister_database(self.adapter.backend_identity());
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend_identity())
            .field("config", &self.config)
            .finish()
    }
}
