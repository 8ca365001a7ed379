//! Typed pointers between entities.
//!
//! A [`Reference`] is stored inside an item and serialized as a small
//! descriptor (`{isNil}` or `{isEager, qualifiedCacheName, id, version}`).
//! It resolves its target through the [`Registry`](crate::Registry), either
//! on first [`get`](Reference::get) or, for eager references, as soon as it
//! is bound to its parent entity.
//!
//! ```text
//! decoded ──► retrieving ──► loaded
//!                  │
//!                  └──► retrievalError ──(cooldown)──► retrieving
//!
//! any ──► dereferenced   (explicit cycle break; terminal for resolution)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use tokio::sync::oneshot;

use ember_types::{EntityId, ReferenceData, SerializedReference};

use crate::batch::Batch;
use crate::database::Database;
use crate::entity::{Entity, ParentBinding, ParentEntity, Persistable};
use crate::error::{PersistError, PersistResult, ReferenceError};
use crate::log::LogLevel;

/// What resolving a reference yields: the target, `None` for nil.
pub type Resolved<T> = Result<Option<Arc<Entity<T>>>, ReferenceError>;

/// Object-safe view of a reference, used to walk the references of an item.
pub trait ReferenceContainer: Send + Sync {
    /// Bind to the entity holding the reference. Eager references start
    /// resolving here.
    fn attach(&self, parent: &ParentBinding, entity: Weak<dyn ParentEntity>);

    /// Switch to `dereferenced`, handing back the resolved target if any.
    fn detach_target(&self) -> Option<Arc<dyn ParentEntity>>;
}

/// Observable resolution state of a [`Reference`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferencePhase {
    Decoded,
    Retrieving,
    Loaded,
    RetrievalError,
    Dereferenced,
}

enum Phase {
    Decoded,
    Retrieving,
    Loaded,
    Failed {
        retry_after: Instant,
        cause: ReferenceError,
    },
    Dereferenced,
}

struct ParentLink {
    binding: ParentBinding,
    entity: Option<Weak<dyn ParentEntity>>,
}

struct Slot<T: Persistable> {
    phase: Phase,
    data: Option<ReferenceData>,
    target: Option<Arc<Entity<T>>>,
    parent: Option<ParentLink>,
    waiters: Vec<oneshot::Sender<Resolved<T>>>,
    // Bumped on every reassignment; a retrieval started under an older
    // epoch is discarded when it completes.
    epoch: u64,
}

struct Shared<T: Persistable> {
    is_eager: bool,
    slot: Mutex<Slot<T>>,
}

/// A pointer to an entity of type `T`.
///
/// Clones are handles to the same reference: resolving or reassigning
/// through one is seen by all.
pub struct Reference<T: Persistable> {
    shared: Arc<Shared<T>>,
}

impl<T: Persistable> Reference<T> {
    /// Lazy reference to an already-loaded `target`.
    pub fn new(parent: &ParentBinding, target: &Arc<Entity<T>>) -> Self {
        Self::resolved(parent, target, false)
    }

    /// Eager reference to an already-loaded `target`.
    pub fn eager(parent: &ParentBinding, target: &Arc<Entity<T>>) -> Self {
        Self::resolved(parent, target, true)
    }

    /// A reference pointing nowhere.
    pub fn nil(parent: &ParentBinding) -> Self {
        Self::build(false, Phase::Loaded, None, None, Some(parent))
    }

    /// Reference to a stored entity described by `data`. Eager references
    /// start loading right away.
    pub fn from_data(parent: &ParentBinding, data: ReferenceData, is_eager: bool) -> Self {
        let reference = Self::build(is_eager, Phase::Decoded, Some(data), None, Some(parent));
        if is_eager {
            let mut slot = reference.lock();
            // Only fails when the database is gone; get() reports that later.
            let _ = reference.shared.retrieve(&mut slot);
        }
        reference
    }

    fn resolved(parent: &ParentBinding, target: &Arc<Entity<T>>, is_eager: bool) -> Self {
        Self::build(
            is_eager,
            Phase::Loaded,
            Some(target.reference_data()),
            Some(Arc::clone(target)),
            Some(parent),
        )
    }

    fn build(
        is_eager: bool,
        phase: Phase,
        data: Option<ReferenceData>,
        target: Option<Arc<Entity<T>>>,
        parent: Option<&ParentBinding>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                is_eager,
                slot: Mutex::new(Slot {
                    phase,
                    data,
                    target,
                    parent: parent.map(|binding| ParentLink {
                        binding: binding.clone(),
                        entity: None,
                    }),
                    waiters: Vec::new(),
                    epoch: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.shared.lock()
    }

    pub fn is_eager(&self) -> bool {
        self.shared.is_eager
    }

    pub fn is_nil(&self) -> bool {
        self.lock().data.is_none()
    }

    /// Id of the target, `None` for nil.
    pub fn id(&self) -> Option<EntityId> {
        self.lock().data.as_ref().map(|d| d.id)
    }

    pub fn reference_data(&self) -> Option<ReferenceData> {
        self.lock().data.clone()
    }

    pub fn phase(&self) -> ReferencePhase {
        match self.lock().phase {
            Phase::Decoded => ReferencePhase::Decoded,
            Phase::Retrieving => ReferencePhase::Retrieving,
            Phase::Loaded => ReferencePhase::Loaded,
            Phase::Failed { .. } => ReferencePhase::RetrievalError,
            Phase::Dereferenced => ReferencePhase::Dereferenced,
        }
    }

    /// The resolved target, without triggering resolution.
    pub fn loaded(&self) -> Option<Arc<Entity<T>>> {
        let slot = self.lock();
        match slot.phase {
            Phase::Loaded => slot.target.clone(),
            _ => None,
        }
    }

    /// Resolve the target.
    ///
    /// Concurrent callers share one retrieval. A failed retrieval is
    /// returned as-is until the retry interval has passed.
    pub async fn get(&self) -> Resolved<T> {
        let rx = {
            let mut slot = self.lock();
            match &slot.phase {
                Phase::Dereferenced => return Err(ReferenceError::Dereferenced),
                Phase::Loaded => return Ok(slot.target.clone()),
                Phase::Failed { retry_after, cause } if Instant::now() < *retry_after => {
                    return Err(cause.clone());
                }
                _ => {}
            }
            if slot.data.is_none() {
                slot.phase = Phase::Loaded;
                return Ok(None);
            }
            if !matches!(slot.phase, Phase::Retrieving) {
                self.shared.retrieve(&mut slot)?;
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        rx.await.unwrap_or_else(|_| {
            Err(ReferenceError::Retrieval(Arc::new(PersistError::TaskFailed(
                "reference retrieval abandoned".into(),
            ))))
        })
    }

    /// Blocking [`get`](Self::get).
    pub fn get_sync(&self) -> Resolved<T> {
        let database = self.lock().database().ok_or(ReferenceError::Unbound)?;
        database
            .block_on(self.get())
            .map_err(|e| ReferenceError::Retrieval(Arc::new(e)))?
    }

    /// Point at `target` (or nowhere). Marks the parent dirty in `batch` and
    /// returns `true` if the target id changed.
    pub fn set(&self, target: Option<&Arc<Entity<T>>>, batch: &Batch) -> bool {
        self.assign(target.map(|t| t.reference_data()), target.cloned(), batch)
    }

    /// Like [`set`](Self::set), from a descriptor. The target is loaded on
    /// the next `get`.
    pub fn set_data(&self, data: Option<ReferenceData>, batch: &Batch) -> bool {
        self.assign(data, None, batch)
    }

    fn assign(&self, data: Option<ReferenceData>, target: Option<Arc<Entity<T>>>, batch: &Batch) -> bool {
        let (previous, waiters, resolved, parent) = {
            let mut slot = self.lock();
            if slot.data.as_ref().map(|d| d.id) == data.as_ref().map(|d| d.id) {
                return false;
            }
            slot.epoch += 1;
            let previous = std::mem::replace(&mut slot.target, target);
            slot.data = data;

            let mut waiters = Vec::new();
            let mut resolved = Ok(None);
            if matches!(slot.phase, Phase::Dereferenced) {
                waiters = std::mem::take(&mut slot.waiters);
                resolved = Err(ReferenceError::Dereferenced);
            } else if slot.target.is_some() || slot.data.is_none() {
                slot.phase = Phase::Loaded;
                waiters = std::mem::take(&mut slot.waiters);
                resolved = Ok(slot.target.clone());
            } else {
                slot.phase = Phase::Decoded;
                if self.shared.is_eager || !slot.waiters.is_empty() {
                    if let Err(e) = self.shared.retrieve(&mut slot) {
                        waiters = std::mem::take(&mut slot.waiters);
                        resolved = Err(e);
                    }
                }
            }
            let parent = slot.parent.as_ref().and_then(|p| p.entity.clone());
            (previous, waiters, resolved, parent)
        };

        for tx in waiters {
            let _ = tx.send(resolved.clone());
        }
        drop(previous);
        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent.mark_dirty(batch);
        }
        true
    }

    /// Drop the strong handle to the target, keeping its descriptor.
    pub fn dereference(&self) {
        let _released = self.detach_target();
    }

    /// [`dereference`](Self::dereference), then break every reference
    /// reachable from the released target.
    pub fn dereference_recursive(&self) {
        let parent_id = self.lock().parent.as_ref().map(|p| p.binding.id());
        if let Some(target) = self.detach_target() {
            let mut visited: HashSet<EntityId> = parent_id.into_iter().collect();
            target.break_references_from(&mut visited);
        }
    }
}

impl<T: Persistable> Slot<T> {
    fn database(&self) -> Option<Arc<Database>> {
        self.parent.as_ref().and_then(|p| p.binding.database())
    }
}

impl<T: Persistable> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().expect("reference lock poisoned")
    }

    /// Start loading the target described by the slot. The result lands in
    /// [`complete`](Self::complete).
    fn retrieve(self: &Arc<Self>, slot: &mut Slot<T>) -> Result<(), ReferenceError> {
        let database = slot.database().ok_or(ReferenceError::Unbound)?;
        let Some(data) = slot.data.clone() else {
            return Ok(());
        };
        slot.phase = Phase::Retrieving;
        let epoch = slot.epoch;
        let shared = Arc::downgrade(self);
        let runtime = database.runtime().clone();
        runtime.spawn(async move {
            let result = resolve::<T>(&database, &data).await;
            if let Some(shared) = shared.upgrade() {
                shared.complete(epoch, result, &database, &data);
            }
        });
        Ok(())
    }

    fn complete(&self, epoch: u64, result: PersistResult<Arc<Entity<T>>>, database: &Database, data: &ReferenceData) {
        let (waiters, resolved, previous) = {
            let mut slot = self.lock();
            if slot.epoch != epoch {
                return;
            }
            match result {
                Ok(entity) => {
                    slot.phase = Phase::Loaded;
                    let previous = slot.target.replace(Arc::clone(&entity));
                    (std::mem::take(&mut slot.waiters), Ok(Some(entity)), previous)
                }
                Err(e) => {
                    let cause = ReferenceError::Retrieval(Arc::new(e));
                    slot.phase = Phase::Failed {
                        retry_after: Instant::now() + database.config().reference_retry_interval(),
                        cause: cause.clone(),
                    };
                    (std::mem::take(&mut slot.waiters), Err(cause), None)
                }
            }
        };
        drop(previous);

        if let Err(e) = &resolved {
            database.log(
                LogLevel::Warning,
                "Reference",
                "get",
                &format!("{}/{} unavailable: {e}", data.qualified_cache_name(), data.id),
                json!({ "id": data.id.to_string(), "waiters": waiters.len() }),
            );
        }
        for tx in waiters {
            let _ = tx.send(resolved.clone());
        }
    }
}

async fn resolve<T: Persistable>(database: &Database, data: &ReferenceData) -> PersistResult<Arc<Entity<T>>> {
    let cache = database.registry().cache::<T>(&data.qualified_cache_name())?;
    cache.get(data.id).await
}

impl<T: Persistable> ReferenceContainer for Reference<T> {
    fn attach(&self, parent: &ParentBinding, entity: Weak<dyn ParentEntity>) {
        let mut slot = self.lock();
        slot.parent = Some(ParentLink {
            binding: parent.clone(),
            entity: Some(entity),
        });
        if self.shared.is_eager && matches!(slot.phase, Phase::Decoded) {
            // Just bound, so only a vanished database can fail this.
            let _ = self.shared.retrieve(&mut slot);
        }
    }

    fn detach_target(&self) -> Option<Arc<dyn ParentEntity>> {
        let (target, waiters) = {
            let mut slot = self.lock();
            slot.epoch += 1;
            slot.phase = Phase::Dereferenced;
            // `data` already describes the target; it is kept as the descriptor.
            (slot.target.take(), std::mem::take(&mut slot.waiters))
        };
        for tx in waiters {
            let _ = tx.send(Err(ReferenceError::Dereferenced));
        }
        target.map(|t| t as Arc<dyn ParentEntity>)
    }
}

impl<T: Persistable> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Persistable> Default for Reference<T> {
    /// An unbound nil reference.
    fn default() -> Self {
        Self::build(false, Phase::Loaded, None, None, None)
    }
}

impl<T: Persistable> Serialize for Reference<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = {
            let slot = self.lock();
            SerializedReference::from_data(slot.data.as_ref(), self.shared.is_eager)
        };
        wire.serialize(serializer)
    }
}

impl<'de, T: Persistable> Deserialize<'de> for Reference<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (data, is_eager) = SerializedReference::deserialize(deserializer)?
            .into_parts()
            .map_err(D::Error::custom)?;
        let phase = if data.is_some() {
            Phase::Decoded
        } else {
            Phase::Loaded
        };
        Ok(Self::build(is_eager, phase, data, None, None))
    }
}

impl<T: Persistable> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("phase", &self.phase())
            .field("id", &self.id())
            .field("eager", &self.is_eager())
            .finish()
    }
}
