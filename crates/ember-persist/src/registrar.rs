//! Name → weakly-held object registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{PersistError, PersistResult};

/// Concurrency-safe registry that never keeps its objects alive.
///
/// Used to enforce "one live instance per name" and to let distant
/// components find an object by name without owning it. Entries whose object
/// has been dropped count as absent and are replaced on the next
/// registration.
pub struct WeakRegistrar<T: ?Sized> {
    entries: Mutex<HashMap<String, Weak<T>>>,
}

impl<T: ?Sized> WeakRegistrar<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `object` under `name`.
    ///
    /// Fails with [`PersistError::DuplicateRegistration`] if a different
    /// object is still alive under the same name. Registering the same
    /// object twice is a no-op.
    pub fn register(&self, name: &str, object: &Arc<T>) -> PersistResult<()> {
        let candidate = Arc::downgrade(object);
        let mut entries = self.entries.lock().expect("registrar lock poisoned");
        if let Some(existing) = entries.get(name) {
            // strong_count instead of upgrade: an upgraded Arc dropped here
            // could run the object's destructor under this lock.
            if existing.strong_count() > 0 && !Weak::ptr_eq(existing, &candidate) {
                return Err(PersistError::DuplicateRegistration {
                    name: name.to_string(),
                });
            }
        }
        entries.insert(name.to_string(), candidate);
        Ok(())
    }

    /// The live object registered under `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock().expect("registrar lock poisoned");
        entries.get(name).and_then(Weak::upgrade)
    }

    /// Returns `true` if a live object is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.lock().expect("registrar lock poisoned");
        entries.get(name).is_some_and(|w| w.strong_count() > 0)
    }

    /// Remove `name` if its object is gone. Called from destructors, where
    /// the dying object can no longer be compared by pointer.
    pub fn deregister_dead(&self, name: &str) -> bool {
        let mut entries = self.entries.lock().expect("registrar lock poisoned");
        match entries.get(name) {
            Some(existing) if existing.strong_count() == 0 => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Drop every entry whose object is gone. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock().expect("registrar lock poisoned");
        let before = entries.len();
        entries.retain(|_, w| w.strong_count() > 0);
        before - entries.len()
    }

    /// Names with a live object, sorted.
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("registrar lock poisoned");
        let mut names: Vec<String> = entries
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("registrar lock poisoned");
        entries.values().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry, live or not.
    pub fn reset(&self) {
        self.entries.lock().expect("registrar lock poisoned").clear();
    }
}

impl<T: ?Sized> Default for WeakRegistrar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for WeakRegistrar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistrar")
            .field("names", &self.names())
            .finish()
    }
}
