//! Fault injection for storage backends.
//!
//! [`FlakyStorage`] wraps another adapter and fails a configurable number of
//! upcoming reads or writes, optionally slows writes down, and counts the
//! writes that actually reached the inner backend. It is used by the
//! persistence tests to exercise retry, timeout and lost-update paths.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ember_types::EntityId;

use crate::error::{StoreError, StoreResult};
use crate::record::EntityRecord;
use crate::traits::{StorageAdapter, StoreAction};

/// Shared counters, so prepared actions can update them after the adapter
/// call has returned.
#[derive(Default)]
struct Faults {
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
    recoverable: AtomicBool,
    write_delay_ms: AtomicU64,
    applied_writes: AtomicUsize,
    attempted_writes: AtomicUsize,
}

impl Faults {
    /// Consume one pending failure from `counter`, if any.
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected_error(&self, what: &str) -> StoreError {
        StoreError::Backend {
            message: format!("injected {what} failure"),
            recoverable: self.recoverable.load(Ordering::SeqCst),
        }
    }
}

/// Adapter wrapper that injects failures and latency.
pub struct FlakyStorage {
    inner: Arc<dyn StorageAdapter>,
    identity: String,
    synchronous: bool,
    faults: Arc<Faults>,
}

impl FlakyStorage {
    /// Wrap `inner`. Failures injected later are recoverable by default.
    pub fn new(inner: Arc<dyn StorageAdapter>) -> Self {
        let identity = format!("flaky:{}", inner.backend_identity());
        let synchronous = inner.is_synchronous();
        let faults = Faults::default();
        faults.recoverable.store(true, Ordering::SeqCst);
        Self {
            inner,
            identity,
            synchronous,
            faults: Arc::new(faults),
        }
    }

    /// Force actions to run on worker threads even if the inner backend is
    /// synchronous. Needed for write timeouts to be observable.
    pub fn asynchronous(mut self) -> Self {
        self.synchronous = false;
        self
    }

    /// Fail the next `n` write actions.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads (`get` and `scan`).
    pub fn fail_next_reads(&self, n: usize) {
        self.faults.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Whether injected failures are reported as recoverable.
    pub fn set_recoverable(&self, recoverable: bool) {
        self.faults.recoverable.store(recoverable, Ordering::SeqCst);
    }

    /// Sleep this long inside every write action.
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Writes that reached the inner backend and succeeded.
    pub fn applied_writes(&self) -> usize {
        self.faults.applied_writes.load(Ordering::SeqCst)
    }

    /// Write actions that were run, including injected failures.
    pub fn attempted_writes(&self) -> usize {
        self.faults.attempted_writes.load(Ordering::SeqCst)
    }

    fn wrap(&self, action: StoreAction) -> StoreAction {
        let faults = Arc::clone(&self.faults);
        Box::new(move || {
            faults.attempted_writes.fetch_add(1, Ordering::SeqCst);
            let delay = faults.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                thread::sleep(Duration::from_millis(delay));
            }
            if Faults::take(&faults.failing_writes) {
                return Err(faults.injected_error("write"));
            }
            action()?;
            faults.applied_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn check_read(&self) -> StoreResult<()> {
        if Faults::take(&self.faults.failing_reads) {
            return Err(self.faults.injected_error("read"));
        }
        Ok(())
    }
}

impl StorageAdapter for FlakyStorage {
    fn backend_identity(&self) -> &str {
        &self.identity
    }

    fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn validate_cache_name(&self, name: &str) -> StoreResult<()> {
        self.inner.validate_cache_name(name)
    }

    fn get(&self, cache: &str, id: &EntityId) -> StoreResult<EntityRecord> {
        self.check_read()?;
        self.inner.get(cache, id)
    }

    fn scan(&self, cache: &str) -> StoreResult<Vec<EntityRecord>> {
        self.check_read()?;
        self.inner.scan(cache)
    }

    fn add_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        Ok(self.wrap(self.inner.add_action(cache, record)?))
    }

    fn update_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        Ok(self.wrap(self.inner.update_action(cache, record)?))
    }

    fn remove_action(&self, cache: &str, id: &EntityId) -> StoreResult<StoreAction> {
        Ok(self.wrap(self.inner.remove_action(cache, id)?))
    }
}

impl std::fmt::Debug for FlakyStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyStorage")
            .field("identity", &self.identity)
            .field("applied_writes", &self.applied_writes())
            .finish()
    }
}
