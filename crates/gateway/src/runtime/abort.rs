//! Process-wide cooperative cancellation signals.
//!
//! A shared table of abort flags keyed by opaque handles. Consumers (run
//! processes, tool wrappers) poll [`AbortRegistry::is_aborted`] at each
//! cooperative point. Forced cancellation is unsafe while external side
//! effects are in flight; polling lets tools clean up first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque handle into the abort table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle(u64);

/// Shared table of abort flags. All operations are safe under concurrent
/// access; aborting is idempotent.
pub struct AbortRegistry {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl Default for AbortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh, un-aborted signal.
    pub fn create(&self) -> SignalHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .lock()
            .insert(id, Arc::new(AtomicBool::new(false)));
        SignalHandle(id)
    }

    /// Request cancellation. Idempotent; a cleared or unknown handle is a
    /// no-op.
    pub fn abort(&self, handle: SignalHandle) {
        if let Some(flag) = self.table.lock().get(&handle.0) {
            flag.store(true, Ordering::Release);
        }
    }

    /// Whether cancellation has been requested. Unknown handles read as
    /// not aborted.
    pub fn is_aborted(&self, handle: SignalHandle) -> bool {
        self.table
            .lock()
            .get(&handle.0)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Drop the signal from the table (called when its run terminates).
    pub fn clear(&self, handle: SignalHandle) {
        self.table.lock().remove(&handle.0);
    }

    /// A cheap shared view of the flag for hot polling loops.
    pub fn flag(&self, handle: SignalHandle) -> Option<Arc<AtomicBool>> {
        self.table.lock().get(&handle.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_lifecycle() {
        let registry = AbortRegistry::new();
        let handle = registry.create();
        assert!(!registry.is_aborted(handle));

        registry.abort(handle);
        assert!(registry.is_aborted(handle));

        // Idempotent.
        registry.abort(handle);
        assert!(registry.is_aborted(handle));

        registry.clear(handle);
        assert!(!registry.is_aborted(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn abort_after_clear_is_noop() {
        let registry = AbortRegistry::new();
        let handle = registry.create();
        registry.clear(handle);
        registry.abort(handle);
        assert!(!registry.is_aborted(handle));
    }

    #[test]
    fn handles_are_independent() {
        let registry = AbortRegistry::new();
        let a = registry.create();
        let b = registry.create();
        registry.abort(a);
        assert!(registry.is_aborted(a));
        assert!(!registry.is_aborted(b));
    }

    #[test]
    fn flag_shares_state() {
        let registry = AbortRegistry::new();
        let handle = registry.create();
        let flag = registry.flag(handle).unwrap();
        assert!(!flag.load(Ordering::Acquire));
        registry.abort(handle);
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn concurrent_abort_and_poll() {
        let registry = Arc::new(AbortRegistry::new());
        let handle = registry.create();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            joins.push(std::thread::spawn(move || {
                registry.abort(handle);
                registry.is_aborted(handle)
            }));
        }
        for join in joins {
            assert!(join.join().unwrap());
        }
    }
}
