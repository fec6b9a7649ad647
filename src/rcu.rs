//! Epoch-based deferred reclamation standing in for RCU.
//!
//! Slab pages of `TYPESAFE_BY_RCU` caches are not returned to the page
//! provider directly. They are deferred on a `crossbeam_epoch` collector
//! private to the allocator and released once every participant pinned
//! when they were queued has unpinned.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Collector, Guard};

/// A reclamation domain shared by all caches of one allocator.
pub struct RcuDomain {
    collector: Collector,
    pending: Arc<AtomicUsize>,
}

/// Read-side critical section; dropping it ends the section.
pub struct RcuReadGuard {
    _guard: Guard,
}

impl RcuDomain {
    pub fn new() -> Self {
        Self {
            collector: Collector::new(),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enter a read-side critical section.
    pub fn read_lock(&self) -> RcuReadGuard {
        // The participant stays registered until the guard is dropped.
        let handle = self.collector.register();
        RcuReadGuard {
            _guard: handle.pin(),
        }
    }

    /// Queue `work` to run after a grace period.
    pub fn call(&self, work: impl FnOnce() + Send + 'static) {
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        let handle = self.collector.register();
        let guard = handle.pin();
        guard.defer(move || {
            work();
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        guard.flush();
    }

    /// Try to advance the epoch and run the work whose grace period has
    /// elapsed. Returns the number of callbacks run.
    pub fn poll(&self) -> usize {
        let before = self.pending();
        let handle = self.collector.register();
        handle.pin().flush();
        before.saturating_sub(self.pending())
    }

    /// Wait until every queued callback has run. Must not be called from
    /// inside a read-side critical section.
    pub fn barrier(&self) {
        let handle = self.collector.register();
        while self.pending() != 0 {
            handle.pin().flush();
            core::hint::spin_loop();
        }
    }

    /// Number of callbacks still waiting for their grace period.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}
