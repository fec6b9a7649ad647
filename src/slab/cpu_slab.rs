//! Per-CPU slab state.
//!
//! The fast paths work on one 64-bit word per CPU:
//!
//! ```text
//!  63           32 31                0
//! [      tid      ][ freelist index  ]
//! ```
//!
//! The index names the first object of the CPU's private freelist inside
//! the active slab. Every successful update advances `tid` by a stride that
//! keeps the sequences of different CPUs disjoint, so a compare-and-swap
//! issued against a stale snapshot always fails.
//!
//! The active slab is published separately. Whenever it changes the word
//! is replaced too, and `readers` lets the slow path wait until no fast
//! path can still be dereferencing the previous slab.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use kspin::SpinNoIrq;

use super::page::Slab;
use crate::stats::CpuStats;

/// Word index meaning "private freelist empty".
pub(crate) const NO_OBJECT: u32 = u32::MAX;

#[inline]
fn pack(idx: u32, tid: u32) -> u64 {
    (tid as u64) << 32 | idx as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// Frozen slabs parked on a CPU, linked through `next_partial`.
///
/// Parked slabs keep taking frees, so their free objects are counted from
/// the slab states whenever the cap is checked.
pub(crate) struct CpuPartial {
    head: *mut Slab,
    slabs: usize,
}

// SAFETY: the list is only walked under the owning CPU's lock or after it
// has been detached from the CPU.
unsafe impl Send for CpuPartial {}

impl CpuPartial {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            slabs: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn slabs(&self) -> usize {
        self.slabs
    }

    /// Free objects over all parked slabs right now.
    pub(crate) fn free_objects(&self) -> usize {
        let mut free = 0;
        let mut cursor = self.head;
        while let Some(slab) = NonNull::new(cursor) {
            let s = unsafe { slab.as_ref() };
            free += s.objects() - s.inuse();
            cursor = s.next_partial();
        }
        free
    }

    pub(crate) fn head(&self) -> Option<NonNull<Slab>> {
        NonNull::new(self.head)
    }

    /// Park `slab` on the list of `cpu`.
    pub(crate) fn push(&mut self, slab: NonNull<Slab>, cpu: usize) {
        let s = unsafe { slab.as_ref() };
        s.set_next_partial(self.head);
        s.set_parked(Some(cpu));
        self.head = slab.as_ptr();
        self.slabs += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<Slab>> {
        let slab = NonNull::new(self.head)?;
        let s = unsafe { slab.as_ref() };
        self.head = s.next_partial();
        s.set_next_partial(ptr::null_mut());
        s.set_parked(None);
        self.slabs -= 1;
        Some(slab)
    }

    /// Detach the whole list. The slabs stay linked but no longer count as
    /// parked.
    pub(crate) fn take(&mut self) -> CpuPartial {
        let list = core::mem::replace(self, CpuPartial::new());
        let mut cursor = list.head;
        while let Some(slab) = NonNull::new(cursor) {
            let s = unsafe { slab.as_ref() };
            s.set_parked(None);
            cursor = s.next_partial();
        }
        list
    }
}

/// Keeps the slab read by a fast path alive until dropped.
pub(crate) struct ReadPin<'a>(&'a AtomicUsize);

impl Drop for ReadPin<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State of one cache on one CPU.
pub(crate) struct CpuSlab {
    cpu: usize,
    word: AtomicU64,
    active: AtomicPtr<Slab>,
    readers: AtomicUsize,
    tid_step: u32,
    /// Local lock of the slow paths; guards the partial list.
    pub(crate) lock: SpinNoIrq<CpuPartial>,
    pub(crate) stats: CpuStats,
}

impl CpuSlab {
    pub(crate) fn new(cpu: u32, tid_step: u32) -> Self {
        Self {
            cpu: cpu as usize,
            word: AtomicU64::new(pack(NO_OBJECT, cpu)),
            active: AtomicPtr::new(ptr::null_mut()),
            readers: AtomicUsize::new(0),
            tid_step,
            lock: SpinNoIrq::new(CpuPartial::new()),
            stats: CpuStats::new(),
        }
    }

    pub(crate) fn cpu(&self) -> usize {
        self.cpu
    }

    /// Enter a fast path. Must be taken before the word and the active
    /// slab are read.
    #[inline]
    pub(crate) fn pin(&self) -> ReadPin<'_> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        ReadPin(&self.readers)
    }

    /// `(freelist index, tid)`.
    #[inline]
    pub(crate) fn load_word(&self) -> (u32, u32) {
        unpack(self.word.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn active(&self) -> *mut Slab {
        self.active.load(Ordering::SeqCst)
    }

    /// Replace `{idx, tid}` by `{new_idx, next tid}`.
    #[inline]
    pub(crate) fn cmpxchg_word(&self, idx: u32, tid: u32, new_idx: u32) -> bool {
        self.word
            .compare_exchange(
                pack(idx, tid),
                pack(new_idx, tid.wrapping_add(self.tid_step)),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Set the private freelist and advance the tid.
    fn publish(&self, idx: u32) -> u32 {
        let step = self.tid_step;
        let prev = self
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                let (_, tid) = unpack(w);
                Some(pack(idx, tid.wrapping_add(step)))
            })
            .unwrap_or_else(|w| w);
        unpack(prev).0
    }

    /// Take the active slab away from the fast paths. Returns the slab and
    /// what was left of the private freelist. Caller holds the local lock.
    pub(crate) fn detach(&self) -> (Option<NonNull<Slab>>, u32) {
        let slab = self.active.swap(ptr::null_mut(), Ordering::SeqCst);
        let idx = self.publish(NO_OBJECT);
        while self.readers.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
        (NonNull::new(slab), idx)
    }

    /// Make `slab` active with private freelist `idx`. Caller holds the
    /// local lock and the CPU has no active slab.
    pub(crate) fn install(&self, slab: NonNull<Slab>, idx: u32) {
        debug_assert!(self.active().is_null());
        self.publish(idx);
        self.active.store(slab.as_ptr(), Ordering::SeqCst);
    }
}
