//! Statistics for slab caches.
//!
//! Structural counters ([`CacheInfo`]) are always maintained. Per-CPU event
//! counters are only collected with the `tracking` feature.

use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

/// Per-CPU event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatItem {
    /// Allocation served from the per-CPU freelist.
    AllocFastpath,
    /// Allocation that entered the slow path.
    AllocSlowpath,
    /// Free spliced onto the per-CPU freelist.
    FreeFastpath,
    /// Free applied to the slab directly.
    FreeSlowpath,
    /// Free into a slab owned by some CPU.
    FreeFrozen,
    /// Free moved a full slab onto a node partial list.
    FreeAddPartial,
    /// Free emptied a slab and took it off a node list.
    FreeRemovePartial,
    /// Slow path recovered remote frees from the active slab.
    AllocRefill,
    /// Active slab was dropped because it sits on the wrong node.
    AllocNodeMismatch,
    /// Slab taken from a node partial list.
    AllocFromPartial,
    /// Fresh slab taken from the page provider.
    AllocSlab,
    /// Slab handed back to the page provider.
    FreeSlab,
    /// Active slab deactivated.
    DeactivateSlab,
    /// Active slab replaced by the head of the CPU partial list.
    CpuPartialAlloc,
    /// Slab pushed onto a CPU partial list by a free.
    CpuPartialFree,
    /// Slab moved from a node list onto a CPU partial list.
    CpuPartialNode,
    /// CPU partial list drained to the node lists.
    CpuPartialDrain,
    /// Per-CPU `{freelist, tid}` compare-and-swap lost a race.
    CmpxchgCpuFail,
    /// Slab `{freelist, counters}` compare-and-swap lost a race.
    CmpxchgSlabFail,
    /// Fresh slab fell back to the cache's minimum order.
    OrderFallback,
}

/// Number of distinct [`StatItem`]s.
pub const NR_STAT_ITEMS: usize = StatItem::OrderFallback as usize + 1;

/// One CPU's event counters.
pub(crate) struct CpuStats {
    #[cfg_attr(not(feature = "tracking"), allow(dead_code))]
    counters: [AtomicU64; NR_STAT_ITEMS],
}

impl CpuStats {
    pub(crate) const fn new() -> Self {
        Self {
            counters: [const { AtomicU64::new(0) }; NR_STAT_ITEMS],
        }
    }

    #[inline]
    pub(crate) fn inc(&self, _item: StatItem) {
        #[cfg(feature = "tracking")]
        self.counters[_item as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self, item: StatItem) -> u64 {
        self.counters[item as usize].load(Ordering::Relaxed)
    }
}

/// Snapshot of a cache's shape and population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    /// Cache name.
    pub name: String,
    /// Payload size requested at creation.
    pub object_size: usize,
    /// Distance between consecutive objects in a slab.
    pub stride: usize,
    /// Slab order used for fresh slabs.
    pub order: u32,
    /// Objects in a slab of `order`.
    pub objects_per_slab: usize,
    /// Slabs currently owned by the cache.
    pub nr_slabs: usize,
    /// Slabs on node partial lists.
    pub nr_partial: usize,
    /// Object capacity of all owned slabs.
    pub total_objects: usize,
    /// Per-node retention floor.
    pub min_partial: usize,
    /// Per-CPU partial free-object cap.
    pub cpu_partial: usize,
}
