//! Slab descriptor.
//!
//! A slab describes one block of `2^order` pages carved into equal-size
//! objects. The descriptor lives outside the block so that the whole block
//! is available to objects; the page provider maps block addresses back to
//! descriptors.
//!
//! The mutable per-slab state is a single 64-bit word updated by
//! compare-and-swap:
//!
//! ```text
//!  63     48 47      46..32      31..16     15..0
//! [ unused ][frozen][ objects ][  inuse  ][ freelist head index ]
//! ```

use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::layout::CacheLayout;
use super::slab_cache::SlabCache;

/// Freelist head value meaning "no free object".
pub(crate) const NO_FREE: u16 = u16::MAX;

const INUSE_SHIFT: u32 = 16;
const OBJECTS_SHIFT: u32 = 32;
const FROZEN_BIT: u64 = 1 << 47;
const NOT_PARKED: u32 = u32::MAX;

/// Decoded form of the slab state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabState {
    pub freelist: u16,
    pub inuse: u16,
    pub objects: u16,
    pub frozen: bool,
}

impl SlabState {
    #[inline]
    pub(crate) fn pack(self) -> u64 {
        let mut word = self.freelist as u64
            | (self.inuse as u64) << INUSE_SHIFT
            | (self.objects as u64 & 0x7fff) << OBJECTS_SHIFT;
        if self.frozen {
            word |= FROZEN_BIT;
        }
        word
    }

    #[inline]
    pub(crate) fn unpack(word: u64) -> Self {
        Self {
            freelist: word as u16,
            inuse: (word >> INUSE_SHIFT) as u16,
            objects: ((word >> OBJECTS_SHIFT) & 0x7fff) as u16,
            frozen: word & FROZEN_BIT != 0,
        }
    }

    #[inline]
    pub(crate) fn has_free(&self) -> bool {
        self.freelist != NO_FREE
    }
}

/// Which node list a slab is linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ListKind {
    None = 0,
    Partial = 1,
    Full = 2,
}

impl ListKind {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ListKind::Partial,
            2 => ListKind::Full,
            _ => ListKind::None,
        }
    }
}

/// Descriptor of one slab.
pub struct Slab {
    base: usize,
    order: u32,
    node: usize,
    stride: usize,
    red_left_pad: usize,
    objects: usize,
    cache: *const SlabCache,
    state: AtomicU64,
    // Node list linkage, guarded by the node list lock.
    prev: AtomicPtr<Slab>,
    next: AtomicPtr<Slab>,
    list: AtomicU8,
    // CPU partial list linkage and owner, guarded by the owning CPU's lock.
    next_partial: AtomicPtr<Slab>,
    parked: AtomicU32,
}

// SAFETY: every mutable field is atomic; the raw cache pointer refers to a
// cache that outlives all of its slabs.
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Allocate a descriptor for a fresh block. The slab starts frozen
    /// with every object counted as in use, so the creator owns all of them.
    pub(crate) fn create(
        cache: *const SlabCache,
        layout: &CacheLayout,
        base: usize,
        order: u32,
        node: usize,
        objects: usize,
    ) -> NonNull<Slab> {
        let slab = Box::new(Slab {
            base,
            order,
            node,
            stride: layout.size,
            red_left_pad: layout.red_left_pad,
            objects,
            cache,
            state: AtomicU64::new(
                SlabState {
                    freelist: NO_FREE,
                    inuse: objects as u16,
                    objects: objects as u16,
                    frozen: true,
                }
                .pack(),
            ),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            list: AtomicU8::new(ListKind::None as u8),
            next_partial: AtomicPtr::new(ptr::null_mut()),
            parked: AtomicU32::new(NOT_PARKED),
        });
        NonNull::from(Box::leak(slab))
    }

    /// Release a descriptor created by [`Slab::create`].
    ///
    /// # Safety
    /// `slab` must not be reachable from any list, CPU or page mapping.
    pub(crate) unsafe fn destroy(slab: NonNull<Slab>) {
        drop(Box::from_raw(slab.as_ptr()));
    }

    /// First byte of the backing block.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Order of the backing block.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Memory node of the backing block.
    pub fn node(&self) -> usize {
        self.node
    }

    /// Object capacity.
    pub fn objects(&self) -> usize {
        self.objects
    }

    /// Objects not on the slab's own freelist.
    pub fn inuse(&self) -> usize {
        self.load_state().inuse as usize
    }

    /// Whether a CPU owns the slab.
    pub fn is_frozen(&self) -> bool {
        self.load_state().frozen
    }

    pub(crate) fn cache_ptr(&self) -> *const SlabCache {
        self.cache
    }

    /// Address of object `idx`.
    #[inline]
    pub(crate) fn object_addr(&self, idx: usize) -> usize {
        self.base + idx * self.stride + self.red_left_pad
    }

    /// Index of the object starting at `addr`, if `addr` is an object
    /// boundary of this slab.
    #[inline]
    pub(crate) fn index_of(&self, addr: usize) -> Option<usize> {
        let first = self.base + self.red_left_pad;
        if addr < first {
            return None;
        }
        let off = addr - first;
        if off % self.stride != 0 {
            return None;
        }
        let idx = off / self.stride;
        (idx < self.objects).then_some(idx)
    }

    /// Index of the slot covering `addr`, object boundary or not.
    pub(crate) fn slot_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let idx = (addr - self.base) / self.stride;
        (idx < self.objects).then_some(idx)
    }

    /// Address of the freelist head encoded as an index (0 for none).
    #[inline]
    pub(crate) fn head_addr(&self, head: u16) -> usize {
        if head == NO_FREE {
            0
        } else {
            self.object_addr(head as usize)
        }
    }

    /// Head index for an object address (0 means none).
    #[inline]
    pub(crate) fn head_index(&self, addr: usize) -> u16 {
        if addr == 0 {
            NO_FREE
        } else {
            self.index_of(addr).map_or(NO_FREE, |i| i as u16)
        }
    }

    #[inline]
    pub(crate) fn load_state(&self) -> SlabState {
        SlabState::unpack(self.state.load(Ordering::Acquire))
    }

    /// Replace the state word if it still equals `old`.
    #[inline]
    pub(crate) fn cmpxchg_state(&self, old: SlabState, new: SlabState) -> bool {
        self.state
            .compare_exchange(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Overwrite the state word. Only valid while no other context can
    /// reach the slab.
    pub(crate) fn store_state(&self, state: SlabState) {
        self.state.store(state.pack(), Ordering::Release);
    }

    pub(crate) fn list(&self) -> ListKind {
        ListKind::from_u8(self.list.load(Ordering::Relaxed))
    }

    pub(crate) fn set_list(&self, kind: ListKind) {
        self.list.store(kind as u8, Ordering::Relaxed);
    }

    pub(crate) fn prev(&self) -> *mut Slab {
        self.prev.load(Ordering::Relaxed)
    }

    pub(crate) fn next(&self) -> *mut Slab {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prev(&self, prev: *mut Slab) {
        self.prev.store(prev, Ordering::Relaxed);
    }

    pub(crate) fn set_next(&self, next: *mut Slab) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn next_partial(&self) -> *mut Slab {
        self.next_partial.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_partial(&self, next: *mut Slab) {
        self.next_partial.store(next, Ordering::Relaxed);
    }

    /// CPU whose partial list holds the slab.
    pub(crate) fn parked_on(&self) -> Option<usize> {
        match self.parked.load(Ordering::Acquire) {
            NOT_PARKED => None,
            cpu => Some(cpu as usize),
        }
    }

    pub(crate) fn set_parked(&self, cpu: Option<usize>) {
        let value = cpu.map_or(NOT_PARKED, |c| c as u32);
        self.parked.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_packing() {
        let state = SlabState {
            freelist: 17,
            inuse: 300,
            objects: 32767,
            frozen: true,
        };
        assert_eq!(SlabState::unpack(state.pack()), state);

        let empty = SlabState {
            freelist: NO_FREE,
            inuse: 0,
            objects: 1,
            frozen: false,
        };
        let back = SlabState::unpack(empty.pack());
        assert!(!back.has_free());
        assert!(!back.frozen);
        assert_eq!(back.objects, 1);
    }
}
