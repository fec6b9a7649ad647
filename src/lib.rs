//! SLUB-style slab object allocator.
//!
//! This crate implements an object allocator that serves fixed-size objects
//! out of multi-page slabs, featuring:
//! - A per-CPU lock-free fast path validated by a `{freelist, tid}` word
//! - Per-CPU partial lists and per-node partial lists of slabs
//! - Frozen slabs that stay off every shared list while a CPU owns them
//! - Hardened and optionally randomized intra-slab freelists
//! - Redzones, poisoning and allocation/free tracking for debug caches
//! - A power-of-two family of generalized sized caches (`kmalloc`)

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use core::fmt;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Page size of a [`HeapPageProvider`] unless given explicitly.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The error type used for allocation and cache management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or alignment. (e.g. unaligned)
    InvalidParam,
    /// No enough memory to allocate.
    NoMemory,
    /// Deallocate an address that is not a live object of the cache.
    NotAllocated,
    /// The object does not fit into a slab of the largest supported order.
    ObjectTooLarge,
    /// The cache still holds live objects and cannot be destroyed.
    CacheBusy {
        /// Number of objects still handed out.
        live_objects: usize,
    },
    /// Unknown letter in the debug option stream.
    InvalidDebugOption(char),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidParam => write!(f, "invalid size or alignment"),
            AllocError::NoMemory => write!(f, "out of memory"),
            AllocError::NotAllocated => write!(f, "address is not an allocated object"),
            AllocError::ObjectTooLarge => {
                write!(f, "object does not fit into a slab of the maximum order")
            }
            AllocError::CacheBusy { live_objects } => {
                write!(f, "cache still has {} live objects", live_objects)
            }
            AllocError::InvalidDebugOption(c) => write!(f, "invalid debug option '{}'", c),
        }
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

#[inline]
const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Smallest order `o` such that `page_size << o >= size`.
#[inline]
pub(crate) fn get_order(size: usize, page_size: usize) -> u32 {
    let pages = size.div_ceil(page_size).max(1);
    pages.next_power_of_two().trailing_zeros()
}

pub mod allocator;
pub mod debug;
pub mod flags;
pub mod kmalloc;
pub mod page_provider;
pub mod platform;
pub mod rcu;
pub mod slab;
pub mod stats;

pub use allocator::{SlabAllocator, SlabConfig};
pub use debug::{CorruptionKind, CorruptionReport, DebugOptions, Track};
pub use flags::{CacheFlags, GfpFlags};
pub use kmalloc::{KmallocCaches, SizeClass};
pub use page_provider::{HeapPageProvider, PageBlock, PageProvider};
pub use platform::{SlabPlatform, UniprocessorPlatform};
pub use rcu::{RcuDomain, RcuReadGuard};
pub use slab::{Constructor, Slab, SlabCache};
pub use stats::{CacheInfo, StatItem};
