//! Debug metadata: redzones, poisoning and corruption reports.
//!
//! Only caches created with one of [`CacheFlags::DEBUG_FLAGS`] pay for
//! any of this. Such caches route every allocation and free through the
//! node list lock so that each object can be checked when it changes
//! hands.

mod options;
mod track;

use alloc::string::String;
use core::fmt;

pub use options::{DebugOptions, DebugSelection, DEFAULT_DEBUG_FLAGS};
pub use track::Track;
pub(crate) use track::{get_track, init_tracks, set_track, TrackItem};

use crate::flags::CacheFlags;
use crate::slab::CacheLayout;

/// Redzone byte of a free object.
pub const RED_INACTIVE: u8 = 0xbb;
/// Redzone byte of an allocated object.
pub const RED_ACTIVE: u8 = 0xcc;
/// Filler for padding and unused metadata.
pub const POISON_INUSE: u8 = 0x5a;
/// Payload byte of a free object.
pub const POISON_FREE: u8 = 0x6b;
/// Last payload byte of a free object.
pub const POISON_END: u8 = 0xa5;

/// What a consistency check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Bytes in front of the object were overwritten.
    LeftRedzone,
    /// Bytes behind the payload were overwritten.
    RightRedzone,
    /// A free object's payload was written.
    Poison,
    /// Slack at the end of a slot was written.
    Padding,
    /// A freelist pointer does not lead to an object of the slab.
    FreePointer,
    /// The object is already free.
    DoubleFree,
    /// The address is not an object boundary of any slab.
    InvalidAddress,
    /// The object belongs to another cache.
    WrongCache,
    /// Slab counters disagree with its freelist.
    SlabCounters,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CorruptionKind::LeftRedzone => "left redzone overwritten",
            CorruptionKind::RightRedzone => "right redzone overwritten",
            CorruptionKind::Poison => "poison overwritten",
            CorruptionKind::Padding => "padding overwritten",
            CorruptionKind::FreePointer => "freelist pointer corrupt",
            CorruptionKind::DoubleFree => "object already free",
            CorruptionKind::InvalidAddress => "invalid object address",
            CorruptionKind::WrongCache => "object from wrong cache",
            CorruptionKind::SlabCounters => "slab counters inconsistent",
        };
        f.write_str(s)
    }
}

/// One finding of the debug checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    /// What was found.
    pub kind: CorruptionKind,
    /// Name of the cache doing the check.
    pub cache: String,
    /// Object (or slab base, for slab-wide findings) being checked.
    pub object: usize,
    /// First offending address.
    pub addr: usize,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} at {:#x} (object {:#x})",
            self.cache, self.kind, self.addr, self.object
        )
    }
}

/// Fill `[start, end)` with `val`.
///
/// # Safety
/// The range must be writable.
unsafe fn fill(start: usize, end: usize, val: u8) {
    if end > start {
        core::ptr::write_bytes(start as *mut u8, val, end - start);
    }
}

/// Check `[start, end)` against `val`. On mismatch the first offending
/// address is returned and the range is restored.
///
/// # Safety
/// The range must be readable and writable.
unsafe fn check_bytes(start: usize, end: usize, val: u8) -> Option<usize> {
    if end <= start {
        return None;
    }
    let bytes = core::slice::from_raw_parts(start as *const u8, end - start);
    let bad = bytes.iter().position(|&b| b != val)?;
    fill(start, end, val);
    Some(start + bad)
}

/// Write the redzones of `object` with `val` and, for a free object of a
/// poisoned cache, the poison pattern.
///
/// # Safety
/// `object` must be an object of a cache with `layout`.
pub(crate) unsafe fn init_object(layout: &CacheLayout, object: usize, val: u8) {
    if layout.flags.contains(CacheFlags::RED_ZONE) {
        fill(object - layout.red_left_pad, object, val);
    }
    if layout.poison_object && val == RED_INACTIVE {
        fill(object, object + layout.object_size - 1, POISON_FREE);
        fill(object + layout.object_size - 1, object + layout.object_size, POISON_END);
    }
    if layout.flags.contains(CacheFlags::RED_ZONE) {
        fill(object + layout.object_size, object + layout.inuse, val);
    }
}

/// Fill the slack behind the metadata of `object`.
///
/// # Safety
/// `object` must be an object of a cache with `layout`.
pub(crate) unsafe fn init_padding(layout: &CacheLayout, object: usize) {
    if layout.flags.contains(CacheFlags::POISON) {
        let end = object - layout.red_left_pad + layout.size;
        fill(object + layout.metadata_end(), end, POISON_INUSE);
    }
}

/// Verify the redzones, poison and padding of `object`, expecting the
/// redzone byte `val`. Each finding is passed to `report` and the damaged
/// bytes are restored. Returns whether the object was intact.
///
/// # Safety
/// `object` must be an object of a cache with `layout`.
pub(crate) unsafe fn check_object(
    layout: &CacheLayout,
    object: usize,
    val: u8,
    report: &mut dyn FnMut(CorruptionKind, usize),
) -> bool {
    let mut ok = true;
    if layout.flags.contains(CacheFlags::RED_ZONE) {
        if let Some(addr) = check_bytes(object - layout.red_left_pad, object, val) {
            report(CorruptionKind::LeftRedzone, addr);
            ok = false;
        }
        if let Some(addr) = check_bytes(object + layout.object_size, object + layout.inuse, val) {
            report(CorruptionKind::RightRedzone, addr);
            ok = false;
        }
    }
    if layout.poison_object && val == RED_INACTIVE {
        let last = object + layout.object_size - 1;
        let bad = check_bytes(object, last, POISON_FREE)
            .or_else(|| check_bytes(last, last + 1, POISON_END));
        if let Some(addr) = bad {
            report(CorruptionKind::Poison, addr);
            ok = false;
        }
    }
    if layout.flags.contains(CacheFlags::POISON) {
        let end = object - layout.red_left_pad + layout.size;
        if let Some(addr) = check_bytes(object + layout.metadata_end(), end, POISON_INUSE) {
            report(CorruptionKind::Padding, addr);
            ok = false;
        }
    }
    ok
}
