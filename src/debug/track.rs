//! Allocation and free track records.

use core::panic::Location;

use crate::slab::CacheLayout;

/// Which of the two records stored behind an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackItem {
    Alloc = 0,
    Free = 1,
}

/// Call site, CPU, task and time of the last allocation or free of an
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Track {
    /// Address of the caller's `Location` record (0 if never written).
    pub addr: usize,
    /// CPU the operation ran on.
    pub cpu: u32,
    /// Task identifier supplied by the platform.
    pub pid: u32,
    /// Platform timestamp.
    pub when: u64,
}

impl Track {
    pub(crate) fn new(caller: &'static Location<'static>, cpu: usize, pid: u32, when: u64) -> Self {
        Self {
            addr: caller as *const Location<'static> as usize,
            cpu: cpu as u32,
            pid,
            when,
        }
    }

    /// Whether the record was ever written.
    pub fn is_set(&self) -> bool {
        self.addr != 0
    }

    /// Source location of the call site.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        if self.addr == 0 {
            return None;
        }
        // SAFETY: `addr` was taken from a `&'static Location` in `Track::new`.
        Some(unsafe { &*(self.addr as *const Location<'static>) })
    }
}

fn track_addr(layout: &CacheLayout, object: usize, item: TrackItem) -> usize {
    let mut off = layout.inuse;
    if layout.offset >= layout.inuse {
        off += core::mem::size_of::<usize>();
    }
    object + off + item as usize * core::mem::size_of::<Track>()
}

/// Store a track record.
///
/// # Safety
/// `object` must be an object of a `STORE_USER` cache with `layout`.
pub(crate) unsafe fn set_track(layout: &CacheLayout, object: usize, item: TrackItem, track: Track) {
    (track_addr(layout, object, item) as *mut Track).write_unaligned(track);
}

/// Load a track record.
///
/// # Safety
/// `object` must be an object of a `STORE_USER` cache with `layout`.
pub(crate) unsafe fn get_track(layout: &CacheLayout, object: usize, item: TrackItem) -> Track {
    (track_addr(layout, object, item) as *const Track).read_unaligned()
}

/// Clear both records of a freshly formatted object.
///
/// # Safety
/// `object` must be an object of a `STORE_USER` cache with `layout`.
pub(crate) unsafe fn init_tracks(layout: &CacheLayout, object: usize) {
    set_track(layout, object, TrackItem::Alloc, Track::default());
    set_track(layout, object, TrackItem::Free, Track::default());
}
