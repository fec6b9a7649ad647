//! Per-node slab lists.
//!
//! Each memory node keeps a partial list of unfrozen slabs that still have
//! free objects and, for debug caches, a full list. Both are threaded
//! through the slab descriptors and guarded by the node's list lock.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

use super::page::{ListKind, Slab};

/// Doubly linked list of slab descriptors.
pub(crate) struct SlabList {
    head: *mut Slab,
    tail: *mut Slab,
    len: usize,
}

impl SlabList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn head(&self) -> *mut Slab {
        self.head
    }

    pub(crate) fn push_back(&mut self, slab: NonNull<Slab>) {
        let s = unsafe { slab.as_ref() };
        s.set_prev(self.tail);
        s.set_next(ptr::null_mut());

        if let Some(tail) = NonNull::new(self.tail) {
            unsafe { tail.as_ref() }.set_next(slab.as_ptr());
        } else {
            self.head = slab.as_ptr();
        }

        self.tail = slab.as_ptr();
        self.len += 1;
    }

    pub(crate) fn push_front(&mut self, slab: NonNull<Slab>) {
        let s = unsafe { slab.as_ref() };
        s.set_prev(ptr::null_mut());
        s.set_next(self.head);

        if let Some(head) = NonNull::new(self.head) {
            unsafe { head.as_ref() }.set_prev(slab.as_ptr());
        } else {
            self.tail = slab.as_ptr();
        }

        self.head = slab.as_ptr();
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, slab: NonNull<Slab>) {
        let s = unsafe { slab.as_ref() };
        let prev = s.prev();
        let next = s.next();

        if let Some(prev) = NonNull::new(prev) {
            unsafe { prev.as_ref() }.set_next(next);
        } else {
            self.head = next;
        }

        if let Some(next) = NonNull::new(next) {
            unsafe { next.as_ref() }.set_prev(prev);
        } else {
            self.tail = prev;
        }

        s.set_prev(ptr::null_mut());
        s.set_next(ptr::null_mut());
        self.len = self.len.saturating_sub(1);
    }

    /// Move every slab of `other` to the front of this list, keeping
    /// their order.
    pub(crate) fn splice_front(&mut self, other: &mut SlabList) {
        let Some(other_tail) = NonNull::new(other.tail) else {
            return;
        };
        unsafe { other_tail.as_ref() }.set_next(self.head);
        if let Some(head) = NonNull::new(self.head) {
            unsafe { head.as_ref() }.set_prev(other.tail);
        } else {
            self.tail = other.tail;
        }
        self.head = other.head;
        self.len += other.len;
        *other = SlabList::new();
    }

    /// Walk the list. The callback may unlink the slab it is handed.
    pub(crate) fn for_each(&self, mut f: impl FnMut(NonNull<Slab>)) {
        let mut cursor = self.head;
        while let Some(slab) = NonNull::new(cursor) {
            cursor = unsafe { slab.as_ref() }.next();
            f(slab);
        }
    }
}

/// Lists guarded by the node list lock.
pub(crate) struct NodeLists {
    pub partial: SlabList,
    pub full: SlabList,
}

// SAFETY: the raw list pointers refer to slab descriptors owned by the
// cache and are only followed while the list lock is held.
unsafe impl Send for NodeLists {}

/// Slab pool of one memory node.
pub(crate) struct NodePool {
    pub(crate) lists: SpinNoIrq<NodeLists>,
    nr_partial: AtomicUsize,
    nr_slabs: AtomicUsize,
    total_objects: AtomicUsize,
}

impl NodePool {
    pub(crate) const fn new() -> Self {
        Self {
            lists: SpinNoIrq::new(NodeLists {
                partial: SlabList::new(),
                full: SlabList::new(),
            }),
            nr_partial: AtomicUsize::new(0),
            nr_slabs: AtomicUsize::new(0),
            total_objects: AtomicUsize::new(0),
        }
    }

    /// Length of the partial list, readable without the lock.
    pub(crate) fn nr_partial(&self) -> usize {
        self.nr_partial.load(Ordering::Relaxed)
    }

    pub(crate) fn nr_slabs(&self) -> usize {
        self.nr_slabs.load(Ordering::Relaxed)
    }

    pub(crate) fn total_objects(&self) -> usize {
        self.total_objects.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_slabs(&self, objects: usize) {
        self.nr_slabs.fetch_add(1, Ordering::Relaxed);
        self.total_objects.fetch_add(objects, Ordering::Relaxed);
    }

    pub(crate) fn dec_slabs(&self, objects: usize) {
        self.nr_slabs.fetch_sub(1, Ordering::Relaxed);
        self.total_objects.fetch_sub(objects, Ordering::Relaxed);
    }

    /// Refresh the lockless partial count after direct list surgery.
    pub(crate) fn sync_partial(&self, lists: &NodeLists) {
        self.nr_partial.store(lists.partial.len(), Ordering::Relaxed);
    }

    pub(crate) fn add_partial(&self, lists: &mut NodeLists, slab: NonNull<Slab>, tail: bool) {
        unsafe { slab.as_ref() }.set_list(ListKind::Partial);
        if tail {
            lists.partial.push_back(slab);
        } else {
            lists.partial.push_front(slab);
        }
        self.sync_partial(lists);
    }

    pub(crate) fn remove_partial(&self, lists: &mut NodeLists, slab: NonNull<Slab>) {
        lists.partial.remove(slab);
        unsafe { slab.as_ref() }.set_list(ListKind::None);
        self.sync_partial(lists);
    }

    pub(crate) fn add_full(&self, lists: &mut NodeLists, slab: NonNull<Slab>) {
        unsafe { slab.as_ref() }.set_list(ListKind::Full);
        lists.full.push_back(slab);
    }

    /// Unlink `slab` from whichever list holds it.
    pub(crate) fn remove_any(&self, lists: &mut NodeLists, slab: NonNull<Slab>) {
        match unsafe { slab.as_ref() }.list() {
            ListKind::Partial => self.remove_partial(lists, slab),
            ListKind::Full => {
                lists.full.remove(slab);
                unsafe { slab.as_ref() }.set_list(ListKind::None);
            }
            ListKind::None => {}
        }
    }
}
