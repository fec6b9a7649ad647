//! Object allocation.
//!
//! The fast path pops the CPU's private freelist with a single
//! compare-and-swap on the `{freelist, tid}` word. The slow path refills
//! it, in order, from remote frees into the active slab, from the CPU
//! partial list, from the local node, from remote nodes and finally from a
//! fresh slab.

use alloc::vec::Vec;
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[cfg(feature = "log")]
use log::{debug, info, warn};

use super::cpu_slab::{CpuPartial, CpuSlab, NO_OBJECT};
use super::freelist::ShuffledIndices;
use super::page::{Slab, SlabState, NO_FREE};
use super::slab_cache::SlabCache;
use crate::debug::{
    check_object, init_object, init_padding, init_tracks, set_track, CorruptionKind, Track,
    TrackItem, RED_ACTIVE, RED_INACTIVE,
};
use crate::flags::{CacheFlags, GfpFlags};
use crate::stats::StatItem;
use crate::{AllocError, AllocResult};

#[inline]
fn word_index(head: u16) -> u32 {
    if head == NO_FREE {
        NO_OBJECT
    } else {
        head as u32
    }
}

impl SlabCache {
    /// Allocate an object.
    #[track_caller]
    pub fn alloc(&self, gfp: GfpFlags) -> AllocResult<NonNull<u8>> {
        self.alloc_node(gfp, None)
    }

    /// Allocate an object, preferably from memory node `node`.
    #[track_caller]
    pub fn alloc_node(&self, gfp: GfpFlags, node: Option<usize>) -> AllocResult<NonNull<u8>> {
        if self.flags.contains(CacheFlags::FAILSLAB)
            && !gfp.contains(GfpFlags::NOFAIL)
            && self.platform.should_fail_alloc(self.name())
        {
            return Err(AllocError::NoMemory);
        }
        let node = node.filter(|&n| n < self.nodes.len());
        let object = if self.debug {
            self.alloc_debug(gfp, node, Location::caller())?
        } else {
            self.alloc_fast(gfp, node)?
        };
        if gfp.contains(GfpFlags::ZERO) {
            unsafe { core::ptr::write_bytes(object as *mut u8, 0, self.layout.object_size) };
        }
        NonNull::new(object as *mut u8).ok_or(AllocError::NoMemory)
    }

    /// Allocate up to `count` objects into `out`. Either all of them are
    /// allocated or none; returns the number appended.
    #[track_caller]
    pub fn alloc_bulk(&self, gfp: GfpFlags, count: usize, out: &mut Vec<NonNull<u8>>) -> usize {
        let start = out.len();
        out.reserve(count);
        for _ in 0..count {
            match self.alloc(gfp) {
                Ok(object) => out.push(object),
                Err(_) => {
                    let _ = self.free_bulk(&out[start..]);
                    out.truncate(start);
                    return 0;
                }
            }
        }
        count
    }

    fn alloc_fast(&self, gfp: GfpFlags, node: Option<usize>) -> AllocResult<usize> {
        loop {
            let cpu = self.current_cpu();
            let c = &self.cpus[cpu];
            {
                let pin = c.pin();
                let (idx, tid) = c.load_word();
                let slab = c.active();
                if idx != NO_OBJECT && !slab.is_null() {
                    let s = unsafe { &*slab };
                    if node.map_or(true, |n| s.node() == n) && (idx as usize) < s.objects() {
                        let object = s.object_addr(idx as usize);
                        let fp = object + self.layout.offset;
                        let next = unsafe { self.codec.read(fp) };
                        let link = Self::link_index(s, next);
                        let next_idx = link.map_or(NO_OBJECT, word_index);
                        if c.cmpxchg_word(idx, tid, next_idx) {
                            drop(pin);
                            c.stats.inc(StatItem::AllocFastpath);
                            if link.is_none() {
                                self.report(CorruptionKind::FreePointer, object, fp);
                            }
                            return Ok(object);
                        }
                        c.stats.inc(StatItem::CmpxchgCpuFail);
                        continue;
                    }
                }
            }
            if let Some(object) = self.alloc_slow(cpu, gfp, node)? {
                return Ok(object);
            }
        }
    }

    /// Take the slab's own freelist. A slab found without free objects is
    /// unfrozen on the spot, leaving it full and on no list.
    fn get_freelist(&self, slab: &Slab) -> u16 {
        loop {
            let old = slab.load_state();
            let new = SlabState {
                freelist: NO_FREE,
                inuse: old.objects,
                objects: old.objects,
                frozen: old.has_free(),
            };
            if slab.cmpxchg_state(old, new) {
                return old.freelist;
            }
            self.stat_inc(StatItem::CmpxchgSlabFail);
        }
    }

    /// Pop the first object of the chain at `head` and make the rest the
    /// CPU's private freelist with `slab` active.
    fn install(&self, c: &CpuSlab, slab: NonNull<Slab>, head: u16) -> usize {
        let s = unsafe { slab.as_ref() };
        let object = s.head_addr(head);
        let fp = object + self.layout.offset;
        let next = unsafe { self.codec.read(fp) };
        let next_idx = match Self::link_index(s, next) {
            Some(link) => word_index(link),
            None => {
                self.report(CorruptionKind::FreePointer, object, fp);
                NO_OBJECT
            }
        };
        c.install(slab, next_idx);
        object
    }

    /// Returns `None` when the fast path should simply be retried.
    fn alloc_slow(
        &self,
        cpu: usize,
        gfp: GfpFlags,
        node: Option<usize>,
    ) -> AllocResult<Option<usize>> {
        let c = &self.cpus[cpu];
        c.stats.inc(StatItem::AllocSlowpath);
        let mut partial = c.lock.lock();

        let (active, remaining) = c.detach();
        if let Some(slab) = active {
            let s = unsafe { slab.as_ref() };
            if node.is_some_and(|n| s.node() != n) {
                c.stats.inc(StatItem::AllocNodeMismatch);
                self.deactivate_slab(slab, remaining);
            } else if remaining != NO_OBJECT {
                // Frees on this CPU refilled the list while we were on our
                // way here.
                c.install(slab, remaining);
                return Ok(None);
            } else {
                let head = self.get_freelist(s);
                if head != NO_FREE {
                    c.stats.inc(StatItem::AllocRefill);
                    return Ok(Some(self.install(c, slab, head)));
                }
                c.stats.inc(StatItem::DeactivateSlab);
            }
        }

        while let Some(slab) = partial.head() {
            let s = unsafe { slab.as_ref() };
            if node.is_some_and(|n| s.node() != n) {
                break;
            }
            partial.pop();
            c.stats.inc(StatItem::CpuPartialAlloc);
            let head = self.get_freelist(s);
            if head != NO_FREE {
                return Ok(Some(self.install(c, slab, head)));
            }
        }

        let local = node.unwrap_or_else(|| self.node_of_cpu(cpu));
        // A request naming a node only takes partial slabs of that node.
        let mut found = self.get_partial_node(local, c, &mut partial);
        if found.is_none() && node.is_none() {
            found = self.get_any_partial(local, c, &mut partial);
        }
        if let Some((slab, head)) = found {
            return Ok(Some(self.install(c, slab, head)));
        }

        let (slab, head) = self.new_slab(Some(local), gfp)?;
        c.stats.inc(StatItem::AllocSlab);
        Ok(Some(self.install(c, slab, head)))
    }

    /// Take slabs off the partial list of `node`. The first is returned
    /// frozen with its freelist; more are parked on the CPU partial list
    /// until about half of its cap is reached.
    fn get_partial_node(
        &self,
        node: usize,
        c: &CpuSlab,
        partial: &mut CpuPartial,
    ) -> Option<(NonNull<Slab>, u16)> {
        let pool = &self.nodes[node];
        if pool.nr_partial() == 0 {
            return None;
        }
        let limit = self.cpu_partial();
        let mut lists = pool.lists.lock();
        let mut taken = None;
        let mut available = 0;

        let mut cursor = lists.partial.head();
        while let Some(slab) = NonNull::new(cursor) {
            let s = unsafe { slab.as_ref() };
            cursor = s.next();

            let Some(free) = self.freeze(s, taken.is_none()) else {
                continue;
            };
            pool.remove_partial(&mut lists, slab);
            available += free.1;
            if taken.is_none() {
                c.stats.inc(StatItem::AllocFromPartial);
                taken = Some((slab, free.0));
            } else {
                c.stats.inc(StatItem::CpuPartialNode);
                partial.push(slab, c.cpu());
            }
            if limit == 0 || available > limit / 2 {
                break;
            }
        }
        taken
    }

    /// Freeze a slab taken off a node list, optionally taking its
    /// freelist. Returns `(freelist head, free objects)`, or `None` if the
    /// slab has nothing to offer.
    fn freeze(&self, slab: &Slab, take_freelist: bool) -> Option<(u16, usize)> {
        loop {
            let old = slab.load_state();
            if !old.has_free() {
                return None;
            }
            let mut new = old;
            new.frozen = true;
            if take_freelist {
                new.freelist = NO_FREE;
                new.inuse = old.objects;
            }
            if slab.cmpxchg_state(old, new) {
                return Some((old.freelist, (old.objects - old.inuse) as usize));
            }
            self.stat_inc(StatItem::CmpxchgSlabFail);
        }
    }

    fn remote_allowed(&self) -> bool {
        let ratio = self.remote_defrag_ratio();
        ratio != 0 && (self.rng.lock().below(1000) as usize) < ratio
    }

    fn get_any_partial(
        &self,
        local: usize,
        c: &CpuSlab,
        partial: &mut CpuPartial,
    ) -> Option<(NonNull<Slab>, u16)> {
        if self.nodes.len() == 1 || !self.remote_allowed() {
            return None;
        }
        self.node_fallback[local]
            .iter()
            .find_map(|&n| self.get_partial_node(n, c, partial))
    }

    /// Allocate and format a fresh slab. It is returned frozen, with every
    /// object free and counted as in use.
    pub(super) fn new_slab(
        &self,
        node: Option<usize>,
        gfp: GfpFlags,
    ) -> AllocResult<(NonNull<Slab>, u16)> {
        loop {
            match self.allocate_slab(node, gfp) {
                Ok(slab) => return Ok(slab),
                Err(_) if gfp.contains(GfpFlags::NOFAIL) => core::hint::spin_loop(),
                Err(err) => {
                    self.oom_warning(gfp, node);
                    return Err(err);
                }
            }
        }
    }

    fn oom_warning(&self, gfp: GfpFlags, node: Option<usize>) {
        if gfp.contains(GfpFlags::NOWARN)
            || self.flags.contains(CacheFlags::NO_WARN)
            || self.oom_warned.swap(true, Ordering::Relaxed)
        {
            return;
        }
        let info = self.info();
        warn!(
            "{}: unable to allocate slab (order {}, min order {}, node {:?}): {} slabs, {} objects",
            info.name, info.order, self.layout.min_order, node, info.nr_slabs, info.total_objects
        );
    }

    fn allocate_slab(
        &self,
        node: Option<usize>,
        gfp: GfpFlags,
    ) -> AllocResult<(NonNull<Slab>, u16)> {
        let layout = &self.layout;
        let page_gfp = (gfp | self.gfp) - GfpFlags::ZERO;
        let mut order = layout.order;
        let block = if order > layout.min_order && !gfp.contains(GfpFlags::NORETRY) {
            match self
                .provider
                .alloc_pages(order, page_gfp | GfpFlags::NOWARN, node)
            {
                Ok(block) => block,
                Err(_) => {
                    order = layout.min_order;
                    self.stat_inc(StatItem::OrderFallback);
                    self.provider.alloc_pages(order, page_gfp, node)?
                }
            }
        } else {
            self.provider.alloc_pages(order, page_gfp, node)?
        };

        let node = block.node.min(self.nodes.len() - 1);
        let objects = layout.objects_for_order(order, self.page_size);
        let slab = Slab::create(self, layout, block.addr, order, node, objects);
        self.provider.set_slab(block.addr, Some(slab));
        let head = self.format_slab(unsafe { slab.as_ref() });
        self.nodes[node].inc_slabs(objects);
        debug!(
            "{}: new slab {:#x} order {} node {} objects {}",
            self.name(),
            block.addr,
            order,
            node,
            objects
        );
        Ok((slab, head))
    }

    /// Prepare every object of a fresh slab and link them into a freelist.
    fn format_slab(&self, slab: &Slab) -> u16 {
        let objects = slab.objects();
        let debug_layout = self.flags.intersects(CacheFlags::DEBUG_LAYOUT_FLAGS);
        for i in 0..objects {
            let object = slab.object_addr(i);
            if debug_layout {
                unsafe {
                    init_object(&self.layout, object, RED_INACTIVE);
                    init_padding(&self.layout, object);
                    if self.flags.contains(CacheFlags::STORE_USER) {
                        init_tracks(&self.layout, object);
                    }
                }
            }
            if let Some(ctor) = self.ctor {
                ctor(object as *mut u8);
            }
        }

        match &self.random_seq {
            Some(seq) => {
                let start = self.rng.lock().below(seq.len() as u64) as usize;
                self.link_objects(slab, ShuffledIndices::new(seq, start, objects))
            }
            None => self.link_objects(slab, 0..objects),
        }
    }

    fn link_objects(&self, slab: &Slab, indices: impl Iterator<Item = usize>) -> u16 {
        let mut head = NO_FREE;
        let mut prev = 0;
        for idx in indices {
            let object = slab.object_addr(idx);
            if prev == 0 {
                head = idx as u16;
            } else {
                unsafe { self.codec.write(prev + self.layout.offset, object) };
            }
            prev = object;
        }
        if prev != 0 {
            unsafe { self.codec.write(prev + self.layout.offset, 0) };
        }
        head
    }

    /// Allocation for debug caches: one object at a time, under the node
    /// list lock, with every object checked on the way out.
    fn alloc_debug(
        &self,
        gfp: GfpFlags,
        node: Option<usize>,
        caller: &'static Location<'static>,
    ) -> AllocResult<usize> {
        let cpu = self.current_cpu();
        self.cpus[cpu].stats.inc(StatItem::AllocSlowpath);
        let local = node.unwrap_or_else(|| self.node_of_cpu(cpu));

        if let Some(object) = self.alloc_single_from_partial(local, cpu, caller) {
            return Ok(object);
        }
        if node.is_none() && self.nodes.len() > 1 && self.remote_allowed() {
            for &n in self.node_fallback[local].iter() {
                if let Some(object) = self.alloc_single_from_partial(n, cpu, caller) {
                    return Ok(object);
                }
            }
        }

        let (slab, head) = self.new_slab(Some(local), gfp)?;
        self.cpus[cpu].stats.inc(StatItem::AllocSlab);
        Ok(self.alloc_single_from_new_slab(slab, head, cpu, caller))
    }

    fn alloc_single_from_partial(
        &self,
        node: usize,
        cpu: usize,
        caller: &'static Location<'static>,
    ) -> Option<usize> {
        let pool = &self.nodes[node];
        if pool.nr_partial() == 0 {
            return None;
        }
        let mut lists = pool.lists.lock();
        let mut cursor = lists.partial.head();
        while let Some(slab) = NonNull::new(cursor) {
            let s = unsafe { slab.as_ref() };
            cursor = s.next();
            if !self.check_slab(s) {
                // Retire the slab: nothing more is handed out of it.
                s.store_state(SlabState {
                    freelist: NO_FREE,
                    inuse: s.objects() as u16,
                    objects: s.objects() as u16,
                    frozen: false,
                });
                pool.remove_partial(&mut lists, slab);
                pool.add_full(&mut lists, slab);
                continue;
            }
            let state = s.load_state();
            if !state.has_free() {
                pool.remove_partial(&mut lists, slab);
                pool.add_full(&mut lists, slab);
                continue;
            }

            let object = s.head_addr(state.freelist);
            let new = SlabState {
                freelist: self.debug_next(s, object),
                inuse: state.inuse + 1,
                ..state
            };
            s.store_state(new);
            if !new.has_free() {
                pool.remove_partial(&mut lists, slab);
                pool.add_full(&mut lists, slab);
            }
            self.cpus[cpu].stats.inc(StatItem::AllocFromPartial);
            self.alloc_debug_processing(object, cpu, caller);
            return Some(object);
        }
        None
    }

    fn alloc_single_from_new_slab(
        &self,
        slab: NonNull<Slab>,
        head: u16,
        cpu: usize,
        caller: &'static Location<'static>,
    ) -> usize {
        let s = unsafe { slab.as_ref() };
        let pool = &self.nodes[s.node()];
        let object = s.head_addr(head);
        let mut lists = pool.lists.lock();
        let new = SlabState {
            freelist: self.debug_next(s, object),
            inuse: 1,
            objects: s.objects() as u16,
            frozen: false,
        };
        s.store_state(new);
        if new.has_free() {
            pool.add_partial(&mut lists, slab, false);
        } else {
            pool.add_full(&mut lists, slab);
        }
        self.alloc_debug_processing(object, cpu, caller);
        object
    }

    /// Next link of a debug-cache object, cutting the list on corruption.
    fn debug_next(&self, slab: &Slab, object: usize) -> u16 {
        let fp = object + self.layout.offset;
        let next = unsafe { self.codec.read(fp) };
        Self::link_index(slab, next).unwrap_or_else(|| {
            self.report(CorruptionKind::FreePointer, object, fp);
            NO_FREE
        })
    }

    fn alloc_debug_processing(&self, object: usize, cpu: usize, caller: &'static Location<'static>) {
        let layout = &self.layout;
        unsafe {
            check_object(layout, object, RED_INACTIVE, &mut |kind, addr| {
                self.report(kind, object, addr)
            });
            if self.flags.contains(CacheFlags::STORE_USER) {
                let track = Track::new(
                    caller,
                    cpu,
                    self.platform.current_pid(),
                    self.platform.now(),
                );
                set_track(layout, object, TrackItem::Alloc, track);
            }
            init_object(layout, object, RED_ACTIVE);
        }
        if self.flags.contains(CacheFlags::TRACE) {
            info!("{}: alloc {:#x} from {}", self.name(), object, caller);
        }
    }
}
