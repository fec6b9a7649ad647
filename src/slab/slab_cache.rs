//! Slab cache descriptor and lifecycle.
//!
//! A [`SlabCache`] serves objects of one size. Its storage is a three-tier
//! hierarchy: each CPU's active slab, each CPU's list of parked partial
//! slabs, and each node's partial list. The allocation and free paths live
//! in `alloc_path.rs` and `free_path.rs`; this file holds construction,
//! tunables, flushing, shrinking, destruction and diagnostics.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use kspin::{SpinNoIrq, SpinNoIrqGuard};

#[cfg(feature = "log")]
use log::{debug, error, info};

use super::cpu_slab::{CpuSlab, NO_OBJECT};
use super::freelist::{random_sequence, FreePointerCodec};
use super::layout::{CacheLayout, LayoutParams};
use super::node_pool::{NodeLists, NodePool, SlabList};
use super::page::{Slab, SlabState, NO_FREE};
use crate::allocator::SlabConfig;
use crate::debug::{get_track, CorruptionKind, CorruptionReport, Track, TrackItem};
use crate::flags::{CacheFlags, GfpFlags};
use crate::page_provider::PageProvider;
use crate::platform::{SlabPlatform, XorShift64};
use crate::rcu::RcuDomain;
use crate::stats::{CacheInfo, StatItem};
use crate::{AllocError, AllocResult};

/// Called once on every object of a freshly created slab.
pub type Constructor = fn(*mut u8);

/// Lower bound of the default `min_partial`.
pub const MIN_PARTIAL: usize = 5;
/// Upper bound of the default `min_partial`.
pub const MAX_PARTIAL: usize = 10;
/// Largest accepted `remote_defrag_ratio`.
pub const MAX_DEFRAG_RATIO: usize = 1000;
/// Shrinking sorts slabs with up to this many free objects.
const SHRINK_PROMOTE_MAX: usize = 32;

/// Services shared by every cache of one allocator.
#[derive(Clone)]
pub(crate) struct CacheEnv {
    pub provider: Arc<dyn PageProvider>,
    pub platform: Arc<dyn SlabPlatform>,
    pub rcu: Arc<RcuDomain>,
    pub config: SlabConfig,
}

/// An object cache.
pub struct SlabCache {
    name: String,
    pub(super) layout: CacheLayout,
    pub(super) flags: CacheFlags,
    pub(super) debug: bool,
    pub(super) ctor: Option<Constructor>,
    pub(super) codec: FreePointerCodec,
    pub(super) random_seq: Option<Box<[u16]>>,
    pub(super) cpus: Box<[CachePadded<CpuSlab>]>,
    pub(super) nodes: Box<[NodePool]>,
    /// Other nodes of each node, closest first.
    pub(super) node_fallback: Box<[Box<[usize]>]>,
    pub(super) gfp: GfpFlags,
    pub(super) page_size: usize,
    pub(super) provider: Arc<dyn PageProvider>,
    pub(super) platform: Arc<dyn SlabPlatform>,
    pub(super) rcu: Arc<RcuDomain>,
    pub(super) rng: SpinNoIrq<XorShift64>,
    min_partial: AtomicUsize,
    cpu_partial: AtomicUsize,
    cpu_partial_allowed: bool,
    remote_defrag_ratio: AtomicUsize,
    pub(super) oom_warned: AtomicBool,
    tainted: AtomicBool,
    reports: SpinNoIrq<Vec<CorruptionReport>>,
}

fn default_min_partial(size: usize) -> usize {
    (size.ilog2() as usize / 2).clamp(MIN_PARTIAL, MAX_PARTIAL)
}

fn default_cpu_partial(size: usize, page_size: usize) -> usize {
    if size >= page_size {
        2
    } else if size >= 1024 {
        6
    } else if size >= 256 {
        13
    } else {
        30
    }
}

impl SlabCache {
    pub(crate) fn create(
        name: &str,
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<Constructor>,
        env: &CacheEnv,
    ) -> AllocResult<Arc<SlabCache>> {
        let config = &env.config;
        let selection = config.debug.flags_for(name);
        let mut flags = flags | selection.flags;
        if config.randomize_freelist {
            flags |= CacheFlags::RANDOM_FREELIST;
        }

        let page_size = env.provider.page_size();
        let nr_cpus = env.platform.nr_cpus().max(1);
        let nr_nodes = env.platform.nr_nodes().max(1);
        let params = LayoutParams {
            page_size,
            max_order: config.max_order,
            provider_max_order: env.provider.max_order(),
            min_order: config.min_order,
            min_objects: config.min_objects,
            nr_cpus,
        };
        let mut layout = CacheLayout::calculate(object_size, align, flags, ctor.is_some(), &params)?;
        if selection.skip_if_order_grows && flags.intersects(CacheFlags::DEBUG_LAYOUT_FLAGS) {
            let plain_flags = flags - CacheFlags::DEBUG_LAYOUT_FLAGS;
            let plain =
                CacheLayout::calculate(object_size, align, plain_flags, ctor.is_some(), &params)?;
            if plain.order < layout.order {
                info!(
                    "{}: debug metadata would raise order {} -> {}, disabled",
                    name, plain.order, layout.order
                );
                flags = plain_flags;
                layout = plain;
            }
        }

        let debug = flags.is_debug();
        let cpu_partial_allowed = config.cpu_partial && !debug;
        let cpu_partial = if cpu_partial_allowed {
            default_cpu_partial(layout.size, page_size)
        } else {
            0
        };

        let tid_step = nr_cpus.next_power_of_two() as u32;
        let cpus = (0..nr_cpus)
            .map(|cpu| CachePadded::new(CpuSlab::new(cpu as u32, tid_step)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let nodes = (0..nr_nodes)
            .map(|_| NodePool::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let node_fallback = (0..nr_nodes)
            .map(|from| {
                let mut others: Vec<usize> = (0..nr_nodes).filter(|&n| n != from).collect();
                others.sort_by_key(|&to| (env.platform.node_distance(from, to), to));
                others.into_boxed_slice()
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut rng = XorShift64::new(env.platform.random_u64());
        let random_seq = flags
            .contains(CacheFlags::RANDOM_FREELIST)
            .then(|| random_sequence(layout.objects, &mut rng));
        let codec = FreePointerCodec::new(env.platform.random_u64() as usize, config.harden_freelist);

        info!(
            "create cache {}: object {} stride {} order {} objects {}",
            name, object_size, layout.size, layout.order, layout.objects
        );

        Ok(Arc::new(SlabCache {
            name: name.to_string(),
            layout,
            flags,
            debug,
            ctor,
            codec,
            random_seq,
            cpus,
            nodes,
            node_fallback,
            gfp: GfpFlags::from_cache_flags(flags),
            page_size,
            provider: env.provider.clone(),
            platform: env.platform.clone(),
            rcu: env.rcu.clone(),
            rng: SpinNoIrq::new(rng),
            min_partial: AtomicUsize::new(default_min_partial(layout.size)),
            cpu_partial: AtomicUsize::new(cpu_partial),
            cpu_partial_allowed,
            remote_defrag_ratio: AtomicUsize::new(MAX_DEFRAG_RATIO),
            oom_warned: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
            reports: SpinNoIrq::new(Vec::new()),
        }))
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload size requested at creation.
    pub fn object_size(&self) -> usize {
        self.layout.object_size
    }

    /// Object and slab geometry.
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Effective creation flags, including debug options.
    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// Partial slabs a node keeps before it starts freeing empty ones.
    pub fn min_partial(&self) -> usize {
        self.min_partial.load(Ordering::Relaxed)
    }

    /// Takes effect on the next free that empties a slab.
    pub fn set_min_partial(&self, min_partial: usize) {
        self.min_partial.store(min_partial, Ordering::Relaxed);
    }

    /// Per-CPU partial list cap, in free objects.
    pub fn cpu_partial(&self) -> usize {
        self.cpu_partial.load(Ordering::Relaxed)
    }

    /// Fails for caches that cannot use CPU partial lists.
    pub fn set_cpu_partial(&self, objects: usize) -> AllocResult {
        if objects != 0 && !self.cpu_partial_allowed {
            return Err(AllocError::InvalidParam);
        }
        self.cpu_partial.store(objects, Ordering::Relaxed);
        Ok(())
    }

    /// Chance, per thousand, that an allocation looks at remote nodes
    /// before allocating a fresh slab.
    pub fn remote_defrag_ratio(&self) -> usize {
        self.remote_defrag_ratio.load(Ordering::Relaxed)
    }

    /// `0` keeps allocations on the local node. Values above
    /// [`MAX_DEFRAG_RATIO`] are rejected.
    pub fn set_remote_defrag_ratio(&self, ratio: usize) -> AllocResult {
        if ratio > MAX_DEFRAG_RATIO {
            return Err(AllocError::InvalidParam);
        }
        self.remote_defrag_ratio.store(ratio, Ordering::Relaxed);
        Ok(())
    }

    /// Structural counters.
    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            name: self.name.clone(),
            object_size: self.layout.object_size,
            stride: self.layout.size,
            order: self.layout.order,
            objects_per_slab: self.layout.objects,
            nr_slabs: self.nodes.iter().map(NodePool::nr_slabs).sum(),
            nr_partial: self.nodes.iter().map(NodePool::nr_partial).sum(),
            total_objects: self.nodes.iter().map(NodePool::total_objects).sum(),
            min_partial: self.min_partial(),
            cpu_partial: self.cpu_partial(),
        }
    }

    /// Event counter summed over all CPUs.
    pub fn stat(&self, item: StatItem) -> u64 {
        self.cpus.iter().map(|c| c.stats.get(item)).sum()
    }

    /// Event counter of one CPU.
    pub fn stat_cpu(&self, cpu: usize, item: StatItem) -> u64 {
        self.cpus.get(cpu).map_or(0, |c| c.stats.get(item))
    }

    /// Whether any corruption was detected.
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Relaxed)
    }

    /// Drain the recorded corruption reports.
    pub fn take_reports(&self) -> Vec<CorruptionReport> {
        core::mem::take(&mut *self.reports.lock())
    }

    /// Allocation record of `object`, for caches with `STORE_USER`.
    pub fn alloc_track(&self, object: NonNull<u8>) -> Option<Track> {
        self.track(object.as_ptr() as usize, TrackItem::Alloc)
    }

    /// Free record of `object`, for caches with `STORE_USER`.
    pub fn free_track(&self, object: NonNull<u8>) -> Option<Track> {
        self.track(object.as_ptr() as usize, TrackItem::Free)
    }

    fn track(&self, addr: usize, item: TrackItem) -> Option<Track> {
        if !self.flags.contains(CacheFlags::STORE_USER) {
            return None;
        }
        let slab = self.lookup(addr).ok()?;
        unsafe { slab.as_ref() }.index_of(addr)?;
        Some(unsafe { get_track(&self.layout, addr, item) })
    }

    #[inline]
    pub(super) fn current_cpu(&self) -> usize {
        self.platform.current_cpu().min(self.cpus.len() - 1)
    }

    #[inline]
    pub(super) fn node_of_cpu(&self, cpu: usize) -> usize {
        self.platform.cpu_to_node(cpu).min(self.nodes.len() - 1)
    }

    #[inline]
    pub(super) fn stat_inc(&self, item: StatItem) {
        self.cpus[self.current_cpu()].stats.inc(item);
    }

    /// Slab owning `addr`, which must belong to this cache.
    pub(super) fn lookup(&self, addr: usize) -> AllocResult<NonNull<Slab>> {
        let slab = self.provider.slab_of(addr).ok_or(AllocError::NotAllocated)?;
        if !core::ptr::eq(unsafe { slab.as_ref() }.cache_ptr(), self) {
            return Err(AllocError::NotAllocated);
        }
        Ok(slab)
    }

    pub(super) fn report(&self, kind: CorruptionKind, object: usize, addr: usize) {
        let report = CorruptionReport {
            kind,
            cache: self.name.clone(),
            object,
            addr,
        };
        error!("{}", report);
        self.tainted.store(true, Ordering::Relaxed);
        self.reports.lock().push(report);
    }

    /// Object index of the freelist link `next` found in `slab`, or `None`
    /// if the link is corrupt. Zero ends the list.
    #[inline]
    pub(super) fn link_index(slab: &Slab, next: usize) -> Option<u16> {
        if next == 0 {
            Some(NO_FREE)
        } else {
            slab.index_of(next).map(|i| i as u16)
        }
    }

    /// Walk the chain starting at object `head`, returning its length and
    /// last object. A corrupt link is reported and the chain cut there.
    pub(super) fn chain_tail(&self, slab: &Slab, head: u16) -> (usize, usize) {
        if head == NO_FREE {
            return (0, 0);
        }
        let mut object = slab.head_addr(head);
        let mut count = 1;
        loop {
            let fp = object + self.layout.offset;
            let next = unsafe { self.codec.read(fp) };
            if next == 0 {
                return (count, object);
            }
            if Self::link_index(slab, next).is_none() || count >= slab.objects() {
                self.report(CorruptionKind::FreePointer, object, fp);
                unsafe { self.codec.write(fp, 0) };
                return (count, object);
            }
            object = next;
            count += 1;
        }
    }

    /// Length of the chain at `head`, or `None` if it is corrupt.
    pub(super) fn freelist_len(&self, slab: &Slab, head: u16) -> Option<usize> {
        let mut object = slab.head_addr(head);
        let mut count = 0;
        while object != 0 {
            count += 1;
            if count > slab.objects() {
                return None;
            }
            let next = unsafe { self.codec.read(object + self.layout.offset) };
            Self::link_index(slab, next)?;
            object = next;
        }
        Some(count)
    }

    /// Hand a slab with no live objects back to the page provider. The slab
    /// must be unreachable from every list and CPU.
    pub(super) fn discard_slab(&self, slab: NonNull<Slab>) {
        let s = unsafe { slab.as_ref() };
        let (base, order) = (s.base(), s.order());
        self.nodes[s.node()].dec_slabs(s.objects());
        self.stat_inc(StatItem::FreeSlab);
        debug!("{}: discard slab {:#x} order {}", self.name, base, order);

        if self.flags.contains(CacheFlags::TYPESAFE_BY_RCU) {
            let provider = self.provider.clone();
            let ptr = slab.as_ptr() as usize;
            self.rcu.call(move || {
                provider.set_slab(base, None);
                provider.free_pages(base, order);
                if let Some(slab) = NonNull::new(ptr as *mut Slab) {
                    unsafe { Slab::destroy(slab) };
                }
            });
        } else {
            self.provider.set_slab(base, None);
            self.provider.free_pages(base, order);
            unsafe { Slab::destroy(slab) };
        }
    }

    /// Return the active slab of `cpu`, with what is left of the CPU's
    /// private freelist, to its node.
    pub(super) fn deactivate_slab(&self, slab: NonNull<Slab>, remaining: u32) {
        let s = unsafe { slab.as_ref() };
        let pool = &self.nodes[s.node()];
        let head = if remaining == NO_OBJECT {
            NO_FREE
        } else {
            remaining as u16
        };
        let (count, tail) = self.chain_tail(s, head);

        enum Mode {
            Free,
            Partial,
            Full,
        }
        let (mode, old, lists) = loop {
            let old = s.load_state();
            let mut new = old;
            new.frozen = false;
            if count > 0 {
                unsafe {
                    self.codec
                        .write(tail + self.layout.offset, s.head_addr(old.freelist))
                };
                new.freelist = head;
                new.inuse = old.inuse - count as u16;
            }
            let (mode, lists) = if new.inuse == 0 && pool.nr_partial() >= self.min_partial() {
                (Mode::Free, None)
            } else if new.has_free() {
                (Mode::Partial, Some(pool.lists.lock()))
            } else {
                (Mode::Full, None)
            };
            if s.cmpxchg_state(old, new) {
                break (mode, old, lists);
            }
            self.stat_inc(StatItem::CmpxchgSlabFail);
        };

        self.stat_inc(StatItem::DeactivateSlab);
        match mode {
            Mode::Partial => {
                if let Some(mut lists) = lists {
                    // Slabs that collected remote frees age at the tail.
                    pool.add_partial(&mut lists, slab, old.has_free());
                }
            }
            Mode::Free => self.discard_slab(slab),
            Mode::Full => {}
        }
    }

    /// Unfreeze a detached CPU partial list onto the node lists. The node
    /// lock is held across consecutive slabs of the same node.
    pub(super) fn unfreeze_partials(&self, mut head: Option<NonNull<Slab>>) {
        let mut locked: Option<(usize, SpinNoIrqGuard<'_, NodeLists>)> = None;
        let mut discard: Vec<NonNull<Slab>> = Vec::new();

        while let Some(slab) = head {
            let s = unsafe { slab.as_ref() };
            head = NonNull::new(s.next_partial());
            s.set_next_partial(core::ptr::null_mut());

            let node = s.node();
            if locked.as_ref().map(|(n, _)| *n) != Some(node) {
                drop(locked.take());
                locked = Some((node, self.nodes[node].lists.lock()));
            }
            let pool = &self.nodes[node];

            let new = loop {
                let old = s.load_state();
                let new = SlabState {
                    frozen: false,
                    ..old
                };
                if s.cmpxchg_state(old, new) {
                    break new;
                }
                self.stat_inc(StatItem::CmpxchgSlabFail);
            };

            if new.inuse == 0 && pool.nr_partial() >= self.min_partial() {
                discard.push(slab);
            } else if let Some((_, lists)) = locked.as_mut() {
                pool.add_partial(lists, slab, true);
            }
        }
        drop(locked);

        for slab in discard {
            self.discard_slab(slab);
        }
    }

    /// Return the active slab and the partial list of `cpu` to the nodes.
    pub fn flush_cpu(&self, cpu: usize) {
        let Some(c) = self.cpus.get(cpu) else {
            return;
        };
        let mut partial = c.lock.lock();
        let (active, remaining) = c.detach();
        if let Some(slab) = active {
            self.deactivate_slab(slab, remaining);
        }
        let list = partial.take();
        drop(partial);
        if !list.is_empty() {
            self.unfreeze_partials(list.head());
        }
    }

    /// Flush every CPU.
    pub fn flush_all(&self) {
        for cpu in 0..self.cpus.len() {
            self.flush_cpu(cpu);
        }
    }

    /// Release every empty slab and sort the partial lists so that the
    /// fullest slabs come first. Returns the number of slabs released.
    pub fn shrink(&self) -> usize {
        self.flush_all();

        let mut released = 0;
        for pool in self.nodes.iter() {
            let mut discard = Vec::new();
            {
                let mut lists = pool.lists.lock();
                let mut promote: [SlabList; SHRINK_PROMOTE_MAX] =
                    core::array::from_fn(|_| SlabList::new());

                let mut cursor = lists.partial.head();
                while let Some(slab) = NonNull::new(cursor) {
                    let s = unsafe { slab.as_ref() };
                    cursor = s.next();
                    let state = s.load_state();
                    let free = s.objects() - state.inuse as usize;
                    if state.inuse == 0 {
                        pool.remove_partial(&mut lists, slab);
                        discard.push(slab);
                    } else if free <= SHRINK_PROMOTE_MAX {
                        lists.partial.remove(slab);
                        promote[free - 1].push_back(slab);
                    }
                }
                for bucket in promote.iter_mut().rev() {
                    lists.partial.splice_front(bucket);
                }
                pool.sync_partial(&lists);
            }
            released += discard.len();
            for slab in discard {
                self.discard_slab(slab);
            }
        }
        debug!("{}: shrink released {} slabs", self.name, released);
        released
    }

    /// Flush every CPU and count the objects still handed out.
    ///
    /// The flush returns every active and parked slab to the node lists,
    /// so the next allocation on each CPU takes the slow path.
    pub fn live_objects(&self) -> usize {
        self.flush_all();
        self.nodes.iter().map(|pool| self.node_live_objects(pool)).sum()
    }

    fn node_live_objects(&self, pool: &NodePool) -> usize {
        let lists = pool.lists.lock();
        let mut listed = 0;
        let mut live = 0;
        let mut count = |slab: NonNull<Slab>| {
            let s = unsafe { slab.as_ref() };
            listed += s.objects();
            live += s.inuse();
        };
        lists.partial.for_each(&mut count);
        lists.full.for_each(&mut count);
        // Full slabs outside debug caches sit on no list.
        live + pool.total_objects().saturating_sub(listed)
    }

    /// Flush every CPU and release all empty slabs. Returns the number of
    /// objects still live.
    fn release_empty(&self) -> usize {
        self.flush_all();

        for pool in self.nodes.iter() {
            let mut discard = Vec::new();
            {
                let mut lists = pool.lists.lock();
                let mut cursor = lists.partial.head();
                while let Some(slab) = NonNull::new(cursor) {
                    let s = unsafe { slab.as_ref() };
                    cursor = s.next();
                    if s.inuse() == 0 {
                        pool.remove_partial(&mut lists, slab);
                        discard.push(slab);
                    } else {
                        error!(
                            "{}: slab {:#x} still has {} objects in use",
                            self.name,
                            s.base(),
                            s.inuse()
                        );
                    }
                }
            }
            for slab in discard {
                self.discard_slab(slab);
            }
        }
        self.nodes.iter().map(|pool| self.node_live_objects(pool)).sum()
    }

    /// Tear the cache down. Empty slabs are released either way; if objects
    /// are still live the cache stays usable and `CacheBusy` is returned.
    pub(crate) fn shutdown(&self) -> AllocResult {
        let live = self.release_empty();
        if live > 0 {
            error!("{}: cannot destroy cache with {} live objects", self.name, live);
            return Err(AllocError::CacheBusy { live_objects: live });
        }
        if self.flags.contains(CacheFlags::TYPESAFE_BY_RCU) {
            self.rcu.barrier();
        }
        info!("destroy cache {}", self.name);
        Ok(())
    }

    /// Sanity check of a slab's counters before a debug cache touches it.
    /// Only active with `CONSISTENCY_CHECKS`. Caller holds the node lock.
    pub(super) fn check_slab(&self, slab: &Slab) -> bool {
        if !self.flags.contains(CacheFlags::CONSISTENCY_CHECKS) {
            return true;
        }
        let state = slab.load_state();
        let objects = slab.objects();
        let ok = state.objects as usize == objects
            && objects == self.layout.objects_for_order(slab.order(), self.page_size)
            && state.inuse as usize <= objects
            && (state.freelist == NO_FREE || (state.freelist as usize) < objects);
        if !ok {
            error!(
                "{}: slab {:#x} counters corrupt: inuse {} objects {}/{} freelist {}",
                self.name,
                slab.base(),
                state.inuse,
                state.objects,
                objects,
                state.freelist
            );
            self.report(CorruptionKind::SlabCounters, slab.base(), slab.base());
        }
        ok
    }

    /// Check every listed slab against its counters. Findings are recorded
    /// as [`CorruptionKind::SlabCounters`] reports; returns their number.
    pub fn validate(&self) -> usize {
        let mut problems = 0;
        for pool in self.nodes.iter() {
            let lists = pool.lists.lock();
            let mut nr_listed = 0;
            let mut check = |slab: NonNull<Slab>, full: bool| {
                let s = unsafe { slab.as_ref() };
                nr_listed += 1;
                let state = s.load_state();
                let free = self.freelist_len(s, state.freelist);
                let ok = !state.frozen
                    && state.objects as usize == s.objects()
                    && free == Some(s.objects() - state.inuse as usize)
                    && (full == (state.inuse as usize == s.objects()));
                if !ok {
                    self.report(CorruptionKind::SlabCounters, s.base(), s.base());
                    problems += 1;
                }
            };
            lists.partial.for_each(|s| check(s, false));
            lists.full.for_each(|s| check(s, true));
            if nr_listed > pool.nr_slabs() {
                self.report(CorruptionKind::SlabCounters, 0, 0);
                problems += 1;
            }
        }
        problems
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        // Pages holding live objects stay with whoever holds the objects.
        let live = self.release_empty();
        if live > 0 {
            error!("{}: dropped with {} live objects", self.name, live);
        }
    }
}
