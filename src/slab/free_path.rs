//! Object release.
//!
//! A free into the CPU's active slab is spliced onto the private freelist
//! with one compare-and-swap on the `{freelist, tid}` word. Any other free
//! goes straight to the owning slab's state word and takes the node list
//! lock only when the slab changes list.

use alloc::vec::Vec;
use core::panic::Location;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, info};

use super::cpu_slab::NO_OBJECT;
use super::page::{Slab, SlabState};
use super::slab_cache::SlabCache;
use crate::debug::{check_object, init_object, set_track, CorruptionKind, Track, TrackItem};
use crate::debug::{RED_ACTIVE, RED_INACTIVE};
use crate::flags::CacheFlags;
use crate::stats::StatItem;
use crate::{AllocError, AllocResult};

/// Objects from other slabs tolerated while gathering one bulk group.
const BULK_LOOKAHEAD: usize = 3;

impl SlabCache {
    /// Return `object` to the cache.
    ///
    /// Fails with [`AllocError::NotAllocated`] if the address is not an
    /// object of this cache. Debug caches also refuse double frees.
    #[track_caller]
    pub fn free(&self, object: NonNull<u8>) -> AllocResult {
        let addr = object.as_ptr() as usize;
        if self.debug {
            return self.free_debug(addr, Location::caller());
        }
        let slab = self.lookup(addr)?;
        if unsafe { slab.as_ref() }.index_of(addr).is_none() {
            return Err(AllocError::NotAllocated);
        }
        self.do_free(slab, addr, addr, 1);
        Ok(())
    }

    /// Return a batch of objects. Objects of the same slab are chained
    /// and released together. Every valid object is freed; the result
    /// reports whether any address was rejected.
    #[track_caller]
    pub fn free_bulk(&self, objects: &[NonNull<u8>]) -> AllocResult {
        let mut result = Ok(());
        if self.debug {
            for &object in objects {
                if let Err(err) = self.free_debug(object.as_ptr() as usize, Location::caller()) {
                    result = Err(err);
                }
            }
            return result;
        }

        let mut addrs: Vec<usize> = objects.iter().map(|o| o.as_ptr() as usize).collect();
        let mut size = addrs.len();
        while size > 0 {
            let last = size - 1;
            let addr = core::mem::take(&mut addrs[last]);
            size = last;
            if addr == 0 {
                continue;
            }
            let slab = match self.lookup(addr) {
                Ok(slab) if unsafe { slab.as_ref() }.index_of(addr).is_some() => slab,
                _ => {
                    result = Err(AllocError::NotAllocated);
                    continue;
                }
            };
            let s = unsafe { slab.as_ref() };

            let (mut head, tail, mut count) = (addr, addr, 1);
            let mut lookahead = BULK_LOOKAHEAD;
            let mut resume = 0;
            for i in (0..last).rev() {
                let other = addrs[i];
                if other == 0 {
                    continue;
                }
                if s.index_of(other).is_some() {
                    unsafe { self.codec.write(other + self.layout.offset, head) };
                    head = other;
                    count += 1;
                    addrs[i] = 0;
                } else {
                    if resume == 0 {
                        resume = i + 1;
                    }
                    lookahead -= 1;
                    if lookahead == 0 {
                        break;
                    }
                }
            }
            self.do_free(slab, head, tail, count);
            size = resume;
        }
        result
    }

    /// Release the chain `head..=tail` of `count` objects of `slab`. The
    /// links inside the chain are already written.
    fn do_free(&self, slab: NonNull<Slab>, head: usize, tail: usize, count: usize) {
        let s = unsafe { slab.as_ref() };
        loop {
            let c = &self.cpus[self.current_cpu()];
            let pin = c.pin();
            let (idx, tid) = c.load_word();
            if c.active() != slab.as_ptr() {
                drop(pin);
                break;
            }
            let next = if idx == NO_OBJECT {
                0
            } else {
                s.object_addr(idx as usize)
            };
            unsafe { self.codec.write(tail + self.layout.offset, next) };
            let new_idx = s.index_of(head).map_or(NO_OBJECT, |i| i as u32);
            if c.cmpxchg_word(idx, tid, new_idx) {
                drop(pin);
                c.stats.inc(StatItem::FreeFastpath);
                return;
            }
            drop(pin);
            c.stats.inc(StatItem::CmpxchgCpuFail);
        }
        self.free_slow(slab, head, tail, count);
    }

    fn free_slow(&self, slab: NonNull<Slab>, head: usize, tail: usize, count: usize) {
        let s = unsafe { slab.as_ref() };
        let pool = &self.nodes[s.node()];
        self.stat_inc(StatItem::FreeSlowpath);

        let mut lists = None;
        let (old, new, froze) = loop {
            let old = s.load_state();
            unsafe {
                self.codec
                    .write(tail + self.layout.offset, s.head_addr(old.freelist))
            };
            let mut new = SlabState {
                freelist: s.head_index(head),
                inuse: old.inuse - count as u16,
                ..old
            };
            let was_full = !old.has_free();
            let mut froze = false;
            if !old.frozen {
                if was_full && self.cpu_partial() > 0 {
                    new.frozen = true;
                    froze = true;
                } else if (new.inuse == 0 || was_full) && lists.is_none() {
                    lists = Some(pool.lists.lock());
                }
            }
            if s.cmpxchg_state(old, new) {
                break (old, new, froze);
            }
            self.stat_inc(StatItem::CmpxchgSlabFail);
        };

        if old.frozen {
            self.stat_inc(StatItem::FreeFrozen);
            drop(lists);
            let cpu = self.current_cpu();
            if s.parked_on() == Some(cpu) {
                self.trim_cpu_partial(cpu);
            }
            return;
        }
        if froze {
            drop(lists);
            self.put_cpu_partial(slab);
            return;
        }
        let Some(mut lists) = lists else {
            return;
        };
        if new.inuse == 0 && pool.nr_partial() >= self.min_partial() {
            pool.remove_any(&mut lists, slab);
            drop(lists);
            self.stat_inc(StatItem::FreeRemovePartial);
            self.discard_slab(slab);
        } else if !old.has_free() {
            pool.add_partial(&mut lists, slab, true);
            self.stat_inc(StatItem::FreeAddPartial);
        }
    }

    /// Park a slab frozen by a free on this CPU's partial list. If the
    /// list would then hold more free objects than allowed, the old list
    /// is unfrozen onto the node lists first.
    fn put_cpu_partial(&self, slab: NonNull<Slab>) {
        let s = unsafe { slab.as_ref() };
        let free = s.objects() - s.inuse();
        let limit = self.cpu_partial();
        let c = &self.cpus[self.current_cpu()];

        let mut partial = c.lock.lock();
        let drained = (!partial.is_empty() && partial.free_objects() + free > limit).then(|| {
            c.stats.inc(StatItem::CpuPartialDrain);
            partial.take()
        });
        partial.push(slab, c.cpu());
        c.stats.inc(StatItem::CpuPartialFree);
        drop(partial);

        if let Some(list) = drained {
            debug!(
                "{}: drain {} slabs ({} free objects) from cpu partial list",
                self.name(),
                list.slabs(),
                list.free_objects()
            );
            self.unfreeze_partials(list.head());
        }
    }

    /// Unfreeze the partial list of `cpu` once frees into its parked slabs
    /// have pushed it over the cap.
    fn trim_cpu_partial(&self, cpu: usize) {
        let c = &self.cpus[cpu];
        let mut partial = c.lock.lock();
        let free = partial.free_objects();
        if free <= self.cpu_partial() {
            return;
        }
        c.stats.inc(StatItem::CpuPartialDrain);
        let list = partial.take();
        drop(partial);
        debug!(
            "{}: trim {} slabs ({} free objects) from cpu partial list",
            self.name(),
            list.slabs(),
            free
        );
        self.unfreeze_partials(list.head());
    }

    /// Free for debug caches, under the node list lock.
    fn free_debug(&self, addr: usize, caller: &'static Location<'static>) -> AllocResult {
        let Some(slab) = self.provider.slab_of(addr) else {
            self.report(CorruptionKind::InvalidAddress, addr, addr);
            return Err(AllocError::NotAllocated);
        };
        let s = unsafe { slab.as_ref() };
        if !core::ptr::eq(s.cache_ptr(), self) {
            self.report(CorruptionKind::WrongCache, addr, addr);
            return Err(AllocError::NotAllocated);
        }
        let Some(idx) = s.index_of(addr) else {
            self.report(CorruptionKind::InvalidAddress, addr, addr);
            return Err(AllocError::NotAllocated);
        };

        let cpu = self.current_cpu();
        let pool = &self.nodes[s.node()];
        let mut lists = pool.lists.lock();
        if !self.check_slab(s) {
            return Err(AllocError::NotAllocated);
        }
        if self.on_freelist(s, addr) {
            self.report(CorruptionKind::DoubleFree, addr, addr);
            return Err(AllocError::NotAllocated);
        }

        let layout = &self.layout;
        unsafe {
            check_object(layout, addr, RED_ACTIVE, &mut |kind, at| {
                self.report(kind, addr, at)
            });
            if self.flags.contains(CacheFlags::STORE_USER) {
                let track = Track::new(caller, cpu, self.platform.current_pid(), self.platform.now());
                set_track(layout, addr, TrackItem::Free, track);
            }
            init_object(layout, addr, RED_INACTIVE);
        }
        if self.flags.contains(CacheFlags::TRACE) {
            info!("{}: free {:#x} from {}", self.name(), addr, caller);
        }

        let old = s.load_state();
        unsafe { self.codec.write(addr + layout.offset, s.head_addr(old.freelist)) };
        let new = SlabState {
            freelist: idx as u16,
            inuse: old.inuse - 1,
            ..old
        };
        s.store_state(new);
        self.cpus[cpu].stats.inc(StatItem::FreeSlowpath);

        if new.inuse == 0 && pool.nr_partial() >= self.min_partial() {
            pool.remove_any(&mut lists, slab);
            drop(lists);
            self.cpus[cpu].stats.inc(StatItem::FreeRemovePartial);
            self.discard_slab(slab);
        } else if !old.has_free() {
            pool.remove_any(&mut lists, slab);
            pool.add_partial(&mut lists, slab, true);
            self.cpus[cpu].stats.inc(StatItem::FreeAddPartial);
        }
        Ok(())
    }

    /// Whether `object` is on the slab's freelist. A corrupt link is
    /// reported and the list cut there, with `inuse` fixed up to match.
    /// Caller holds the node list lock.
    fn on_freelist(&self, slab: &Slab, object: usize) -> bool {
        let state = slab.load_state();
        let mut cursor = slab.head_addr(state.freelist);
        let mut nr = 0;
        while cursor != 0 && nr < slab.objects() {
            if cursor == object {
                return true;
            }
            nr += 1;
            let fp = cursor + self.layout.offset;
            let next = unsafe { self.codec.read(fp) };
            if Self::link_index(slab, next).is_none() {
                self.report(CorruptionKind::FreePointer, cursor, fp);
                unsafe { self.codec.write(fp, 0) };
                slab.store_state(SlabState {
                    inuse: (slab.objects() - nr) as u16,
                    ..state
                });
                return false;
            }
            cursor = next;
        }
        false
    }
}
