//! Integration tests for the slab allocator
//!
//! Tests caches end to end on top of the heap-backed page provider,
//! focusing on slab lifecycle and cross-module scenarios.

#![no_std]

extern crate alloc;
extern crate slub_allocator;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use slub_allocator::{
    AllocError, CacheFlags, GfpFlags, HeapPageProvider, SlabAllocator, SlabCache, SlabConfig,
    SlabPlatform, UniprocessorPlatform,
};
#[cfg(feature = "tracking")]
use slub_allocator::StatItem;

const PAGE_SIZE: usize = 0x1000;

fn setup_with(
    provider: HeapPageProvider<PAGE_SIZE>,
    config: SlabConfig,
) -> (Arc<HeapPageProvider<PAGE_SIZE>>, SlabAllocator) {
    let provider = Arc::new(provider);
    let allocator =
        SlabAllocator::new(provider.clone(), Arc::new(UniprocessorPlatform), config).unwrap();
    (provider, allocator)
}

fn setup() -> (Arc<HeapPageProvider<PAGE_SIZE>>, SlabAllocator) {
    setup_with(HeapPageProvider::new(1), SlabConfig::default())
}

fn addr(p: NonNull<u8>) -> usize {
    p.as_ptr() as usize
}

#[test]
fn test_first_slab_holds_170_objects() {
    let (provider, a) = setup();
    let cache = a
        .create_cache("t", 24, 8, CacheFlags::empty(), None)
        .unwrap();
    assert_eq!(cache.layout().order, 0);
    assert_eq!(cache.layout().objects, 170);

    let calls = provider.alloc_calls();
    let mut objs = Vec::new();
    for _ in 0..170 {
        objs.push(cache.alloc(GfpFlags::empty()).unwrap());
    }
    assert_eq!(provider.alloc_calls(), calls + 1);

    let base = objs.iter().map(|&p| addr(p)).min().unwrap();
    assert_eq!(base % PAGE_SIZE, 0);
    assert!(objs.iter().all(|&p| addr(p) < base + PAGE_SIZE));

    objs.push(cache.alloc(GfpFlags::empty()).unwrap());
    assert_eq!(provider.alloc_calls(), calls + 2);
    assert_eq!(cache.info().nr_slabs, 2);

    let mut sorted: Vec<usize> = objs.iter().map(|&p| addr(p)).collect();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 171);

    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_hot_object_reuse() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 2048, 8, CacheFlags::empty(), None)
        .unwrap();
    let first = cache.alloc(GfpFlags::empty()).unwrap();
    let second = cache.alloc(GfpFlags::empty()).unwrap();
    assert_ne!(first, second);
    cache.free(first).unwrap();
    assert_eq!(cache.alloc(GfpFlags::empty()).unwrap(), first);
}

#[test]
fn test_empty_slab_released_at_min_partial() {
    let (provider, a) = setup();
    let cache = a
        .create_cache("t", 32, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;
    let n = cache.min_partial() * per_slab + 1;

    let objs: Vec<_> = (0..n)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    assert_eq!(cache.info().nr_slabs, cache.min_partial() + 1);
    let frees = provider.free_calls();
    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert!(provider.free_calls() > frees);
    assert!(cache.info().nr_partial <= cache.min_partial());
    #[cfg(feature = "tracking")]
    {
        // Frees into parked slabs push the CPU list over its cap.
        assert!(cache.stat(StatItem::CpuPartialDrain) >= 1);
        assert!(cache.stat(StatItem::FreeRemovePartial) >= 1);
    }
}

#[test]
fn test_shrink_releases_every_empty_slab() {
    let (provider, a) = setup();
    let cache = a
        .create_cache("t", 32, 8, CacheFlags::empty(), None)
        .unwrap();
    let n = cache.min_partial() * cache.layout().objects + 1;
    let objs: Vec<_> = (0..n)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    for obj in objs {
        cache.free(obj).unwrap();
    }
    cache.shrink();
    assert!(provider.free_calls() >= 1);
    assert_eq!(cache.info().nr_slabs, 0);
    assert_eq!(provider.pages_in_use(), 0);
    // Nothing left to do.
    assert_eq!(cache.shrink(), 0);
}

#[test]
fn test_shrink_keeps_live_slabs() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 128, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;
    let objs: Vec<_> = (0..per_slab * 3)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    // Keep one object of the middle slab alive.
    let keep = objs[per_slab];
    for &obj in objs.iter().filter(|&&o| o != keep) {
        cache.free(obj).unwrap();
    }
    cache.shrink();
    assert_eq!(cache.info().nr_slabs, 1);
    assert_eq!(cache.live_objects(), 1);
    assert_eq!(cache.validate(), 0);
    cache.free(keep).unwrap();
}

#[test]
fn test_single_object_slabs() {
    let config = SlabConfig {
        max_order: 0,
        ..SlabConfig::default()
    };
    let (provider, a) = setup_with(HeapPageProvider::new(1), config);
    let cache = a
        .create_cache("big", 3000, 8, CacheFlags::empty(), None)
        .unwrap();
    assert_eq!(cache.layout().objects, 1);

    let objs: Vec<_> = (0..3)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    assert_eq!(cache.info().nr_slabs, 3);
    assert_eq!(provider.pages_in_use(), 3);
    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_oversized_cache_rejected() {
    let (_provider, a) = setup();
    assert_eq!(
        a.create_cache("huge", 8 << 20, 8, CacheFlags::empty(), None)
            .err(),
        Some(AllocError::ObjectTooLarge)
    );
    assert_eq!(
        a.create_cache("bad-align", 64, 12, CacheFlags::empty(), None)
            .err(),
        Some(AllocError::InvalidParam)
    );
}

#[test]
fn test_bulk_round_trip_keeps_counters() {
    let (provider, a) = setup();
    let cache = a
        .create_cache("bulk", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let anchor = cache.alloc(GfpFlags::empty()).unwrap();
    let before = cache.info();
    let pages = provider.pages_in_use();

    let mut objs = Vec::new();
    assert_eq!(cache.alloc_bulk(GfpFlags::empty(), 16, &mut objs), 16);
    assert_eq!(objs.len(), 16);
    cache.free_bulk(&objs).unwrap();

    assert_eq!(cache.info(), before);
    assert_eq!(provider.pages_in_use(), pages);
    cache.free(anchor).unwrap();
}

#[test]
fn test_bulk_free_across_slabs() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("bulk", 256, 8, CacheFlags::empty(), None)
        .unwrap();
    let mut objs = Vec::new();
    let n = cache.layout().objects * 3 + 5;
    assert_eq!(cache.alloc_bulk(GfpFlags::empty(), n, &mut objs), n);
    // Interleave slabs so the lookahead has work to do.
    objs.reverse();
    objs.swap(1, n - 2);
    cache.free_bulk(&objs).unwrap();
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.validate(), 0);
}

#[test]
fn test_bulk_alloc_is_all_or_nothing() {
    let provider = HeapPageProvider::new(1).with_page_limit(1);
    let (_provider, a) = setup_with(provider, SlabConfig::default());
    let cache = a
        .create_cache("bulk", 512, 8, CacheFlags::NO_WARN, None)
        .unwrap();
    let mut objs = Vec::new();
    assert_eq!(cache.alloc_bulk(GfpFlags::empty(), 100, &mut objs), 0);
    assert!(objs.is_empty());
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_order_fallback() {
    let provider = HeapPageProvider::new(1).with_page_limit(2);
    let (provider, a) = setup_with(provider, SlabConfig::default());
    let cache = a
        .create_cache("t", 2048, 8, CacheFlags::empty(), None)
        .unwrap();
    assert!(cache.layout().order > cache.layout().min_order);

    let objs: Vec<_> = (0..4)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    assert_eq!(provider.pages_in_use(), 2);
    assert_eq!(cache.info().nr_slabs, 2);
    assert_eq!(
        cache.alloc(GfpFlags::NOWARN),
        Err(AllocError::NoMemory)
    );
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::OrderFallback), 3);
    for obj in objs {
        cache.free(obj).unwrap();
    }
}

#[test]
fn test_out_of_memory_and_recovery() {
    let provider = HeapPageProvider::new(1).with_page_limit(1);
    let (_provider, a) = setup_with(provider, SlabConfig::default());
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;
    let objs: Vec<_> = (0..per_slab)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    assert_eq!(cache.alloc(GfpFlags::empty()), Err(AllocError::NoMemory));
    assert_eq!(cache.alloc(GfpFlags::NORETRY), Err(AllocError::NoMemory));

    cache.free(objs[0]).unwrap();
    assert_eq!(cache.alloc(GfpFlags::empty()).unwrap(), objs[0]);
}

#[test]
fn test_free_foreign_address() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let other = a
        .create_cache("other", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let obj = other.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(cache.free(obj), Err(AllocError::NotAllocated));

    let heap = Box::into_raw(Box::new([0u64; 8]));
    let heap_ptr = NonNull::new(heap as *mut u8).unwrap();
    assert_eq!(cache.free(heap_ptr), Err(AllocError::NotAllocated));
    drop(unsafe { Box::from_raw(heap) });

    let inner = NonNull::new((addr(obj) + 1) as *mut u8).unwrap();
    assert_eq!(other.free(inner), Err(AllocError::NotAllocated));
    other.free(obj).unwrap();
}

fn fill_pattern(object: *mut u8) {
    unsafe { core::ptr::write_bytes(object, 0x42, 48) };
}

#[test]
fn test_constructor_runs_on_fresh_slabs() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("ctor", 48, 8, CacheFlags::empty(), Some(fill_pattern))
        .unwrap();
    // The free pointer lives outside the payload when a constructor is set.
    assert!(cache.layout().offset >= 48);
    let objs: Vec<_> = (0..cache.layout().objects)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    for &obj in &objs {
        let bytes = unsafe { core::slice::from_raw_parts(obj.as_ptr(), 48) };
        assert!(bytes.iter().all(|&b| b == 0x42));
    }
    cache.free_bulk(&objs).unwrap();
}

#[test]
fn test_zeroed_allocation() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 96, 8, CacheFlags::empty(), None)
        .unwrap();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    unsafe { core::ptr::write_bytes(obj.as_ptr(), 0xff, 96) };
    cache.free(obj).unwrap();
    let again = cache.alloc(GfpFlags::ZERO).unwrap();
    assert_eq!(again, obj);
    let bytes = unsafe { core::slice::from_raw_parts(again.as_ptr(), 96) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_randomized_freelist_order() {
    let config = SlabConfig {
        randomize_freelist: true,
        ..SlabConfig::default()
    };
    let (_provider, a) = setup_with(HeapPageProvider::new(1), config);
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    assert!(cache.flags().contains(CacheFlags::RANDOM_FREELIST));
    let objs: Vec<usize> = (0..cache.layout().objects)
        .map(|_| addr(cache.alloc(GfpFlags::empty()).unwrap()))
        .collect();
    let mut sorted = objs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), objs.len());
    assert_eq!(sorted[sorted.len() - 1] - sorted[0], 64 * (objs.len() - 1));
    assert_ne!(sorted, objs);
}

#[test]
fn test_typesafe_by_rcu_defers_page_release() {
    let (provider, a) = setup();
    let cache = a
        .create_cache("rcu", 64, 8, CacheFlags::TYPESAFE_BY_RCU, None)
        .unwrap();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    cache.free(obj).unwrap();

    let guard = a.rcu().read_lock();
    assert_eq!(cache.shrink(), 1);
    assert_eq!(cache.info().nr_slabs, 0);
    assert_eq!(provider.pages_in_use(), 1);
    assert_eq!(a.rcu().pending(), 1);

    drop(guard);
    a.rcu().barrier();
    assert_eq!(provider.pages_in_use(), 0);
}

#[test]
fn test_tunable_bounds() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    assert_eq!(
        cache.set_remote_defrag_ratio(1001),
        Err(AllocError::InvalidParam)
    );
    cache.set_remote_defrag_ratio(0).unwrap();
    cache.set_min_partial(2);
    assert_eq!(cache.info().min_partial, 2);

    let debug = a
        .create_cache("dbg", 64, 8, CacheFlags::RED_ZONE, None)
        .unwrap();
    assert_eq!(debug.cpu_partial(), 0);
    assert_eq!(debug.set_cpu_partial(8), Err(AllocError::InvalidParam));
}

#[test]
fn test_kmalloc_family() {
    let (provider, a) = setup();
    assert!(a.find_cache("kmalloc-8").is_some());
    assert!(a.find_cache("kmalloc-8192").is_some());

    let small = a.kmalloc(100, GfpFlags::empty()).unwrap();
    assert_eq!(a.ksize(small), Some(128));
    let large = a.kmalloc(64 * 1024, GfpFlags::empty()).unwrap();
    assert_eq!(a.ksize(large), Some(64 * 1024));
    assert_eq!(addr(large) % (64 * 1024), 0);

    a.kfree(small).unwrap();
    a.kfree(large).unwrap();
    assert_eq!(a.kfree(large), Err(AllocError::NotAllocated));
    a.shrink_all();
    assert_eq!(provider.pages_in_use(), 0);
}

/// One CPU on node 0, a second memory node without CPUs.
struct TwoNodes;

impl SlabPlatform for TwoNodes {
    fn nr_cpus(&self) -> usize {
        1
    }

    fn current_cpu(&self) -> usize {
        0
    }

    fn nr_nodes(&self) -> usize {
        2
    }
}

#[test]
fn test_node_placement() {
    let provider = Arc::new(HeapPageProvider::<PAGE_SIZE>::new(2));
    let a = SlabAllocator::new(provider.clone(), Arc::new(TwoNodes), SlabConfig::default()).unwrap();
    let cache = a
        .create_cache("numa", 64, 8, CacheFlags::empty(), None)
        .unwrap();

    let remote = cache.alloc_node(GfpFlags::empty(), Some(1)).unwrap();
    assert_eq!(provider.node_pages_in_use(1), 1);
    assert_eq!(provider.node_pages_in_use(0), 0);

    let local = cache.alloc_node(GfpFlags::empty(), Some(0)).unwrap();
    assert_eq!(provider.node_pages_in_use(0), 1);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::AllocNodeMismatch), 1);

    // Out-of-range nodes mean "any node".
    let any = cache.alloc_node(GfpFlags::empty(), Some(7)).unwrap();

    for obj in [remote, local, any] {
        cache.free(obj).unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_thisnode_does_not_fall_back() {
    let provider = Arc::new(HeapPageProvider::<PAGE_SIZE>::new(2));
    provider.set_node_page_limit(1, Some(0));
    let a = SlabAllocator::new(provider.clone(), Arc::new(TwoNodes), SlabConfig::default()).unwrap();
    let cache = a
        .create_cache("numa", 64, 8, CacheFlags::NO_WARN, None)
        .unwrap();

    assert_eq!(
        cache.alloc_node(GfpFlags::THISNODE, Some(1)),
        Err(AllocError::NoMemory)
    );
    let obj = cache.alloc_node(GfpFlags::empty(), Some(1)).unwrap();
    assert_eq!(provider.node_pages_in_use(0), 1);
    cache.free(obj).unwrap();
}

#[test]
fn test_fast_paths_are_used() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let objs: Vec<_> = (0..10)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert_eq!(cache.validate(), 0);
    #[cfg(feature = "tracking")]
    {
        assert_eq!(cache.stat(StatItem::AllocSlowpath), 1);
        assert_eq!(cache.stat(StatItem::AllocFastpath), 9);
        assert_eq!(cache.stat(StatItem::FreeFastpath), 10);
        assert_eq!(cache.stat_cpu(0, StatItem::AllocSlab), 1);
    }
}

fn two_node_cache() -> (Arc<HeapPageProvider<PAGE_SIZE>>, SlabAllocator, Arc<SlabCache>) {
    let provider = Arc::new(HeapPageProvider::<PAGE_SIZE>::new(2));
    let a = SlabAllocator::new(provider.clone(), Arc::new(TwoNodes), SlabConfig::default()).unwrap();
    let cache = a
        .create_cache("numa", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    (provider, a, cache)
}

#[test]
fn test_remote_partial_slab_taken_before_new_slab() {
    let (provider, _a, cache) = two_node_cache();
    // Leaves a partial slab on node 1 once the CPU lets go of it.
    let remote = cache.alloc_node(GfpFlags::empty(), Some(1)).unwrap();
    cache.flush_cpu(0);
    assert_eq!(cache.info().nr_partial, 1);

    let calls = provider.alloc_calls();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(provider.alloc_calls(), calls);
    assert_eq!(provider.node_pages_in_use(0), 0);
    assert_eq!(cache.info().nr_partial, 0);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::AllocFromPartial), 1);

    cache.free(obj).unwrap();
    cache.free(remote).unwrap();
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_zero_defrag_ratio_stays_local() {
    let (provider, _a, cache) = two_node_cache();
    cache.set_remote_defrag_ratio(0).unwrap();
    let remote = cache.alloc_node(GfpFlags::empty(), Some(1)).unwrap();
    cache.flush_cpu(0);

    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(provider.node_pages_in_use(0), 1);
    assert_eq!(cache.info().nr_partial, 1);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::AllocFromPartial), 0);

    cache.free(obj).unwrap();
    cache.free(remote).unwrap();
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_node_partial_refills_cpu_partial_up_to_half_cap() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;
    cache.set_cpu_partial(0).unwrap();
    let objs: Vec<_> = (0..per_slab * 5)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();

    // Ten free objects in each of the first four slabs, all on the node list.
    for slab in 0..4 {
        for i in 0..10 {
            cache.free(objs[slab * per_slab + i]).unwrap();
        }
    }
    assert_eq!(cache.info().nr_partial, 4);

    // The first slab is taken, the second parked; 20 free objects exceed
    // half of the cap.
    cache.set_cpu_partial(30).unwrap();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(cache.info().nr_partial, 2);
    #[cfg(feature = "tracking")]
    {
        assert_eq!(cache.stat(StatItem::AllocFromPartial), 1);
        assert_eq!(cache.stat(StatItem::CpuPartialNode), 1);
    }

    cache.free(obj).unwrap();
    for (i, obj) in objs.into_iter().enumerate() {
        if i % per_slab >= 10 || i >= 4 * per_slab {
            cache.free(obj).unwrap();
        }
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.validate(), 0);
}

#[test]
fn test_live_objects_flushes_cpu_state() {
    let (_provider, a) = setup();
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(cache.live_objects(), 1);
    // The active slab went back to the node.
    assert_eq!(cache.info().nr_partial, 1);

    let again = cache.alloc(GfpFlags::empty()).unwrap();
    assert_eq!(cache.info().nr_partial, 0);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::AllocSlowpath), 2);
    cache.free(obj).unwrap();
    cache.free(again).unwrap();
}
