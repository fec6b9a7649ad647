//! Multi-CPU tests
//!
//! Each test thread plays one CPU through a thread-local CPU id.

use std::cell::Cell;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use slub_allocator::{
    CacheFlags, GfpFlags, HeapPageProvider, SlabAllocator, SlabCache, SlabConfig, SlabPlatform,
};
#[cfg(feature = "tracking")]
use slub_allocator::StatItem;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// `nr_cpus` CPUs, each test thread picks its own.
struct ThreadCpus(usize);

impl SlabPlatform for ThreadCpus {
    fn nr_cpus(&self) -> usize {
        self.0
    }

    fn current_cpu(&self) -> usize {
        CPU.with(|c| c.get())
    }
}

/// One thread switching between CPUs on demand.
struct SwitchableCpu {
    nr_cpus: usize,
    cpu: AtomicUsize,
}

impl SlabPlatform for SwitchableCpu {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }
}

fn threaded_allocator(nr_cpus: usize) -> SlabAllocator {
    SlabAllocator::new(
        Arc::new(HeapPageProvider::<4096>::new(1)),
        Arc::new(ThreadCpus(nr_cpus)),
        SlabConfig::default(),
    )
    .unwrap()
}

/// Object addresses, sendable between threads.
fn addrs(objs: &[NonNull<u8>]) -> Vec<usize> {
    objs.iter().map(|p| p.as_ptr() as usize).collect()
}

fn ptr(addr: usize) -> NonNull<u8> {
    NonNull::new(addr as *mut u8).unwrap()
}

#[test]
fn test_two_cpus_allocate_distinct_objects() {
    let a = threaded_allocator(2);
    let cache = a
        .create_cache("t", 64, 8, CacheFlags::empty(), None)
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|cpu| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                CPU.with(|c| c.set(cpu));
                barrier.wait();
                let objs: Vec<_> = (0..10_000)
                    .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
                    .collect();
                addrs(&objs)
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(all.insert(addr), "object {:#x} handed out twice", addr);
        }
    }
    assert_eq!(all.len(), 20_000);
    assert_eq!(cache.live_objects(), 20_000);
    assert_eq!(cache.validate(), 0);

    for addr in all {
        cache.free(ptr(addr)).unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn test_remote_free_reaches_owner_after_refill() {
    let platform = Arc::new(SwitchableCpu {
        nr_cpus: 2,
        cpu: AtomicUsize::new(0),
    });
    let a = SlabAllocator::new(
        Arc::new(HeapPageProvider::<4096>::new(1)),
        platform.clone(),
        SlabConfig::default(),
    )
    .unwrap();
    let cache = a
        .create_cache("t", 256, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;

    let x = cache.alloc(GfpFlags::empty()).unwrap();
    platform.cpu.store(1, Ordering::Relaxed);
    cache.free(x).unwrap();
    platform.cpu.store(0, Ordering::Relaxed);

    // The rest of the private freelist comes first.
    let rest: Vec<_> = (0..per_slab - 1)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();
    assert!(!rest.contains(&x));
    assert_eq!(cache.alloc(GfpFlags::empty()).unwrap(), x);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat(StatItem::AllocRefill), 1);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat_cpu(1, StatItem::FreeFrozen), 1);
    assert_eq!(cache.info().nr_slabs, 1);
}

#[test]
fn test_remote_free_of_full_slab_parks_it_on_the_freeing_cpu() {
    let platform = Arc::new(SwitchableCpu {
        nr_cpus: 2,
        cpu: AtomicUsize::new(0),
    });
    let a = SlabAllocator::new(
        Arc::new(HeapPageProvider::<4096>::new(1)),
        platform.clone(),
        SlabConfig::default(),
    )
    .unwrap();
    let cache = a
        .create_cache("t", 512, 8, CacheFlags::empty(), None)
        .unwrap();
    let per_slab = cache.layout().objects;

    // Fill one slab and move on to a second, leaving the first full.
    let objs: Vec<_> = (0..per_slab + 1)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();

    platform.cpu.store(1, Ordering::Relaxed);
    cache.free(objs[0]).unwrap();
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat_cpu(1, StatItem::CpuPartialFree), 1);
    // CPU 1 allocates from the slab it parked.
    assert_eq!(cache.alloc(GfpFlags::empty()).unwrap(), objs[0]);
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat_cpu(1, StatItem::CpuPartialAlloc), 1);

    a.cpu_offline(1);
    platform.cpu.store(0, Ordering::Relaxed);
    for obj in objs {
        cache.free(obj).unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.validate(), 0);
}

#[test]
fn test_cpu_partial_list_drains_past_its_limit() {
    let platform = Arc::new(SwitchableCpu {
        nr_cpus: 2,
        cpu: AtomicUsize::new(0),
    });
    let a = SlabAllocator::new(
        Arc::new(HeapPageProvider::<4096>::new(1)),
        platform.clone(),
        SlabConfig::default(),
    )
    .unwrap();
    let cache = a
        .create_cache("t", 1024, 8, CacheFlags::empty(), None)
        .unwrap();
    cache.set_cpu_partial(2).unwrap();
    let per_slab = cache.layout().objects;

    let objs: Vec<_> = (0..per_slab * 4 + 1)
        .map(|_| cache.alloc(GfpFlags::empty()).unwrap())
        .collect();

    // One free per full slab from the other CPU parks each of them.
    platform.cpu.store(1, Ordering::Relaxed);
    for slab in 0..4 {
        cache.free(objs[slab * per_slab]).unwrap();
    }
    #[cfg(feature = "tracking")]
    assert_eq!(cache.stat_cpu(1, StatItem::CpuPartialFree), 4);
    #[cfg(feature = "tracking")]
    assert!(cache.stat_cpu(1, StatItem::CpuPartialDrain) >= 1);
    assert!(cache.info().nr_partial >= 2);

    platform.cpu.store(0, Ordering::Relaxed);
    for (i, obj) in objs.into_iter().enumerate() {
        if i % per_slab != 0 || i == per_slab * 4 {
            cache.free(obj).unwrap();
        }
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.validate(), 0);
}

fn churn(cache: &SlabCache, inbox: &Mutex<Vec<usize>>, outbox: &Mutex<Vec<usize>>, rounds: usize) {
    let mut mine = Vec::new();
    for round in 0..rounds {
        for _ in 0..64 {
            mine.push(cache.alloc(GfpFlags::empty()).unwrap());
        }
        // Hand half to the neighbour, free what it handed us.
        let half = mine.split_off(mine.len() / 2);
        outbox.lock().unwrap().extend(addrs(&half));
        let foreign: Vec<usize> = std::mem::take(&mut *inbox.lock().unwrap());
        for addr in foreign {
            cache.free(ptr(addr)).unwrap();
        }
        if round % 2 == 1 {
            for obj in mine.drain(..) {
                cache.free(obj).unwrap();
            }
        }
    }
    for obj in mine {
        cache.free(obj).unwrap();
    }
}

#[test]
fn test_cross_cpu_churn() {
    const CPUS: usize = 4;
    let a = threaded_allocator(CPUS);
    let cache = a
        .create_cache("churn", 96, 8, CacheFlags::empty(), None)
        .unwrap();
    let boxes: Arc<Vec<Mutex<Vec<usize>>>> =
        Arc::new((0..CPUS).map(|_| Mutex::new(Vec::new())).collect());

    let handles: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let cache = cache.clone();
            let boxes = boxes.clone();
            thread::spawn(move || {
                CPU.with(|c| c.set(cpu));
                churn(&cache, &boxes[cpu], &boxes[(cpu + 1) % CPUS], 200);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Whatever is still in flight.
    for inbox in boxes.iter() {
        for addr in std::mem::take(&mut *inbox.lock().unwrap()) {
            cache.free(ptr(addr)).unwrap();
        }
    }
    assert_eq!(cache.live_objects(), 0);
    assert_eq!(cache.validate(), 0);
    cache.shrink();
    assert_eq!(cache.info().nr_slabs, 0);
    assert!(!cache.is_tainted());
}

#[test]
fn test_destroy_waits_for_readers_without_blocking_registry() {
    let a = Arc::new(threaded_allocator(2));
    let cache = a
        .create_cache("rcu", 64, 8, CacheFlags::TYPESAFE_BY_RCU, None)
        .unwrap();
    let obj = cache.alloc(GfpFlags::empty()).unwrap();
    cache.free(obj).unwrap();

    let guard = a.rcu().read_lock();
    let destroyer = {
        let a = a.clone();
        thread::spawn(move || a.destroy_cache(cache))
    };
    while a.find_cache("rcu").is_some() {
        thread::yield_now();
    }
    // The destroyer sits in the grace period; the registry stays usable.
    assert!(a.find_cache("kmalloc-8").is_some());
    let other = a
        .create_cache("other", 32, 8, CacheFlags::empty(), None)
        .unwrap();
    thread::sleep(std::time::Duration::from_millis(50));
    assert!(!destroyer.is_finished());

    drop(guard);
    assert_eq!(destroyer.join().unwrap(), Ok(()));
    assert_eq!(a.rcu().pending(), 0);
    a.destroy_cache(other).unwrap();
}
