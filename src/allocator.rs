//! Allocator registry.
//!
//! A [`SlabAllocator`] ties the page provider, the platform and the RCU
//! domain together, owns every cache created through it and provides the
//! generalized `kmalloc` caches.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{info, warn};

use crate::debug::DebugOptions;
use crate::flags::{CacheFlags, GfpFlags};
use crate::kmalloc::KmallocCaches;
use crate::page_provider::PageProvider;
use crate::platform::SlabPlatform;
use crate::rcu::RcuDomain;
use crate::slab::{CacheEnv, Constructor, SlabCache, DEFAULT_SLAB_MAX_ORDER};
use crate::{AllocError, AllocResult};

/// Allocator-wide tunables, fixed at construction.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    /// Preferred upper bound on a cache's slab order.
    pub max_order: u32,
    /// Lower bound on a cache's slab order.
    pub min_order: u32,
    /// Objects-per-slab target; derived from the CPU count when `None`.
    pub min_objects: Option<usize>,
    /// Obfuscate stored freelist pointers.
    pub harden_freelist: bool,
    /// Link fresh slabs in a random order.
    pub randomize_freelist: bool,
    /// Allow per-CPU partial lists.
    pub cpu_partial: bool,
    /// Debug flags applied per cache at creation.
    pub debug: DebugOptions,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            max_order: DEFAULT_SLAB_MAX_ORDER,
            min_order: 0,
            min_objects: None,
            harden_freelist: true,
            randomize_freelist: false,
            cpu_partial: true,
            debug: DebugOptions::none(),
        }
    }
}

/// Slab allocator instance.
pub struct SlabAllocator {
    env: CacheEnv,
    caches: SpinNoIrq<Vec<Arc<SlabCache>>>,
    kmalloc: KmallocCaches,
}

impl SlabAllocator {
    /// Build an allocator and its `kmalloc` caches.
    pub fn new(
        provider: Arc<dyn PageProvider>,
        platform: Arc<dyn SlabPlatform>,
        config: SlabConfig,
    ) -> AllocResult<Self> {
        if config.min_order > config.max_order || config.max_order > provider.max_order() {
            return Err(AllocError::InvalidParam);
        }
        let env = CacheEnv {
            provider,
            platform,
            rcu: Arc::new(RcuDomain::new()),
            config,
        };
        let kmalloc = KmallocCaches::new(&env)?;
        let caches = SpinNoIrq::new(kmalloc.caches().to_vec());
        info!(
            "slab allocator: {} cpus, {} nodes, page size {:#x}",
            env.platform.nr_cpus(),
            env.platform.nr_nodes(),
            env.provider.page_size()
        );
        Ok(Self {
            env,
            caches,
            kmalloc,
        })
    }

    /// Create a cache of `size`-byte objects aligned to `align` (0 for the
    /// natural alignment). Names must be unique.
    pub fn create_cache(
        &self,
        name: &str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<Constructor>,
    ) -> AllocResult<Arc<SlabCache>> {
        if name.is_empty() || size == 0 || (align != 0 && !align.is_power_of_two()) {
            return Err(AllocError::InvalidParam);
        }
        let align = if align == 0 {
            core::mem::align_of::<usize>()
        } else {
            align
        };
        let mut caches = self.caches.lock();
        if caches.iter().any(|c| c.name() == name) {
            warn!("slab allocator: cache {} already exists", name);
            return Err(AllocError::InvalidParam);
        }
        let cache = SlabCache::create(name, size, align, flags, ctor, &self.env)?;
        caches.push(cache.clone());
        Ok(cache)
    }

    /// Destroy a cache. Fails with [`AllocError::CacheBusy`] while objects
    /// are still allocated; the cache then stays registered.
    ///
    /// The cache is unregistered before teardown, which may wait for an RCU
    /// grace period, so lookups and creation go on meanwhile.
    pub fn destroy_cache(&self, cache: Arc<SlabCache>) -> AllocResult {
        if self.kmalloc.caches().iter().any(|c| Arc::ptr_eq(c, &cache)) {
            return Err(AllocError::InvalidParam);
        }
        {
            let mut caches = self.caches.lock();
            let pos = caches
                .iter()
                .position(|c| Arc::ptr_eq(c, &cache))
                .ok_or(AllocError::InvalidParam)?;
            caches.remove(pos);
        }
        if let Err(err) = cache.shutdown() {
            self.caches.lock().push(cache);
            return Err(err);
        }
        Ok(())
    }

    /// Look a cache up by name.
    pub fn find_cache(&self, name: &str) -> Option<Arc<SlabCache>> {
        self.caches.lock().iter().find(|c| c.name() == name).cloned()
    }

    /// Every registered cache, `kmalloc` caches included.
    pub fn caches(&self) -> Vec<Arc<SlabCache>> {
        self.caches.lock().clone()
    }

    /// Shrink every cache. Returns the number of slabs released.
    pub fn shrink_all(&self) -> usize {
        self.caches().iter().map(|c| c.shrink()).sum()
    }

    /// Flush the per-CPU state of `cpu` in every cache, as when the CPU
    /// goes offline.
    pub fn cpu_offline(&self, cpu: usize) {
        for cache in self.caches() {
            cache.flush_cpu(cpu);
        }
    }

    /// The generalized sized caches.
    pub fn kmalloc_caches(&self) -> &KmallocCaches {
        &self.kmalloc
    }

    /// Allocate `size` bytes from the smallest fitting `kmalloc` cache, or
    /// straight from the page provider for large sizes.
    #[track_caller]
    pub fn kmalloc(&self, size: usize, gfp: GfpFlags) -> AllocResult<NonNull<u8>> {
        self.kmalloc.kmalloc(size, gfp)
    }

    /// [`kmalloc`](Self::kmalloc) on a preferred node.
    #[track_caller]
    pub fn kmalloc_node(
        &self,
        size: usize,
        gfp: GfpFlags,
        node: Option<usize>,
    ) -> AllocResult<NonNull<u8>> {
        self.kmalloc.kmalloc_node(size, gfp, node)
    }

    /// Free memory returned by [`kmalloc`](Self::kmalloc).
    #[track_caller]
    pub fn kfree(&self, ptr: NonNull<u8>) -> AllocResult {
        self.kmalloc.kfree(ptr)
    }

    /// Usable size of a `kmalloc` allocation, `None` for foreign pointers.
    pub fn ksize(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.kmalloc.ksize(ptr)
    }

    /// Reclamation domain of typesafe-by-RCU caches.
    pub fn rcu(&self) -> &RcuDomain {
        &self.env.rcu
    }

    /// Page provider backing every cache.
    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.env.provider
    }

    /// CPU and node topology in use.
    pub fn platform(&self) -> &Arc<dyn SlabPlatform> {
        &self.env.platform
    }
}
