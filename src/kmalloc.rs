//! Generalized sized caches.
//!
//! Requests up to [`SizeClass::MAX_OBJ_SIZE`] bytes are served by one
//! cache per power-of-two size class; larger requests go straight to the
//! page provider.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::flags::{CacheFlags, GfpFlags};
use crate::page_provider::PageProvider;
use crate::slab::{CacheEnv, SlabCache};
use crate::{get_order, AllocError, AllocResult};

/// Size classes of the generalized caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SizeClass {
    Bytes8 = 8,
    Bytes16 = 16,
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
    Bytes1024 = 1024,
    Bytes2048 = 2048,
    Bytes4096 = 4096,
    Bytes8192 = 8192,
}

impl SizeClass {
    pub const COUNT: usize = 11;
    pub const MAX_OBJ_SIZE: usize = 8192;

    /// Smallest class holding `size` bytes.
    pub fn from_size(size: usize) -> Option<Self> {
        if size > Self::MAX_OBJ_SIZE {
            return None;
        }
        let index = size.max(8).next_power_of_two().trailing_zeros() as usize - 3;
        Self::from_index(index)
    }

    /// Select size class from memory layout
    pub fn from_layout(layout: Layout) -> Option<Self> {
        let required_size = layout.size().max(layout.align());
        let class = Self::from_size(required_size);
        if class.is_none() {
            warn!(
                "Invalid layout: size={}, align={}",
                layout.size(),
                layout.align()
            );
        }
        class
    }

    pub fn size(&self) -> usize {
        *self as usize
    }

    pub fn to_index(&self) -> usize {
        self.size().trailing_zeros() as usize - 3
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SizeClass::Bytes8),
            1 => Some(SizeClass::Bytes16),
            2 => Some(SizeClass::Bytes32),
            3 => Some(SizeClass::Bytes64),
            4 => Some(SizeClass::Bytes128),
            5 => Some(SizeClass::Bytes256),
            6 => Some(SizeClass::Bytes512),
            7 => Some(SizeClass::Bytes1024),
            8 => Some(SizeClass::Bytes2048),
            9 => Some(SizeClass::Bytes4096),
            10 => Some(SizeClass::Bytes8192),
            _ => None,
        }
    }
}

/// The `kmalloc-*` caches plus the bookkeeping of large allocations.
pub struct KmallocCaches {
    caches: Vec<Arc<SlabCache>>,
    /// Page-backed allocations: address to order.
    large: SpinNoIrq<BTreeMap<usize, u32>>,
    provider: Arc<dyn PageProvider>,
}

impl KmallocCaches {
    pub(crate) fn new(env: &CacheEnv) -> AllocResult<Self> {
        let caches = (0..SizeClass::COUNT)
            .filter_map(SizeClass::from_index)
            .map(|class| {
                let name = format!("kmalloc-{}", class.size());
                SlabCache::create(&name, class.size(), class.size(), CacheFlags::empty(), None, env)
            })
            .collect::<AllocResult<Vec<_>>>()?;
        Ok(Self {
            caches,
            large: SpinNoIrq::new(BTreeMap::new()),
            provider: env.provider.clone(),
        })
    }

    /// Cache serving `class`.
    pub fn cache(&self, class: SizeClass) -> &Arc<SlabCache> {
        &self.caches[class.to_index()]
    }

    /// All size-class caches, smallest first.
    pub fn caches(&self) -> &[Arc<SlabCache>] {
        &self.caches
    }

    #[track_caller]
    pub fn kmalloc(&self, size: usize, gfp: GfpFlags) -> AllocResult<NonNull<u8>> {
        self.kmalloc_node(size, gfp, None)
    }

    /// Allocate `size` bytes, preferably on `node`.
    #[track_caller]
    pub fn kmalloc_node(
        &self,
        size: usize,
        gfp: GfpFlags,
        node: Option<usize>,
    ) -> AllocResult<NonNull<u8>> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }
        if let Some(class) = SizeClass::from_size(size) {
            return self.caches[class.to_index()].alloc_node(gfp, node);
        }

        let page_size = self.provider.page_size();
        let order = get_order(size, page_size);
        if order > self.provider.max_order() {
            return Err(AllocError::ObjectTooLarge);
        }
        let block = self.provider.alloc_pages(order, gfp - GfpFlags::ZERO, node)?;
        if gfp.contains(GfpFlags::ZERO) {
            unsafe { core::ptr::write_bytes(block.addr as *mut u8, 0, page_size << order) };
        }
        self.large.lock().insert(block.addr, order);
        debug!("kmalloc: {} bytes as order {} block {:#x}", size, order, block.addr);
        NonNull::new(block.addr as *mut u8).ok_or(AllocError::NoMemory)
    }

    /// Size-class cache owning `addr`.
    fn owner(&self, addr: usize) -> Option<&Arc<SlabCache>> {
        let slab = self.provider.slab_of(addr)?;
        let cache = unsafe { slab.as_ref() }.cache_ptr();
        self.caches.iter().find(|c| core::ptr::eq(Arc::as_ptr(c), cache))
    }

    /// Release memory obtained from [`kmalloc`](Self::kmalloc).
    #[track_caller]
    pub fn kfree(&self, ptr: NonNull<u8>) -> AllocResult {
        let addr = ptr.as_ptr() as usize;
        let large = self.large.lock().remove(&addr);
        if let Some(order) = large {
            self.provider.free_pages(addr, order);
            return Ok(());
        }
        self.owner(addr).ok_or(AllocError::NotAllocated)?.free(ptr)
    }

    /// Usable size of the allocation at `ptr`.
    pub fn ksize(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        if let Some(&order) = self.large.lock().get(&addr) {
            return Some(self.provider.page_size() << order);
        }
        self.owner(addr).map(|c| c.object_size())
    }
}
