//! Page-level backing store for slabs.
//!
//! The slab engine never manages pages itself; it asks a [`PageProvider`]
//! for `2^order` contiguous pages and hands them back when a slab is
//! discarded. The provider also owns the reverse mapping from an address
//! to the slab descriptor covering it.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::flags::GfpFlags;
use crate::slab::Slab;
use crate::{AllocError, AllocResult};

/// Largest order the reference provider hands out.
pub const DEFAULT_MAX_PAGE_ORDER: u32 = 10;

/// A block of `2^order` pages returned by [`PageProvider::alloc_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBlock {
    /// Address of the first byte of the block.
    pub addr: usize,
    /// Memory node the block lives on.
    pub node: usize,
}

/// Page allocator interface consumed by the slab engine.
pub trait PageProvider: Send + Sync {
    /// Size of one page in bytes.
    fn page_size(&self) -> usize;

    /// Largest order `alloc_pages` can satisfy.
    fn max_order(&self) -> u32;

    /// Allocate `2^order` contiguous pages, aligned to their size, preferably
    /// on `node` (`None` means any node).
    fn alloc_pages(&self, order: u32, gfp: GfpFlags, node: Option<usize>)
        -> AllocResult<PageBlock>;

    /// Release a block previously returned by `alloc_pages`.
    fn free_pages(&self, addr: usize, order: u32);

    /// Tag the block starting at `addr` as backing `slab` (or clear the tag).
    fn set_slab(&self, addr: usize, slab: Option<NonNull<Slab>>);

    /// Slab descriptor whose block contains `addr`, if any.
    fn slab_of(&self, addr: usize) -> Option<NonNull<Slab>>;
}

struct BlockInfo {
    order: u32,
    node: usize,
    layout: Layout,
    slab: usize,
}

struct HeapInner {
    blocks: BTreeMap<usize, BlockInfo>,
    pages_in_use: Vec<usize>,
    node_limits: Vec<Option<usize>>,
    page_limit: Option<usize>,
}

impl HeapInner {
    fn total_in_use(&self) -> usize {
        self.pages_in_use.iter().sum()
    }

    fn node_can_take(&self, node: usize, pages: usize) -> bool {
        if let Some(limit) = self.page_limit {
            if self.total_in_use() + pages > limit {
                return false;
            }
        }
        match self.node_limits[node] {
            Some(limit) => self.pages_in_use[node] + pages <= limit,
            None => true,
        }
    }
}

/// Reference page provider carving blocks out of the global heap.
///
/// Nodes are simulated: every block is labelled with the node it was
/// requested on, and per-node page limits make a node look exhausted so
/// that cross-node fallback can be exercised.
pub struct HeapPageProvider<const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }> {
    nr_nodes: usize,
    max_order: u32,
    inner: SpinNoIrq<HeapInner>,
    alloc_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

impl<const PAGE_SIZE: usize> HeapPageProvider<PAGE_SIZE> {
    /// Create a provider spanning `nr_nodes` simulated nodes.
    pub fn new(nr_nodes: usize) -> Self {
        let nr_nodes = nr_nodes.max(1);
        Self {
            nr_nodes,
            max_order: DEFAULT_MAX_PAGE_ORDER,
            inner: SpinNoIrq::new(HeapInner {
                blocks: BTreeMap::new(),
                pages_in_use: vec![0; nr_nodes],
                node_limits: vec![None; nr_nodes],
                page_limit: None,
            }),
            alloc_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
        }
    }

    /// Cap the total number of pages handed out across all nodes.
    pub fn with_page_limit(self, pages: usize) -> Self {
        self.inner.lock().page_limit = Some(pages);
        self
    }

    /// Cap the pages handed out from one node (`None` lifts the cap).
    pub fn set_node_page_limit(&self, node: usize, pages: Option<usize>) {
        self.inner.lock().node_limits[node] = pages;
    }

    /// Number of `alloc_pages` calls so far, successful or not.
    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::Relaxed)
    }

    /// Number of `free_pages` calls so far.
    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::Relaxed)
    }

    /// Pages currently handed out.
    pub fn pages_in_use(&self) -> usize {
        self.inner.lock().total_in_use()
    }

    /// Pages currently handed out from `node`.
    pub fn node_pages_in_use(&self, node: usize) -> usize {
        self.inner.lock().pages_in_use[node]
    }

    /// Number of blocks currently handed out.
    pub fn blocks_in_use(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

impl<const PAGE_SIZE: usize> PageProvider for HeapPageProvider<PAGE_SIZE> {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn max_order(&self) -> u32 {
        self.max_order
    }

    fn alloc_pages(
        &self,
        order: u32,
        gfp: GfpFlags,
        node: Option<usize>,
    ) -> AllocResult<PageBlock> {
        self.alloc_calls.fetch_add(1, Ordering::Relaxed);
        if order > self.max_order {
            return Err(AllocError::InvalidParam);
        }
        let pages = 1usize << order;
        let bytes = PAGE_SIZE << order;
        let layout = Layout::from_size_align(bytes, bytes).map_err(|_| AllocError::InvalidParam)?;

        let mut inner = self.inner.lock();
        let preferred = node.unwrap_or(0).min(self.nr_nodes - 1);
        let chosen = if inner.node_can_take(preferred, pages) {
            preferred
        } else if gfp.contains(GfpFlags::THISNODE) {
            return Err(AllocError::NoMemory);
        } else {
            match (0..self.nr_nodes).find(|&n| n != preferred && inner.node_can_take(n, pages)) {
                Some(n) => n,
                None => {
                    if !gfp.contains(GfpFlags::NOWARN) {
                        warn!(
                            "page provider: out of pages for order {} on node {}",
                            order, preferred
                        );
                    }
                    return Err(AllocError::NoMemory);
                }
            }
        };

        let addr = unsafe { alloc::alloc::alloc(layout) } as usize;
        if addr == 0 {
            return Err(AllocError::NoMemory);
        }

        inner.pages_in_use[chosen] += pages;
        inner.blocks.insert(
            addr,
            BlockInfo {
                order,
                node: chosen,
                layout,
                slab: 0,
            },
        );
        debug!(
            "page provider: order {} block at {:#x} on node {}",
            order, addr, chosen
        );
        Ok(PageBlock { addr, node: chosen })
    }

    fn free_pages(&self, addr: usize, order: u32) {
        self.free_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let Some(info) = inner.blocks.remove(&addr) else {
            warn!("page provider: freeing unknown block {:#x}", addr);
            return;
        };
        debug_assert_eq!(info.order, order, "block freed with a different order");
        inner.pages_in_use[info.node] -= 1usize << info.order;
        drop(inner);
        unsafe { alloc::alloc::dealloc(addr as *mut u8, info.layout) };
    }

    fn set_slab(&self, addr: usize, slab: Option<NonNull<Slab>>) {
        if let Some(info) = self.inner.lock().blocks.get_mut(&addr) {
            info.slab = slab.map_or(0, |s| s.as_ptr() as usize);
        }
    }

    fn slab_of(&self, addr: usize) -> Option<NonNull<Slab>> {
        let inner = self.inner.lock();
        let (&base, info) = inner.blocks.range(..=addr).next_back()?;
        if addr >= base + (PAGE_SIZE << info.order) {
            return None;
        }
        NonNull::new(info.slab as *mut Slab)
    }
}

impl<const PAGE_SIZE: usize> Drop for HeapPageProvider<PAGE_SIZE> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (addr, info) in core::mem::take(&mut inner.blocks) {
            unsafe { alloc::alloc::dealloc(addr as *mut u8, info.layout) };
        }
    }
}
