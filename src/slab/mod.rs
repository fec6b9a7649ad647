//! Slab object caches.
//!
//! This module implements the SLUB-style cache engine: per-CPU fast paths,
//! frozen slabs, per-CPU and per-node partial lists, and the debug
//! allocation path.

mod alloc_path;
mod cpu_slab;
mod free_path;
mod freelist;
mod layout;
mod node_pool;
mod page;
mod slab_cache;

// Re-export public types
pub use layout::{CacheLayout, CACHE_LINE_SIZE, DEFAULT_SLAB_MAX_ORDER, MAX_OBJS_PER_SLAB};
pub use page::Slab;
pub use slab_cache::{Constructor, SlabCache, MAX_DEFRAG_RATIO, MAX_PARTIAL, MIN_PARTIAL};

pub(crate) use layout::LayoutParams;
pub(crate) use slab_cache::CacheEnv;
