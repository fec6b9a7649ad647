//! Cache creation flags and per-request allocation flags.

use bitflags::bitflags;

bitflags! {
    /// Flags fixed at cache creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CacheFlags: u32 {
        /// Run the free-path and allocation-path consistency checks.
        const CONSISTENCY_CHECKS = 1 << 0;
        /// Surround every object with redzone sentinels.
        const RED_ZONE = 1 << 1;
        /// Fill free objects with the poison pattern.
        const POISON = 1 << 2;
        /// Keep allocation and free track records per object.
        const STORE_USER = 1 << 3;
        /// Log every allocation and free.
        const TRACE = 1 << 4;
        /// Align objects to the hardware cache line.
        const HWCACHE_ALIGN = 1 << 5;
        /// Back slabs with DMA zone pages.
        const CACHE_DMA = 1 << 6;
        /// Back slabs with DMA32 zone pages.
        const CACHE_DMA32 = 1 << 7;
        /// Slab pages are reclaimable under memory pressure.
        const RECLAIM_ACCOUNT = 1 << 8;
        /// Slab pages are released only after an RCU grace period.
        const TYPESAFE_BY_RCU = 1 << 9;
        /// Allocations consult the fail-injection hook.
        const FAILSLAB = 1 << 10;
        /// Objects are not reported to a leak tracer.
        const NOLEAKTRACE = 1 << 11;
        /// Objects are charged to the caller's accounting group.
        const ACCOUNT = 1 << 12;
        /// Do not emit the out-of-memory diagnostic.
        const NO_WARN = 1 << 13;
        /// Build slab freelists in a per-cache random order.
        const RANDOM_FREELIST = 1 << 14;

        /// Every flag that forces the debug allocation path.
        const DEBUG_FLAGS = Self::CONSISTENCY_CHECKS.bits()
            | Self::RED_ZONE.bits()
            | Self::POISON.bits()
            | Self::STORE_USER.bits()
            | Self::TRACE.bits();
        /// Flags that grow an object's footprint.
        const DEBUG_LAYOUT_FLAGS = Self::RED_ZONE.bits()
            | Self::POISON.bits()
            | Self::STORE_USER.bits();
    }
}

impl CacheFlags {
    /// Whether allocations from a cache with these flags must go through the
    /// debug path.
    pub fn is_debug(self) -> bool {
        self.intersects(CacheFlags::DEBUG_FLAGS)
    }
}

bitflags! {
    /// Per-request allocation flags handed to the cache and the page provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GfpFlags: u32 {
        /// The caller may sleep while pages are being found.
        const MAY_BLOCK = 1 << 0;
        /// Zero the object before returning it.
        const ZERO = 1 << 1;
        /// The request may dip into reserves.
        const HIGH = 1 << 2;
        /// The allocation must not fail; retry in the page provider.
        const NOFAIL = 1 << 3;
        /// Give up on the first page provider failure.
        const NORETRY = 1 << 4;
        /// Suppress the out-of-memory diagnostic.
        const NOWARN = 1 << 5;
        /// Pages must come from the DMA zone.
        const DMA = 1 << 6;
        /// Pages must come from the DMA32 zone.
        const DMA32 = 1 << 7;
        /// Pages are reclaimable.
        const RECLAIMABLE = 1 << 8;
        /// Only the requested node is acceptable.
        const THISNODE = 1 << 9;
    }
}

impl GfpFlags {
    /// Zone and mobility modifiers implied by the cache's creation flags.
    pub fn from_cache_flags(flags: CacheFlags) -> Self {
        let mut gfp = GfpFlags::empty();
        if flags.contains(CacheFlags::CACHE_DMA) {
            gfp |= GfpFlags::DMA;
        }
        if flags.contains(CacheFlags::CACHE_DMA32) {
            gfp |= GfpFlags::DMA32;
        }
        if flags.contains(CacheFlags::RECLAIM_ACCOUNT) {
            gfp |= GfpFlags::RECLAIMABLE;
        }
        gfp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flags() {
        assert!(!CacheFlags::HWCACHE_ALIGN.is_debug());
        assert!(CacheFlags::RED_ZONE.is_debug());
        assert!((CacheFlags::TRACE | CacheFlags::CACHE_DMA).is_debug());
        assert!(CacheFlags::default().is_empty());
    }

    #[test]
    fn test_zone_modifiers() {
        let gfp = GfpFlags::from_cache_flags(CacheFlags::CACHE_DMA32 | CacheFlags::POISON);
        assert_eq!(gfp, GfpFlags::DMA32);
    }
}
