//! Object layout and slab order computation.

use core::mem::size_of;

use crate::debug::Track;
use crate::flags::CacheFlags;
use crate::{align_down, align_up, get_order, AllocError, AllocResult};

/// A slab's `objects` field is 15 bits wide.
pub const MAX_OBJS_PER_SLAB: usize = (1 << 15) - 1;

/// Default upper bound on the order picked for a cache.
pub const DEFAULT_SLAB_MAX_ORDER: u32 = 3;

/// Cache line used for `HWCACHE_ALIGN`.
pub const CACHE_LINE_SIZE: usize = 64;

const PTR_SIZE: usize = size_of::<usize>();

/// Inputs to the layout computation that come from the environment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutParams {
    pub page_size: usize,
    /// Preferred upper bound on the order.
    pub max_order: u32,
    /// Hard upper bound imposed by the page provider.
    pub provider_max_order: u32,
    /// Lower bound on the order.
    pub min_order: u32,
    /// Override for the objects-per-slab target.
    pub min_objects: Option<usize>,
    pub nr_cpus: usize,
}

/// Computed geometry of a cache's objects and slabs.
///
/// Per-object layout, relative to the start of a slot:
///
/// ```text
/// [ red_left_pad ][ payload | right redzone ][ free pointer ][ tracks ][ pad ]
///                 ^ object                  ^ offset (when outside)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    /// Payload size requested by the cache creator.
    pub object_size: usize,
    /// Alignment of every object.
    pub align: usize,
    /// Payload plus right redzone, relative to the object.
    pub inuse: usize,
    /// Distance between consecutive slots.
    pub size: usize,
    /// Offset of the free pointer, relative to the object.
    pub offset: usize,
    /// Bytes in front of every object carrying the left redzone.
    pub red_left_pad: usize,
    /// Order of fresh slabs.
    pub order: u32,
    /// Smallest order holding one object.
    pub min_order: u32,
    /// Objects in a slab of `order`.
    pub objects: usize,
    /// Free objects are filled with the poison pattern.
    pub poison_object: bool,
    /// Flags after layout adjustments.
    pub flags: CacheFlags,
}

impl CacheLayout {
    /// Compute the layout for a cache or fail if no supported order fits.
    pub(crate) fn calculate(
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        has_ctor: bool,
        params: &LayoutParams,
    ) -> AllocResult<Self> {
        if object_size == 0 || !align.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        let align = calculate_alignment(flags, align, object_size);

        let mut size = align_up(object_size, PTR_SIZE);
        let poison_object = flags.contains(CacheFlags::POISON)
            && !flags.contains(CacheFlags::TYPESAFE_BY_RCU)
            && !has_ctor;

        // Leave room for a right redzone when the payload is word-exact.
        if flags.contains(CacheFlags::RED_ZONE) && size == object_size {
            size += PTR_SIZE;
        }
        let inuse = size;

        let fp_outside = flags.intersects(CacheFlags::TYPESAFE_BY_RCU | CacheFlags::POISON)
            || has_ctor
            || (flags.contains(CacheFlags::RED_ZONE) && object_size < PTR_SIZE);
        let offset = if fp_outside {
            let offset = size;
            size += PTR_SIZE;
            offset
        } else {
            align_down(object_size / 2, PTR_SIZE)
        };

        if flags.contains(CacheFlags::STORE_USER) {
            size += 2 * size_of::<Track>();
        }

        let mut red_left_pad = 0;
        if flags.contains(CacheFlags::RED_ZONE) {
            size += PTR_SIZE;
            red_left_pad = align_up(PTR_SIZE, align);
            size += red_left_pad;
        }
        let size = align_up(size, align);

        let order = calculate_order(size, params)?;
        let objects = order_objects(order, size, params.page_size);
        Ok(Self {
            object_size,
            align,
            inuse,
            size,
            offset,
            red_left_pad,
            order,
            min_order: get_order(size, params.page_size),
            objects,
            poison_object,
            flags,
        })
    }

    /// End of the free pointer and tracks, relative to the object.
    pub fn metadata_end(&self) -> usize {
        let mut off = self.inuse;
        if self.offset >= self.inuse {
            off += PTR_SIZE;
        }
        if self.flags.contains(CacheFlags::STORE_USER) {
            off += 2 * size_of::<Track>();
        }
        off
    }

    /// Objects in a slab of `order`.
    pub fn objects_for_order(&self, order: u32, page_size: usize) -> usize {
        order_objects(order, self.size, page_size)
    }
}

fn calculate_alignment(flags: CacheFlags, align: usize, size: usize) -> usize {
    let mut align = align;
    if flags.contains(CacheFlags::HWCACHE_ALIGN) {
        let mut ralign = CACHE_LINE_SIZE;
        while size <= ralign / 2 {
            ralign /= 2;
        }
        align = align.max(ralign);
    }
    align.max(PTR_SIZE)
}

fn order_objects(order: u32, size: usize, page_size: usize) -> usize {
    ((page_size << order) / size).min(MAX_OBJS_PER_SLAB)
}

/// Find the lowest order in `min..=max_order` whose leftover is at most
/// `1/fract_leftover` of the slab. Returns `max_order + 1` if none fits.
fn slab_order(
    size: usize,
    min_objects: usize,
    max_order: u32,
    fract_leftover: usize,
    params: &LayoutParams,
) -> u32 {
    let page_size = params.page_size;
    let min_order = params
        .min_order
        .max(get_order(min_objects * size, page_size));
    if (page_size << min_order) / size > MAX_OBJS_PER_SLAB {
        return get_order(size * MAX_OBJS_PER_SLAB, page_size).saturating_sub(1);
    }

    let mut order = min_order;
    while order <= max_order {
        let slab_size = page_size << order;
        let rem = slab_size % size;
        if slab_size >= size && rem <= slab_size / fract_leftover {
            break;
        }
        order += 1;
    }
    order
}

fn calculate_order(size: usize, params: &LayoutParams) -> AllocResult<u32> {
    let max_order = params.max_order.min(params.provider_max_order);
    let fls = usize::BITS - params.nr_cpus.max(1).leading_zeros();
    let mut min_objects = params
        .min_objects
        .unwrap_or(4 * (fls as usize + 1));
    min_objects = min_objects.min(order_objects(max_order, size, params.page_size));

    while min_objects > 1 {
        let mut fraction = 16;
        while fraction >= 4 {
            let order = slab_order(size, min_objects, max_order, fraction, params);
            if order <= max_order {
                return Ok(order);
            }
            fraction /= 2;
        }
        min_objects -= 1;
    }

    // Accept any leftover with a single object.
    let order = slab_order(size, 1, max_order, 1, params);
    if order <= max_order {
        return Ok(order);
    }
    let order = slab_order(size, 1, params.provider_max_order, 1, params);
    if order <= params.provider_max_order {
        return Ok(order);
    }
    Err(AllocError::ObjectTooLarge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(nr_cpus: usize) -> LayoutParams {
        LayoutParams {
            page_size: 4096,
            max_order: DEFAULT_SLAB_MAX_ORDER,
            provider_max_order: 10,
            min_order: 0,
            min_objects: None,
            nr_cpus,
        }
    }

    #[test]
    fn test_plain_small_object() {
        let layout =
            CacheLayout::calculate(24, 8, CacheFlags::empty(), false, &params(1)).unwrap();
        assert_eq!(layout.size, 24);
        assert_eq!(layout.inuse, 24);
        assert_eq!(layout.offset, 8);
        assert_eq!(layout.order, 0);
        assert_eq!(layout.objects, 170);
        assert_eq!(layout.red_left_pad, 0);
    }

    #[test]
    fn test_free_pointer_outside_when_poisoned() {
        let flags = CacheFlags::RED_ZONE | CacheFlags::POISON;
        let layout = CacheLayout::calculate(64, 8, flags, false, &params(1)).unwrap();
        assert_eq!(layout.inuse, 72);
        assert_eq!(layout.offset, 72);
        assert_eq!(layout.red_left_pad, 8);
        assert_eq!(layout.size, 96);
        assert!(layout.poison_object);
    }

    #[test]
    fn test_ctor_disables_poisoning() {
        let layout =
            CacheLayout::calculate(40, 8, CacheFlags::POISON, true, &params(1)).unwrap();
        assert!(!layout.poison_object);
        assert_eq!(layout.offset, 40);
    }

    #[test]
    fn test_store_user_reserves_tracks() {
        let layout =
            CacheLayout::calculate(32, 8, CacheFlags::STORE_USER, false, &params(1)).unwrap();
        assert_eq!(layout.size, 32 + 2 * size_of::<Track>());
        assert_eq!(layout.metadata_end(), layout.size);
    }

    #[test]
    fn test_hwcache_align() {
        let layout =
            CacheLayout::calculate(40, 8, CacheFlags::HWCACHE_ALIGN, false, &params(1)).unwrap();
        assert_eq!(layout.align, 64);
        assert_eq!(layout.size, 64);
        let small =
            CacheLayout::calculate(12, 8, CacheFlags::HWCACHE_ALIGN, false, &params(1)).unwrap();
        assert_eq!(small.align, 16);
    }

    #[test]
    fn test_large_objects_pick_higher_order() {
        let layout =
            CacheLayout::calculate(2048, 8, CacheFlags::empty(), false, &params(1)).unwrap();
        assert_eq!(layout.order, 2);
        assert_eq!(layout.objects, 8);
        assert_eq!(layout.min_order, 0);
    }

    #[test]
    fn test_single_object_slab() {
        let layout =
            CacheLayout::calculate(3000, 8, CacheFlags::empty(), false, &params(1)).unwrap();
        assert!(layout.objects >= 1);
        assert!(layout.size * layout.objects <= 4096 << layout.order);
    }

    #[test]
    fn test_too_large() {
        let err = CacheLayout::calculate(
            (4096 << 10) + 1,
            8,
            CacheFlags::empty(),
            false,
            &params(1),
        );
        assert_eq!(err, Err(AllocError::ObjectTooLarge));
    }

    #[test]
    fn test_invalid_params() {
        assert_eq!(
            CacheLayout::calculate(0, 8, CacheFlags::empty(), false, &params(1)),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(
            CacheLayout::calculate(16, 12, CacheFlags::empty(), false, &params(1)),
            Err(AllocError::InvalidParam)
        );
    }
}
