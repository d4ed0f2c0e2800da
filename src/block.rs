//! A block is one virtual-memory mapping subdivided into fixed-size areas.
//!
//! Occupancy is tracked by two bit vectors: `used` (one bit per area, 1 =
//! occupied) and `stop` (bit `i` set marks area `i` as the last area of an
//! allocation). The stop sentinel lets release recover an allocation's
//! length by scanning forward for the next set bit — no per-allocation
//! metadata is stored anywhere.
//!
//! `largest_unused_area` and the `[search_start, search_end)` window are a
//! cache over the `used` vector: authoritative while the `DIRTY` flag is
//! clear, pessimistic hints once any mark operation runs. A failed full scan
//! re-derives them and clears `DIRTY` again.

use crate::bits::{self, BitWord};
use crate::vm::DualMapping;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

/// Index of a block in the allocator's slab.
pub(crate) type BlockId = usize;

pub(crate) mod flags {
    /// Area 0 is a pre-occupied guard; doubles as the initial area start.
    pub(crate) const INITIAL_PADDING: u32 = 0x0000_0001;
    /// No areas beyond the padding are occupied.
    pub(crate) const EMPTY: u32 = 0x0000_0002;
    /// `largest_unused_area` / search window may be stale.
    pub(crate) const DIRTY: u32 = 0x0000_0004;
    /// The mapping has distinct RX and RW views.
    pub(crate) const DUAL_MAPPED: u32 = 0x0000_0008;
}

pub(crate) struct Block {
    pub(crate) pool_id: usize,
    mapping: DualMapping,
    pub(crate) block_size: usize,
    flags: u32,
    /// Number of areas (bits) in this block.
    pub(crate) area_size: u32,
    /// Number of occupied areas (set bits in `used`).
    pub(crate) area_used: u32,
    /// Length of the largest free run. Exact when `DIRTY` is clear.
    pub(crate) largest_unused_area: u32,
    /// Search window start. The window contains every free area.
    pub(crate) search_start: u32,
    /// Search window end (exclusive).
    pub(crate) search_end: u32,
    pub(crate) used: Vec<BitWord>,
    pub(crate) stop: Vec<BitWord>,
    /// Debug shadow of allocation start areas; catches double release and
    /// releases through interior pointers before they corrupt the vectors.
    #[cfg(debug_assertions)]
    live_starts: FixedBitSet,
}

impl Block {
    pub(crate) fn new(
        pool_id: usize,
        mapping: DualMapping,
        block_size: usize,
        block_flags: u32,
        area_size: u32,
    ) -> Self {
        let words = bits::word_count_for(area_size as usize);
        let mut block = Self {
            pool_id,
            mapping,
            block_size,
            flags: block_flags,
            area_size,
            area_used: 0,
            largest_unused_area: 0,
            search_start: 0,
            search_end: 0,
            used: vec![0; words],
            stop: vec![0; words],
            #[cfg(debug_assertions)]
            live_starts: FixedBitSet::with_capacity(area_size as usize),
        };
        block.clear();
        block
    }

    #[inline]
    pub(crate) fn rx(&self) -> NonNull<u8> {
        self.mapping.rx
    }

    #[inline]
    pub(crate) fn rw(&self) -> NonNull<u8> {
        self.mapping.rw
    }

    #[inline]
    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub(crate) fn add_flags(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub(crate) fn clear_flags(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.has_flag(flags::EMPTY)
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.has_flag(flags::DIRTY)
    }

    /// First allocatable area: 1 when the padding guard occupies area 0.
    /// The flag bit value doubles as the area count.
    #[inline]
    pub(crate) fn initial_area_start(&self) -> u32 {
        self.flags & flags::INITIAL_PADDING
    }

    #[inline]
    pub(crate) fn area_available(&self) -> u32 {
        self.area_size - self.area_used
    }

    #[inline]
    pub(crate) fn is_area_used(&self, area: u32) -> bool {
        bits::get_bit(&self.used, area as usize)
    }

    /// End (exclusive) of the allocation starting at `area_start`, recovered
    /// from the stop sentinel.
    #[inline]
    pub(crate) fn area_end_of(&self, area_start: u32) -> u32 {
        let stop = bits::first_set_from(&self.stop, area_start as usize)
            .expect("used area without a stop sentinel");
        stop as u32 + 1
    }

    /// Whether `area` is the first area of a live allocation (debug builds
    /// track this exactly; release builds only know the used bit).
    #[inline]
    pub(crate) fn debug_check_allocation_start(&self, area: u32) {
        #[cfg(debug_assertions)]
        debug_assert!(
            self.live_starts.contains(area as usize),
            "area {area} is not the start of a live allocation"
        );
        let _ = area;
    }

    /// Reset to the fully-unoccupied state, keeping only the padding guard.
    pub(crate) fn clear(&mut self) {
        self.used.fill(0);
        self.stop.fill(0);

        let pad = self.initial_area_start() != 0;
        if pad {
            bits::set_bit(&mut self.used, 0, true);
            bits::set_bit(&mut self.stop, 0, true);
        }

        let start = self.initial_area_start();
        self.area_used = start;
        self.largest_unused_area = self.area_size - start;
        self.search_start = start;
        self.search_end = self.area_size;

        self.add_flags(flags::EMPTY);
        self.clear_flags(flags::DIRTY);

        #[cfg(debug_assertions)]
        self.live_starts.clear();
    }

    /// Occupy `[start, end)` and plant the stop sentinel at `end - 1`.
    pub(crate) fn mark_allocated(&mut self, start: u32, end: u32) {
        debug_assert!(start < end && end <= self.area_size);
        let size = end - start;

        bits::fill_range(&mut self.used, start as usize, size as usize);
        bits::set_bit(&mut self.stop, end as usize - 1, true);

        self.area_used += size;

        #[cfg(debug_assertions)]
        {
            debug_assert!(!self.live_starts.contains(start as usize));
            self.live_starts.insert(start as usize);
        }

        if self.area_available() == 0 {
            // Fully occupied: empty search window, nothing left to cache.
            self.search_start = self.area_size;
            self.search_end = 0;
            self.largest_unused_area = 0;
            self.clear_flags(flags::DIRTY | flags::EMPTY);
        } else {
            if self.search_start == start {
                self.search_start = end;
            }
            if self.search_end == end {
                self.search_end = start;
            }
            self.add_flags(flags::DIRTY);
            self.clear_flags(flags::EMPTY);
        }
    }

    /// Free `[start, end)` and clear its stop sentinel.
    pub(crate) fn mark_released(&mut self, start: u32, end: u32) {
        debug_assert!(start < end && end <= self.area_size);
        let size = end - start;

        self.area_used -= size;
        self.search_start = self.search_start.min(start);
        self.search_end = self.search_end.max(end);

        bits::clear_range(&mut self.used, start as usize, size as usize);
        bits::set_bit(&mut self.stop, end as usize - 1, false);

        #[cfg(debug_assertions)]
        {
            debug_assert!(self.live_starts.contains(start as usize));
            self.live_starts.set(start as usize, false);
        }

        if self.area_used == self.initial_area_start() {
            self.search_start = self.initial_area_start();
            self.search_end = self.area_size;
            self.largest_unused_area = self.area_size - self.initial_area_start();
            self.add_flags(flags::EMPTY);
            self.clear_flags(flags::DIRTY);
        } else {
            self.add_flags(flags::DIRTY);
        }

        debug_assert_eq!(bits::count_ones(&self.used), self.area_used as usize);
    }

    /// Free the tail `[start, end)` of an existing allocation and move its
    /// stop sentinel onto the retained prefix.
    ///
    /// `start` cannot be 0: shrinking an allocation to nothing is a release,
    /// not a shrink, and the prefix needs an area to carry the sentinel.
    pub(crate) fn mark_shrunk(&mut self, start: u32, end: u32) {
        debug_assert!(start != 0);
        debug_assert!(start < end && end <= self.area_size);
        let size = end - start;

        self.area_used -= size;
        self.search_start = self.search_start.min(start);
        self.search_end = self.search_end.max(end);

        bits::clear_range(&mut self.used, start as usize, size as usize);
        bits::set_bit(&mut self.stop, end as usize - 1, false);
        bits::set_bit(&mut self.stop, start as usize - 1, true);

        self.add_flags(flags::DIRTY);
    }

    /// Unmap the block's virtual memory. Called exactly once, by the engine,
    /// right before the block is dropped.
    ///
    /// # Safety
    /// The mapping must still be live and no pointers into it may be used
    /// afterwards.
    pub(crate) unsafe fn release_mapping(&mut self) {
        use crate::vm::{PlatformVmOps, VmOps};
        // Safety: forwarded from the caller; mode matches how the mapping
        // was created.
        unsafe {
            if self.has_flag(flags::DUAL_MAPPED) {
                if let Err(e) = PlatformVmOps::release_dual_mapping(self.mapping, self.block_size) {
                    log::warn!("failed to release dual mapping: {e}");
                }
            } else if let Err(e) = PlatformVmOps::release(self.mapping.rx, self.block_size) {
                log::warn!("failed to release mapping: {e}");
            }
        }
    }
}
