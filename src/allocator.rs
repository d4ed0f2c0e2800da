//! The allocator engine: carves executable memory out of VM-backed blocks
//! and hands back aligned spans for code emission.
//!
//! Blocks live in a slab indexed by [`BlockId`]; each pool keeps an
//! insertion-ordered list of ids plus a round-robin cursor, and a `BTreeMap`
//! keyed by RX base address resolves release/shrink/query pointers back to
//! their block in O(log N). All mutable state sits behind one mutex per
//! allocator.

use crate::bits::BitRangeIter;
use crate::block::{flags, Block, BlockId};
use crate::pool::{self, Pool, BASE_GRANULARITY, MULTI_POOL_COUNT};
use crate::stats;
use crate::sync::Mutex;
use crate::vm::{
    self, DualMapping, PlatformVmOps, ProtectJitAccess, ProtectJitReadWriteScope, VmOps,
};
use crate::Error;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Configured block sizes outside this range fall back to the VM page
/// granularity.
const MIN_BLOCK_SIZE: usize = 64 * 1024;
const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Cap for the block-size doubling heuristic. Oversized requests still get
/// a block aligned up to their size.
const MAX_GROWN_BLOCK_SIZE: usize = 32 * 1024 * 1024;

/// Requests above this fail with [`Error::TooLarge`].
const MAX_REQUEST_SIZE: usize = (u32::MAX / 2) as usize;

/// X86 and X86_64: four `int3` bytes, so straying execution traps.
fn default_fill_pattern() -> u32 {
    if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        0xCCCC_CCCC
    } else {
        0
    }
}

/// Behavior switches, all off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitAllocatorOptions {
    /// Map every block twice: one read-execute view and one read-write view
    /// of the same pages. Turned on automatically when the host enforces
    /// W^X and offers no JIT mode, since RWX mappings would always fail.
    pub use_dual_mapping: bool,
    /// Use three pools of 64, 128 and 256 byte granularity instead of one.
    /// Pays off for generators that emit a lot of code: large, naturally
    /// aligned allocations land in coarser pools with fewer bits to scan.
    pub use_multiple_pools: bool,
    /// Fill new blocks and freshly released spans with the fill pattern.
    pub fill_unused_memory: bool,
    /// Free a block as soon as it becomes empty instead of keeping one
    /// empty block per pool in reserve. The reserve avoids map/unmap thrash
    /// when a single allocation is repeatedly created and destroyed.
    pub immediate_release: bool,
    /// Do not reserve area 0 of every block as a guard. The guard keeps
    /// valid allocations away from the block's base address.
    pub disable_initial_padding: bool,
    /// Fill pattern override; the default is platform-specific.
    pub custom_fill_pattern: Option<u32>,
}

/// Creation parameters. Invalid values fall back to defaults silently.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateParams {
    pub options: JitAllocatorOptions,
    /// Base block size; power of two in `[64 KiB, 256 MiB]`, 0 = page
    /// granularity.
    pub block_size: usize,
    /// Area size in bytes; power of two in `[64, 256]`, 0 = 64.
    pub granularity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Keep one wiped block per pool as an empty reserve.
    Soft,
    /// Release every block.
    Hard,
}

/// An allocated span: the executable view, the writable view and the
/// granularity-rounded byte size. Both pointers address the same physical
/// bytes; they differ only under dual mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub rx: NonNull<u8>,
    pub rw: NonNull<u8>,
    pub size: usize,
}

/// Point-in-time snapshot, taken under the allocator lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub block_count: usize,
    pub allocation_count: usize,
    /// Bytes handed out to callers (excludes padding guards).
    pub used_size: usize,
    /// Bytes of virtual memory reserved by blocks.
    pub reserved_size: usize,
    /// Host-heap bytes spent on bookkeeping.
    pub overhead_size: usize,
}

impl Statistics {
    #[must_use]
    pub fn used_size_as_percent(&self) -> f64 {
        if self.reserved_size == 0 {
            return 0.0;
        }
        self.used_size as f64 * 100.0 / self.reserved_size as f64
    }

    #[must_use]
    pub fn overhead_size_as_percent(&self) -> f64 {
        if self.reserved_size == 0 {
            return 0.0;
        }
        self.overhead_size as f64 * 100.0 / self.reserved_size as f64
    }
}

/// Thread-safe allocator of executable memory spans.
///
/// See the crate docs for the full contract. All operations lock one
/// per-allocator mutex for their duration; do not call back into the
/// allocator from VM callbacks or signal handlers.
pub struct JitAllocator {
    engine: Option<Mutex<Engine>>,
}

impl JitAllocator {
    /// Creates an allocator. Invalid parameters fall back to defaults;
    /// construction itself cannot fail.
    #[must_use]
    pub fn new(params: CreateParams) -> Self {
        let vm_info = PlatformVmOps::info();
        let mut options = params.options;

        let mut block_size = params.block_size;
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            block_size = vm_info.page_granularity;
        }

        let mut granularity = params.granularity;
        if !(64..=256).contains(&granularity) || !granularity.is_power_of_two() {
            granularity = BASE_GRANULARITY;
        }

        let fill_pattern = options
            .custom_fill_pattern
            .unwrap_or_else(default_fill_pattern);

        // Hardened runtime: RWX mappings are refused and there is no JIT
        // mode, so dual mapping is the only way block creation can succeed.
        let hardened = PlatformVmOps::hardened_runtime_info();
        if hardened.enabled && !hardened.map_jit {
            options.use_dual_mapping = true;
        }

        let pool_count = if options.use_multiple_pools {
            MULTI_POOL_COUNT
        } else {
            1
        };
        let pools = (0..pool_count)
            .map(|id| Pool::new(granularity << id))
            .collect();

        Self {
            engine: Some(Mutex::new(Engine {
                options,
                block_size,
                granularity,
                fill_pattern,
                page_size: vm_info.page_size,
                allocation_count: 0,
                pools,
                slab: Vec::new(),
                free_ids: Vec::new(),
                tree: BTreeMap::new(),
            })),
        }
    }

    /// A sentinel allocator that fails every operation with
    /// [`Error::NotInitialized`]. Useful as a placeholder in statics and
    /// containers before a real allocator is constructed.
    #[must_use]
    pub const fn uninitialized() -> Self {
        Self { engine: None }
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Result<R, Error> {
        let mutex = self.engine.as_ref().ok_or(Error::NotInitialized)?;
        // A panicked debug assertion must not take the allocator down with
        // it; the engine state is still consistent under the lock.
        let mut engine = mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(f(&mut engine))
    }

    /// Allocates `size` bytes of executable memory, rounded up to the
    /// allocator granularity.
    pub fn alloc(&self, size: usize) -> Result<Span, Error> {
        self.with_engine(|engine| engine.alloc(size))?
    }

    /// Releases a span previously returned by [`alloc`](Self::alloc).
    /// `rx` must be the span's RX base pointer.
    pub fn release(&self, rx: NonNull<u8>) -> Result<(), Error> {
        self.with_engine(|engine| engine.release(rx))?
    }

    /// Releases the tail of a span, keeping its first `new_size` bytes
    /// (rounded up to the granularity). `new_size == 0` releases the span.
    pub fn shrink(&self, rx: NonNull<u8>, new_size: usize) -> Result<(), Error> {
        self.with_engine(|engine| engine.shrink(rx, new_size))?
    }

    /// Looks up the span containing `rx` without mutating anything. `rx`
    /// may point inside the span; the returned base is area-aligned.
    pub fn query(&self, rx: NonNull<u8>) -> Result<Span, Error> {
        self.with_engine(|engine| engine.query(rx))?
    }

    /// Discards every allocation. With [`ResetPolicy::Soft`] each pool keeps
    /// one wiped block as an empty reserve (unless immediate release is
    /// configured). A no-op on the uninitialized sentinel.
    pub fn reset(&self, policy: ResetPolicy) {
        let _ = self.with_engine(|engine| engine.reset(policy));
    }

    /// Usage snapshot. The uninitialized sentinel reports all zeros.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.with_engine(Engine::statistics).unwrap_or_default()
    }
}

impl Default for JitAllocator {
    fn default() -> Self {
        Self::new(CreateParams::default())
    }
}

struct Engine {
    options: JitAllocatorOptions,
    block_size: usize,
    granularity: u32,
    fill_pattern: u32,
    page_size: usize,
    allocation_count: usize,
    pools: Vec<Pool>,
    /// Block storage; pool lists and the address tree refer to it by id.
    slab: Vec<Option<Block>>,
    free_ids: Vec<BlockId>,
    /// RX base address → block id.
    tree: BTreeMap<usize, BlockId>,
}

impl Engine {
    fn alloc(&mut self, size: usize) -> Result<Span, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        // Round up to the minimum granularity.
        let granularity_mask = self.granularity as usize - 1;
        let size = size
            .checked_add(granularity_mask)
            .ok_or(Error::TooLarge)?
            & !granularity_mask;
        if size > MAX_REQUEST_SIZE {
            return Err(Error::TooLarge);
        }

        let pool_id = pool::size_to_pool_id(self.pools.len(), self.granularity, size);
        let area_size = self.pools[pool_id].area_size_from_bytes(size);

        // Try existing blocks first, starting at the pool cursor and
        // wrapping through the whole list.
        let mut winner: Option<(usize, BlockId, u32)> = None;
        let block_count = self.pools[pool_id].blocks.len();
        let cursor = self.pools[pool_id].cursor;
        for i in 0..block_count {
            let pos = (cursor + i) % block_count;
            let id = self.pools[pool_id].blocks[pos];
            let block = self.slab[id].as_mut().expect("pool entry missing from slab");

            if block.area_available() < area_size {
                continue;
            }
            // Clean hints are authoritative; a clean block that cannot fit
            // the request is skipped without touching its bit vector.
            if !block.is_dirty() && block.largest_unused_area < area_size {
                continue;
            }
            if let Some(area_index) = scan_block_for_fit(block, area_size) {
                winner = Some((pos, id, area_index));
                break;
            }
        }

        let (pos, id, area_index) = match winner {
            Some(win) => {
                let block = self.slab[win.1].as_ref().expect("winner vanished");
                if block.is_empty() {
                    // The reserve block is back in service.
                    self.pools[pool_id].empty_block_count = 0;
                }
                win
            }
            None => {
                let ideal_size = self.ideal_block_size(pool_id, size)?;
                let id = self.new_block(pool_id, ideal_size)?;
                let pos = self.pools[pool_id].blocks.len() - 1;

                let block = self.slab[id].as_mut().expect("new block missing");
                let area_index = block.initial_area_start();
                // The upcoming allocation is already accounted into the
                // hints; mark_allocated sets DIRTY regardless.
                block.search_start += area_size;
                block.largest_unused_area -= area_size;
                (pos, id, area_index)
            }
        };

        let block = self.slab[id].as_mut().expect("block vanished");
        block.mark_allocated(area_index, area_index + area_size);

        let pool = &mut self.pools[pool_id];
        pool.total_area_used += area_size as usize;
        // Round-robin: the next search resumes at the block that just served.
        pool.cursor = pos;

        self.allocation_count += 1;
        stats::TOTAL_USED.raise(size);

        let block = self.slab[id].as_ref().expect("block vanished");
        let offset = self.pools[pool_id].byte_size_from_area(area_index);
        debug_assert!(offset <= block.block_size - size);

        // Safety: offset stays within the block's mapping.
        let (rx, rw) = unsafe {
            (
                NonNull::new_unchecked(block.rx().as_ptr().add(offset)),
                NonNull::new_unchecked(block.rw().as_ptr().add(offset)),
            )
        };
        Ok(Span { rx, rw, size })
    }

    fn release(&mut self, rx: NonNull<u8>) -> Result<(), Error> {
        let id = self.block_for_ptr(rx).ok_or(Error::InvalidState)?;
        let block = self.slab[id].as_mut().expect("tree entry missing from slab");
        let pool_id = block.pool_id;

        let offset = rx.as_ptr() as usize - block.rx().as_ptr() as usize;
        let area_start = (offset >> self.pools[pool_id].granularity_log2) as u32;
        if !block.is_area_used(area_start) {
            return Err(Error::InvalidState);
        }
        block.debug_check_allocation_start(area_start);

        let area_end = block.area_end_of(area_start);
        let area_size = area_end - area_start;
        block.mark_released(area_start, area_end);

        self.pools[pool_id].total_area_used -= area_size as usize;
        self.allocation_count -= 1;

        let span_size = self.pools[pool_id].byte_size_from_area(area_size);
        stats::TOTAL_USED.lower(span_size);

        if self.options.fill_unused_memory {
            let block = self.slab[id].as_ref().expect("block vanished");
            let span_offset = self.pools[pool_id].byte_size_from_area(area_start);
            // Safety: the span lies within the block's RW view.
            let span_ptr = unsafe { block.rw().as_ptr().add(span_offset) };
            let _scope = ProtectJitReadWriteScope::new(span_ptr, span_size);
            // Safety: span_ptr..span_ptr+span_size is writable under the scope.
            unsafe { fill_pattern(span_ptr, self.fill_pattern, span_size) };
        }

        let block = self.slab[id].as_ref().expect("block vanished");
        if block.is_empty() {
            if self.pools[pool_id].empty_block_count > 0 || self.options.immediate_release {
                let pos = self.pools[pool_id]
                    .blocks
                    .iter()
                    .position(|&b| b == id)
                    .expect("block missing from its pool list");
                let mut removed = self.remove_block(pool_id, pos);
                // Safety: the block is fully unlinked; no live spans remain.
                unsafe { removed.release_mapping() };
            } else {
                self.pools[pool_id].empty_block_count = 1;
            }
        }

        Ok(())
    }

    fn shrink(&mut self, rx: NonNull<u8>, new_size: usize) -> Result<(), Error> {
        if new_size == 0 {
            return self.release(rx);
        }

        let id = self.block_for_ptr(rx).ok_or(Error::InvalidState)?;
        let block = self.slab[id].as_mut().expect("tree entry missing from slab");
        let pool_id = block.pool_id;

        let offset = rx.as_ptr() as usize - block.rx().as_ptr() as usize;
        let area_start = (offset >> self.pools[pool_id].granularity_log2) as u32;
        if !block.is_area_used(area_start) {
            return Err(Error::InvalidArgument);
        }
        block.debug_check_allocation_start(area_start);

        let area_end = block.area_end_of(area_start);
        let area_prev_size = area_end - area_start;
        let area_shrunk_size = self.pools[pool_id].area_size_from_bytes(new_size);
        if area_shrunk_size > area_prev_size {
            return Err(Error::InvalidState);
        }

        let area_diff = area_prev_size - area_shrunk_size;
        if area_diff != 0 {
            block.mark_shrunk(area_start + area_shrunk_size, area_end);
            self.pools[pool_id].total_area_used -= area_diff as usize;

            let tail_size = self.pools[pool_id].byte_size_from_area(area_diff);
            stats::TOTAL_USED.lower(tail_size);

            if self.options.fill_unused_memory {
                let block = self.slab[id].as_ref().expect("block vanished");
                let tail_offset = self.pools[pool_id]
                    .byte_size_from_area(area_start + area_shrunk_size);
                // Safety: the tail lies within the block's RW view.
                let tail_ptr = unsafe { block.rw().as_ptr().add(tail_offset) };
                let _scope = ProtectJitReadWriteScope::new(tail_ptr, tail_size);
                // Safety: tail_ptr..tail_ptr+tail_size is writable under the scope.
                unsafe { fill_pattern(tail_ptr, self.fill_pattern, tail_size) };
            }
        }

        Ok(())
    }

    fn query(&self, rx: NonNull<u8>) -> Result<Span, Error> {
        let id = self.block_for_ptr(rx).ok_or(Error::InvalidState)?;
        let block = self.slab[id].as_ref().expect("tree entry missing from slab");
        let pool = &self.pools[block.pool_id];

        let offset = rx.as_ptr() as usize - block.rx().as_ptr() as usize;
        let area_start = (offset >> pool.granularity_log2) as u32;
        if !block.is_area_used(area_start) {
            return Err(Error::InvalidArgument);
        }

        let area_end = block.area_end_of(area_start);
        let byte_offset = pool.byte_size_from_area(area_start);
        let byte_size = pool.byte_size_from_area(area_end - area_start);

        // Safety: the span lies within the block's mapping.
        let (rx, rw) = unsafe {
            (
                NonNull::new_unchecked(block.rx().as_ptr().add(byte_offset)),
                NonNull::new_unchecked(block.rw().as_ptr().add(byte_offset)),
            )
        };
        Ok(Span {
            rx,
            rw,
            size: byte_size,
        })
    }

    fn reset(&mut self, policy: ResetPolicy) {
        self.tree.clear();
        let keep_reserve = policy != ResetPolicy::Hard && !self.options.immediate_release;

        for pool_id in 0..self.pools.len() {
            let ids = std::mem::take(&mut self.pools[pool_id].blocks);
            let granularity = self.pools[pool_id].granularity as usize;
            let mut kept: Option<BlockId> = None;

            for (i, &id) in ids.iter().enumerate() {
                if i == 0 && keep_reserve {
                    kept = Some(id);
                    continue;
                }
                let mut block = self.slab[id].take().expect("pool entry missing from slab");
                self.free_ids.push(id);
                let live =
                    (block.area_used - block.initial_area_start()) as usize * granularity;
                stats::TOTAL_USED.lower(live);
                stats::TOTAL_RESERVED.lower(block.block_size);
                log::trace!(
                    "reset: destroying block at {:#x} ({} bytes)",
                    block.rx().as_ptr() as usize,
                    block.block_size
                );
                // Safety: every allocation is discarded by reset; no spans
                // into this block may be used afterwards.
                unsafe { block.release_mapping() };
            }

            self.pools[pool_id].reset();

            if let Some(id) = kept {
                {
                    let block = self.slab[id].as_mut().expect("kept block missing");
                    let live =
                        (block.area_used - block.initial_area_start()) as usize * granularity;
                    stats::TOTAL_USED.lower(live);
                    // insert_block re-adds the reservation below.
                    stats::TOTAL_RESERVED.lower(block.block_size);
                    wipe_block(block, self.options.fill_unused_memory, self.fill_pattern,
                        self.pools[pool_id].granularity_log2);
                }
                let block = self.slab[id].take().expect("kept block missing");
                self.free_ids.push(id);
                self.insert_block(block);
                self.pools[pool_id].empty_block_count = 1;
            }
        }

        self.allocation_count = 0;
    }

    fn statistics(&mut self) -> Statistics {
        let mut out = Statistics {
            allocation_count: self.allocation_count,
            ..Statistics::default()
        };
        let padding_areas = usize::from(!self.options.disable_initial_padding);
        for pool in &self.pools {
            let guard_areas = pool.blocks.len() * padding_areas;
            out.block_count += pool.blocks.len();
            out.reserved_size += pool.total_area_size * pool.granularity as usize;
            out.used_size += (pool.total_area_used - guard_areas) * pool.granularity as usize;
            out.overhead_size += pool.total_overhead_bytes;
        }
        out
    }

    /// Ideal size for the next block of a pool: double the last block, cap
    /// the growth, and for oversized requests align the request up to the
    /// configured block size.
    fn ideal_block_size(&self, pool_id: usize, allocation_size: usize) -> Result<usize, Error> {
        let pool = &self.pools[pool_id];
        let last_block_size = pool
            .blocks
            .last()
            .and_then(|&id| self.slab[id].as_ref())
            .map_or(self.block_size, |b| b.block_size);

        let mut allocation_size = allocation_size;
        if !self.options.disable_initial_padding {
            allocation_size = allocation_size
                .checked_add(BASE_GRANULARITY as usize)
                .ok_or(Error::OutOfMemory)?;
        }

        let mut block_size = last_block_size;
        if block_size < MAX_GROWN_BLOCK_SIZE {
            block_size *= 2;
        }
        if allocation_size > block_size {
            block_size = allocation_size
                .checked_next_multiple_of(self.block_size)
                .ok_or(Error::OutOfMemory)?;
        }

        Ok(block_size)
    }

    /// Maps and inserts a fresh block; returns its slab id.
    fn new_block(&mut self, pool_id: usize, block_size: usize) -> Result<BlockId, Error> {
        debug_assert_eq!(block_size % self.page_size, 0);
        let area_size = self.pools[pool_id].area_size_from_bytes(block_size);

        let mut block_flags = 0;
        if !self.options.disable_initial_padding {
            block_flags |= flags::INITIAL_PADDING;
        }

        let mapping = if self.options.use_dual_mapping {
            block_flags |= flags::DUAL_MAPPED;
            // Safety: block_size is non-zero and page aligned.
            unsafe { PlatformVmOps::alloc_dual_mapping(block_size) }
        } else {
            // Safety: as above.
            unsafe { PlatformVmOps::alloc_rwx(block_size).map(|p| DualMapping { rx: p, rw: p }) }
        }
        .map_err(|e| {
            log::debug!("mapping a {block_size} byte block failed: {e}");
            Error::OutOfMemory
        })?;

        if self.options.fill_unused_memory {
            let _scope = ProtectJitReadWriteScope::new(mapping.rw.as_ptr(), block_size);
            // Safety: the RW view is writable for block_size bytes.
            unsafe { fill_pattern(mapping.rw.as_ptr(), self.fill_pattern, block_size) };
        }

        let block = Block::new(pool_id, mapping, block_size, block_flags, area_size);
        log::trace!(
            "new block at {:#x} ({} bytes, {} areas, pool {})",
            block.rx().as_ptr() as usize,
            block_size,
            area_size,
            pool_id
        );
        Ok(self.insert_block(block))
    }

    /// Links a block into its pool list, the address tree and the pool
    /// statistics.
    fn insert_block(&mut self, block: Block) -> BlockId {
        let pool_id = block.pool_id;
        let rx_base = block.rx().as_ptr() as usize;
        let area_size = block.area_size as usize;
        let area_used = block.area_used as usize;
        let block_size = block.block_size;
        let overhead = block_overhead_bytes(&block);

        let id = match self.free_ids.pop() {
            Some(id) => {
                debug_assert!(self.slab[id].is_none());
                self.slab[id] = Some(block);
                id
            }
            None => {
                self.slab.push(Some(block));
                self.slab.len() - 1
            }
        };
        self.tree.insert(rx_base, id);

        let pool = &mut self.pools[pool_id];
        pool.push_block(id);
        pool.total_area_size += area_size;
        pool.total_area_used += area_used;
        pool.total_overhead_bytes += overhead;

        stats::TOTAL_RESERVED.raise(block_size);
        id
    }

    /// Unlinks the block at `pos` of a pool from every structure and hands
    /// it back to the caller (who releases the mapping).
    fn remove_block(&mut self, pool_id: usize, pos: usize) -> Block {
        let id = self.pools[pool_id].blocks[pos];
        let block = self.slab[id].take().expect("pool entry missing from slab");
        self.free_ids.push(id);
        self.tree.remove(&(block.rx().as_ptr() as usize));

        let pool = &mut self.pools[pool_id];
        pool.remove_block_at(pos);
        pool.total_area_size -= block.area_size as usize;
        pool.total_area_used -= block.area_used as usize;
        pool.total_overhead_bytes -= block_overhead_bytes(&block);

        stats::TOTAL_RESERVED.lower(block.block_size);
        log::trace!(
            "removed block at {:#x} ({} bytes, pool {})",
            block.rx().as_ptr() as usize,
            block.block_size,
            pool_id
        );
        block
    }

    /// Resolves a pointer to the block whose RX range contains it.
    fn block_for_ptr(&self, rx: NonNull<u8>) -> Option<BlockId> {
        let addr = rx.as_ptr() as usize;
        let (&base, &id) = self.tree.range(..=addr).next_back()?;
        let block = self.slab[id].as_ref()?;
        debug_assert_eq!(block.rx().as_ptr() as usize, base);
        (addr - base < block.block_size).then_some(id)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (pool_id, pool) in self.pools.iter().enumerate() {
            let granularity = pool.granularity as usize;
            for &id in &pool.blocks {
                if let Some(block) = self.slab[id].as_mut() {
                    let live =
                        (block.area_used - block.initial_area_start()) as usize * granularity;
                    stats::TOTAL_USED.lower(live);
                    stats::TOTAL_RESERVED.lower(block.block_size);
                    log::trace!(
                        "drop: releasing block at {:#x} (pool {pool_id})",
                        block.rx().as_ptr() as usize
                    );
                    // Safety: the allocator is going away; the API contract
                    // requires every span to be dead by now.
                    unsafe { block.release_mapping() };
                }
            }
        }
    }
}

/// First-fit scan of a block's search window. On a miss the freshly observed
/// window and largest-run length are written back and `DIRTY` is cleared —
/// the block is fully characterized until the next mutation.
fn scan_block_for_fit(block: &mut Block, area_size: u32) -> Option<u32> {
    debug_assert!(block.search_start < block.search_end);

    let mut it = BitRangeIter::zeros(
        &block.used,
        block.search_start as usize,
        block.search_end as usize,
    );

    let mut min_start = usize::MAX;
    let mut largest = 0usize;
    let mut last_end = 0usize;

    while let Some((start, end)) = it.next_range(area_size as usize) {
        let len = end - start;
        if len >= area_size as usize {
            return Some(start as u32);
        }
        min_start = min_start.min(start);
        largest = largest.max(len);
        last_end = end;
    }

    if min_start != usize::MAX {
        block.search_start = min_start as u32;
        block.search_end = last_end as u32;
        block.largest_unused_area = largest as u32;
        block.clear_flags(flags::DIRTY);
    }
    None
}

/// Wipes a block that may still hold discarded code: every used run is
/// overwritten with the fill pattern and its icache flushed, then the
/// occupancy state is cleared. Runs under the process-wide JIT protection
/// toggle because reset covers many spans at once.
fn wipe_block(block: &mut Block, fill_unused_memory: bool, pattern: u32, granularity_log2: u32) {
    if !block.is_empty() && fill_unused_memory {
        vm::protect_jit_memory(ProtectJitAccess::ReadWrite);

        let rw = block.rw().as_ptr();
        let mut it = BitRangeIter::ones(&block.used, 0, block.area_size as usize);
        while let Some((start, end)) = it.next() {
            // Safety: the run lies within the block's RW view.
            let span_ptr = unsafe { rw.add(start << granularity_log2) };
            let span_size = (end - start) << granularity_log2;
            // Safety: writable under the process-wide RW toggle.
            unsafe { fill_pattern(span_ptr, pattern, span_size) };
            vm::flush_instruction_cache(span_ptr, span_size);
        }

        vm::protect_jit_memory(ProtectJitAccess::ReadExecute);
    }

    block.clear();
}

fn block_overhead_bytes(block: &Block) -> usize {
    std::mem::size_of::<Block>()
        + block.used.len() * std::mem::size_of::<crate::bits::BitWord>() * 2
}

/// Spans are always a multiple of 4 bytes and 4-byte aligned, so the pattern
/// is stamped word by word.
///
/// # Safety
/// `dst..dst+size` must be writable.
unsafe fn fill_pattern(dst: *mut u8, pattern: u32, size: usize) {
    debug_assert_eq!(size % 4, 0);
    let words = dst.cast::<u32>();
    for i in 0..size / 4 {
        // Safety: in bounds per the function contract.
        unsafe { words.add(i).write(pattern) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::testing::Rng;

    fn addr(p: NonNull<u8>) -> usize {
        p.as_ptr() as usize
    }

    #[test]
    fn test_single_small_alloc() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(8).expect("alloc failed");
        assert_eq!(span.size, 64, "requests round up to the granularity");

        let queried = allocator.query(span.rx).expect("query failed");
        assert_eq!(queried.rx, span.rx);
        assert_eq!(queried.rw, span.rw);
        assert_eq!(queried.size, 64);

        let stats = allocator.statistics();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.used_size, 64);
        assert!(stats.reserved_size >= 64 * 1024);
        assert!(stats.overhead_size > 0);
    }

    #[test]
    fn test_write_rw_read_rx_then_release() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(8).expect("alloc failed");
        // Safety: the span is live and 8 <= span.size.
        unsafe {
            for i in 0..8 {
                span.rw.as_ptr().add(i).write(0xAA);
            }
            for i in 0..8 {
                assert_eq!(span.rx.as_ptr().add(i).read(), 0xAA);
            }
        }

        allocator.release(span.rx).expect("release failed");
        let stats = allocator.statistics();
        assert_eq!(stats.used_size, 0);
        assert_eq!(stats.allocation_count, 0);
        // The emptied block stays mapped as the pool's reserve.
        assert_eq!(stats.block_count, 1);
    }

    #[cfg(not(miri))]
    #[test]
    fn test_churn_without_overlap() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());
        let mut rng = Rng::new(100);

        // External interval map: start -> end of every live span.
        let mut live = std::collections::BTreeMap::<usize, usize>::new();
        let mut ptrs = Vec::with_capacity(20_000);

        for _ in 0..20_000 {
            let size = 8 + (rng.next_u32() % 1017) as usize;
            let span = allocator.alloc(size).expect("alloc failed");
            let start = addr(span.rx);
            let end = start + span.size;

            if let Some((_, &prev_end)) = live.range(..=start).next_back() {
                assert!(prev_end <= start, "span overlaps its predecessor");
            }
            if let Some((&next_start, _)) = live.range(start..).next() {
                assert!(next_start >= end, "span overlaps its successor");
            }

            live.insert(start, end);
            ptrs.push(start);
        }

        assert_eq!(allocator.statistics().allocation_count, 20_000);

        for i in 0..ptrs.len() {
            let j = rng.next_u32() as usize % ptrs.len();
            ptrs.swap(i, j);
        }
        for &p in &ptrs {
            let rx = NonNull::new(p as *mut u8).unwrap();
            allocator.release(rx).expect("release failed");
        }

        let stats = allocator.statistics();
        assert_eq!(stats.used_size, 0);
        assert_eq!(stats.allocation_count, 0);
    }

    #[test]
    fn test_shrink_preserves_prefix() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(256).expect("alloc failed");
        // Safety: the span is live for 256 bytes.
        unsafe {
            for i in 0..256 {
                span.rw.as_ptr().add(i).write(i as u8);
            }
        }

        allocator.shrink(span.rx, 64).expect("shrink failed");
        // Safety: the retained prefix is still live.
        unsafe {
            for i in 0..64 {
                assert_eq!(span.rx.as_ptr().add(i).read(), i as u8);
            }
        }
        assert_eq!(allocator.query(span.rx).unwrap().size, 64);

        // The freed tail is allocatable again and never overlaps the prefix.
        let next = allocator.alloc(64).expect("alloc after shrink failed");
        let prefix = addr(span.rx)..addr(span.rx) + 64;
        assert!(!prefix.contains(&addr(next.rx)));
    }

    #[test]
    fn test_immediate_release_drops_empty_blocks() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            options: JitAllocatorOptions {
                immediate_release: true,
                ..JitAllocatorOptions::default()
            },
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);

        let span = allocator.alloc(8).expect("alloc failed");
        allocator.release(span.rx).expect("release failed");

        let stats = allocator.statistics();
        assert_eq!(stats.block_count, 0);
        assert_eq!(stats.reserved_size, 0);
    }

    #[test]
    fn test_multiple_pools_stratification() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            options: JitAllocatorOptions {
                use_multiple_pools: true,
                ..JitAllocatorOptions::default()
            },
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);

        let small = allocator.alloc(64).expect("alloc failed");
        let large = allocator.alloc(256).expect("alloc failed");

        {
            let engine = allocator.engine.as_ref().unwrap().lock().unwrap();
            assert_eq!(engine.pools.len(), MULTI_POOL_COUNT);
            assert_eq!(engine.pools[0].granularity, 64);
            assert_eq!(engine.pools[2].granularity, 256);

            let small_block = engine.block_for_ptr(small.rx).unwrap();
            assert_eq!(engine.slab[small_block].as_ref().unwrap().pool_id, 0);

            let large_block = engine.block_for_ptr(large.rx).unwrap();
            assert_eq!(engine.slab[large_block].as_ref().unwrap().pool_id, 2);
        }

        // The owning pool's granularity divides the reported size.
        assert_eq!(allocator.query(large.rx).unwrap().size % 256, 0);
        assert_eq!(allocator.query(small.rx).unwrap().size, 64);
    }

    #[test]
    fn test_alloc_error_paths() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        assert_eq!(allocator.alloc(0), Err(Error::InvalidArgument));
        assert_eq!(allocator.alloc(MAX_REQUEST_SIZE + 1), Err(Error::TooLarge));
        assert_eq!(allocator.alloc(usize::MAX), Err(Error::TooLarge));
    }

    #[test]
    fn test_release_and_query_error_paths() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        // No block contains this pointer.
        let bogus = NonNull::new(0x10 as *mut u8).unwrap();
        assert_eq!(allocator.release(bogus), Err(Error::InvalidState));
        assert_eq!(allocator.query(bogus), Err(Error::InvalidState));
        assert_eq!(allocator.shrink(bogus, 64), Err(Error::InvalidState));

        // Inside a live block but on an unoccupied area.
        let span = allocator.alloc(64).expect("alloc failed");
        let free_area = NonNull::new(unsafe { span.rx.as_ptr().add(64) }).unwrap();
        assert_eq!(allocator.query(free_area), Err(Error::InvalidArgument));
        assert_eq!(allocator.shrink(free_area, 64), Err(Error::InvalidArgument));
        assert_eq!(allocator.release(free_area), Err(Error::InvalidState));
    }

    #[test]
    fn test_shrink_error_paths_and_noop() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(64).expect("alloc failed");
        assert_eq!(
            allocator.shrink(span.rx, 128),
            Err(Error::InvalidState),
            "growing via shrink is refused"
        );

        // Shrinking to the same area count changes nothing.
        allocator.shrink(span.rx, 64).expect("no-op shrink failed");
        assert_eq!(allocator.query(span.rx).unwrap().size, 64);

        // new_size == 0 is a release.
        allocator.shrink(span.rx, 0).expect("shrink-to-zero failed");
        assert_eq!(allocator.query(span.rx), Err(Error::InvalidArgument));
        assert_eq!(allocator.statistics().allocation_count, 0);
    }

    #[test]
    fn test_uninitialized_sentinel_fails_everything() {
        let allocator = JitAllocator::uninitialized();
        let p = NonNull::new(0x40 as *mut u8).unwrap();

        assert_eq!(allocator.alloc(64), Err(Error::NotInitialized));
        assert_eq!(allocator.release(p), Err(Error::NotInitialized));
        assert_eq!(allocator.shrink(p, 32), Err(Error::NotInitialized));
        assert_eq!(allocator.query(p), Err(Error::NotInitialized));
        assert_eq!(allocator.statistics(), Statistics::default());
        allocator.reset(ResetPolicy::Hard);
    }

    #[test]
    fn test_alloc_reuses_released_space() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let first = allocator.alloc(64).expect("alloc failed");
        let first_addr = addr(first.rx);
        allocator.release(first.rx).expect("release failed");

        let second = allocator.alloc(64).expect("alloc failed");
        // Reuse of the same address is permitted (and expected here); both
        // allocations must report identical sizes either way.
        assert_eq!(second.size, 64);
        assert_eq!(addr(second.rx), first_addr);
    }

    #[test]
    fn test_fragmentation_is_reused_without_new_blocks() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let spans: Vec<Span> = (0..100)
            .map(|_| allocator.alloc(64).expect("alloc failed"))
            .collect();
        for span in spans.iter().step_by(2) {
            allocator.release(span.rx).expect("release failed");
        }

        let blocks_before = allocator.statistics().block_count;
        for _ in 0..50 {
            allocator.alloc(64).expect("alloc failed");
        }
        assert_eq!(
            allocator.statistics().block_count,
            blocks_before,
            "holes must be reused before any new block is mapped"
        );
    }

    #[test]
    fn test_empty_reserve_is_limited_to_one_block() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let small = allocator.alloc(64).expect("alloc failed");
        allocator.release(small.rx).expect("release failed");
        assert_eq!(allocator.statistics().block_count, 1);

        // Too big for the reserve block; a second block appears.
        let big = allocator.alloc(130 * 1024).expect("alloc failed");
        assert_eq!(allocator.statistics().block_count, 2);

        // The pool already holds an empty reserve, so the second block is
        // unmapped as soon as it empties.
        allocator.release(big.rx).expect("release failed");
        assert_eq!(allocator.statistics().block_count, 1);
    }

    #[test]
    fn test_reset_soft_keeps_one_wiped_block() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        allocator.alloc(64).expect("alloc failed");
        allocator.alloc(128).expect("alloc failed");
        allocator.alloc(130 * 1024).expect("alloc failed");
        assert_eq!(allocator.statistics().block_count, 2);

        allocator.reset(ResetPolicy::Soft);
        let stats = allocator.statistics();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.used_size, 0);

        // The reserve serves the next allocation.
        let span = allocator.alloc(64).expect("alloc after reset failed");
        assert_eq!(span.size, 64);

        allocator.reset(ResetPolicy::Hard);
        assert_eq!(allocator.statistics().block_count, 0);
        assert_eq!(allocator.statistics().reserved_size, 0);
    }

    #[test]
    fn test_fill_pattern_stamps_new_and_released_memory() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            options: JitAllocatorOptions {
                fill_unused_memory: true,
                custom_fill_pattern: Some(0xDEAD_BEEF),
                ..JitAllocatorOptions::default()
            },
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);

        let span = allocator.alloc(64).expect("alloc failed");
        // New blocks are pre-filled, so a fresh span carries the pattern.
        // Safety: the span is live for 64 bytes.
        unsafe {
            for i in 0..span.size / 4 {
                assert_eq!(span.rx.as_ptr().cast::<u32>().add(i).read(), 0xDEAD_BEEF);
            }
            span.rw.as_ptr().write_bytes(0x11, span.size);
        }

        let rx = span.rx;
        allocator.release(rx).expect("release failed");
        // The block is retained as the reserve; the released span must be
        // stamped with the pattern again.
        // Safety: the block's RX view is still mapped.
        unsafe {
            for i in 0..span.size / 4 {
                assert_eq!(rx.as_ptr().cast::<u32>().add(i).read(), 0xDEAD_BEEF);
            }
        }
    }

    #[cfg(not(miri))]
    #[test]
    fn test_dual_mapping_views() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            options: JitAllocatorOptions {
                use_dual_mapping: true,
                ..JitAllocatorOptions::default()
            },
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);

        let span = match allocator.alloc(64) {
            Ok(span) => span,
            Err(Error::OutOfMemory) => {
                // Dual mapping needs shm or tmp-file backing; constrained
                // sandboxes may offer neither.
                eprintln!("dual mapping unavailable on this host");
                return;
            }
            Err(e) => panic!("unexpected error: {e:?}"),
        };

        assert_ne!(span.rx, span.rw);
        // Safety: the span is live; rw is the writable view.
        unsafe {
            span.rw.as_ptr().cast::<u32>().write(0xB8B8_B8B8);
            assert_eq!(span.rx.as_ptr().cast::<u32>().read(), 0xB8B8_B8B8);
        }
        allocator.release(span.rx).expect("release failed");
    }

    #[test]
    fn test_custom_granularity_rounds_requests() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            granularity: 256,
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);
        let span = allocator.alloc(8).expect("alloc failed");
        assert_eq!(span.size, 256);
    }

    #[test]
    fn test_invalid_params_fall_back_to_defaults() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let params = CreateParams {
            block_size: 12_345,
            granularity: 100,
            ..CreateParams::default()
        };
        let allocator = JitAllocator::new(params);
        let span = allocator.alloc(8).expect("alloc failed");
        assert_eq!(span.size, 64, "granularity must fall back to 64");
        assert!(
            allocator.statistics().reserved_size >= 64 * 1024,
            "block size must fall back to the page granularity"
        );
    }

    #[cfg(not(miri))]
    #[test]
    fn test_oversized_request_gets_dedicated_block() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let size = MAX_GROWN_BLOCK_SIZE + 1024 * 1024;
        let span = allocator.alloc(size).expect("oversized alloc failed");
        assert_eq!(span.size, size);
        assert_eq!(allocator.query(span.rx).unwrap().size, size);
        allocator.release(span.rx).expect("release failed");
    }

    #[test]
    fn test_query_on_interior_area_returns_area_base() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(256).expect("alloc failed");
        // An area-aligned pointer into the middle of the span resolves to
        // that area; the reported size runs to the allocation's end.
        let interior = NonNull::new(unsafe { span.rx.as_ptr().add(128) }).unwrap();
        let queried = allocator.query(interior).expect("query failed");
        assert_eq!(queried.rx, interior);
        assert_eq!(queried.size, 128);
    }

    #[test]
    fn test_global_gauges_track_reserved_and_used() {
        let _guard = crate::TEST_MUTEX.write().unwrap();
        let reserved_before = stats::TOTAL_RESERVED.bytes();
        let used_before = stats::TOTAL_USED.bytes();

        {
            let allocator = JitAllocator::new(CreateParams::default());
            let span = allocator.alloc(64).expect("alloc failed");
            assert!(stats::TOTAL_RESERVED.bytes() >= reserved_before + 64 * 1024);
            assert_eq!(stats::TOTAL_USED.bytes(), used_before + 64);

            allocator.release(span.rx).expect("release failed");
            assert_eq!(stats::TOTAL_USED.bytes(), used_before);
        }

        assert_eq!(stats::TOTAL_RESERVED.bytes(), reserved_before);
        assert_eq!(stats::TOTAL_USED.bytes(), used_before);
    }

    #[cfg(not(miri))]
    #[test]
    fn test_concurrent_alloc_release() {
        use crate::sync::thread;
        use crate::sync::Arc;

        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = Arc::new(JitAllocator::new(CreateParams::default()));

        let handles: Vec<thread::JoinHandle<()>> = (0..4)
            .map(|t| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    let mut rng = Rng::new(t);
                    for _ in 0..200 {
                        let size = 8 + (rng.next_u32() % 1017) as usize;
                        let span = allocator.alloc(size).expect("alloc failed");
                        // Safety: the span is live and private to this thread.
                        unsafe { span.rw.as_ptr().write(t as u8) };
                        allocator.release(span.rx).expect("release failed");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = allocator.statistics();
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.used_size, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not the start of a live allocation")]
    fn test_release_of_interior_pointer_panics_in_debug() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let allocator = JitAllocator::new(CreateParams::default());

        let span = allocator.alloc(256).expect("alloc failed");
        let interior = NonNull::new(unsafe { span.rx.as_ptr().add(64) }).unwrap();
        let _ = allocator.release(interior);
    }
}
