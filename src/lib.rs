//! Executable-memory allocator for JIT code generators.
//!
//! Memory is carved out of large virtual-memory blocks, each subdivided into
//! fixed-size areas and tracked by two bit vectors (occupancy plus a
//! stop-sentinel that recovers allocation lengths on release). Blocks are
//! stratified into pools by granularity, and every block is findable from a
//! pointer through an ordered address tree.
//!
//! Every allocation returns a [`Span`] with two views: `rx` to execute from
//! and `rw` to write through. With a single RWX mapping the views are equal;
//! under W^X policies the allocator maps blocks twice (or the platform JIT
//! mode is used) and the views differ. After writing code, flush the
//! instruction cache via [`flush_instruction_cache`] before executing it.
//!
//! ```no_run
//! use jitmem::{CreateParams, JitAllocator};
//!
//! let allocator = JitAllocator::new(CreateParams::default());
//! let span = allocator.alloc(64)?;
//! // Safety: span.rw is writable for span.size bytes.
//! unsafe { span.rw.as_ptr().write(0xC3) }; // ret
//! jitmem::flush_instruction_cache(span.rx.as_ptr(), span.size);
//! // ... execute through span.rx, then:
//! allocator.release(span.rx)?;
//! # Ok::<(), jitmem::Error>(())
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("jitmem supports only 64-bit targets.");

pub(crate) mod sync;

mod allocator;
mod bits;
mod block;
mod loom_tests;
mod pool;
pub(crate) mod stats;
mod vm;

pub use allocator::{
    CreateParams, JitAllocator, JitAllocatorOptions, ResetPolicy, Span, Statistics,
};
pub use vm::{
    flush_instruction_cache, protect_jit_memory, DualMapping, HardenedRuntimeInfo,
    ProtectJitAccess, ProtectJitReadWriteScope, VmError, VmInfo,
};

use std::fmt;

/// Errors surfaced by allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation on the uninitialized sentinel allocator.
    NotInitialized,
    /// Zero size where a non-zero size is required, or an operation on an
    /// unoccupied area of a live block.
    InvalidArgument,
    /// Requested size exceeds the engine limit.
    TooLarge,
    /// The VM mapping failed or a block-size computation overflowed.
    OutOfMemory,
    /// The pointer is not inside any live block, or the operation does not
    /// apply to the allocation in its current state.
    InvalidState,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "allocator is not initialized"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::TooLarge => write!(f, "requested size is too large"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::InvalidState => write!(f, "invalid allocator state for this operation"),
        }
    }
}

impl std::error::Error for Error {}

// Serializes tests that assert on the process-wide diagnostic gauges:
// gauge-asserting tests take `write`, everything else that touches an
// allocator takes `read`.
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}

#[cfg(test)]
pub(crate) mod testing {
    /// xorshift128+ seeded via splitmix64; deterministic and dependency-free.
    pub(crate) struct Rng {
        state: [u64; 2],
    }

    impl Rng {
        pub(crate) fn new(seed: u64) -> Self {
            let mut s = seed;
            let mut state = [0u64; 2];
            for slot in &mut state {
                s = s.wrapping_add(0x9E37_79B9_7F4A_7C15);
                let mut x = s;
                x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
                x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
                x ^= x >> 31;
                *slot = if x != 0 { x } else { 0x1F0A_2BE7_1D16_3FA0 };
            }
            Self { state }
        }

        pub(crate) fn next_u64(&mut self) -> u64 {
            let mut x = self.state[0];
            let y = self.state[1];
            x ^= x << 23;
            x ^= x >> 18;
            x ^= y ^ (y >> 5);
            self.state[0] = y;
            self.state[1] = x;
            x.wrapping_add(y)
        }

        pub(crate) fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }
    }
}
