//! Loom-based concurrency tests.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Every interleaving of concurrent allocator calls must linearize through
//! the per-allocator mutex. The VM layer is the heap-backed mock under
//! `cfg(loom)`, so no real mappings are created.
//!
//! # Design notes
//!
//! Loom enumerates thread interleavings exhaustively, so:
//!   - Thread counts kept to 2 (state space is exponential).
//!   - One alloc/release pair per thread.
//!   - A fresh `JitAllocator` per model iteration (its construction goes
//!     through the VmOps mock under cfg(loom)).
#[cfg(loom)]
mod tests {
    use crate::allocator::{CreateParams, JitAllocator, JitAllocatorOptions};
    use crate::sync::Arc;

    #[test]
    fn loom_concurrent_alloc_release() {
        loom::model(|| {
            let allocator = Arc::new(JitAllocator::new(CreateParams::default()));
            let a1 = allocator.clone();
            let a2 = allocator.clone();

            let t1 = loom::thread::spawn(move || {
                let span = a1.alloc(64).expect("alloc failed");
                a1.release(span.rx).expect("release failed");
            });
            let t2 = loom::thread::spawn(move || {
                let span = a2.alloc(128).expect("alloc failed");
                a2.release(span.rx).expect("release failed");
            });

            t1.join().unwrap();
            t2.join().unwrap();

            let stats = allocator.statistics();
            assert_eq!(stats.allocation_count, 0);
            assert_eq!(stats.used_size, 0);
        });
    }

    #[test]
    fn loom_concurrent_alloc_query() {
        loom::model(|| {
            let allocator = Arc::new(JitAllocator::new(CreateParams {
                options: JitAllocatorOptions {
                    immediate_release: true,
                    ..JitAllocatorOptions::default()
                },
                ..CreateParams::default()
            }));
            let a1 = allocator.clone();
            let a2 = allocator.clone();

            let t1 = loom::thread::spawn(move || {
                let span = a1.alloc(64).expect("alloc failed");
                let queried = a1.query(span.rx).expect("query failed");
                assert_eq!(queried.size, span.size);
                a1.release(span.rx).expect("release failed");
            });
            let t2 = loom::thread::spawn(move || {
                let span = a2.alloc(64).expect("alloc failed");
                a2.release(span.rx).expect("release failed");
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // immediate_release: no empty reserve survives.
            assert_eq!(allocator.statistics().block_count, 0);
        });
    }
}
