//! Black-box coverage of the concrete seeds in spec section 8, driven purely
//! through the public `Fragmalloc` surface (no access to internal bin state).
//!
//! Every arena above the thread cache (fast bins, unsorted queue, small/large
//! bins, top) is process-global, so a test cannot assume it is looking at a
//! pristine heap — other tests may run concurrently against the very same
//! arena. Each test spawns its own OS thread so its *thread cache* (which
//! genuinely is thread-local) starts empty regardless of what ran earlier on
//! a recycled test-harness thread, and assertions are written to hold
//! regardless of what unrelated concurrent allocations have left behind.

use fragmalloc::{Fragmalloc, TunableId};
use std::thread;

/// Scenario 1: thread-cache hit. Releasing and immediately re-requesting the
/// same size returns the same address. Safe under concurrency: the thread
/// cache is thread-local, so no other thread can observe or disturb it.
#[test]
fn thread_cache_hit_returns_same_pointer() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        unsafe {
            let p1 = a.allocate(24).expect("first allocation");
            a.release(p1.as_ptr());
            let p2 = a.allocate(24).expect("second allocation");
            assert_eq!(p1.as_ptr(), p2.as_ptr());
            a.release(p2.as_ptr());
        }
    })
    .join()
    .unwrap();
}

/// Scenario 2: fast-tier LIFO. With the thread cache disabled, three chunks
/// of an unusual size (so this test's pushes/pops aren't interleaved with
/// anything else this suite does to the same size class) released in order
/// A, B, C come back out C, B, A.
#[test]
fn fast_tier_is_lifo_with_thread_cache_disabled() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        assert!(a.set_tunable(TunableId::TcacheEnabled, 0));
        let size = 77usize;
        unsafe {
            let pa = a.allocate(size).expect("alloc A");
            let pb = a.allocate(size).expect("alloc B");
            let pc = a.allocate(size).expect("alloc C");

            a.release(pa.as_ptr());
            a.release(pb.as_ptr());
            a.release(pc.as_ptr());

            let first = a.allocate(size).expect("realloc 1");
            let second = a.allocate(size).expect("realloc 2");
            let third = a.allocate(size).expect("realloc 3");

            assert_eq!(first.as_ptr(), pc.as_ptr());
            assert_eq!(second.as_ptr(), pb.as_ptr());
            assert_eq!(third.as_ptr(), pa.as_ptr());

            a.release(first.as_ptr());
            a.release(second.as_ptr());
            a.release(third.as_ptr());
        }
    })
    .join()
    .unwrap();
}

/// Scenario 4 (weakened for a shared, possibly-contended arena): releasing a
/// large chunk and then making repeated small requests keeps succeeding with
/// the expected usable size, never aborting — the last-remainder fast path
/// (or any other tier that ends up serving the request) must leave the
/// allocator in a structurally sound state either way.
#[test]
fn small_requests_after_releasing_a_large_chunk_keep_succeeding() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        unsafe {
            let big = a.allocate(4096).expect("big allocation");
            a.release(big.as_ptr());

            for _ in 0..8 {
                let p = a.allocate(64).expect("small allocation after releasing a big chunk");
                assert!(a.usable_size(p.as_ptr()) >= 64);
                a.release(p.as_ptr());
            }
        }
    })
    .join()
    .unwrap();
}

/// Scenario 6 (partial, black-box): a request at/above the default mmap
/// threshold is served, is distinguishable as its own region (usable size
/// comfortably covers the request), and round-trips through release without
/// the corruption checks firing.
#[test]
fn large_request_is_served_and_released_cleanly() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        unsafe {
            let size = 200 * 1024;
            let p = a.allocate(size).expect("large allocation");
            assert!(a.usable_size(p.as_ptr()) >= size);
            core::ptr::write_bytes(p.as_ptr(), 0xCD, size);
            a.release(p.as_ptr());
        }
    })
    .join()
    .unwrap();
}

/// `allocate(0)` returns a valid, freeable pointer (spec section 8 round-trip
/// properties).
#[test]
fn zero_size_allocation_is_valid_and_freeable() {
    let a = Fragmalloc::new();
    unsafe {
        let p = a.allocate(0).expect("zero-size allocation should still succeed");
        a.release(p.as_ptr());
    }
}

/// `reallocate(p, usable_size(p))` is a no-op pointer-wise when a neighbor
/// blocks forward expansion.
#[test]
fn reallocate_to_same_usable_size_is_identity() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        unsafe {
            let p = a.allocate(100).expect("allocation");
            let keep_alive = a.allocate(16).expect("neighbor to block forward expansion");
            let usable = a.usable_size(p.as_ptr());
            let q = a.reallocate(p.as_ptr(), usable).expect("reallocate to its own usable size");
            assert_eq!(p.as_ptr(), q.as_ptr());
            a.release(q.as_ptr());
            a.release(keep_alive.as_ptr());
        }
    })
    .join()
    .unwrap();
}

/// A long alloc/free sequence of varying sizes must not panic, abort, or
/// corrupt state across iterations.
#[test]
fn repeated_alloc_free_cycles_do_not_corrupt_state() {
    let a = Fragmalloc::new();
    let sizes = [8usize, 40, 128, 512, 2048, 100_000];
    unsafe {
        for _ in 0..50 {
            let mut ptrs = Vec::new();
            for &s in &sizes {
                let p = a.allocate(s).unwrap_or_else(|| panic!("allocation of {s} bytes failed"));
                let usable = a.usable_size(p.as_ptr());
                core::ptr::write_bytes(p.as_ptr(), 0xAA, s.min(usable));
                ptrs.push(p);
            }
            for p in ptrs {
                a.release(p.as_ptr());
            }
        }
    }
}

/// `trim` does not panic or abort on an arena that has actually accumulated
/// trailing free space, and reports `false` (nothing worth trimming) on a
/// thread that never allocated anything.
#[test]
fn trim_does_not_corrupt_a_fresh_arena() {
    thread::spawn(|| {
        let a = Fragmalloc::new();
        assert!(!a.trim());
        unsafe {
            let p = a.allocate(64).expect("allocation");
            a.release(p.as_ptr());
        }
        let _ = a.trim();
    })
    .join()
    .unwrap();
}

#[test]
fn set_tunable_rejects_out_of_range_and_accepts_in_range_values() {
    let a = Fragmalloc::new();
    assert!(!a.set_tunable(TunableId::MaxFastUser, 81));
    assert!(a.set_tunable(TunableId::MaxFastUser, 80));
    assert!(!a.set_tunable(TunableId::TcacheCount, (u16::MAX as usize) + 1));
    assert!(a.set_tunable(TunableId::TcacheCount, 16));
}
