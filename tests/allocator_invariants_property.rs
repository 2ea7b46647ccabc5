//! Property-based coverage of the invariants that hold for any allocation
//! sequence, as opposed to the concrete seeds in `boundary_scenarios.rs`.
//!
//! Runs each case on its own thread for the same reason `boundary_scenarios.rs`
//! does: fast bins/unsorted queue/small/large bins/top are process-global, so
//! only the thread cache is guaranteed pristine per test.

use fragmalloc::Fragmalloc;
use proptest::prelude::*;
use std::thread;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..512).prop_map(Op::Alloc),
        (0usize..32).prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any interleaving of allocations and frees, every live allocation's
    /// usable size is at least what was requested, and no two live
    /// allocations' byte ranges overlap.
    #[test]
    fn live_allocations_never_overlap_and_are_big_enough(
        ops in proptest::collection::vec(op_strategy(), 1..64),
    ) {
        thread::spawn(move || {
            let a = Fragmalloc::new();
            let mut live: Vec<(usize, *mut u8)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Some(p) = a.allocate(size) {
                            let usable = unsafe { a.usable_size(p.as_ptr()) };
                            prop_assert!(usable >= size);
                            for &(other_size, other_ptr) in &live {
                                let a_start = p.as_ptr() as usize;
                                let a_end = a_start + usable;
                                let b_start = other_ptr as usize;
                                let b_end = b_start + unsafe { a.usable_size(other_ptr) }.max(other_size);
                                prop_assert!(a_end <= b_start || b_end <= a_start);
                            }
                            live.push((size, p.as_ptr()));
                        }
                    }
                    Op::Free(idx) => {
                        if !live.is_empty() {
                            let (_, ptr) = live.remove(idx % live.len());
                            unsafe { a.release(ptr) };
                        }
                    }
                }
            }

            for (_, ptr) in live {
                unsafe { a.release(ptr) };
            }

            Ok(())
        })
        .join()
        .unwrap()?;
    }

    /// `allocate_zeroed(count, elem_size)` always returns memory that reads
    /// back as all zero bytes, regardless of the count/size split chosen.
    #[test]
    fn zeroed_allocations_are_always_zero_filled(
        count in 1usize..64,
        elem_size in 1usize..64,
    ) {
        thread::spawn(move || {
            let a = Fragmalloc::new();
            if let Some(p) = a.allocate_zeroed(count, elem_size) {
                let total = count * elem_size;
                let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), total) };
                prop_assert!(bytes.iter().all(|&b| b == 0));
                unsafe { a.release(p.as_ptr()) };
            }
            Ok(())
        })
        .join()
        .unwrap()?;
    }
}
