//! The process-wide parameter record (spec section 3 Parameter record, section 4.8).
//!
//! Read-mostly: every policy decision in the allocation/release engines
//! consults these via relaxed loads; updates go through validated setters
//! that hold the primary arena's mutex (spec section 5).

use crate::bins::DEFAULT_MAX_FAST_USER;
use crate::chunk::pad;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// The auxiliary-arena sub-heap size (spec section 4.7): 4 MiB mirrors the
/// teacher's `MI_SEGMENT_SIZE`/`MI_LARGE_PAGE_SIZE` choice for the same
/// "big enough to amortize mmap, small enough to bound waste" tradeoff.
pub const HEAP_MAX: usize = 4 * 1024 * 1024;

const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;
const DEFAULT_TOP_PAD: usize = 0;
const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
const DEFAULT_MMAP_THRESHOLD_MAX: usize = HEAP_MAX / 2;
const DEFAULT_MMAP_MAX: usize = 65536;
const DEFAULT_TCACHE_COUNT: usize = 7;
const DEFAULT_TCACHE_MAX_BYTES: usize = 1024;
const DEFAULT_UNSORTED_DRAIN_LIMIT: usize = 0; // 0 == unbounded (only MAX_ITERS applies)

/// Identifies a tunable for [`Tunables::set`] (spec section 6 `set_tunable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunableId {
    MaxFastUser,
    TrimThreshold,
    TopPad,
    MmapThreshold,
    MmapMax,
    TcacheEnabled,
    TcacheCount,
    TcacheMaxBytes,
    UnsortedDrainLimit,
}

pub struct Tunables {
    max_fast: AtomicUsize, // chunk size, 0 disables the fast tier
    trim_threshold: AtomicUsize,
    top_pad: AtomicUsize,
    mmap_threshold: AtomicUsize,
    mmap_threshold_initial: usize,
    mmap_max: AtomicUsize,
    no_dyn_threshold: AtomicBool,
    n_mmaps: AtomicUsize,
    mmapped_mem: AtomicUsize,
    tcache_enabled: AtomicBool,
    tcache_count: AtomicUsize,
    tcache_max_bytes: AtomicUsize,
    unsorted_drain_limit: AtomicUsize,
}

impl Default for Tunables {
    fn default() -> Self {
        let max_fast = pad(DEFAULT_MAX_FAST_USER).expect("default max_fast always valid");
        Tunables {
            max_fast: AtomicUsize::new(max_fast),
            trim_threshold: AtomicUsize::new(DEFAULT_TRIM_THRESHOLD),
            top_pad: AtomicUsize::new(DEFAULT_TOP_PAD),
            mmap_threshold: AtomicUsize::new(DEFAULT_MMAP_THRESHOLD),
            mmap_threshold_initial: DEFAULT_MMAP_THRESHOLD,
            mmap_max: AtomicUsize::new(DEFAULT_MMAP_MAX),
            no_dyn_threshold: AtomicBool::new(false),
            n_mmaps: AtomicUsize::new(0),
            mmapped_mem: AtomicUsize::new(0),
            tcache_enabled: AtomicBool::new(true),
            tcache_count: AtomicUsize::new(DEFAULT_TCACHE_COUNT),
            tcache_max_bytes: AtomicUsize::new(DEFAULT_TCACHE_MAX_BYTES),
            unsorted_drain_limit: AtomicUsize::new(DEFAULT_UNSORTED_DRAIN_LIMIT),
        }
    }
}

impl Tunables {
    #[inline]
    pub fn max_fast(&self) -> usize {
        self.max_fast.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn trim_threshold(&self) -> usize {
        self.trim_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn top_pad(&self) -> usize {
        self.top_pad.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mmap_threshold(&self) -> usize {
        self.mmap_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mmap_max(&self) -> usize {
        self.mmap_max.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tcache_enabled(&self) -> bool {
        self.tcache_enabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tcache_count(&self) -> usize {
        self.tcache_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tcache_max_bytes(&self) -> usize {
        self.tcache_max_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn unsorted_drain_limit(&self) -> usize {
        self.unsorted_drain_limit.load(Ordering::Relaxed)
    }

    pub fn record_mmap(&self, size: usize) {
        self.n_mmaps.fetch_add(1, Ordering::Relaxed);
        self.mmapped_mem.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_munmap(&self, size: usize) {
        self.n_mmaps.fetch_sub(1, Ordering::Relaxed);
        self.mmapped_mem.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn mmapped_regions(&self) -> usize {
        self.n_mmaps.load(Ordering::Relaxed)
    }

    /// Dynamic threshold adaptation on release of a directly mapped chunk
    /// (spec section 4.4 step 2): grow `mmap_threshold` to this chunk's size and
    /// `trim_threshold` to double that, each capped by the configured ceiling,
    /// unless dynamic adjustment has been disabled by a manual `set`.
    pub fn adapt_mmap_threshold(&self, freed_chunk_size: usize) {
        if self.no_dyn_threshold.load(Ordering::Relaxed) {
            return;
        }
        if freed_chunk_size > self.mmap_threshold() && freed_chunk_size <= DEFAULT_MMAP_THRESHOLD_MAX {
            self.mmap_threshold.store(freed_chunk_size, Ordering::Relaxed);
            self.trim_threshold
                .store(freed_chunk_size.saturating_mul(2), Ordering::Relaxed);
        }
    }

    /// Validated setter (spec section 4.8). Returns `false` (no change) on an
    /// out-of-range value.
    pub fn set(&self, id: TunableId, value: usize) -> bool {
        match id {
            TunableId::MaxFastUser => {
                let max_user_payload = 80usize;
                if value > max_user_payload {
                    return false;
                }
                let size = match pad(value) {
                    Some(s) => s,
                    None => return false,
                };
                // Setting max_fast first consolidates the fast tier: the caller
                // (`Fragmalloc::set_tunable`, the only place with both an arena
                // and this record in hand) is responsible for running bulk
                // consolidation before this store becomes visible, since that
                // requires arena state this record does not have access to.
                self.max_fast.store(size, Ordering::Relaxed);
                true
            }
            TunableId::TrimThreshold => {
                self.trim_threshold.store(value, Ordering::Relaxed);
                true
            }
            TunableId::TopPad => {
                self.top_pad.store(value, Ordering::Relaxed);
                true
            }
            TunableId::MmapThreshold => {
                if value > HEAP_MAX / 2 {
                    return false;
                }
                self.mmap_threshold.store(value, Ordering::Relaxed);
                self.no_dyn_threshold.store(true, Ordering::Relaxed);
                true
            }
            TunableId::MmapMax => {
                self.mmap_max.store(value, Ordering::Relaxed);
                true
            }
            TunableId::TcacheEnabled => {
                self.tcache_enabled.store(value != 0, Ordering::Relaxed);
                true
            }
            TunableId::TcacheCount => {
                if value > u16::MAX as usize {
                    return false;
                }
                self.tcache_count.store(value, Ordering::Relaxed);
                true
            }
            TunableId::TcacheMaxBytes => {
                self.tcache_max_bytes.store(value, Ordering::Relaxed);
                true
            }
            TunableId::UnsortedDrainLimit => {
                self.unsorted_drain_limit.store(value, Ordering::Relaxed);
                true
            }
        }
    }

    #[inline]
    pub fn initial_mmap_threshold(&self) -> usize {
        self.mmap_threshold_initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_max_fast_rejects_over_80_bytes() {
        let t = Tunables::default();
        assert!(!t.set(TunableId::MaxFastUser, 81));
        assert!(t.set(TunableId::MaxFastUser, 64));
    }

    #[test]
    fn set_mmap_threshold_disables_dynamic_adjustment() {
        let t = Tunables::default();
        let before = t.mmap_threshold();
        assert!(t.set(TunableId::MmapThreshold, 256 * 1024));
        t.adapt_mmap_threshold(300 * 1024);
        assert_eq!(t.mmap_threshold(), 256 * 1024);
        assert_ne!(t.mmap_threshold(), before);
    }

    #[test]
    fn releasing_a_large_mapped_chunk_raises_threshold_and_doubles_trim() {
        let t = Tunables::default();
        let freed_size = DEFAULT_MMAP_THRESHOLD_MAX / 2;
        assert!(freed_size > t.mmap_threshold());
        t.adapt_mmap_threshold(freed_size);
        assert_eq!(t.mmap_threshold(), freed_size);
        assert_eq!(t.trim_threshold(), freed_size * 2);
    }

    #[test]
    fn mmap_threshold_never_grows_past_its_ceiling() {
        let t = Tunables::default();
        t.adapt_mmap_threshold(DEFAULT_MMAP_THRESHOLD_MAX + 1);
        assert_eq!(t.mmap_threshold(), DEFAULT_MMAP_THRESHOLD);
    }
}
