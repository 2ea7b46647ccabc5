//! Multi-arena management (spec section 3 Arena, section 4.7, section 5).
//!
//! One primary arena grows via the break pointer (or, on platforms without
//! one, via the same sub-heap mapping strategy auxiliary arenas use).
//! Auxiliary arenas are created under contention, each backed by one or more
//! chained `HEAP_MAX`-aligned sub-heaps, up to a core-derived cap.

use crate::bins::{BinHead, Bitmap, FastBins, NBINS};
use crate::chunk::{is_aligned, ChunkPtr, ALIGN, MIN_CHUNK_SIZE};
use crate::os;
use crate::stats::ArenaStats;
use crate::tunables::{Tunables, HEAP_MAX};
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use parking_lot::{Mutex, MutexGuard};

/// Header placed at the start of every auxiliary-arena sub-heap mapping.
/// Because the mapping is `HEAP_MAX`-aligned, any chunk address inside it can
/// be masked down to recover this header (spec section 9: owning-arena discovery).
#[repr(C)]
struct SubHeapHeader {
    arena: *const Arena,
    prev: *mut SubHeapHeader,
    /// Total reserved size of this sub-heap (always `HEAP_MAX` here; kept as
    /// a field rather than a constant to mirror the teacher's per-segment
    /// size bookkeeping and to allow a future variable-size sub-heap).
    size: usize,
    /// Bytes of `size` already carved into chunks (this sub-heap's frontier).
    frontier: usize,
}

const SUB_HEAP_HEADER_SIZE: usize = {
    let raw = core::mem::size_of::<SubHeapHeader>();
    (raw + ALIGN - 1) & !(ALIGN - 1)
};

/// Mutex-protected arena state (spec section 3 Arena, section 5: "protected by the
/// arena mutex"). Fast-tier stacks live outside this, in [`Arena::fastbins`].
pub struct ArenaInner {
    bins: [BinHead; NBINS],
    bitmap: Bitmap,
    top: Option<ChunkPtr>,
    last_remainder: Option<ChunkPtr>,
    stats: ArenaStats,
    /// Primary arena only: one past the end of the break-pointer region we
    /// currently own, so we can tell a fresh `sbrk` extension is contiguous
    /// with our existing top chunk.
    brk_end: usize,
    /// Auxiliary arenas (and the primary on platforms without a break
    /// pointer): the most recently mapped sub-heap.
    current_sub_heap: *mut SubHeapHeader,
}

unsafe impl Send for ArenaInner {}

impl ArenaInner {
    pub fn bin(&self, idx: usize) -> &BinHead {
        &self.bins[idx]
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn top(&self) -> Option<ChunkPtr> {
        self.top
    }

    pub fn set_top(&mut self, chunk: Option<ChunkPtr>) {
        self.top = chunk;
    }

    pub fn last_remainder(&self) -> Option<ChunkPtr> {
        self.last_remainder
    }

    pub fn set_last_remainder(&mut self, chunk: Option<ChunkPtr>) {
        self.last_remainder = chunk;
    }

    pub fn stats(&self) -> &ArenaStats {
        &self.stats
    }
}

pub struct Arena {
    inner: Mutex<ArenaInner>,
    pub fastbins: FastBins,
    attached_threads: AtomicUsize,
    is_primary: bool,
    next: AtomicPtr<Arena>,
    /// One past the highest address this arena currently owns from the OS
    /// (the primary's `brk_end`, or the active sub-heap's mapped end).
    /// Mirrored outside the mutex so `release` can reject a wild pointer
    /// (spec section 4.4 step 1: "does not straddle the arena's frontier")
    /// without taking the lock on every free.
    frontier_limit: AtomicUsize,
}

impl Arena {
    fn new(is_primary: bool) -> Box<Arena> {
        Box::new(Arena {
            inner: Mutex::new(ArenaInner {
                bins: core::array::from_fn(|_| BinHead::default()),
                bitmap: Bitmap::default(),
                top: None,
                last_remainder: None,
                stats: ArenaStats::default(),
                brk_end: 0,
                current_sub_heap: core::ptr::null_mut(),
            }),
            fastbins: FastBins::default(),
            attached_threads: AtomicUsize::new(0),
            is_primary,
            next: AtomicPtr::new(core::ptr::null_mut()),
            frontier_limit: AtomicUsize::new(0),
        })
    }

    /// Whether `[chunk, chunk+size)` lies within this arena's currently owned
    /// OS memory. A `frontier_limit` of `0` means the arena has not grown yet
    /// (every pointer is out of range).
    pub fn contains_range(&self, chunk: ChunkPtr, size: usize) -> bool {
        let limit = self.frontier_limit.load(Ordering::Relaxed);
        limit != 0 && (chunk.as_ptr() as usize).saturating_add(size) <= limit
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ArenaInner>> {
        self.inner.try_lock()
    }

    #[inline]
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Grow this arena to serve at least `min_size` more bytes, extending the
    /// top chunk in place (spec section 4.7). Returns `false` on OS exhaustion.
    pub fn grow(&self, inner: &mut ArenaInner, min_size: usize, tunables: &Tunables) -> bool {
        if self.is_primary {
            if self.grow_via_break(inner, min_size, tunables) {
                return true;
            }
            // Break pointer unavailable or exhausted: fall back to the same
            // sub-heap strategy auxiliary arenas use, same as the note in
            // os.rs about platforms with no program break at all.
        }
        self.grow_via_sub_heap(inner, min_size, tunables)
    }

    fn grow_via_break(&self, inner: &mut ArenaInner, min_size: usize, tunables: &Tunables) -> bool {
        let increment = os::align_up(min_size + tunables.top_pad() + MIN_CHUNK_SIZE, os::page_size());
        let prev = match unsafe { os::extend_program_break(increment as isize) } {
            Some(p) if !p.is_null() => p,
            _ => return false,
        };
        let contiguous = inner.top.is_some() && prev as usize == inner.brk_end;
        if contiguous {
            let top = inner.top.unwrap();
            unsafe {
                let new_size = top.size() + increment;
                top.set_size_and_flags(new_size, true, false, false);
            }
        } else {
            // First growth, or the break moved elsewhere underneath us
            // (another allocator sharing the break region): start a fresh top.
            // A pre-existing top too small to keep is simply abandoned; the
            // allocation engine only ever reads `top` through this field.
            let new_top = unsafe { ChunkPtr::from_raw(prev) };
            unsafe {
                new_top.set_size_and_flags(increment, true, false, false);
            }
            inner.top = Some(new_top);
        }
        inner.brk_end = prev as usize + increment;
        self.frontier_limit.store(inner.brk_end, Ordering::Relaxed);
        inner.stats.reserved.increase(increment as i64);
        true
    }

    fn grow_via_sub_heap(&self, inner: &mut ArenaInner, min_size: usize, tunables: &Tunables) -> bool {
        let _ = tunables; // top_pad only shapes the break-pointer path; sub-heaps hand out the whole reservation
        unsafe {
            let current = inner.current_sub_heap;
            if !current.is_null() {
                let remaining = (*current).size - (*current).frontier;
                if remaining >= min_size + MIN_CHUNK_SIZE {
                    let top_addr = (current as *mut u8).add((*current).frontier);
                    let top = ChunkPtr::from_raw(top_addr);
                    let size = remaining;
                    top.set_size_and_flags(size, true, false, !self.is_primary);
                    (*current).frontier += size;
                    inner.top = Some(top);
                    self.frontier_limit
                        .store(current as usize + (*current).size, Ordering::Relaxed);
                    return true;
                }
            }

            if min_size + MIN_CHUNK_SIZE + SUB_HEAP_HEADER_SIZE > HEAP_MAX {
                return false;
            }
            let region = match os::map_anonymous_aligned(HEAP_MAX, HEAP_MAX) {
                Some(r) => r,
                None => return false,
            };
            let header = region.as_ptr() as *mut SubHeapHeader;
            (*header).arena = self as *const Arena;
            (*header).prev = current;
            (*header).size = HEAP_MAX;
            (*header).frontier = SUB_HEAP_HEADER_SIZE;
            inner.current_sub_heap = header;

            let top_addr = region.as_ptr().add(SUB_HEAP_HEADER_SIZE);
            let top = ChunkPtr::from_raw(top_addr);
            let top_size = HEAP_MAX - SUB_HEAP_HEADER_SIZE;
            top.set_size_and_flags(top_size, true, false, !self.is_primary);
            (*header).frontier = HEAP_MAX;
            inner.top = Some(top);
            self.frontier_limit
                .store(header as usize + HEAP_MAX, Ordering::Relaxed);
            inner.stats.reserved.increase(HEAP_MAX as i64);
            true
        }
    }

    /// Primary-arena trim (spec section 4.7): the break pointer retracted by
    /// `extra` bytes, so the frontier bound shrinks to match.
    pub fn shrink_frontier(&self, inner: &mut ArenaInner, extra: usize) {
        inner.brk_end -= extra;
        self.frontier_limit.store(inner.brk_end, Ordering::Relaxed);
    }

    /// Recover the owning arena from a chunk belonging to a non-primary
    /// arena's sub-heap (spec section 9: `addr & ~(HEAP_MAX-1)`).
    ///
    /// # Safety
    /// `chunk` must actually belong to some auxiliary arena's sub-heap.
    pub unsafe fn owning_from_sub_heap(chunk: ChunkPtr) -> &'static Arena {
        let base = (chunk.as_ptr() as usize) & !(HEAP_MAX - 1);
        let header = base as *mut SubHeapHeader;
        &*(*header).arena
    }
}

fn arena_cap() -> usize {
    let ncpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let per_core = if core::mem::size_of::<usize>() >= 8 { 8 } else { 2 };
    ncpus.saturating_mul(per_core).max(1)
}

static PRIMARY: Mutex<Option<&'static Arena>> = Mutex::new(None);
static ARENA_RING: Mutex<Vec<&'static Arena>> = Mutex::new(Vec::new());

thread_local! {
    static CURRENT_ARENA: Cell<Option<&'static Arena>> = Cell::new(None);
}

fn primary_arena() -> &'static Arena {
    let mut slot = PRIMARY.lock();
    if let Some(a) = *slot {
        return a;
    }
    let leaked: &'static Arena = Box::leak(Arena::new(true));
    *slot = Some(leaked);
    ARENA_RING.lock().push(leaked);
    leaked
}

/// Pick an arena for the calling thread (spec section 4.7 Arena binding, section 5):
/// tries every arena in the ring under a try-lock (an inherited affinity would
/// just be the first of these to succeed), creates a fresh arena on failure
/// while under the cap, or round-robins once the cap is reached. The result is
/// cached in the thread's affinity slot for every later call on this thread.
pub fn pick_arena(_tunables: &Tunables) -> &'static Arena {
    CURRENT_ARENA.with(|cell| {
        if let Some(a) = cell.get() {
            return a;
        }

        primary_arena(); // ensures the ring is non-empty and starts with it
        let mut ring = ARENA_RING.lock();

        for &candidate in ring.iter() {
            if let Some(guard) = candidate.try_lock() {
                drop(guard);
                candidate.attached_threads.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(candidate));
                return candidate;
            }
        }

        if ring.len() < arena_cap() {
            let leaked: &'static Arena = Box::leak(Arena::new(false));
            leaked.attached_threads.fetch_add(1, Ordering::Relaxed);
            ring.push(leaked);
            cell.set(Some(leaked));
            return leaked;
        }

        // At the cap and every arena contended right now: round-robin by
        // address hash of this thread's stack location, a cheap stand-in for
        // a thread id that needs no extra per-thread storage. The caller's
        // subsequent `lock()` simply waits its turn.
        let probe = &ring as *const _ as usize;
        let chosen = ring[probe % ring.len()];
        chosen.attached_threads.fetch_add(1, Ordering::Relaxed);
        cell.set(Some(chosen));
        chosen
    })
}

/// Identify the owning arena of a chunk from its header flags (spec section 4.4:
/// "the owning arena from the chunk's header flag and region metadata").
///
/// # Safety
/// `chunk` must be a chunk this allocator produced.
pub unsafe fn owning_arena(chunk: ChunkPtr) -> &'static Arena {
    debug_assert!(is_aligned(chunk.as_ptr()));
    if chunk.non_main_arena() {
        Arena::owning_from_sub_heap(chunk)
    } else {
        primary_arena()
    }
}
