//! The allocation engine (spec section 4.3): normalizes the request, then
//! serves it from progressively slower tiers — thread cache, fast bins, the
//! exact small bin, the unsorted queue, large bins via the skip list, the
//! bitmap-guided next-larger bin, the top chunk — growing the arena only once
//! every bin has had a chance. Also home to the public-facing operations that
//! need direct chunk access: `reallocate`, `allocate_aligned`,
//! `allocate_zeroed`, `usable_size`.

use crate::arena::{self, Arena, ArenaInner};
use crate::bins;
use crate::chunk::{pad, ChunkPtr, MIN_CHUNK_SIZE, WORD};
use crate::free_engine;
use crate::os;
use crate::tcache;
use crate::tunables::Tunables;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

/// Bound on unsorted-queue drain iterations per call, independent of the
/// user-configurable `unsorted_drain_limit` (spec section 4.3 step 5: a hard
/// backstop against an adversarial or corrupted queue looping forever).
pub const MAX_UNSORTED_ITERS: usize = 10_000;

/// Allocate `size` bytes, or `None` on OS exhaustion or an unsatisfiable
/// request (zero-sized requests get the minimum chunk's usable size, matching
/// `malloc(0)`'s "a valid, freeable pointer" contract).
///
/// # Safety
/// Must only run while `tunables` outlives the returned pointer's lifetime
/// with the allocator.
pub unsafe fn allocate(size: usize, tunables: &Tunables) -> Option<NonNull<u8>> {
    let needed = match pad(size) {
        Some(n) => n,
        None => {
            crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
            return None;
        }
    };

    // Step 1: thread cache, no locking, no arena involved at all.
    if let Some(Some(chunk)) = tcache::with_tcache(tunables, |tc| tc.pop(needed)) {
        return Some(finish(chunk));
    }

    let arena = arena::pick_arena(tunables);

    // Step 2: fast bin, lock-free, with an opportunistic refill of the
    // thread cache from the rest of that size class's stack.
    if needed <= tunables.max_fast() {
        let idx = bins::fastbin_index(needed);
        if let Some(chunk) = arena.fastbins.pop(idx) {
            if bins::fastbin_index(chunk.size()) != idx {
                crate::error::abort_corrupted(crate::error::ErrorKind::WrongFastbinClass);
            }
            refill_tcache_from_fastbin(arena, idx, needed, tunables);
            return Some(finish(chunk));
        }
    }

    let mut inner = arena.lock();

    // Step 3: the exact small bin, with the same opportunistic refill.
    if bins::in_smallbin_range(needed) {
        let bin_idx = bins::smallbin_index(needed);
        if let Some(chunk) = pop_smallbin(&mut inner, bin_idx) {
            refill_tcache_from_smallbin(&mut inner, bin_idx, needed, tunables);
            inner.stats().allocated.increase(needed as i64);
            return Some(finish(chunk));
        }
    } else if arena.fastbins.have_fastchunks.load(Ordering::Relaxed) {
        // Step 4: a large request first forces fast-tier consolidation so
        // those chunks become available for coalescing and best-fit search.
        free_engine::consolidate_fastbins(arena, &mut inner);
    }

    // Steps 5-7: unsorted drain-and-classify, large-bin best fit, bitmap scan.
    if let Some(chunk) = try_serve_from_bins(&mut inner, needed, tunables) {
        inner.stats().allocated.increase(needed as i64);
        return Some(finish(chunk));
    }

    // Step 8: split the top chunk if it is big enough to leave a valid
    // remainder (spec section 4.3 step 8: "If size(top) >= n + MIN"). The top
    // chunk must never be exhausted down to nothing (spec section 3: its P
    // bit, and hence its existence, is permanent), so the gate includes MIN.
    if let Some(top) = inner.top() {
        if top.size() >= needed + MIN_CHUNK_SIZE {
            let chunk = split_top(&mut inner, top, needed);
            inner.stats().allocated.increase(needed as i64);
            return Some(finish(chunk));
        }
    }

    // Step 9: a last consolidation pass in case fast chunks freed since step 4
    // would now satisfy the request, then retry the same bin search once.
    if arena.fastbins.have_fastchunks.load(Ordering::Relaxed) {
        free_engine::consolidate_fastbins(arena, &mut inner);
        if let Some(chunk) = try_serve_from_bins(&mut inner, needed, tunables) {
            inner.stats().allocated.increase(needed as i64);
            return Some(finish(chunk));
        }
        if let Some(top) = inner.top() {
            if top.size() >= needed + MIN_CHUNK_SIZE {
                let chunk = split_top(&mut inner, top, needed);
                inner.stats().allocated.increase(needed as i64);
                return Some(finish(chunk));
            }
        }
    }

    // Step 10: every bin tier and the top chunk missed. Spec section 4.7's large
    // direct mapping is itself part of this OS-growth fallback, not a shortcut
    // ahead of it: only once nothing else could serve the request do we either
    // hand it a fresh mapping (large requests) or grow the arena and retry.
    if needed >= tunables.mmap_threshold() && tunables.mmapped_regions() < tunables.mmap_max() {
        drop(inner);
        return match allocate_mapped(needed, tunables) {
            Some(p) => Some(p),
            None => {
                crate::error::set_last_error(crate::error::AllocError::OutOfMemory);
                None
            }
        };
    }

    if arena.grow(&mut inner, needed, tunables) {
        let top = inner.top().expect("grow() always sets top on success");
        let chunk = split_top(&mut inner, top, needed);
        inner.stats().allocated.increase(needed as i64);
        return Some(finish(chunk));
    }

    crate::error::set_last_error(crate::error::AllocError::OutOfMemory);
    None
}

#[inline]
unsafe fn finish(chunk: ChunkPtr) -> NonNull<u8> {
    NonNull::new_unchecked(chunk.to_mem())
}

unsafe fn allocate_mapped(needed: usize, tunables: &Tunables) -> Option<NonNull<u8>> {
    let actual = os::good_alloc_size(needed);
    let region = os::map_anonymous(needed)?;
    let chunk = ChunkPtr::new(region);
    chunk.set_size_and_flags(actual, true, true, false);
    tunables.record_mmap(actual);
    Some(finish(chunk))
}

unsafe fn pop_smallbin(inner: &mut ArenaInner, idx: usize) -> Option<ChunkPtr> {
    let bin = inner.bin(idx);
    let victim = bin.last()?;
    bins::bin_detach(victim);
    if bin.is_empty() {
        inner.bitmap().clear(idx);
    }
    victim.next_chunk().set_prev_inuse(true);
    Some(victim)
}

unsafe fn refill_tcache_from_fastbin(arena: &Arena, idx: usize, needed: usize, tunables: &Tunables) {
    if !tunables.tcache_enabled() || idx >= tcache::NTCACHE_BINS {
        return;
    }
    tcache::with_tcache(tunables, |tc| {
        while (tc.count(idx) as usize) < tunables.tcache_count() {
            let chunk = match arena.fastbins.pop(idx) {
                Some(c) => c,
                None => break,
            };
            if !tc.push(needed, chunk, tunables) {
                let _ = arena.fastbins.push(idx, chunk);
                break;
            }
        }
    });
}

unsafe fn refill_tcache_from_smallbin(inner: &mut ArenaInner, bin_idx: usize, needed: usize, tunables: &Tunables) {
    if !tunables.tcache_enabled() || bin_idx >= tcache::NTCACHE_BINS {
        return;
    }
    tcache::with_tcache(tunables, |tc| {
        while (tc.count(bin_idx) as usize) < tunables.tcache_count() {
            let bin = inner.bin(bin_idx);
            let chunk = match bin.last() {
                Some(c) => c,
                None => break,
            };
            bins::bin_detach(chunk);
            if bin.is_empty() {
                inner.bitmap().clear(bin_idx);
            }
            chunk.next_chunk().set_prev_inuse(true);
            if !tc.push(needed, chunk, tunables) {
                bins::bin_push_back(inner.bin(bin_idx), chunk);
                inner.bitmap().mark(bin_idx);
                break;
            }
        }
    });
}

/// Spec section 4.3 steps 5-7: drain the unsorted queue (classifying
/// everything that isn't an exact or last-remainder fit), then look for a
/// large-bin best fit, then fall back to the bitmap-guided next larger bin.
unsafe fn try_serve_from_bins(inner: &mut ArenaInner, needed: usize, tunables: &Tunables) -> Option<ChunkPtr> {
    if let Some(chunk) = drain_unsorted(inner, needed, tunables) {
        return Some(chunk);
    }
    if !bins::in_smallbin_range(needed) {
        if let Some(chunk) = large_bin_best_fit(inner, needed) {
            return Some(finish_split(inner, chunk, needed));
        }
    }
    let scan_from = if bins::in_smallbin_range(needed) {
        bins::smallbin_index(needed) + 1
    } else {
        bins::largebin_index(needed)
    };
    if let Some(idx) = inner.bitmap().next_set_from(scan_from) {
        if let Some(chunk) = take_from_bin(inner, idx) {
            return Some(finish_split(inner, chunk, needed));
        }
    }
    None
}

unsafe fn drain_unsorted(inner: &mut ArenaInner, needed: usize, tunables: &Tunables) -> Option<ChunkPtr> {
    let configured_limit = tunables.unsorted_drain_limit();
    let mut iters = 0usize;
    loop {
        if iters >= MAX_UNSORTED_ITERS {
            return None;
        }
        if configured_limit > 0 && iters >= configured_limit {
            return None;
        }
        iters += 1;

        let bin = inner.bin(bins::UNSORTED_BIN);
        let victim = bin.last()?;
        bins::bin_detach(victim);
        let victim_size = victim.size();

        if victim_size == needed {
            victim.next_chunk().set_prev_inuse(true);
            return Some(victim);
        }

        if Some(victim) == inner.last_remainder()
            && bins::in_smallbin_range(needed)
            && victim_size >= needed + MIN_CHUNK_SIZE
        {
            inner.set_last_remainder(None);
            return Some(finish_split(inner, victim, needed));
        }

        if bins::in_smallbin_range(victim_size) {
            bins::bin_push_back(inner.bin(bins::smallbin_index(victim_size)), victim);
        } else {
            victim.set_fd_nextsize(core::ptr::null_mut());
            victim.set_bk_nextsize(core::ptr::null_mut());
            bins::insert_large(inner.bin(bins::bin_index(victim_size)), victim);
        }
        inner.bitmap().mark(bins::bin_index(victim_size));
    }
}

/// Best fit within the one large bin whose range covers `needed`: the main
/// list is strictly decreasing, so scanning from the smallest (the tail)
/// finds the first (smallest) chunk that still fits. Prefers an unpromoted
/// same-size duplicate over the representative itself, since removing a
/// duplicate needs no skip-list surgery.
unsafe fn large_bin_best_fit(inner: &mut ArenaInner, needed: usize) -> Option<ChunkPtr> {
    let idx = bins::largebin_index(needed);
    let bin = inner.bin(idx);
    let mut cur = bin.last()?;
    loop {
        if cur.size() >= needed {
            let dup_link = cur.fd();
            let victim = if dup_link != bin.self_ptr() && ChunkPtr::from_link(dup_link).size() == cur.size() {
                ChunkPtr::from_link(dup_link)
            } else {
                cur
            };
            bins::unlink(victim, Some(bin));
            if bin.is_empty() {
                inner.bitmap().clear(idx);
            }
            return Some(victim);
        }
        let prev_link = cur.bk();
        if prev_link == bin.self_ptr() {
            return None;
        }
        cur = ChunkPtr::from_link(prev_link);
    }
}

/// Take the largest (first) chunk out of bin `idx`, used once the bitmap has
/// pointed at some strictly larger bin than the one `needed` maps to (so any
/// member is guaranteed big enough).
unsafe fn take_from_bin(inner: &mut ArenaInner, idx: usize) -> Option<ChunkPtr> {
    let bin = inner.bin(idx);
    let victim = bin.first()?;
    let large_head = if idx >= bins::LARGE_BIN_BASE { Some(bin) } else { None };
    bins::unlink(victim, large_head);
    if bin.is_empty() {
        inner.bitmap().clear(idx);
    }
    Some(victim)
}

/// Split `chunk` (known to be at least `needed` bytes) into an in-use prefix
/// of exactly `needed` bytes and, if the remainder would itself be a valid
/// chunk, a free suffix queued onto unsorted and recorded as the last
/// remainder (spec section 4.3's last-remainder fast path feeds on this).
unsafe fn finish_split(inner: &mut ArenaInner, chunk: ChunkPtr, needed: usize) -> ChunkPtr {
    let total = chunk.size();
    let remainder_size = total - needed;
    let non_main = chunk.non_main_arena();
    if remainder_size < MIN_CHUNK_SIZE {
        chunk.set_size_and_flags(total, true, false, non_main);
        chunk.next_chunk().set_prev_inuse(true);
        return chunk;
    }
    chunk.set_size_and_flags(needed, true, false, non_main);
    let remainder = ChunkPtr::from_raw(chunk.as_ptr().add(needed));
    remainder.set_size_and_flags(remainder_size, true, false, non_main);
    remainder.write_footer();
    remainder.next_chunk().set_prev_inuse(false);
    bins::bin_push_front(inner.bin(bins::UNSORTED_BIN), remainder);
    inner.set_last_remainder(Some(remainder));
    chunk
}

/// Split the top chunk (spec section 4.3 step 8). Callers only reach this once
/// `top.size() >= needed + MIN` has already been checked, so the remainder
/// always qualifies as a chunk in its own right — the top chunk is the
/// arena's permanent frontier (spec section 3) and must never be driven to
/// `None` by a split.
unsafe fn split_top(inner: &mut ArenaInner, top: ChunkPtr, needed: usize) -> ChunkPtr {
    let total = top.size();
    debug_assert!(total >= needed + MIN_CHUNK_SIZE);
    let remainder_size = total - needed;
    let non_main = top.non_main_arena();
    top.set_size_and_flags(needed, true, false, non_main);
    let new_top = ChunkPtr::from_raw(top.as_ptr().add(needed));
    new_top.set_size_and_flags(remainder_size, true, false, non_main);
    inner.set_top(Some(new_top));
    top
}

/// The usable payload size of a live allocation (spec section 6 `usable_size`):
/// the chunk size minus the header, i.e. everything from `mem` onward.
///
/// # Safety
/// `mem` must be a live pointer from this allocator.
pub unsafe fn usable_size(mem: *mut u8) -> usize {
    ChunkPtr::from_mem(mem).size() - 2 * WORD
}

/// Allocate `count * elem_size` zero-initialized bytes (spec section 6
/// `allocate_zeroed(k, s)`, `calloc`'s contract): the multiplication is
/// checked here, ahead of [`allocate`]'s own size-overflow check on the
/// product, since a caller that pre-multiplied `k*s` itself could silently
/// wrap before either check ever saw it.
///
/// # Safety
/// Same as [`allocate`].
pub unsafe fn allocate_zeroed(count: usize, elem_size: usize, tunables: &Tunables) -> Option<NonNull<u8>> {
    let total = match count.checked_mul(elem_size) {
        Some(t) => t,
        None => {
            crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
            return None;
        }
    };
    let p = allocate(total, tunables)?;
    core::ptr::write_bytes(p.as_ptr(), 0, total);
    Some(p)
}

/// Allocate `size` bytes aligned to `align` (must be a power of two). Natural
/// allocations are already `ALIGN`-aligned; anything stricter is served by
/// over-allocating and carving an aligned interior chunk out of the result,
/// releasing the unused prefix back through the normal release path (mirrors
/// glibc's `_int_memalign`). Directly mapped allocations are not split this
/// way; an over-aligned request big enough to hit the mmap threshold fails
/// unless the mapping already happens to land on the right boundary.
///
/// # Safety
/// Same as [`allocate`].
pub unsafe fn allocate_aligned(size: usize, align: usize, tunables: &Tunables) -> Option<NonNull<u8>> {
    if align <= crate::chunk::ALIGN {
        return allocate(size, tunables);
    }
    if !align.is_power_of_two() {
        crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
        return None;
    }

    let needed = match pad(size) {
        Some(n) => n,
        None => {
            crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
            return None;
        }
    };
    let total_request = match needed.checked_add(align).and_then(|t| t.checked_add(MIN_CHUNK_SIZE)) {
        Some(t) => t,
        None => {
            crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
            return None;
        }
    };
    let raw_mem = allocate(total_request - 2 * WORD, tunables)?;
    let raw_chunk = ChunkPtr::from_mem(raw_mem.as_ptr());

    let mem_addr = raw_chunk.as_ptr() as usize + 2 * WORD;
    let aligned_mem = (mem_addr + align - 1) & !(align - 1);
    let front_slack = aligned_mem - mem_addr;

    if raw_chunk.is_mmapped() {
        if front_slack == 0 {
            return Some(raw_mem);
        }
        crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
        return None;
    }
    if front_slack == 0 {
        return Some(raw_mem);
    }

    let mut lead = front_slack;
    if lead < MIN_CHUNK_SIZE {
        lead += align;
    }

    let raw_size = raw_chunk.size();
    let non_main = raw_chunk.non_main_arena();
    let aligned_chunk = ChunkPtr::from_raw(raw_chunk.as_ptr().add(lead));
    aligned_chunk.set_size_and_flags(raw_size - lead, true, false, non_main);
    raw_chunk.set_size_and_flags(lead, true, false, non_main);

    free_engine::release(raw_chunk.to_mem(), tunables);
    Some(finish(aligned_chunk))
}

/// Resize a live allocation, preserving its contents up to the smaller of the
/// old and new sizes. A `new_size` of zero releases `mem` and returns `None`,
/// matching `realloc(p, 0)`.
///
/// # Safety
/// `mem` must be null or a live pointer from this allocator.
pub unsafe fn reallocate(mem: *mut u8, new_size: usize, tunables: &Tunables) -> Option<NonNull<u8>> {
    if mem.is_null() {
        return allocate(new_size, tunables);
    }
    if new_size == 0 {
        free_engine::release(mem, tunables);
        return None;
    }

    let chunk = ChunkPtr::from_mem(mem);
    let old_usable = chunk.size() - 2 * WORD;
    let needed = match pad(new_size) {
        Some(n) => n,
        None => {
            crate::error::set_last_error(crate::error::AllocError::InvalidArgument);
            return None;
        }
    };

    if chunk.is_mmapped() {
        let new_ptr = allocate(new_size, tunables)?;
        core::ptr::copy_nonoverlapping(mem, new_ptr.as_ptr(), old_usable.min(new_size));
        free_engine::release(mem, tunables);
        return Some(new_ptr);
    }

    let old_chunk_size = chunk.size();
    let non_main = chunk.non_main_arena();

    if needed <= old_chunk_size {
        let remainder_size = old_chunk_size - needed;
        if remainder_size >= MIN_CHUNK_SIZE {
            let arena = arena::owning_arena(chunk);
            {
                let _inner = arena.lock();
                chunk.set_size_and_flags(needed, true, false, non_main);
                let remainder = ChunkPtr::from_raw(chunk.as_ptr().add(needed));
                remainder.set_size_and_flags(remainder_size, true, false, non_main);
                remainder.write_footer();
                remainder.next_chunk().set_prev_inuse(true);
            }
            free_engine::release(ChunkPtr::from_raw(chunk.as_ptr().add(needed)).to_mem(), tunables);
        }
        return Some(NonNull::new_unchecked(mem));
    }

    let arena = arena::owning_arena(chunk);
    let mut inner = arena.lock();
    let next = chunk.next_chunk();
    let is_top = inner.top() == Some(next);
    if is_top || !next.prev_inuse() {
        let next_size = next.size();
        // Extending into the top chunk must leave it with at least MIN_CHUNK_SIZE
        // remaining (the top chunk always exists, never shrinks to nothing);
        // extending into an ordinary free neighbor has no such floor.
        let threshold = if is_top { needed + MIN_CHUNK_SIZE } else { needed };
        if old_chunk_size + next_size >= threshold {
            if !is_top {
                let large_head = if bins::in_smallbin_range(next_size) {
                    None
                } else {
                    Some(inner.bin(bins::bin_index(next_size)))
                };
                bins::unlink(next, large_head);
            }
            let combined = old_chunk_size + next_size;
            let remainder_size = combined - needed;
            if is_top {
                chunk.set_size_and_flags(needed, true, false, non_main);
                let new_top = ChunkPtr::from_raw(chunk.as_ptr().add(needed));
                new_top.set_size_and_flags(remainder_size, true, false, false);
                inner.set_top(Some(new_top));
            } else if remainder_size >= MIN_CHUNK_SIZE {
                chunk.set_size_and_flags(needed, true, false, non_main);
                let remainder = ChunkPtr::from_raw(chunk.as_ptr().add(needed));
                remainder.set_size_and_flags(remainder_size, true, false, non_main);
                remainder.write_footer();
                remainder.next_chunk().set_prev_inuse(false);
                bins::bin_push_front(inner.bin(bins::UNSORTED_BIN), remainder);
            } else {
                chunk.set_size_and_flags(combined, true, false, non_main);
                chunk.next_chunk().set_prev_inuse(true);
            }
            return Some(NonNull::new_unchecked(mem));
        }
    }
    drop(inner);

    let new_ptr = allocate(new_size, tunables)?;
    core::ptr::copy_nonoverlapping(mem, new_ptr.as_ptr(), old_usable);
    free_engine::release(mem, tunables);
    Some(new_ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_small_request_roundtrips() {
        let tunables = Tunables::default();
        unsafe {
            let p = allocate(32, &tunables).expect("allocation should succeed");
            assert!(usable_size(p.as_ptr()) >= 32);
            core::ptr::write_bytes(p.as_ptr(), 0xAB, 32);
            free_engine::release(p.as_ptr(), &tunables);
        }
    }

    #[test]
    fn allocate_zeroed_returns_zero_filled_memory() {
        let tunables = Tunables::default();
        unsafe {
            let p = allocate_zeroed(8, 8, &tunables).expect("allocation should succeed");
            let slice = core::slice::from_raw_parts(p.as_ptr(), 64);
            assert!(slice.iter().all(|&b| b == 0));
            free_engine::release(p.as_ptr(), &tunables);
        }
    }

    #[test]
    fn allocate_zeroed_rejects_a_count_times_size_overflow() {
        let tunables = Tunables::default();
        unsafe {
            assert!(allocate_zeroed(usize::MAX, 2, &tunables).is_none());
        }
    }

    #[test]
    fn allocate_aligned_respects_large_alignment() {
        let tunables = Tunables::default();
        unsafe {
            let p = allocate_aligned(128, 256, &tunables).expect("aligned allocation should succeed");
            assert_eq!(p.as_ptr() as usize % 256, 0);
            free_engine::release(p.as_ptr(), &tunables);
        }
    }

    #[test]
    fn reallocate_grows_and_preserves_contents() {
        let tunables = Tunables::default();
        unsafe {
            let p = allocate(16, &tunables).expect("allocation should succeed");
            core::ptr::write_bytes(p.as_ptr(), 0x7, 16);
            let grown = reallocate(p.as_ptr(), 512, &tunables).expect("reallocation should succeed");
            let slice = core::slice::from_raw_parts(grown.as_ptr(), 16);
            assert!(slice.iter().all(|&b| b == 0x7));
            free_engine::release(grown.as_ptr(), &tunables);
        }
    }

    #[test]
    fn reallocate_to_zero_releases_and_returns_none() {
        let tunables = Tunables::default();
        unsafe {
            let p = allocate(16, &tunables).expect("allocation should succeed");
            assert!(reallocate(p.as_ptr(), 0, &tunables).is_none());
        }
    }

    /// Builds a standalone free chunk of `size` bytes with a valid footer,
    /// backed by a leaked buffer so its address stays valid for the test.
    unsafe fn make_free_chunk(size: usize) -> ChunkPtr {
        let mut buf = vec![0u8; size + crate::chunk::ALIGN].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        core::mem::forget(buf);
        let chunk = ChunkPtr::from_raw(ptr);
        chunk.set_size_and_flags(size, true, false, false);
        chunk.write_footer();
        chunk
    }

    /// Large-bin best fit (spec section 8 scenario 5): with {1024, 1536, 2048}
    /// sitting in the 1024-byte-and-up large bin, a request for 1200 bytes
    /// must pick the smallest chunk that still fits — 1536, not 2048 — and
    /// split off the 336-byte remainder.
    #[test]
    fn large_bin_best_fit_picks_the_smallest_chunk_that_fits_and_splits_it() {
        let tunables = Tunables::default();
        unsafe {
            let arena = arena::pick_arena(&tunables);
            let mut inner = arena.lock();

            let needed = 1200;
            let idx = bins::largebin_index(needed);
            let small = make_free_chunk(1024);
            let mid = make_free_chunk(1536);
            let large = make_free_chunk(2048);
            bins::insert_large(inner.bin(idx), small);
            bins::insert_large(inner.bin(idx), mid);
            bins::insert_large(inner.bin(idx), large);

            let victim = large_bin_best_fit(&mut inner, needed).expect("a fitting chunk exists");
            assert_eq!(victim, mid);

            let served = finish_split(&mut inner, victim, needed);
            assert_eq!(served.size(), needed);
            let remainder = inner.last_remainder().expect("split leaves a remainder");
            assert_eq!(remainder.size(), 1536 - needed);
        }
    }
}
