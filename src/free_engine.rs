//! The release engine (spec section 4.4, 4.5, 4.7 trim): validates the incoming
//! pointer, then tries progressively slower tiers — thread cache, fast tier,
//! then the locked coalescing path — before handing control back to the
//! caller. Bulk fast-tier consolidation and trim live here too since both are
//! triggered from the tail of a release.

use crate::arena::{self, Arena, ArenaInner};
use crate::bins::{self, BinHead};
use crate::chunk::{is_aligned, ChunkPtr, MIN_CHUNK_SIZE};
use crate::error::{abort_corrupted, ErrorKind};
use crate::os;
use crate::tcache;
use crate::tunables::Tunables;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

pub const FASTBIN_CONSOLIDATION_THRESHOLD: usize = 65536;

/// Release a user pointer obtained from the allocation engine. `mem` may be
/// null (a no-op, matching `free(NULL)`).
///
/// # Safety
/// `mem` must be null or a pointer this allocator produced and that has not
/// already been released.
pub unsafe fn release(mem: *mut u8, tunables: &Tunables) {
    if mem.is_null() {
        return;
    }
    if !is_aligned(mem) {
        abort_corrupted(ErrorKind::Misaligned);
    }
    let chunk = ChunkPtr::from_mem(mem);
    let size = chunk.size();
    if size < MIN_CHUNK_SIZE || !bins_size_well_formed(size) {
        abort_corrupted(ErrorKind::PointerOutOfRange);
    }

    if chunk.is_mmapped() {
        release_mapped(chunk, size, tunables);
        return;
    }

    // Spec section 4.4 step 1: the chunk must not straddle its arena's frontier.
    let owning = arena::owning_arena(chunk);
    if !owning.contains_range(chunk, size) {
        abort_corrupted(ErrorKind::PointerOutOfRange);
    }

    // The release-time double-free signature: a correctly in-use chunk's
    // physical successor must still have its P bit set.
    if !chunk.next_chunk().prev_inuse() {
        abort_corrupted(ErrorKind::DoubleFree);
    }

    if let Some(true) = tcache::with_tcache(tunables, |tc| tc.push(size, chunk, tunables)) {
        return;
    }

    if size <= tunables.max_fast() {
        let idx = bins::fastbin_index(size);
        match owning.fastbins.push(idx, chunk) {
            Ok(()) => return,
            Err(()) => abort_corrupted(ErrorKind::DoubleFree),
        }
    }

    let arena = owning;
    let mut inner = arena.lock();
    if let Some(merged_size) = coalesce_and_insert(&mut inner, chunk) {
        if merged_size > FASTBIN_CONSOLIDATION_THRESHOLD {
            consolidate_fastbins(arena, &mut inner);
        }
    }
    if let Some(top) = inner.top() {
        if top.size() > tunables.trim_threshold() {
            trim(arena, &mut inner, tunables);
        }
    }
}

#[inline]
fn bins_size_well_formed(size: usize) -> bool {
    size % crate::chunk::ALIGN == 0
}

unsafe fn release_mapped(chunk: ChunkPtr, size: usize, tunables: &Tunables) {
    tunables.adapt_mmap_threshold(size);
    tunables.record_munmap(size);
    os::unmap(NonNull::new_unchecked(chunk.as_ptr()), size);
}

fn large_bin_head(inner: &ArenaInner, size: usize) -> Option<&BinHead> {
    if bins::in_smallbin_range(size) {
        None
    } else {
        Some(inner.bin(bins::bin_index(size)))
    }
}

/// Coalesce `chunk` with any free neighbor and either insert it at the head
/// of the unsorted queue (returning its final size) or absorb it into the top
/// chunk (returning `None`). Spec section 4.4 step 5 / section 4.5's shared core.
pub unsafe fn coalesce_and_insert(inner: &mut ArenaInner, chunk: ChunkPtr) -> Option<usize> {
    let original_next = chunk.next_chunk();
    let mut size = chunk.size();
    let mut merged = chunk;

    if !merged.prev_inuse() {
        let prev = merged.prev_chunk();
        if prev.size() != merged.prev_size() {
            abort_corrupted(ErrorKind::HeaderFooterMismatch);
        }
        bins::unlink(prev, large_bin_head(inner, prev.size()));
        size += prev.size();
        merged = prev;
    }

    let is_top = inner.top() == Some(original_next);
    if is_top {
        size += original_next.size();
        let non_main = merged.non_main_arena();
        merged.set_size_and_flags(size, true, false, non_main);
        inner.set_top(Some(merged));
        None
    } else {
        if !original_next.prev_inuse() {
            bins::unlink(original_next, large_bin_head(inner, original_next.size()));
            size += original_next.size();
        } else {
            original_next.set_prev_inuse(false);
        }
        let non_main = merged.non_main_arena();
        merged.set_size_and_flags(size, true, false, non_main);
        merged.write_footer();
        merged.set_fd_nextsize(core::ptr::null_mut());
        merged.set_bk_nextsize(core::ptr::null_mut());
        bins::bin_push_front(inner.bin(bins::UNSORTED_BIN), merged);
        Some(size)
    }
}

/// Detach every fast-tier chunk, coalesce each with its neighbors, and queue
/// the results onto unsorted (spec section 4.5).
pub unsafe fn consolidate_fastbins(arena: &Arena, inner: &mut ArenaInner) {
    for idx in 0..bins::NFASTBINS {
        let mut cur = arena.fastbins.take_all(idx);
        while let Some(chunk) = cur {
            let next_link = chunk.fd();
            coalesce_and_insert(inner, chunk);
            cur = if next_link.is_null() {
                None
            } else {
                Some(ChunkPtr::from_link(next_link))
            };
        }
    }
    arena.fastbins.have_fastchunks.store(false, Ordering::Relaxed);
}

/// Return trailing unused pages from the top chunk to the OS (spec section 4.7).
pub unsafe fn trim(arena: &Arena, inner: &mut ArenaInner, tunables: &Tunables) -> bool {
    let top = match inner.top() {
        Some(t) => t,
        None => return false,
    };
    let pad = tunables.top_pad();
    let size = top.size();
    if size <= pad + MIN_CHUNK_SIZE {
        return false;
    }
    let page = os::page_size();
    let extra = os::align_down(size - pad - MIN_CHUNK_SIZE, page);
    if extra < page {
        return false;
    }

    if arena.is_primary() {
        match os::extend_program_break(-(extra as isize)) {
            Some(_) => {
                let new_size = size - extra;
                top.set_size_and_flags(new_size, true, false, false);
                arena.shrink_frontier(inner, extra);
                inner.stats().reserved.decrease(extra as i64);
                true
            }
            None => false,
        }
    } else {
        let addr = top.as_ptr().add(size - extra);
        os::advise_dontneed(addr, extra);
        top.set_size_and_flags(size - extra, true, false, true);
        true
    }
}
