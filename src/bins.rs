//! The per-arena free-chunk index: fast-tier stacks, the unsorted queue,
//! small bins, large bins with their skip list, and the non-empty-bin
//! bitmap.

use crate::chunk::{ChunkPtr, LinkNode, ALIGN, MIN_CHUNK_SIZE};
use crate::error::{abort_corrupted, ErrorKind};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Chunk size at which a request leaves the small-bin range and enters the
/// large-bin range: up to `MIN_LARGE` for small bins.
pub const NSMALLBINS: usize = 62;
pub const NLARGEBINS: usize = 63;
pub const MIN_LARGE: usize = MIN_CHUNK_SIZE + NSMALLBINS * ALIGN;

/// Reserved bin-array capacity: `NBINS = 128` is treated as authoritative
/// (matching glibc's own constant, which reserves a couple of slots beyond
/// the arithmetic minimum) and the two unused trailing slots are simply
/// left unreferenced.
pub const NBINS: usize = 128;
pub const UNSORTED_BIN: usize = 0;
pub const SMALL_BIN_BASE: usize = 1;
pub const LARGE_BIN_BASE: usize = SMALL_BIN_BASE + NSMALLBINS;

pub const NFASTBINS: usize = 10;
/// Default fast-tier ceiling: an 80-byte user payload.
pub const DEFAULT_MAX_FAST_USER: usize = 80;

#[inline]
pub fn fastbin_index(chunk_size: usize) -> usize {
    debug_assert!(chunk_size >= MIN_CHUNK_SIZE);
    ((chunk_size - MIN_CHUNK_SIZE) / ALIGN).min(NFASTBINS - 1)
}

#[inline]
pub fn in_smallbin_range(chunk_size: usize) -> bool {
    chunk_size < MIN_LARGE
}

#[inline]
pub fn smallbin_index(chunk_size: usize) -> usize {
    debug_assert!(in_smallbin_range(chunk_size));
    SMALL_BIN_BASE + (chunk_size - MIN_CHUNK_SIZE) / ALIGN
}

/// Faithful port of glibc's `largebin_index_64` nested-threshold formula,
/// rebased to a 0-origin local index.
#[inline]
pub fn largebin_index(chunk_size: usize) -> usize {
    debug_assert!(!in_smallbin_range(chunk_size));
    let sz = chunk_size;
    let raw = if (sz >> 6) <= 48 {
        48 + (sz >> 6)
    } else if (sz >> 9) <= 20 {
        91 + (sz >> 9)
    } else if (sz >> 12) <= 10 {
        110 + (sz >> 12)
    } else if (sz >> 15) <= 4 {
        119 + (sz >> 15)
    } else if (sz >> 18) <= 2 {
        124 + (sz >> 18)
    } else {
        126
    };
    LARGE_BIN_BASE + (raw - 64)
}

#[inline]
pub fn bin_index(chunk_size: usize) -> usize {
    if in_smallbin_range(chunk_size) {
        smallbin_index(chunk_size)
    } else {
        largebin_index(chunk_size)
    }
}

/// Inverse of [`smallbin_index`]: every chunk in that bin has exactly this size.
#[inline]
pub fn smallbin_size(idx: usize) -> usize {
    MIN_CHUNK_SIZE + (idx - SMALL_BIN_BASE) * ALIGN
}

/// One bin's sentinel. A real, fixed-address `LinkNode` so bin lists can
/// splice sentinel and chunk nodes interchangeably (design note: "sentinel
/// addressed as if it were a chunk", reimplemented here with a typed node
/// instead of pointer-arithmetic aliasing).
#[repr(C)]
pub struct BinHead {
    pub link: LinkNode,
}

impl BinHead {
    #[inline]
    pub fn self_ptr(&self) -> *mut LinkNode {
        &self.link as *const LinkNode as *mut LinkNode
    }

    #[inline]
    pub fn init(&mut self) {
        let me = self.self_ptr();
        self.link.fd = me;
        self.link.bk = me;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.link.fd == self.self_ptr()
    }

    /// The last (smallest, for a size-ordered large bin) real chunk, or `None`.
    #[inline]
    pub unsafe fn last(&self) -> Option<ChunkPtr> {
        if self.is_empty() {
            None
        } else {
            Some(ChunkPtr::from_link(self.link.bk))
        }
    }

    /// The first (largest, for a size-ordered large bin) real chunk, or `None`.
    #[inline]
    pub unsafe fn first(&self) -> Option<ChunkPtr> {
        if self.is_empty() {
            None
        } else {
            Some(ChunkPtr::from_link(self.link.fd))
        }
    }
}

impl Default for BinHead {
    fn default() -> Self {
        let mut b = BinHead {
            link: LinkNode {
                fd: core::ptr::null_mut(),
                bk: core::ptr::null_mut(),
            },
        };
        b.init();
        b
    }
}

/// Insert `chunk` at the head of `bin` (used for the unsorted queue and for
/// fresh same-size small-bin insertions).
pub unsafe fn bin_push_front(bin: &BinHead, chunk: ChunkPtr) {
    let me = bin.self_ptr();
    let old_first = (*me).fd;
    chunk.set_fd(old_first);
    chunk.set_bk(me);
    (*old_first).bk = chunk.link();
    (*me).fd = chunk.link();
}

/// Insert `chunk` at the tail of `bin`.
pub unsafe fn bin_push_back(bin: &BinHead, chunk: ChunkPtr) {
    let me = bin.self_ptr();
    let old_last = (*me).bk;
    chunk.set_bk(old_last);
    chunk.set_fd(me);
    (*old_last).fd = chunk.link();
    (*me).bk = chunk.link();
}

/// Detach `chunk` from whatever doubly linked bin list it sits in, without
/// any of the corruption checks `unlink` (section 4.6) performs — used for the
/// trusted fast paths (bulk consolidation of chunks we just validated).
pub unsafe fn bin_detach(chunk: ChunkPtr) {
    let fd = chunk.fd();
    let bk = chunk.bk();
    (*fd).bk = bk;
    (*bk).fd = fd;
}

/// Insert `chunk` into a large bin, keeping the main list strictly decreasing
/// in size and maintaining the `fd_nextsize`/`bk_nextsize` skip list of one
/// representative per distinct size. The skip list is its own circular ring
/// over representatives only — it never touches the bin's sentinel — so
/// `bin.first()`/`last()`
/// (the overall largest/smallest chunks present) are always representatives.
pub unsafe fn insert_large(bin: &BinHead, chunk: ChunkPtr) {
    if bin.is_empty() {
        chunk.set_fd_nextsize(chunk.link());
        chunk.set_bk_nextsize(chunk.link());
        bin_push_front(bin, chunk);
        return;
    }

    let chunk_size = chunk.size();
    let start = bin.first().unwrap();
    let mut rep = start;
    let mut found = None;
    loop {
        if rep.size() <= chunk_size {
            found = Some(rep);
            break;
        }
        let next = ChunkPtr::from_link(rep.fd_nextsize());
        if next == start {
            break;
        }
        rep = next;
    }

    match found {
        Some(rep) if rep.size() == chunk_size => {
            // Duplicate size: insert right after the representative on the
            // main list; duplicates never join the skip list themselves.
            chunk.set_fd_nextsize(core::ptr::null_mut());
            chunk.set_bk_nextsize(core::ptr::null_mut());
            let old_fd = rep.fd();
            chunk.set_fd(old_fd);
            chunk.set_bk(rep.link());
            (*old_fd).bk = chunk.link();
            rep.set_fd(chunk.link());
        }
        Some(rep) => {
            // New distinct size, smaller than `rep`'s predecessor and larger
            // than `rep`: splice into both lists immediately before `rep`.
            let before = ChunkPtr::from_link(rep.bk_nextsize());
            chunk.set_fd_nextsize(rep.link());
            chunk.set_bk_nextsize(before.link());
            rep.set_bk_nextsize(chunk.link());
            before.set_fd_nextsize(chunk.link());

            let old_bk = rep.bk();
            chunk.set_fd(rep.link());
            chunk.set_bk(old_bk);
            (*old_bk).fd = chunk.link();
            rep.set_bk(chunk.link());
        }
        None => {
            // Smaller than every representative present: new smallest,
            // appended at the main list's tail.
            let last = ChunkPtr::from_link(start.bk_nextsize());
            chunk.set_fd_nextsize(start.link());
            chunk.set_bk_nextsize(last.link());
            start.set_bk_nextsize(chunk.link());
            last.set_fd_nextsize(chunk.link());
            bin_push_back(bin, chunk);
        }
    }
}

/// Detach `chunk` from its bin's doubly linked list, validating link
/// consistency along the way. Pass the owning bin's head when `chunk` sits
/// in a large bin so skip-list consistency is also checked and repaired;
/// `None` for small bins and the unsorted queue, which have no skip list.
///
/// Representative-promotion invariant this relies on: every large-bin
/// insertion nulls `fd_nextsize`/`bk_nextsize` on a chunk inserted as a
/// same-size duplicate, and sets them only on the first chunk of
/// a new distinct size. That lets this function tell "my successor is a
/// duplicate sibling" (null fields, promote it) from "my successor is a
/// different size's representative" (non-null fields, just splice) without
/// ever reading through a bin sentinel as if it were a chunk.
pub unsafe fn unlink(chunk: ChunkPtr, large_bin_head: Option<&BinHead>) {
    if chunk.next_chunk().prev_size() != chunk.size() {
        abort_corrupted(ErrorKind::HeaderFooterMismatch);
    }
    let fd = chunk.fd();
    let bk = chunk.bk();
    if (*fd).bk != chunk.link() || (*bk).fd != chunk.link() {
        abort_corrupted(ErrorKind::BrokenLink);
    }
    (*fd).bk = bk;
    (*bk).fd = fd;

    if let Some(head) = large_bin_head {
        if !chunk.fd_nextsize().is_null() {
            let fd_is_real = fd != head.self_ptr();
            let fd_chunk = if fd_is_real { Some(ChunkPtr::from_link(fd)) } else { None };
            let fd_has_nextsize = fd_chunk.map_or(false, |c| !c.fd_nextsize().is_null());

            let p_fd_ns = chunk.fd_nextsize();
            let p_bk_ns = chunk.bk_nextsize();
            if let Some(fd_chunk) = fd_chunk.filter(|_| !fd_has_nextsize) {
                // `fd` is an un-promoted duplicate sibling: it inherits the
                // skip-list slot `chunk` is vacating.
                if p_fd_ns == chunk.link() {
                    fd_chunk.set_fd_nextsize(fd);
                    fd_chunk.set_bk_nextsize(fd);
                } else {
                    fd_chunk.set_fd_nextsize(p_fd_ns);
                    fd_chunk.set_bk_nextsize(p_bk_ns);
                    ChunkPtr::from_link(p_fd_ns).set_bk_nextsize(fd);
                    ChunkPtr::from_link(p_bk_ns).set_fd_nextsize(fd);
                }
            } else {
                // No duplicate to promote: splice `chunk` out of the skip list directly.
                if ChunkPtr::from_link(p_fd_ns).bk_nextsize() != chunk.link()
                    || ChunkPtr::from_link(p_bk_ns).fd_nextsize() != chunk.link()
                {
                    abort_corrupted(ErrorKind::BrokenSkipLink);
                }
                ChunkPtr::from_link(p_fd_ns).set_bk_nextsize(p_bk_ns);
                ChunkPtr::from_link(p_bk_ns).set_fd_nextsize(p_fd_ns);
            }
        }
    }
}

/// The 128-bit "possibly non-empty" summary over small + large bins.
pub struct Bitmap([AtomicUsize; 4]);

const BITS_PER_WORD: usize = usize::BITS as usize;

impl Default for Bitmap {
    fn default() -> Self {
        Bitmap([(); 4].map(|_| AtomicUsize::new(0)))
    }
}

impl Bitmap {
    #[inline]
    fn split(idx: usize) -> (usize, usize) {
        (idx / BITS_PER_WORD, idx % BITS_PER_WORD)
    }

    #[inline]
    pub fn mark(&self, idx: usize) {
        let (w, b) = Self::split(idx);
        self.0[w].fetch_or(1 << b, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear(&self, idx: usize) {
        let (w, b) = Self::split(idx);
        self.0[w].fetch_and(!(1 << b), Ordering::Relaxed);
    }

    #[inline]
    pub fn test(&self, idx: usize) -> bool {
        let (w, b) = Self::split(idx);
        self.0[w].load(Ordering::Relaxed) & (1 << b) != 0
    }

    /// Find the lowest set bit at index `>= from`, scanning word-at-a-time.
    /// Returns `None` once past the last bin.
    pub fn next_set_from(&self, from: usize) -> Option<usize> {
        let (mut w, b) = Self::split(from);
        if w >= self.0.len() {
            return None;
        }
        let mut word = self.0[w].load(Ordering::Relaxed) & (usize::MAX << b);
        loop {
            if word != 0 {
                return Some(w * BITS_PER_WORD + word.trailing_zeros() as usize);
            }
            w += 1;
            if w >= self.0.len() {
                return None;
            }
            word = self.0[w].load(Ordering::Relaxed);
        }
    }
}

/// Per-arena fast-tier: lock-free LIFO stacks, one per size class, with CAS
/// push/pop requiring no arena mutex.
pub struct FastBins {
    heads: [AtomicPtr<LinkNode>; NFASTBINS],
    pub have_fastchunks: core::sync::atomic::AtomicBool,
}

impl Default for FastBins {
    fn default() -> Self {
        FastBins {
            heads: [(); NFASTBINS].map(|_| AtomicPtr::new(core::ptr::null_mut())),
            have_fastchunks: core::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl FastBins {
    /// Push `chunk` onto class `idx`. Aborts on double-push (the chunk
    /// already sits at the head of this stack).
    pub unsafe fn push(&self, idx: usize, chunk: ChunkPtr) -> Result<(), ()> {
        let head = &self.heads[idx];
        let mut old = head.load(Ordering::Relaxed);
        loop {
            if old == chunk.link() as *mut LinkNode {
                return Err(());
            }
            chunk.set_fd(old as *mut LinkNode);
            match head.compare_exchange_weak(
                old,
                chunk.link(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.have_fastchunks.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => old = actual,
            }
        }
    }

    /// Pop the head of class `idx`, or `None` if empty.
    pub unsafe fn pop(&self, idx: usize) -> Option<ChunkPtr> {
        let head = &self.heads[idx];
        let mut old = head.load(Ordering::Acquire);
        loop {
            if old.is_null() {
                return None;
            }
            let chunk = ChunkPtr::from_link(old);
            let next = chunk.fd() as *mut LinkNode;
            match head.compare_exchange_weak(old, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(chunk),
                Err(actual) => old = actual,
            }
        }
    }

    /// Atomically take an entire stack, for bulk consolidation.
    pub unsafe fn take_all(&self, idx: usize) -> Option<ChunkPtr> {
        let head = &self.heads[idx];
        let old = head.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(ChunkPtr::from_link(old))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_boundary_matches_spec_scenario() {
        // Matches glibc's own MIN_LARGE_SIZE.
        assert_eq!(MIN_LARGE, 1024);
    }

    #[test]
    fn smallbin_roundtrip() {
        for i in 0..NSMALLBINS {
            let size = smallbin_size(SMALL_BIN_BASE + i);
            assert!(in_smallbin_range(size));
            assert_eq!(smallbin_index(size), SMALL_BIN_BASE + i);
        }
    }

    #[test]
    fn largebin_index_in_range() {
        let lo = largebin_index(MIN_LARGE);
        let hi = largebin_index(usize::MAX / 2);
        assert_eq!(lo, LARGE_BIN_BASE);
        assert!(hi < LARGE_BIN_BASE + NLARGEBINS);
    }

    #[test]
    fn bitmap_next_set_from() {
        let bm = Bitmap::default();
        bm.mark(5);
        bm.mark(70);
        assert_eq!(bm.next_set_from(0), Some(5));
        assert_eq!(bm.next_set_from(6), Some(70));
        bm.clear(70);
        assert_eq!(bm.next_set_from(6), None);
    }

    /// Builds a standalone chunk of `size` bytes with a valid footer, backed
    /// by a leaked buffer (leaked so the chunk's address stays valid for the
    /// life of the test, the way a real heap chunk would).
    unsafe fn make_chunk(size: usize) -> ChunkPtr {
        let mut buf = vec![0u8; size + ALIGN].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        core::mem::forget(buf);
        let chunk = ChunkPtr::from_raw(ptr);
        chunk.set_size_and_flags(size, true, false, false);
        chunk.write_footer();
        chunk
    }

    #[test]
    fn unlink_splices_middle_chunk_out_of_small_bin() {
        unsafe {
            let bin = BinHead::default();
            let a = make_chunk(MIN_CHUNK_SIZE);
            let b = make_chunk(MIN_CHUNK_SIZE);
            let c = make_chunk(MIN_CHUNK_SIZE);
            bin_push_back(&bin, a);
            bin_push_back(&bin, b);
            bin_push_back(&bin, c);

            unlink(b, None);

            assert_eq!(bin.first(), Some(a));
            assert_eq!(bin.last(), Some(c));
            assert_eq!(a.fd(), c.link());
            assert_eq!(c.bk(), a.link());
        }
    }

    #[test]
    fn unlink_promotes_duplicate_sibling_in_large_bin() {
        unsafe {
            let bin = BinHead::default();
            let rep = make_chunk(2048);
            let dup = make_chunk(2048);
            // `rep` is the distinct-size representative: self-looped skip list.
            rep.set_fd_nextsize(rep.link());
            rep.set_bk_nextsize(rep.link());
            // `dup` is an un-promoted same-size sibling: null skip-list fields.
            dup.set_fd_nextsize(core::ptr::null_mut());
            dup.set_bk_nextsize(core::ptr::null_mut());
            bin_push_back(&bin, rep);
            bin_push_back(&bin, dup);

            unlink(rep, Some(&bin));

            // `dup` inherits the representative slot, self-looped since it is
            // now the only chunk of this size.
            assert_eq!(dup.fd_nextsize(), dup.link());
            assert_eq!(dup.bk_nextsize(), dup.link());
        }
    }

    #[test]
    fn insert_large_keeps_decreasing_order_and_skip_list() {
        unsafe {
            let bin = BinHead::default();
            let a = make_chunk(2048); // inserted first, largest
            let b = make_chunk(1536); // new smallest
            let c = make_chunk(1536); // duplicate of b
            let d = make_chunk(1792); // new middle distinct size

            insert_large(&bin, a);
            insert_large(&bin, b);
            insert_large(&bin, c);
            insert_large(&bin, d);

            // Main list strictly decreasing: a, d, b, c (duplicate right after b).
            assert_eq!(bin.first(), Some(a));
            assert_eq!(a.fd(), d.link());
            assert_eq!(d.fd(), b.link());
            assert_eq!(b.fd(), c.link());
            assert_eq!(c.fd(), bin.self_ptr());

            // Skip list holds exactly the three distinct-size representatives.
            assert_eq!(a.fd_nextsize(), d.link());
            assert_eq!(d.fd_nextsize(), b.link());
            assert_eq!(b.fd_nextsize(), a.link());
            assert!(c.fd_nextsize().is_null());
        }
    }
}
