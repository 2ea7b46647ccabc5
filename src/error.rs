//! Fatal-error diagnostics: corruption has no recovery path.
//!
//! Every invariant violation listed in the engine modules funnels through
//! [`abort_corrupted`], which logs and then aborts the process. We never
//! unwind here: a `GlobalAlloc` implementation must not let a panic cross
//! into arbitrary caller frames, and ptmalloc-style corruption is not
//! something a caller can meaningfully recover from anyway.

use core::fmt;

/// The kind of structural violation detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A chunk's footer (next chunk's `prev_size`) did not match its header size.
    HeaderFooterMismatch,
    /// A doubly linked bin list's `fd`/`bk` pointers did not agree with this node.
    BrokenLink,
    /// A large bin's `fd_nextsize`/`bk_nextsize` skip-list pointers were inconsistent.
    BrokenSkipLink,
    /// A chunk popped from a fast-tier stack did not belong to that stack's size class.
    WrongFastbinClass,
    /// The same chunk appeared twice in a fast-tier stack or thread-cache bin.
    DoubleFree,
    /// A pointer passed to `release`/`reallocate` was not chunk-aligned.
    Misaligned,
    /// A pointer passed to `release`/`reallocate` did not belong to any live chunk.
    PointerOutOfRange,
    /// A free chunk bordered another free chunk (a coalescing-discipline violation).
    AdjacentFreeChunks,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorKind::HeaderFooterMismatch => "corrupted size vs. prev_size",
            ErrorKind::BrokenLink => "corrupted double-linked list",
            ErrorKind::BrokenSkipLink => "corrupted double-linked list (not small)",
            ErrorKind::WrongFastbinClass => "invalid fastbin entry (size class mismatch)",
            ErrorKind::DoubleFree => "double free or corruption",
            ErrorKind::Misaligned => "misaligned pointer",
            ErrorKind::PointerOutOfRange => "pointer not allocated by this arena",
            ErrorKind::AdjacentFreeChunks => "invalid pointer (adjacent free chunks)",
        };
        f.write_str(msg)
    }
}

/// Log the corruption diagnostic and abort. Never returns.
#[cold]
#[inline(never)]
pub fn abort_corrupted(kind: ErrorKind) -> ! {
    log::error!("fragmalloc: {}", kind);
    std::process::abort()
}

/// Errors a caller-visible operation can report without aborting the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS provider could not supply more memory.
    OutOfMemory,
    /// The argument(s) were invalid (zero/non-power-of-two alignment, size overflow).
    InvalidArgument,
}

std::thread_local! {
    /// Spec section 7's "process-wide error indicator", kept per-thread the way
    /// `errno` itself is: a single process-wide cell would let one thread's
    /// failure silently shadow another's. Set on a failing operation, never
    /// cleared on success (matching `errno`'s own contract — callers check it
    /// only right after a call that reported failure).
    static LAST_ERROR: core::cell::Cell<Option<AllocError>> = core::cell::Cell::new(None);
}

/// Record the most recent failure on the calling thread's public-facing
/// allocator calls.
pub fn set_last_error(err: AllocError) {
    LAST_ERROR.with(|cell| cell.set(Some(err)));
}

/// The most recent failure recorded by [`set_last_error`] on this thread, if any.
pub fn last_error() -> Option<AllocError> {
    LAST_ERROR.with(|cell| cell.get())
}
