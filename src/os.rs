//! The OS memory provider: the only place this crate calls
//! into the kernel. Two growth strategies feed the arena layer: moving the
//! classic break pointer for the primary arena's heap, and mapping anonymous
//! pages for auxiliary-arena sub-heaps and directly-mapped large allocations.
//! Split along a cfg(windows)/cfg(unix) line, using `winapi` and `libc`
//! for the same concerns on each side.

#[cfg(not(windows))]
use libc::{madvise, mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
#[cfg(not(windows))]
use libc::MADV_DONTNEED;

#[cfg(windows)]
use winapi::{
    shared::minwindef::DWORD,
    um::{
        errhandlingapi::GetLastError,
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_NOACCESS, PAGE_READWRITE},
    },
};

use core::ptr::NonNull;
use log::warn;
use once_cell::sync::OnceCell;

static PAGE_SIZE: OnceCell<usize> = OnceCell::new();

/// The platform page size, queried once and cached (teacher's `os_init`).
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(windows)]
        {
            let mut si: SYSTEM_INFO = unsafe { core::mem::zeroed() };
            unsafe { GetSystemInfo(&mut si) };
            let gran = si.dwAllocationGranularity as usize;
            if gran > 0 {
                gran
            } else {
                4096
            }
        }
        #[cfg(not(windows))]
        {
            let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if result > 0 {
                result as usize
            } else {
                4096
            }
        }
    })
}

#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    (size + align - 1) / align * align
}

#[inline]
pub fn align_down(size: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    (size / align) * align
}

#[inline]
fn align_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_up(ptr as usize, align) as *mut u8
}

/// Round a requested size up to a whole number of pages.
pub fn good_alloc_size(size: usize) -> usize {
    align_up(size, page_size())
}

/// Move the classic program break (spec section 4.7 primary arena growth).
/// Only meaningful on Unix; Windows has no analogous mechanism, so the
/// primary arena grows by mapping like every auxiliary arena there.
#[cfg(not(windows))]
pub unsafe fn extend_program_break(increment: isize) -> Option<*mut u8> {
    let prev = libc::sbrk(increment as libc::intptr_t);
    if prev == usize::MAX as *mut libc::c_void {
        None
    } else {
        Some(prev as *mut u8)
    }
}

#[cfg(windows)]
pub unsafe fn extend_program_break(_increment: isize) -> Option<*mut u8> {
    None
}

#[cfg(not(windows))]
unsafe fn unix_mmap(size: usize, prot: libc::c_int) -> *mut u8 {
    let p = mmap(core::ptr::null_mut(), size, prot, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0);
    if p == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        p as *mut u8
    }
}

#[cfg(windows)]
unsafe fn win_virtual_alloc(addr: *mut u8, size: usize, flags: DWORD) -> *mut u8 {
    VirtualAlloc(addr as _, size, flags, PAGE_READWRITE) as *mut u8
}

/// Map a fresh, zero-filled, committed anonymous region of at least `size`
/// bytes, page-rounded. Used for directly mapped large allocations and for
/// auxiliary-arena sub-heaps.
pub unsafe fn map_anonymous(size: usize) -> Option<NonNull<u8>> {
    let size = good_alloc_size(size);
    if size == 0 {
        return None;
    }
    #[cfg(windows)]
    let p = win_virtual_alloc(core::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT);
    #[cfg(not(windows))]
    let p = unix_mmap(size, PROT_READ | PROT_WRITE);
    NonNull::new(p)
}

/// Map a region of at least `size` bytes aligned to `align` (a power of two,
/// at least the page size). Teacher's overallocate-then-trim strategy
/// (`os_mem_alloc_aligned`): request extra, then release the slack around the
/// aligned interior (Unix can punch holes; Windows must keep the whole
/// reservation, so it retries with an address hint instead).
pub unsafe fn map_anonymous_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align >= page_size() && (align & (align - 1)) == 0);
    let size = good_alloc_size(size);
    if size == 0 || size >= usize::MAX - align {
        return None;
    }

    #[cfg(not(windows))]
    {
        let over_size = size + align;
        let p = unix_mmap(over_size, PROT_READ | PROT_WRITE);
        if p.is_null() {
            return None;
        }
        let aligned = align_up_ptr(p, align);
        let pre_size = aligned as usize - p as usize;
        let post_size = over_size - pre_size - size;
        if pre_size > 0 {
            munmap(p as *mut libc::c_void, pre_size);
        }
        if post_size > 0 {
            munmap((aligned as usize + size) as *mut libc::c_void, post_size);
        }
        NonNull::new(aligned)
    }
    #[cfg(windows)]
    {
        // Reserve an over-sized range to learn an aligned address, free it,
        // then race to re-reserve exactly there. A handful of retries covers
        // the case where another thread wins the address first.
        let over_size = size + align;
        for _ in 0..8 {
            let probe = win_virtual_alloc(core::ptr::null_mut(), over_size, MEM_RESERVE);
            if probe.is_null() {
                return None;
            }
            VirtualFree(probe as _, 0, MEM_RELEASE);
            let aligned = align_up_ptr(probe, align);
            let p = win_virtual_alloc(aligned, size, MEM_RESERVE | MEM_COMMIT);
            if p == aligned {
                return NonNull::new(p);
            }
            if !p.is_null() {
                VirtualFree(p as _, 0, MEM_RELEASE);
            }
        }
        None
    }
}

/// Release a region obtained from [`map_anonymous`]/[`map_anonymous_aligned`].
pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> bool {
    #[cfg(windows)]
    {
        let _ = size;
        let ok = VirtualFree(ptr.as_ptr() as _, 0, MEM_RELEASE) != 0;
        if !ok {
            warn!("VirtualFree failed: error {}", GetLastError());
        }
        ok
    }
    #[cfg(not(windows))]
    {
        let ok = munmap(ptr.as_ptr() as *mut libc::c_void, size) == 0;
        if !ok {
            warn!("munmap failed: errno {}", std::io::Error::last_os_error());
        }
        ok
    }
}

/// Advise the OS that `[addr, addr+size)` is no longer needed (spec section 4.7
/// trim): pages may be dropped, but the mapping stays valid and will read as
/// zero if touched again.
pub unsafe fn advise_dontneed(addr: *mut u8, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    #[cfg(windows)]
    {
        let p = VirtualAlloc(addr as _, size, MEM_RESET, PAGE_READWRITE);
        let ok = !p.is_null();
        if !ok {
            warn!("MEM_RESET failed: error {}", GetLastError());
        }
        ok
    }
    #[cfg(not(windows))]
    {
        let err = madvise(addr as *mut libc::c_void, size, MADV_DONTNEED);
        if err != 0 {
            warn!("madvise(MADV_DONTNEED) failed: errno {}", std::io::Error::last_os_error());
        }
        err == 0
    }
}

/// Toggle read/write access for a page-aligned region (used when poisoning
/// decommitted guard ranges; currently only exercised by tests).
#[cfg(not(windows))]
#[allow(dead_code)]
pub unsafe fn protect(addr: *mut u8, size: usize, readable: bool) -> bool {
    let prot = if readable { PROT_READ | PROT_WRITE } else { PROT_NONE };
    mprotect(addr as *mut libc::c_void, size, prot) == 0
}

#[cfg(windows)]
#[allow(dead_code)]
pub unsafe fn protect(addr: *mut u8, size: usize, readable: bool) -> bool {
    let mut old = 0;
    VirtualProtect(addr as _, size, if readable { PAGE_READWRITE } else { PAGE_NOACCESS }, &mut old) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn align_down_floors_to_boundary() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
    }

    #[test]
    fn page_size_is_nonzero_power_of_two() {
        let p = page_size();
        assert!(p > 0);
        assert_eq!(p & (p - 1), 0);
    }

    #[test]
    fn map_and_unmap_roundtrip() {
        unsafe {
            let region = map_anonymous(page_size()).expect("mmap should succeed");
            assert!(unmap(region, good_alloc_size(page_size())));
        }
    }

    #[test]
    fn map_anonymous_aligned_respects_alignment() {
        unsafe {
            let align = page_size() * 4;
            let region = map_anonymous_aligned(page_size(), align).expect("aligned mmap should succeed");
            assert_eq!(region.as_ptr() as usize % align, 0);
            assert!(unmap(region, good_alloc_size(page_size())));
        }
    }
}
