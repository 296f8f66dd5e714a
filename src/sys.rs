//! Chunk-granular OS memory backing.
//!
//! mmap(2) does not take an alignment, so [`map_aligned`] over-maps by
//! `size + align`, keeps the aligned interior, and unmaps the head and tail
//! slivers. Only ever called with chunk-multiple sizes and chunk alignment.

use std::ptr;

use tracing::Level;

use crate::config::{CHUNK_ALIGN, CHUNK_SIZE};
use crate::util::UsizePtr;

/// Map an anonymous, readable, writable, private region of `size` bytes
/// aligned to `align`. Returns null on OS exhaustion.
///
/// `size` must be a positive multiple of [`CHUNK_SIZE`]; `align` must be
/// [`CHUNK_ALIGN`].
pub fn map_aligned(size: usize, align: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % CHUNK_SIZE == 0);
    debug_assert!(align == CHUNK_ALIGN);

    let over_alloc = size + align;
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            over_alloc,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return ptr::null_mut();
    }

    let raw_addr = raw as usize;
    let aligned_addr = (raw_addr + align - 1) & !(align - 1);
    let aligned_end = aligned_addr + size;
    let raw_end = raw_addr + over_alloc;

    let head_trim = aligned_addr - raw_addr;
    if head_trim > 0 {
        unsafe {
            libc::munmap(raw, head_trim);
        }
    }
    let tail_trim = raw_end - aligned_end;
    if tail_trim > 0 {
        unsafe {
            libc::munmap(aligned_end as *mut libc::c_void, tail_trim);
        }
    }

    tracing::event!(
        Level::TRACE,
        ptr = ?UsizePtr(aligned_addr),
        size,
        "sys::map_aligned"
    );
    aligned_addr as *mut u8
}

/// Release a region previously produced by [`map_aligned`] (or an exactly
/// chunk-multiple sub-range of one). munmap failing on memory we own means
/// the address space bookkeeping is corrupt, so it is fatal.
pub fn unmap(ptr: *mut u8, size: usize) {
    debug_assert!(!ptr.is_null());
    debug_assert!(size > 0);
    tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr), size, "sys::unmap");
    let rc = unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
    if rc != 0 {
        panic!(
            "munmap({:?}, {}) failed: {}",
            ptr,
            size,
            std::io::Error::last_os_error()
        );
    }
}
