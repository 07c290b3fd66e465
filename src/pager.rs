//! OS page mapper.
//!
//! Thin wrapper over anonymous `mmap(2)`/`munmap(2)`. Every chunk the
//! allocator manages is one mapping obtained here and eventually returned
//! here (or left for the OS to reclaim at process exit).

use std::ptr;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};

/// Reads the virtual memory page size from the OS. Usually 4096.
pub(crate) fn page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
}

/// Maps `len` bytes of fresh anonymous read-write memory.
///
/// Returns null if the OS refuses the mapping. `len` must be a multiple of
/// [`page_size`].
///
/// # Safety
///
/// Safe to call at any time; marked unsafe because the returned region is
/// uninitialized raw memory the caller must frame before use.
pub(crate) unsafe fn map_pages(len: usize) -> *mut u8 {
  unsafe {
    let addr = libc::mmap(
      ptr::null_mut::<c_void>(),
      len,
      PROT_READ | PROT_WRITE,
      MAP_PRIVATE | MAP_ANONYMOUS,
      -1,
      0,
    );

    if addr == MAP_FAILED {
      return ptr::null_mut();
    }

    addr as *mut u8
  }
}

/// Returns a mapping to the OS.
///
/// # Safety
///
/// `base` must be the exact address returned by a prior live [`map_pages`]
/// call and `len` must match that mapping's length. No pointer into the
/// region may be used afterwards.
pub(crate) unsafe fn unmap_pages(
  base: *mut u8,
  len: usize,
) {
  unsafe {
    libc::munmap(base as *mut c_void, len);
  }
}
