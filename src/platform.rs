//! The platform services the allocators consume: page size and raw page mappings.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::InitError;

/// Fallback when `sysconf` cannot answer.
const DEFAULT_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The native page size, queried once and cached.
pub fn page_size() -> usize {
  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }

  let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  let size = match usize::try_from(queried) {
    Ok(size) if size.is_power_of_two() => size,
    _ => DEFAULT_PAGE_SIZE,
  };
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

pub(crate) unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// An anonymous mapping released on drop.
#[derive(Debug)]
pub(crate) struct NativeRegion {
  ptr: NonNull<u8>,
  len: usize,
}

// The region is plain memory owned by exactly one value.
unsafe impl Send for NativeRegion {}

impl NativeRegion {
  /// Maps `len` bytes, rounded up to whole pages.
  pub(crate) fn map(len: usize) -> Result<Self, InitError> {
    let len = crate::checked_align_up(len.max(1), page_size()).ok_or(InitError::MapFailed(len))?;
    let ptr = unsafe { os_mmap(len) };
    let ptr = NonNull::new(ptr).ok_or(InitError::MapFailed(len))?;
    tracing::debug!(len, ptr = ?ptr, "mapped native region");
    Ok(Self { ptr, len })
  }

  #[inline]
  pub(crate) fn as_ptr(&self) -> NonNull<u8> {
    self.ptr
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }
}

impl Drop for NativeRegion {
  fn drop(&mut self) {
    tracing::debug!(len = self.len, ptr = ?self.ptr, "unmapping native region");
    unsafe { os_munmap(self.ptr.as_ptr(), self.len) };
  }
}
