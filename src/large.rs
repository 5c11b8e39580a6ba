use core::ptr::NonNull;

use crate::{
  NativeLargeAllocator, RawAllocator, StaticLargeAllocator, error::InitError, sealed,
};

/// The large tier: an arena of boundary-tagged chunks or one mapping per block.
#[derive(Debug)]
pub enum LargeAllocator {
  Static(StaticLargeAllocator),
  Native(NativeLargeAllocator),
}

impl LargeAllocator {
  /// Per-block native mappings.
  pub fn native() -> Self {
    Self::Native(NativeLargeAllocator::new())
  }

  /// An arena over a caller buffer.
  pub fn from_static(buffer: &'static mut [u8], page_size: usize) -> Result<Self, InitError> {
    StaticLargeAllocator::from_static(buffer, page_size).map(Self::Static)
  }

  /// An arena over one native mapping of `size` bytes.
  pub fn with_native_arena(size: usize, page_size: usize) -> Result<Self, InitError> {
    StaticLargeAllocator::with_native_arena(size, page_size).map(Self::Static)
  }

  #[track_caller]
  pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    match self {
      Self::Static(inner) => inner.malloc(size),
      Self::Native(inner) => inner.malloc(size),
    }
  }

  #[track_caller]
  pub fn malloc_real(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
    match self {
      Self::Static(inner) => inner.malloc_real(size),
      Self::Native(inner) => inner.malloc_real(size),
    }
  }

  #[track_caller]
  pub unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    match self {
      Self::Static(inner) => unsafe { inner.realloc(data, size) },
      Self::Native(inner) => unsafe { inner.realloc(data, size) },
    }
  }

  #[track_caller]
  pub unsafe fn realloc_real(
    &mut self,
    data: NonNull<u8>,
    size: usize,
  ) -> Option<(NonNull<u8>, usize)> {
    match self {
      Self::Static(inner) => unsafe { inner.realloc_real(data, size) },
      Self::Native(inner) => unsafe { inner.realloc_real(data, size) },
    }
  }

  pub unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    match self {
      Self::Static(inner) => unsafe { inner.free(data) },
      Self::Native(inner) => unsafe { inner.free(data) },
    }
  }

  pub fn clear(&mut self) {
    match self {
      Self::Static(inner) => inner.clear(),
      Self::Native(inner) => inner.clear(),
    }
  }

  pub fn dump(&self) {
    match self {
      Self::Static(inner) => inner.dump(),
      Self::Native(inner) => inner.dump(),
    }
  }

  pub fn have(&self, data: *const u8) -> bool {
    match self {
      Self::Static(inner) => inner.have(data),
      Self::Native(inner) => inner.have(data),
    }
  }

  pub unsafe fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    match self {
      Self::Static(inner) => unsafe { inner.size_of(data) },
      Self::Native(inner) => unsafe { inner.size_of(data) },
    }
  }

  pub fn live_count(&self) -> usize {
    match self {
      Self::Static(inner) => inner.live_count(),
      Self::Native(inner) => inner.live_count(),
    }
  }

  pub fn page_size(&self) -> usize {
    match self {
      Self::Static(inner) => inner.page_size(),
      Self::Native(inner) => inner.page_size(),
    }
  }

  /// Free arena bytes; `None` for the native variant, which has no arena.
  pub fn free_bytes(&self) -> Option<usize> {
    match self {
      Self::Static(inner) => Some(inner.free_bytes()),
      Self::Native(_) => None,
    }
  }
}

impl sealed::Sealed for LargeAllocator {}

impl RawAllocator for LargeAllocator {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    LargeAllocator::malloc(self, size)
  }

  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { LargeAllocator::realloc(self, data, size) }
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { LargeAllocator::free(self, data) }
  }

  fn clear(&mut self) {
    LargeAllocator::clear(self)
  }

  fn dump(&self) {
    LargeAllocator::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    LargeAllocator::have(self, data)
  }
}
