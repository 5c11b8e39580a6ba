use core::{mem, ptr::NonNull};

use crate::{
  LargeAllocator, RawAllocator, SMALL_MAX_SIZE, debug::DataHead, sealed, small::SmallPools,
};

/// The two-tier facade: small classes up to [`SMALL_MAX_SIZE`] bytes, the large tier above.
///
/// Both tiers share one [`LargeAllocator`], which also holds the small tier's slots.
/// Frees and reallocs route on the size recorded in the block's head.
pub struct DefaultAllocator {
  large: LargeAllocator,
  small: SmallPools,
}

impl DefaultAllocator {
  pub fn new(large: LargeAllocator) -> Self {
    Self {
      large,
      small: SmallPools::new(),
    }
  }

  /// Size recorded in front of `data`; only meaningful for live blocks.
  #[inline]
  unsafe fn recorded_size(data: NonNull<u8>) -> usize {
    unsafe { (*DataHead::of(data.as_ptr())).size }
  }

  #[track_caller]
  pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size <= SMALL_MAX_SIZE {
      self.small.malloc(&mut self.large, size)
    } else {
      self.large.malloc(size)
    }
  }

  /// Resizes a live block. Crossing [`SMALL_MAX_SIZE`] in either direction moves the
  /// block to the other tier.
  #[track_caller]
  pub unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let old = unsafe { Self::recorded_size(data) };

    match (old <= SMALL_MAX_SIZE, size <= SMALL_MAX_SIZE) {
      (true, true) => unsafe { self.small.realloc(&mut self.large, data, size) },
      (false, false) => unsafe { self.large.realloc(data, size) },
      (true, false) => {
        let old = self.small.size_of(data)?;
        let fresh = self.large.malloc(size)?;
        unsafe {
          fresh.as_ptr().copy_from_nonoverlapping(data.as_ptr(), old);
          self.small.free(&mut self.large, data);
        }
        tracing::trace!(old, size, "realloc: small to large");
        Some(fresh)
      }
      (false, true) => {
        unsafe { self.large.size_of(data)? };
        let fresh = self.small.malloc(&mut self.large, size)?;
        unsafe {
          fresh.as_ptr().copy_from_nonoverlapping(data.as_ptr(), size);
          self.large.free(data);
        }
        tracing::trace!(old, size, "realloc: large to small");
        Some(fresh)
      }
    }
  }

  pub unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    if unsafe { Self::recorded_size(data) } <= SMALL_MAX_SIZE {
      unsafe { self.small.free(&mut self.large, data) }
    } else {
      unsafe { self.large.free(data) }
    }
  }

  /// Recorded size of a live block.
  pub unsafe fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    if unsafe { Self::recorded_size(data) } <= SMALL_MAX_SIZE {
      self.small.size_of(data)
    } else {
      unsafe { self.large.size_of(data) }
    }
  }

  /// Drops every allocation in both tiers.
  pub fn clear(&mut self) {
    self.small.exit(&mut self.large);
    self.large.clear();
  }

  pub fn dump(&self) {
    self.small.dump();
    self.large.dump();
  }

  pub fn have(&self, data: *const u8) -> bool {
    self.small.have(data) || self.large.have(data)
  }

  /// Live small-tier items.
  pub fn small_live_count(&self) -> usize {
    self.small.live_count()
  }

  pub fn large(&self) -> &LargeAllocator {
    &self.large
  }

  /// Releases the small tier's slots and hands back the large allocator.
  pub fn exit(mut self) -> LargeAllocator {
    self.small.exit(&mut self.large);
    mem::replace(&mut self.large, LargeAllocator::native())
  }
}

impl Drop for DefaultAllocator {
  fn drop(&mut self) {
    self.small.exit(&mut self.large);
  }
}

impl sealed::Sealed for DefaultAllocator {}

impl RawAllocator for DefaultAllocator {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    DefaultAllocator::malloc(self, size)
  }

  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { DefaultAllocator::realloc(self, data, size) }
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { DefaultAllocator::free(self, data) }
  }

  fn clear(&mut self) {
    DefaultAllocator::clear(self)
  }

  fn dump(&self) {
    DefaultAllocator::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    DefaultAllocator::have(self, data)
  }
}
