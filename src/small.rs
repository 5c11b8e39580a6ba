//! Size-class tier for requests of up to [`SMALL_MAX_SIZE`] bytes.
//!
//! Each class is a [`FixedPool`] of items carrying a [`DataHead`]. The head records the
//! requested size, so a 50-byte and a 64-byte request share the 64-byte class and a
//! free finds its class without any lookup table.

use core::{mem, ptr::NonNull};

use crate::{
  FixedPool, LargeAllocator, RawAllocator, SMALL_MAX_SIZE,
  debug::{self, CorruptionKind, DataHead},
  sealed,
};

#[cfg(tripwire)]
use crate::debug::{DATA_MAGIC, DATA_PATCH};

const NAME: &str = "small";

/// Item size of every class, smallest first.
pub const SIZE_CLASSES: [usize; 12] = [16, 32, 64, 96, 128, 192, 256, 384, 512, 1024, 2048, 3072];

/// Class index and item size serving a `size`-byte request.
#[inline]
pub const fn size_class(size: usize) -> Option<(usize, usize)> {
  let index = match size {
    65..=192 => match size {
      65..=96 => 3,
      129..=192 => 5,
      _ => 4,
    },
    193..=512 => match size {
      193..=256 => 6,
      385..=512 => 8,
      _ => 7,
    },
    1..=64 => match size {
      1..=16 => 0,
      33..=64 => 2,
      _ => 1,
    },
    513..=SMALL_MAX_SIZE => match size {
      513..=1024 => 9,
      2049..=SMALL_MAX_SIZE => 11,
      _ => 10,
    },
    _ => return None,
  };
  Some((index, SIZE_CLASSES[index]))
}

// =============================================================================
// Pools
// =============================================================================

/// The class pools, working against a large allocator owned elsewhere.
pub(crate) struct SmallPools {
  pools: [Option<FixedPool>; SIZE_CLASSES.len()],
}

impl SmallPools {
  pub(crate) const fn new() -> Self {
    Self {
      pools: [const { None }; SIZE_CLASSES.len()],
    }
  }

  /// Class and recorded size of a live item, reporting rejected pointers.
  fn live(&self, data: NonNull<u8>) -> Option<(usize, usize)> {
    let head = unsafe { &*DataHead::of(data.as_ptr()) };
    let size = head.size;
    let Some((class, space)) = size_class(size) else {
      debug::violation(CorruptionKind::BadMagic, NAME, data.as_ptr());
      return None;
    };

    #[cfg(tripwire)]
    {
      if !unsafe { debug::check_data(NAME, data.as_ptr(), &head.debug, DATA_MAGIC, size, space) } {
        return None;
      }
    }
    #[cfg(not(tripwire))]
    let _ = space;

    match &self.pools[class] {
      Some(pool) => pool.is_live(data).then_some((class, size)),
      None => {
        debug::violation(CorruptionKind::ForeignPointer, NAME, data.as_ptr());
        None
      }
    }
  }

  #[track_caller]
  pub(crate) fn malloc(&mut self, large: &mut LargeAllocator, size: usize) -> Option<NonNull<u8>> {
    let (class, space) = size_class(size)?;
    let pool = self.pools[class].get_or_insert_with(|| {
      tracing::debug!(class, space, "small class pool created");
      FixedPool::new(0, space, true)
    });

    let data = pool.malloc(large)?;
    unsafe { (*DataHead::of(data.as_ptr())).size = size };
    Some(data)
  }

  /// Resizes within the tier. Staying in the same class only rewrites the head.
  #[track_caller]
  pub(crate) unsafe fn realloc(
    &mut self,
    large: &mut LargeAllocator,
    data: NonNull<u8>,
    size: usize,
  ) -> Option<NonNull<u8>> {
    let (class, old) = self.live(data)?;
    let (new_class, _) = size_class(size)?;

    if new_class == class {
      let head = unsafe { &mut *DataHead::of(data.as_ptr()) };
      #[cfg(tripwire)]
      {
        if old > size {
          unsafe { data.as_ptr().add(size).write_bytes(DATA_PATCH, old - size) };
        }
        head.debug.record(DATA_MAGIC);
      }
      head.size = size;
      return Some(data);
    }

    let fresh = self.malloc(large, size)?;
    unsafe {
      fresh.as_ptr().copy_from_nonoverlapping(data.as_ptr(), old.min(size));
      self.free(large, data);
    }
    Some(fresh)
  }

  pub(crate) unsafe fn free(&mut self, large: &mut LargeAllocator, data: NonNull<u8>) -> bool {
    let Some((class, _)) = self.live(data) else {
      return false;
    };
    match self.pools[class].as_mut() {
      Some(pool) => unsafe { pool.free(large, data) },
      None => false,
    }
  }

  /// Recorded size of a live item.
  pub(crate) fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    self.live(data).map(|(_, size)| size)
  }

  pub(crate) fn clear(&mut self, large: &mut LargeAllocator) {
    for pool in self.pools.iter_mut().flatten() {
      pool.clear(large);
    }
  }

  /// Returns every slot to `large`; pools are recreated on demand.
  pub(crate) fn exit(&mut self, large: &mut LargeAllocator) {
    for slot in &mut self.pools {
      if let Some(mut pool) = slot.take() {
        pool.exit(large);
      }
    }
  }

  pub(crate) fn dump(&self) {
    for pool in self.pools.iter().flatten() {
      pool.dump();
    }
  }

  pub(crate) fn have(&self, data: *const u8) -> bool {
    self.pools.iter().flatten().any(|pool| pool.have(data))
  }

  pub(crate) fn live_count(&self) -> usize {
    self.pools.iter().flatten().map(FixedPool::size).sum()
  }
}

// =============================================================================
// Small Allocator
// =============================================================================

/// The small tier on its own, drawing slot arenas from a large allocator it owns.
///
/// Requests above [`SMALL_MAX_SIZE`] fail; [`crate::DefaultAllocator`] routes those to
/// the large tier instead.
pub struct SmallAllocator {
  large: LargeAllocator,
  pools: SmallPools,
}

impl SmallAllocator {
  pub fn new(large: LargeAllocator) -> Self {
    Self {
      large,
      pools: SmallPools::new(),
    }
  }

  #[track_caller]
  pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.pools.malloc(&mut self.large, size)
  }

  #[track_caller]
  pub unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.pools.realloc(&mut self.large, data, size) }
  }

  pub unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { self.pools.free(&mut self.large, data) }
  }

  pub fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    self.pools.size_of(data)
  }

  /// Frees every item; each class keeps one empty slot.
  pub fn clear(&mut self) {
    self.pools.clear(&mut self.large);
  }

  pub fn dump(&self) {
    self.pools.dump();
  }

  pub fn have(&self, data: *const u8) -> bool {
    self.pools.have(data)
  }

  /// Live items across all classes.
  pub fn live_count(&self) -> usize {
    self.pools.live_count()
  }

  pub fn large(&self) -> &LargeAllocator {
    &self.large
  }

  /// Releases every slot and hands back the large allocator.
  pub fn exit(mut self) -> LargeAllocator {
    self.pools.exit(&mut self.large);
    mem::replace(&mut self.large, LargeAllocator::native())
  }
}

impl Drop for SmallAllocator {
  fn drop(&mut self) {
    self.pools.exit(&mut self.large);
  }
}

impl sealed::Sealed for SmallAllocator {}

impl RawAllocator for SmallAllocator {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    SmallAllocator::malloc(self, size)
  }

  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { SmallAllocator::realloc(self, data, size) }
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { SmallAllocator::free(self, data) }
  }

  fn clear(&mut self) {
    SmallAllocator::clear(self)
  }

  fn dump(&self) {
    SmallAllocator::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    SmallAllocator::have(self, data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn small() -> SmallAllocator {
    SmallAllocator::new(LargeAllocator::with_native_arena(1024 * 4096, 4096).unwrap())
  }

  #[test]
  fn class_boundaries() {
    assert_eq!(size_class(0), None);
    assert_eq!(size_class(SMALL_MAX_SIZE + 1), None);

    let mut low = 1;
    for (index, &space) in SIZE_CLASSES.iter().enumerate() {
      assert_eq!(size_class(low), Some((index, space)), "first size of class {space}");
      assert_eq!(size_class(space), Some((index, space)), "last size of class {space}");
      low = space + 1;
    }
  }

  #[test]
  fn sizes_in_one_class_share_a_pool() {
    let mut small = small();
    let a = small.malloc(50).unwrap();
    let b = small.malloc(64).unwrap();
    assert_eq!(small.size_of(a), Some(50));
    assert_eq!(small.size_of(b), Some(64));
    assert_eq!(small.pools.pools.iter().flatten().count(), 1);
    assert_eq!(small.live_count(), 2);

    unsafe {
      assert!(small.free(a));
      assert!(small.free(b));
    }
    assert_eq!(small.live_count(), 0);
  }

  #[test]
  fn realloc_within_a_class_keeps_the_pointer() {
    let mut small = small();
    let data = small.malloc(100).unwrap();
    unsafe {
      data.as_ptr().write_bytes(0x5a, 100);
      assert_eq!(small.realloc(data, 128), Some(data));
      assert_eq!(small.size_of(data), Some(128));
      assert_eq!(small.realloc(data, 97), Some(data));
      assert_eq!(*data.as_ptr().add(96), 0x5a);
      assert!(small.free(data));
    }
  }

  #[test]
  fn realloc_across_classes_copies() {
    let mut small = small();
    let data = small.malloc(40).unwrap();
    let bytes: Vec<u8> = (0..40).collect();
    unsafe {
      data.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), 40);
      let grown = small.realloc(data, 2000).unwrap();
      assert_ne!(grown, data);
      assert_eq!(core::slice::from_raw_parts(grown.as_ptr(), 40), &bytes[..]);
      assert_eq!(small.live_count(), 1);

      let shrunk = small.realloc(grown, 10).unwrap();
      assert_eq!(core::slice::from_raw_parts(shrunk.as_ptr(), 10), &bytes[..10]);
      assert!(small.realloc(shrunk, SMALL_MAX_SIZE + 1).is_none());
      assert!(small.free(shrunk));
    }
  }

  #[test]
  fn rejects_oversized_requests() {
    let mut small = small();
    assert!(small.malloc(0).is_none());
    assert!(small.malloc(SMALL_MAX_SIZE + 1).is_none());
    assert!(small.malloc(SMALL_MAX_SIZE).is_some());
  }

  #[test]
  fn exit_returns_every_slot() {
    let mut small = small();
    let items: Vec<_> = (1..=SMALL_MAX_SIZE)
      .step_by(97)
      .map(|size| small.malloc(size).unwrap())
      .collect();
    assert!(items.iter().all(|data| small.have(data.as_ptr())));
    assert!(small.large().live_count() > 0);

    let large = small.exit();
    assert_eq!(large.live_count(), 0);
  }

  #[test]
  fn double_free_is_rejected() {
    debug::testing::intercept();
    let mut small = small();
    let data = small.malloc(24).unwrap();
    let keep = small.malloc(24).unwrap();
    unsafe {
      assert!(small.free(data));
      assert!(!small.free(data));
    }
    if cfg!(tripwire) {
      assert_eq!(debug::testing::take(), Some(CorruptionKind::DoubleFree));
    }
    assert_eq!(small.live_count(), 1);
    assert!(unsafe { small.free(keep) });
  }

  #[cfg(tripwire)]
  #[test]
  fn overflow_past_the_requested_size_is_caught() {
    debug::testing::intercept();
    let mut small = small();
    let data = small.malloc(20).unwrap();
    unsafe {
      // Still inside the 32-byte item, but past the 20 requested bytes.
      *data.as_ptr().add(20) = 0;
      assert!(!small.free(data));
    }
    assert_eq!(debug::testing::take(), Some(CorruptionKind::Overflow));
  }
}
