//! Equal-size item slots over one buffer, tracked by a bitmap.
//!
//! Layout of the managed buffer:
//!
//! ```text
//! [used bitmap: u64 words][pad to 16][item 0][item 1] ... [item maxn-1]
//! item = [head: head_size][data: item_size][patch][pad to 16]
//! ```
//!
//! Bit `i` of the bitmap is set exactly while item `i` is live. `pred` caches a word
//! known to have a free bit, so most allocations never scan.

use core::{
  ptr::NonNull,
  slice,
};

use crate::{
  DATA_ALIGN, RawAllocator, align_up, checked_align_up,
  debug::{self, CorruptionKind, DATA_HEAD_SIZE, DataHead, EMPTY_HEAD_SIZE, PATCH},
  error::InitError,
  sealed,
};

#[cfg(tripwire)]
use crate::debug::{DATA_EMPTY_MAGIC, DATA_MAGIC, DATA_PATCH, DebugHead};

const WORD_BITS: usize = u64::BITS as usize;
const WORD_BYTES: usize = size_of::<u64>();
const FULL: u64 = u64::MAX;

const NAME: &str = "static_fixed";

#[cfg(tripwire)]
#[derive(Default)]
struct FixedStats {
  peak: usize,
  total: usize,
  real: usize,
  occupied: usize,
  malloc_count: usize,
  free_count: usize,
  pred_failed: usize,
}

/// Fixed-size item pool over one buffer.
pub struct StaticFixedPool {
  used: NonNull<u64>,
  words: usize,
  data: NonNull<u8>,
  item_size: usize,
  item_space: usize,
  head_size: usize,
  maxn: usize,
  count: usize,
  /// Predicted bitmap word plus one; zero when nothing is predicted.
  pred: usize,
  for_small: bool,
  #[cfg(tripwire)]
  stats: FixedStats,
}

// The buffer is exclusively owned by this value.
unsafe impl Send for StaticFixedPool {}

impl StaticFixedPool {
  /// Slices `buffer` into items of `item_size` bytes. With `for_small` every item carries
  /// a size-bearing head so several request sizes can share one item size.
  pub fn from_static(
    buffer: &'static mut [u8],
    item_size: usize,
    for_small: bool,
  ) -> Result<Self, InitError> {
    let len = buffer.len();
    let ptr = NonNull::from(buffer).cast::<u8>();
    unsafe { Self::from_raw(ptr, len, item_size, for_small) }
  }

  /// # Safety
  /// `ptr..ptr + len` must be writable, unused by anything else, and outlive the pool.
  pub unsafe fn from_raw(
    ptr: NonNull<u8>,
    len: usize,
    item_size: usize,
    for_small: bool,
  ) -> Result<Self, InitError> {
    if item_size == 0 {
      return Err(InitError::ZeroItemSize);
    }

    let head_size = if for_small {
      DATA_HEAD_SIZE
    } else {
      EMPTY_HEAD_SIZE
    };
    let item_space = head_size
      .checked_add(item_size)
      .and_then(|size| size.checked_add(PATCH))
      .and_then(|size| checked_align_up(size, DATA_ALIGN))
      .ok_or(InitError::BufferTooSmall { len, need: usize::MAX })?;

    let skip = ptr.as_ptr().align_offset(DATA_ALIGN);
    let left = len.saturating_sub(skip);
    let too_small = InitError::BufferTooSmall {
      len,
      need: skip
        .saturating_add(align_up(WORD_BYTES, DATA_ALIGN))
        .saturating_add(item_space),
    };

    // (maxn + 7) / 8 + maxn * item_space < left
    let mut maxn = left.saturating_mul(8).saturating_sub(7) / item_space.saturating_mul(8).saturating_add(1);

    // Whole bitmap words and the data alignment can push the estimate over.
    let (words, data_offset) = loop {
      if maxn == 0 {
        return Err(too_small);
      }
      let words = maxn.div_ceil(WORD_BITS);
      let data_offset = align_up(words * WORD_BYTES, DATA_ALIGN);
      match maxn.checked_mul(item_space) {
        Some(items) if data_offset + items <= left => break (words, data_offset),
        _ => maxn -= 1,
      }
    };

    let base = unsafe { ptr.as_ptr().add(skip) };
    let mut pool = Self {
      used: unsafe { NonNull::new_unchecked(base.cast::<u64>()) },
      words,
      data: unsafe { NonNull::new_unchecked(base.add(data_offset)) },
      item_size,
      item_space,
      head_size,
      maxn,
      count: 0,
      pred: 1,
      for_small,
      #[cfg(tripwire)]
      stats: FixedStats::default(),
    };
    pool.clear();

    tracing::trace!(item_size, item_space, maxn, len, "static fixed pool ready");
    Ok(pool)
  }

  // ===========================================================================
  // Bitmap
  // ===========================================================================

  #[inline]
  fn bitmap(&self) -> &[u64] {
    unsafe { slice::from_raw_parts(self.used.as_ptr(), self.words) }
  }

  #[inline]
  fn bitmap_mut(&mut self) -> &mut [u64] {
    unsafe { slice::from_raw_parts_mut(self.used.as_ptr(), self.words) }
  }

  #[inline]
  fn is_used(&self, index: usize) -> bool {
    self.bitmap()[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
  }

  #[inline]
  fn set_used(&mut self, index: usize, used: bool) {
    let word = &mut self.bitmap_mut()[index / WORD_BITS];
    let mask = 1 << (index % WORD_BITS);
    if used {
      *word |= mask;
    } else {
      *word &= !mask;
    }
  }

  /// Start of item `index`, head included.
  #[inline]
  fn item(&self, index: usize) -> *mut u8 {
    unsafe { self.data.as_ptr().add(index * self.item_space) }
  }

  #[inline]
  fn item_data(&self, index: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.item(index).add(self.head_size)) }
  }

  fn locate(&self, data: *const u8) -> Result<usize, CorruptionKind> {
    let addr = data as usize;
    let first = self.data.as_ptr() as usize + self.head_size;
    let tail = self.data.as_ptr() as usize + self.maxn * self.item_space;
    if addr < first || addr >= tail {
      return Err(CorruptionKind::ForeignPointer);
    }
    let offset = addr - first;
    if offset % self.item_space != 0 {
      return Err(CorruptionKind::Misaligned);
    }
    Ok(offset / self.item_space)
  }

  #[cfg(tripwire)]
  fn check_item(&self, index: usize) -> bool {
    let magic = if self.for_small {
      DATA_MAGIC
    } else {
      DATA_EMPTY_MAGIC
    };
    let head = unsafe { &*self.item(index).cast::<DebugHead>() };
    let data = self.item_data(index).as_ptr();
    unsafe { debug::check_data(NAME, data, head, magic, self.item_size, self.item_size) }
  }

  /// Live neighbours must still carry intact heads.
  #[cfg(tripwire)]
  fn check_neighbours(&self, index: usize) {
    if index > 0 && self.is_used(index - 1) {
      self.check_item(index - 1);
    }
    if index + 1 < self.maxn && self.is_used(index + 1) {
      self.check_item(index + 1);
    }
  }

  // ===========================================================================
  // Malloc / Free
  // ===========================================================================

  fn malloc_pred(&mut self) -> Option<usize> {
    let word_index = self.pred.checked_sub(1)?;
    let word = self.bitmap()[word_index];
    if word == FULL {
      #[cfg(tripwire)]
      {
        self.stats.pred_failed += 1;
      }
      return None;
    }

    let index = word_index * WORD_BITS + (!word).trailing_zeros() as usize;
    if index >= self.maxn {
      self.pred = 0;
      return None;
    }
    self.set_used(index, true);

    // Move on to the next word when this one filled up.
    if self.bitmap()[word_index] == FULL {
      self.pred = 0;
      let next = index + 1;
      if next < self.maxn && !self.is_used(next) {
        self.pred = next / WORD_BITS + 1;
      }
    }
    Some(index)
  }

  fn malloc_find(&mut self) -> Option<usize> {
    let bitmap = self.bitmap();

    // Skip eight full words at a time.
    let mut base = 0;
    while base + 8 <= bitmap.len() && bitmap[base..base + 8].iter().all(|&word| word == FULL) {
      base += 8;
    }
    let word_index = base + bitmap[base..].iter().position(|&word| word != FULL)?;
    let word = bitmap[word_index];

    let index = word_index * WORD_BITS + (!word).trailing_zeros() as usize;
    if index >= self.maxn {
      return None;
    }
    self.set_used(index, true);

    if self.bitmap()[word_index] != FULL {
      self.pred = word_index + 1;
    }
    Some(index)
  }

  /// Takes a free item; `None` when all `maxn` items are live.
  #[track_caller]
  pub fn malloc(&mut self) -> Option<NonNull<u8>> {
    if self.count >= self.maxn {
      return None;
    }
    let index = self.malloc_pred().or_else(|| self.malloc_find())?;
    self.count += 1;

    let data = self.item_data(index);
    if self.for_small {
      unsafe { (*DataHead::of(data.as_ptr())).size = self.item_size };
    }

    #[cfg(tripwire)]
    {
      let magic = if self.for_small {
        DATA_MAGIC
      } else {
        DATA_EMPTY_MAGIC
      };
      unsafe {
        (*self.item(index).cast::<DebugHead>()).record(magic);
        data.as_ptr().write_bytes(DATA_PATCH, self.item_space - self.head_size);
      }
      self.check_neighbours(index);

      let stats = &mut self.stats;
      stats.real += self.item_size;
      stats.total += self.item_size;
      stats.occupied += self.item_space;
      stats.peak = stats.peak.max(stats.total);
      stats.malloc_count += 1;
    }

    Some(data)
  }

  /// Index of a live item, reporting rejected pointers.
  fn live_item(&self, data: NonNull<u8>) -> Option<usize> {
    let index = match self.locate(data.as_ptr()) {
      Ok(index) => index,
      Err(kind) => {
        debug::violation(kind, NAME, data.as_ptr());
        return None;
      }
    };
    if self.count == 0 || !self.is_used(index) {
      debug::violation(CorruptionKind::DoubleFree, NAME, data.as_ptr());
      return None;
    }

    #[cfg(tripwire)]
    {
      if !self.check_item(index) {
        return None;
      }
      self.check_neighbours(index);
    }

    Some(index)
  }

  /// Whether `data` is a live item, reporting it when not.
  pub(crate) fn is_live(&self, data: NonNull<u8>) -> bool {
    self.live_item(data).is_some()
  }

  pub unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    let Some(index) = self.live_item(data) else {
      return false;
    };

    #[cfg(tripwire)]
    {
      unsafe { (*self.item(index).cast::<DebugHead>()).retire() };
      self.stats.total -= self.item_size;
      self.stats.free_count += 1;
    }

    self.set_used(index, false);
    // Frees cluster, so the freed word is a good next guess.
    if self.pred == 0 {
      self.pred = index / WORD_BITS + 1;
    }
    self.count -= 1;
    true
  }

  /// Calls `f` with the data pointer of every live item, in address order.
  pub fn walk(&self, mut f: impl FnMut(NonNull<u8>)) {
    for (word_index, &word) in self.bitmap().iter().enumerate() {
      let first = word_index * WORD_BITS;
      match word {
        0 => {}
        FULL => (first..first + WORD_BITS).for_each(|index| f(self.item_data(index))),
        _ => {
          let mut bits = word;
          while bits != 0 {
            let bit = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            f(self.item_data(first + bit));
          }
        }
      }
    }
  }

  /// Marks every item free.
  pub fn clear(&mut self) {
    self.bitmap_mut().fill(0);
    self.count = 0;
    self.pred = 1;
    #[cfg(tripwire)]
    {
      self.stats = FixedStats::default();
    }
  }

  pub fn dump(&self) {
    self.walk(|data| {
      tracing::warn!(allocator = NAME, data = ?data, size = self.item_size, "leak");

      #[cfg(tripwire)]
      {
        if let Ok(index) = self.locate(data.as_ptr())
          && self.check_item(index)
        {
          let head = unsafe { &*self.item(index).cast::<DebugHead>() };
          unsafe { debug::dump_data(NAME, data.as_ptr(), head, self.item_size) };
        }
      }
    });

    tracing::info!(
      allocator = NAME,
      item_size = self.item_size,
      count = self.count,
      maxn = self.maxn,
      "summary"
    );

    #[cfg(tripwire)]
    {
      let stats = &self.stats;
      let waste_rate = if stats.occupied == 0 {
        0
      } else {
        (stats.occupied - stats.real) * 10_000 / stats.occupied
      };
      tracing::info!(
        allocator = NAME,
        peak_size = stats.peak,
        waste_per_10k = waste_rate,
        free_count = stats.free_count,
        malloc_count = stats.malloc_count,
        pred_failed = stats.pred_failed,
        "statistics"
      );
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  /// Live items.
  #[inline]
  pub fn size(&self) -> usize {
    self.count
  }

  #[inline]
  pub fn maxn(&self) -> usize {
    self.maxn
  }

  #[inline]
  pub fn full(&self) -> bool {
    self.count == self.maxn
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  #[inline]
  pub fn item_size(&self) -> usize {
    self.item_size
  }

  /// Bytes one item occupies, head and patch included.
  #[inline]
  pub fn item_space(&self) -> usize {
    self.item_space
  }

  pub fn have(&self, data: *const u8) -> bool {
    let addr = data as usize;
    let start = self.data.as_ptr() as usize;
    addr >= start && addr < start + self.maxn * self.item_space
  }
}

impl sealed::Sealed for StaticFixedPool {}

impl RawAllocator for StaticFixedPool {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    if size == 0 || size > self.item_size {
      return None;
    }
    StaticFixedPool::malloc(self)
  }

  /// Items never move; any size up to the item size is satisfied in place.
  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    if size == 0 || size > self.item_size {
      return None;
    }
    self.live_item(data).map(|_| data)
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { StaticFixedPool::free(self, data) }
  }

  fn clear(&mut self) {
    StaticFixedPool::clear(self)
  }

  fn dump(&self) {
    StaticFixedPool::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    StaticFixedPool::have(self, data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{debug::testing as corruption, testing::static_buffer};

  fn pool(len: usize, item_size: usize) -> StaticFixedPool {
    StaticFixedPool::from_static(static_buffer(len), item_size, false).unwrap()
  }

  #[test]
  fn capacity_fits_the_buffer() {
    for (len, item_size) in [(4096, 32), (4096, 1), (65536, 100), (1000, 500)] {
      let pool = pool(len, item_size);
      let bitmap = align_up(pool.maxn().div_ceil(WORD_BITS) * WORD_BYTES, DATA_ALIGN);
      assert!(bitmap + pool.maxn() * pool.item_space() <= len);
      // One more item would not fit.
      let bigger = align_up((pool.maxn() + 1).div_ceil(WORD_BITS) * WORD_BYTES, DATA_ALIGN);
      assert!(bigger + (pool.maxn() + 1) * pool.item_space() > len);
    }
  }

  #[test]
  fn rejects_unusable_configurations() {
    assert_eq!(
      StaticFixedPool::from_static(static_buffer(64), 0, false).err(),
      Some(InitError::ZeroItemSize)
    );
    assert!(matches!(
      StaticFixedPool::from_static(static_buffer(64), 4096, false),
      Err(InitError::BufferTooSmall { len: 64, .. })
    ));
  }

  #[test]
  fn items_are_distinct_and_aligned() {
    let mut pool = pool(8192, 48);
    let mut seen = Vec::new();
    while let Some(data) = pool.malloc() {
      assert_eq!(data.as_ptr() as usize % DATA_ALIGN, 0);
      seen.push(data.as_ptr() as usize);
    }
    assert!(pool.full());
    assert_eq!(seen.len(), pool.maxn());
    seen.sort_unstable();
    assert!(seen.windows(2).all(|pair| pair[1] - pair[0] >= pool.item_space()));
  }

  #[test]
  fn freed_item_is_reused_first() {
    let mut pool = pool(16384, 16);
    let items: Vec<_> = core::iter::from_fn(|| pool.malloc()).collect();
    assert!(pool.full());

    for victim in [0, items.len() / 2, items.len() - 1] {
      assert!(unsafe { pool.free(items[victim]) });
      assert!(!pool.full());
      assert_eq!(pool.malloc(), Some(items[victim]));
      assert!(pool.full());
    }
  }

  #[test]
  fn prediction_follows_frees() {
    // Instrumented items carry a debug head, so size the buffer for the larger spacing.
    let mut pool = pool(256 * 256, 16);
    assert!(pool.maxn() > 130, "{} items of {} bytes", pool.maxn(), pool.item_space());
    let items: Vec<_> = (0..130).map(|_| pool.malloc().unwrap()).collect();

    // A free with nothing predicted moves the prediction to its word.
    pool.pred = 0;
    assert!(unsafe { pool.free(items[70]) });
    assert_eq!(pool.pred, 70 / WORD_BITS + 1);
    assert_eq!(pool.malloc(), Some(items[70]));
  }

  #[test]
  fn walk_visits_live_items() {
    let mut pool = pool(65536, 8);
    let items: Vec<_> = (0..200).map(|_| pool.malloc().unwrap()).collect();
    for data in items.iter().skip(1).step_by(3) {
      assert!(unsafe { pool.free(*data) });
    }

    let mut visited = Vec::new();
    pool.walk(|data| visited.push(data));
    let expected: Vec<_> = items
      .iter()
      .enumerate()
      .filter(|(index, _)| index % 3 != 1)
      .map(|(_, data)| *data)
      .collect();
    assert_eq!(visited, expected);
    assert_eq!(pool.size(), expected.len());
  }

  #[test]
  fn for_small_items_record_their_size() {
    let mut pool = StaticFixedPool::from_static(static_buffer(4096), 64, true).unwrap();
    let data = pool.malloc().unwrap();
    assert_eq!(unsafe { (*DataHead::of(data.as_ptr())).size }, 64);
    assert!(pool.item_space() >= DATA_HEAD_SIZE + 64);
  }

  #[test]
  fn rejects_bad_frees() {
    corruption::intercept();
    let mut pool = pool(4096, 32);
    let data = pool.malloc().unwrap();
    unsafe {
      assert!(!pool.free(NonNull::new_unchecked(data.as_ptr().add(1))));
      assert!(pool.free(data));
      assert!(!pool.free(data));
    }
    if cfg!(tripwire) {
      assert_eq!(corruption::take(), Some(CorruptionKind::DoubleFree));
    }
    assert!(pool.is_empty());
  }

  #[cfg(tripwire)]
  #[test]
  fn overflow_is_caught_on_free() {
    corruption::intercept();
    let mut pool = pool(4096, 32);
    let data = pool.malloc().unwrap();
    unsafe {
      *data.as_ptr().add(32) = 0;
      assert!(!pool.free(data));
    }
    assert_eq!(corruption::take(), Some(CorruptionKind::Overflow));
    assert_eq!(pool.size(), 1);
  }

  #[test]
  fn clear_frees_all_items() {
    let mut pool = pool(4096, 32);
    while pool.malloc().is_some() {}
    pool.clear();
    assert!(pool.is_empty());
    let mut visited = 0;
    pool.walk(|_| visited += 1);
    assert_eq!(visited, 0);
    assert!(pool.malloc().is_some());
  }
}
