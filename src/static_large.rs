//! Page-granular arena of boundary-tagged chunks.
//!
//! The arena is a run of chunks laid end to end. Each chunk starts with a
//! [`ChunkHead`] whose tag packs a 31-bit `space` and a free bit, so
//! `chunk + CHUNK_HEAD_SIZE + space` is the next chunk and every chunk size is a whole
//! number of pages. Free chunks are merged forward on free and realloc, and on the fly
//! while malloc scans. A small cache remembers one large free chunk per
//! `log2(pages)` bucket so most requests skip the scan.

use core::{
  fmt,
  mem::{offset_of, size_of},
  ptr::{self, NonNull},
};

use crate::{
  DATA_ALIGN, RawAllocator, align_down, checked_align_up,
  debug::{self, CorruptionKind, DataHead, PATCH},
  error::InitError,
  platform::{self, NativeRegion},
  sealed,
};

#[cfg(tripwire)]
use crate::debug::{DATA_MAGIC, DATA_PATCH};

// =============================================================================
// Constants
// =============================================================================

/// Prediction buckets, one per `log2` of the chunk page count.
#[cfg(not(feature = "micro"))]
pub const PRED_BUCKETS: usize = 10;
#[cfg(feature = "micro")]
pub const PRED_BUCKETS: usize = 1;

const FREE_BIT: u32 = 1 << 31;
const SPACE_MASK: u32 = FREE_BIT - 1;

/// Largest `space` a single chunk can describe.
pub const MAX_SPACE: usize = SPACE_MASK as usize;

/// Bytes in front of every chunk's data.
pub const CHUNK_HEAD_SIZE: usize = size_of::<ChunkHead>();

const NAME: &str = "static_large";

const _: () = assert!(CHUNK_HEAD_SIZE % DATA_ALIGN == 0);
const _: () = assert!(offset_of!(ChunkHead, base) + size_of::<DataHead>() == CHUNK_HEAD_SIZE);
const _: () = assert!(PRED_BUCKETS >= 1);

// =============================================================================
// Types
// =============================================================================

#[repr(C, align(16))]
struct ChunkHead {
  tag: u32,
  base: DataHead,
}

#[cfg(tripwire)]
#[derive(Default)]
struct LargeStats {
  peak: usize,
  total: usize,
  real: usize,
  occupied: usize,
  malloc_count: usize,
  ralloc_count: usize,
  free_count: usize,
  pred_total: [usize; PRED_BUCKETS],
  pred_failed: [usize; PRED_BUCKETS],
}

/// Variable-size allocator over one contiguous arena.
pub struct StaticLargeAllocator {
  _region: Option<NativeRegion>,
  base: NonNull<u8>,
  data_size: usize,
  page_size: usize,
  /// Offsets of cached free chunks.
  pred: [Option<usize>; PRED_BUCKETS],
  predict: bool,
  live: usize,
  /// Head and space bytes of every allocated chunk.
  used: usize,
  #[cfg(tripwire)]
  stats: LargeStats,
}

// The arena is exclusively owned by this value.
unsafe impl Send for StaticLargeAllocator {}

impl fmt::Debug for StaticLargeAllocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StaticLargeAllocator")
      .field("base", &self.base)
      .field("data_size", &self.data_size)
      .field("page_size", &self.page_size)
      .field("live", &self.live)
      .field("free_bytes", &self.free_bytes())
      .finish_non_exhaustive()
  }
}

// =============================================================================
// Construction
// =============================================================================

impl StaticLargeAllocator {
  /// Manages `buffer`. A `page_size` of zero selects the native page size.
  pub fn from_static(buffer: &'static mut [u8], page_size: usize) -> Result<Self, InitError> {
    let len = buffer.len();
    let ptr = NonNull::from(buffer).cast::<u8>();
    unsafe { Self::build(ptr, len, page_size, None) }
  }

  /// Manages `len` bytes at `ptr`.
  ///
  /// # Safety
  /// The range must be writable, unused by anything else, and outlive the allocator.
  pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize, page_size: usize) -> Result<Self, InitError> {
    unsafe { Self::build(ptr, len, page_size, None) }
  }

  /// Manages a freshly mapped arena of at least `size` bytes.
  pub fn with_native_arena(size: usize, page_size: usize) -> Result<Self, InitError> {
    let region = NativeRegion::map(size)?;
    let (ptr, len) = (region.as_ptr(), region.len());
    unsafe { Self::build(ptr, len, page_size, Some(region)) }
  }

  unsafe fn build(
    ptr: NonNull<u8>,
    len: usize,
    page_size: usize,
    region: Option<NativeRegion>,
  ) -> Result<Self, InitError> {
    let page_size = resolve_page_size(page_size)?;
    let skip = ptr.as_ptr().align_offset(DATA_ALIGN);
    let avail = len.saturating_sub(skip);

    // The 31-bit space field caps the arena at one maximal chunk.
    let data_size =
      align_down(avail, page_size).min(align_down(CHUNK_HEAD_SIZE + MAX_SPACE, page_size));
    if data_size < page_size {
      return Err(InitError::BufferTooSmall {
        len,
        need: skip.saturating_add(page_size),
      });
    }

    let mut allocator = Self {
      _region: region,
      base: unsafe { NonNull::new_unchecked(ptr.as_ptr().add(skip)) },
      data_size,
      page_size,
      pred: [None; PRED_BUCKETS],
      predict: true,
      live: 0,
      used: 0,
      #[cfg(tripwire)]
      stats: LargeStats::default(),
    };
    allocator.clear();

    tracing::debug!(data_size, page_size, base = ?allocator.base, "static large arena ready");
    Ok(allocator)
  }
}

fn resolve_page_size(requested: usize) -> Result<usize, InitError> {
  let mut size = if requested == 0 {
    platform::page_size()
  } else {
    requested
  };

  // A page must hold at least one head and one byte.
  if size <= CHUNK_HEAD_SIZE {
    size += CHUNK_HEAD_SIZE;
  }
  size
    .checked_next_power_of_two()
    .ok_or(InitError::InvalidPageSize(requested))
}

// =============================================================================
// Chunks
// =============================================================================

impl StaticLargeAllocator {
  #[inline]
  fn head(&self, off: usize) -> *mut ChunkHead {
    debug_assert!(off + CHUNK_HEAD_SIZE <= self.data_size, "chunk {off:#x} past tail");
    unsafe { self.base.as_ptr().add(off).cast() }
  }

  #[inline]
  fn base_head(&self, off: usize) -> *mut DataHead {
    unsafe { &raw mut (*self.head(off)).base }
  }

  #[inline]
  fn space(&self, off: usize) -> usize {
    unsafe { ((*self.head(off)).tag & SPACE_MASK) as usize }
  }

  #[inline]
  fn is_free(&self, off: usize) -> bool {
    unsafe { (*self.head(off)).tag & FREE_BIT != 0 }
  }

  #[inline]
  fn set_chunk(&mut self, off: usize, space: usize, free: bool) {
    debug_assert!(space <= MAX_SPACE);
    debug_assert!((CHUNK_HEAD_SIZE + space) % self.page_size == 0, "unaligned chunk {space}");
    let tag = space as u32 | if free { FREE_BIT } else { 0 };
    unsafe { (*self.head(off)).tag = tag };
  }

  #[inline]
  fn set_free(&mut self, off: usize, free: bool) {
    let space = self.space(off);
    self.set_chunk(off, space, free);
  }

  #[inline]
  fn next(&self, off: usize) -> usize {
    off + CHUNK_HEAD_SIZE + self.space(off)
  }

  #[inline]
  fn data(&self, off: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(self.base.as_ptr().add(off + CHUNK_HEAD_SIZE)) }
  }

  /// Chunk offset of a user pointer.
  fn locate(&self, data: *const u8) -> Result<usize, CorruptionKind> {
    let addr = data as usize;
    let first = self.base.as_ptr() as usize + CHUNK_HEAD_SIZE;
    let end = self.base.as_ptr() as usize + self.data_size;
    if addr < first || addr >= end {
      return Err(CorruptionKind::ForeignPointer);
    }

    // Chunks start on page boundaries of the arena.
    let off = addr - first;
    if off % self.page_size != 0 {
      return Err(CorruptionKind::Misaligned);
    }
    Ok(off)
  }

  /// Space of a chunk able to hold `size` bytes plus the patch, keeping the
  /// chunk a whole number of pages.
  fn need_space(&self, size: usize) -> Option<usize> {
    let total = size.checked_add(PATCH)?;
    let mut need = checked_align_up(total, self.page_size)? - CHUNK_HEAD_SIZE;
    if total > need {
      need = checked_align_up(total.checked_add(self.page_size)?, self.page_size)? - CHUNK_HEAD_SIZE;
    }
    (need <= MAX_SPACE).then_some(need)
  }

  #[cfg(tripwire)]
  fn check_chunk(&self, off: usize) -> bool {
    let space = self.space(off);
    let head = unsafe { &*self.base_head(off) };
    unsafe {
      debug::check_data(
        NAME,
        self.data(off).as_ptr(),
        &head.debug,
        DATA_MAGIC,
        head.size,
        space - PATCH,
      )
    }
  }

  /// An allocated right neighbour must still carry an intact head.
  #[cfg(tripwire)]
  fn check_next(&self, off: usize) -> bool {
    let next = self.next(off);
    next >= self.data_size || self.is_free(next) || self.check_chunk(next)
  }
}

// =============================================================================
// Prediction cache
// =============================================================================

impl StaticLargeAllocator {
  #[inline]
  fn pred_index(&self, space: usize) -> usize {
    let pages = (CHUNK_HEAD_SIZE + space) / self.page_size;
    let index = if pages > 1 {
      (pages - 1).ilog2() as usize + 1
    } else {
      0
    };
    index.min(PRED_BUCKETS - 1)
  }

  /// Remembers a free chunk when its bucket is empty or holds a smaller one.
  #[inline]
  fn pred_update(&mut self, off: usize) {
    if !self.predict || off >= self.data_size {
      return;
    }
    debug_assert!(self.is_free(off));

    let space = self.space(off);
    let index = self.pred_index(space);
    match self.pred[index] {
      Some(cached) if self.space(cached) >= space => {}
      _ => self.pred[index] = Some(off),
    }
  }

  #[inline]
  fn pred_remove(&mut self, off: usize) {
    let index = self.pred_index(self.space(off));
    if self.pred[index] == Some(off) {
      self.pred[index] = None;
    }
  }

  /// Tries the cached chunk of every bucket from the request's upward.
  fn malloc_pred(&mut self, need: usize) -> Option<usize> {
    for index in self.pred_index(need)..PRED_BUCKETS {
      let Some(cached) = self.pred[index] else {
        continue;
      };

      let found = self.malloc_find(cached, 1, need);

      #[cfg(tripwire)]
      {
        self.stats.pred_total[index] += 1;
        if found.is_none() {
          self.stats.pred_failed[index] += 1;
        }
      }

      if found.is_some() {
        tracing::trace!(need, index, "malloc: predicted");
        return found;
      }
    }
    None
  }

  /// Enables or disables the prediction cache. Allocation outcomes do not depend on it.
  pub fn set_predictor(&mut self, enabled: bool) {
    self.predict = enabled;
    self.pred = [None; PRED_BUCKETS];
    if enabled {
      // Reseed from the arena.
      let mut off = 0;
      while off < self.data_size {
        if self.is_free(off) {
          self.pred_update(off);
        }
        off = self.next(off);
      }
    }
  }
}

// =============================================================================
// Malloc / Realloc / Free
// =============================================================================

impl StaticLargeAllocator {
  /// Walks up to `walk` chunks from `off` for a free one with `need` bytes of space.
  ///
  /// A free chunk that is too small swallows its free right neighbour and is examined
  /// again without spending a step, so a one-step walk from a cached chunk still
  /// coalesces everything free behind it.
  fn malloc_find(&mut self, mut off: usize, mut walk: usize, need: usize) -> Option<usize> {
    let tail = self.data_size;
    while off < tail && walk > 0 {
      let space = self.space(off);

      #[cfg(tripwire)]
      {
        if !self.is_free(off) {
          self.check_chunk(off);
        }
      }

      if self.is_free(off) {
        if space >= need {
          self.pred_remove(off);

          if space > CHUNK_HEAD_SIZE + need {
            let rest = off + CHUNK_HEAD_SIZE + need;
            self.set_chunk(rest, space - need - CHUNK_HEAD_SIZE, true);
            self.set_chunk(off, need, false);
            self.pred_update(rest);
          } else {
            self.set_free(off, false);
            let next = self.next(off);
            if next < tail && self.is_free(next) {
              self.pred_update(next);
            }
          }
          return Some(off);
        }

        let next = off + CHUNK_HEAD_SIZE + space;
        if next >= tail {
          break;
        }
        if self.is_free(next) {
          self.pred_remove(next);
          self.pred_remove(off);
          let merged = space + CHUNK_HEAD_SIZE + self.space(next);
          self.set_chunk(off, merged, true);
          self.pred_update(off);
          tracing::trace!(off, merged, "malloc: merged free neighbour");
          continue;
        }
      }

      walk -= 1;
      off += CHUNK_HEAD_SIZE + space;
    }
    None
  }

  #[track_caller]
  fn malloc_done(&mut self, size: usize, want_real: bool) -> Option<(NonNull<u8>, usize)> {
    if size == 0 {
      return None;
    }
    let Some(need) = self.need_space(size) else {
      tracing::debug!(size, "malloc: request exceeds the largest chunk");
      return None;
    };

    let found = self
      .malloc_pred(need)
      .or_else(|| self.malloc_find(0, usize::MAX, need));
    let Some(off) = found else {
      tracing::trace!(size, need, "malloc: no free chunk");
      return None;
    };

    let space = self.space(off);
    debug_assert!(space >= size + PATCH);
    let real = if want_real { space - PATCH } else { size };
    let data = self.data(off);
    unsafe { (*self.base_head(off)).size = real };
    self.live += 1;
    self.used += CHUNK_HEAD_SIZE + space;

    #[cfg(tripwire)]
    {
      unsafe {
        (*self.base_head(off)).debug.record(DATA_MAGIC);
        data.as_ptr().write_bytes(DATA_PATCH, real + PATCH);
      }
      let stats = &mut self.stats;
      stats.real += real;
      stats.occupied += CHUNK_HEAD_SIZE + space;
      stats.total += real;
      stats.peak = stats.peak.max(stats.total);
      stats.malloc_count += 1;
    }

    Some((data, real))
  }

  /// Grows or shrinks a chunk where it stands, absorbing free chunks behind it.
  #[track_caller]
  fn realloc_fast(&mut self, off: usize, size: usize, want_real: bool) -> Option<usize> {
    let need = self.need_space(size)?;
    let mut space = self.space(off);

    #[cfg(tripwire)]
    let (prev_size, prev_space) = (unsafe { (*self.base_head(off)).size }, space);

    if need > space {
      let mut next = off + CHUNK_HEAD_SIZE + space;
      while next < self.data_size && self.is_free(next) {
        self.pred_remove(next);
        let absorbed = CHUNK_HEAD_SIZE + self.space(next);
        space += absorbed;
        self.used += absorbed;
        next = off + CHUNK_HEAD_SIZE + space;
        tracing::trace!(off, space, "realloc: merged free neighbour");
      }
      self.set_chunk(off, space, false);
    }

    if need > space {
      return None;
    }

    if space > CHUNK_HEAD_SIZE + need {
      let rest = off + CHUNK_HEAD_SIZE + need;
      let rest_space = space - need - CHUNK_HEAD_SIZE;
      self.set_chunk(rest, rest_space, true);
      self.set_chunk(off, need, false);
      self.used -= CHUNK_HEAD_SIZE + rest_space;
      self.pred_update(rest);
      space = need;
    }

    let real = if want_real { space - PATCH } else { size };
    unsafe { (*self.base_head(off)).size = real };

    #[cfg(tripwire)]
    {
      let data = self.data(off).as_ptr();
      unsafe {
        (*self.base_head(off)).debug.record(DATA_MAGIC);
        if real > prev_size {
          data.add(prev_size).write_bytes(DATA_PATCH, real - prev_size);
        }
        *data.add(real) = DATA_PATCH;
      }
      let stats = &mut self.stats;
      stats.real = stats.real + real - prev_size;
      stats.occupied = stats.occupied + space - prev_space;
      stats.total = stats.total + real - prev_size;
      stats.peak = stats.peak.max(stats.total);
    }

    Some(real)
  }

  /// Resolves a live chunk, reporting rejected pointers.
  fn live_chunk(&self, data: NonNull<u8>) -> Option<usize> {
    let off = match self.locate(data.as_ptr()) {
      Ok(off) => off,
      Err(kind) => {
        debug::violation(kind, NAME, data.as_ptr());
        return None;
      }
    };
    if self.is_free(off) {
      debug::violation(CorruptionKind::DoubleFree, NAME, data.as_ptr());
      return None;
    }

    #[cfg(tripwire)]
    {
      if !self.check_chunk(off) {
        return None;
      }
      self.check_next(off);
    }

    Some(off)
  }

  #[track_caller]
  unsafe fn realloc_done(
    &mut self,
    data: NonNull<u8>,
    size: usize,
    want_real: bool,
  ) -> Option<(NonNull<u8>, usize)> {
    if size == 0 {
      return None;
    }
    let off = self.live_chunk(data)?;

    let moved = match self.realloc_fast(off, size, want_real) {
      Some(real) => (data, real),
      None => {
        let (fresh, real) = self.malloc_done(size, want_real)?;
        let old = unsafe { (*self.base_head(off)).size };
        unsafe {
          ptr::copy_nonoverlapping(data.as_ptr(), fresh.as_ptr(), old.min(size));
          self.free(data);
        }
        (fresh, real)
      }
    };

    #[cfg(tripwire)]
    {
      self.stats.ralloc_count += 1;
    }
    Some(moved)
  }

  /// Allocates at least `size` bytes.
  #[track_caller]
  pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.malloc_done(size, false).map(|(data, _)| data)
  }

  /// Allocates at least `size` bytes and reports the whole usable size of the chunk.
  #[track_caller]
  pub fn malloc_real(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
    self.malloc_done(size, true)
  }

  #[track_caller]
  pub unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.realloc_done(data, size, false) }.map(|(data, _)| data)
  }

  #[track_caller]
  pub unsafe fn realloc_real(
    &mut self,
    data: NonNull<u8>,
    size: usize,
  ) -> Option<(NonNull<u8>, usize)> {
    unsafe { self.realloc_done(data, size, true) }
  }

  pub unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    let Some(off) = self.live_chunk(data) else {
      return false;
    };

    let mut space = self.space(off);
    self.live -= 1;
    self.used -= CHUNK_HEAD_SIZE + space;

    #[cfg(tripwire)]
    {
      let head = unsafe { &mut *self.base_head(off) };
      self.stats.total -= head.size;
      self.stats.free_count += 1;
      head.debug.retire();
    }

    let next = off + CHUNK_HEAD_SIZE + space;
    if next < self.data_size && self.is_free(next) {
      self.pred_remove(next);
      space += CHUNK_HEAD_SIZE + self.space(next);
      tracing::trace!(off, space, "free: merged free neighbour");
    }
    self.set_chunk(off, space, true);
    self.pred_update(off);
    true
  }

  /// Resets the arena to one free chunk.
  pub fn clear(&mut self) {
    self.set_chunk(0, self.data_size - CHUNK_HEAD_SIZE, true);
    self.pred = [None; PRED_BUCKETS];
    self.live = 0;
    self.used = 0;
    #[cfg(tripwire)]
    {
      self.stats = LargeStats::default();
    }
    self.pred_update(0);
  }

  pub fn have(&self, data: *const u8) -> bool {
    let addr = data as usize;
    let base = self.base.as_ptr() as usize;
    addr >= base && addr < base + self.data_size
  }

  /// Recorded size of a live block.
  pub unsafe fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    let off = self.live_chunk(data)?;
    Some(unsafe { (*self.base_head(off)).size })
  }

  pub fn dump(&self) {
    let mut off = 0;
    let mut frags = 0usize;
    while off < self.data_size {
      if !self.is_free(off) {
        let data = self.data(off);
        let size = unsafe { (*self.base_head(off)).size };
        tracing::warn!(allocator = NAME, data = ?data, size, "leak");

        #[cfg(tripwire)]
        {
          if self.check_chunk(off) {
            unsafe { debug::dump_data(NAME, data.as_ptr(), &(*self.base_head(off)).debug, size) };
          }
        }
      }
      frags += 1;
      off = self.next(off);
    }

    for (index, cached) in self.pred.iter().enumerate() {
      let space = cached.map_or(0, |off| self.space(off));
      tracing::info!(
        allocator = NAME,
        max_pages = 1usize << index,
        data = ?cached.map(|off| self.data(off)),
        space,
        "pred"
      );
      #[cfg(tripwire)]
      tracing::info!(
        allocator = NAME,
        total = self.stats.pred_total[index],
        failed = self.stats.pred_failed[index],
        "pred hits"
      );
    }

    tracing::info!(
      allocator = NAME,
      live = self.live,
      free_bytes = self.free_bytes(),
      frag_count = frags,
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
        ralloc_count = stats.ralloc_count,
        "statistics"
      );
    }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Bytes covered by chunks, heads included.
  #[inline]
  pub fn data_size(&self) -> usize {
    self.data_size
  }

  /// Head and space bytes of all free chunks, independent of how they are split.
  #[inline]
  pub fn free_bytes(&self) -> usize {
    self.data_size - self.used
  }

  #[inline]
  pub fn live_count(&self) -> usize {
    self.live
  }

  /// The largest request a fresh arena can satisfy.
  #[inline]
  pub fn max_request(&self) -> usize {
    self.data_size - CHUNK_HEAD_SIZE - PATCH
  }

  /// Number of chunks, free or not.
  pub fn chunk_count(&self) -> usize {
    let mut off = 0;
    let mut count = 0;
    while off < self.data_size {
      count += 1;
      off = self.next(off);
    }
    count
  }
}

impl sealed::Sealed for StaticLargeAllocator {}

impl RawAllocator for StaticLargeAllocator {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    StaticLargeAllocator::malloc(self, size)
  }

  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { StaticLargeAllocator::realloc(self, data, size) }
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { StaticLargeAllocator::free(self, data) }
  }

  fn clear(&mut self) {
    StaticLargeAllocator::clear(self)
  }

  fn dump(&self) {
    StaticLargeAllocator::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    StaticLargeAllocator::have(self, data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{debug::testing as corruption, testing::static_buffer};
  use tracing_test::traced_test;

  const PAGE: usize = 4096;

  fn arena(pages: usize) -> StaticLargeAllocator {
    StaticLargeAllocator::from_static(static_buffer(pages * PAGE), PAGE).unwrap()
  }

  #[test]
  fn fresh_arena_is_one_free_chunk() {
    let allocator = arena(16);
    assert_eq!(allocator.data_size(), 16 * PAGE);
    assert_eq!(allocator.free_bytes(), 16 * PAGE);
    assert_eq!(allocator.chunk_count(), 1);
    assert_eq!(allocator.live_count(), 0);
  }

  #[test]
  fn tiny_page_sizes_are_raised() {
    assert_eq!(resolve_page_size(1).unwrap(), (1 + CHUNK_HEAD_SIZE).next_power_of_two());
    assert_eq!(resolve_page_size(3000).unwrap(), 4096);
    assert!(resolve_page_size(usize::MAX).is_err());
  }

  #[test]
  fn requests_round_to_whole_pages() {
    let mut allocator = arena(16);
    let (_, real) = allocator.malloc_real(1).unwrap();
    assert_eq!(real, PAGE - CHUNK_HEAD_SIZE - PATCH);

    // One byte more than a page's space spills into a second page.
    let (_, real) = allocator.malloc_real(PAGE - CHUNK_HEAD_SIZE - PATCH + 1).unwrap();
    assert_eq!(real, 2 * PAGE - CHUNK_HEAD_SIZE - PATCH);
    assert_eq!(allocator.free_bytes(), 13 * PAGE);
  }

  #[test]
  fn prediction_buckets_follow_page_log2() {
    let allocator = arena(4);
    let space = |pages: usize| pages * PAGE - CHUNK_HEAD_SIZE;
    assert_eq!(allocator.pred_index(space(1)), 0);
    assert_eq!(allocator.pred_index(space(2)), 1);
    assert_eq!(allocator.pred_index(space(3)), 2);
    assert_eq!(allocator.pred_index(space(4)), 2);
    assert_eq!(allocator.pred_index(space(5)), 3);
    assert_eq!(allocator.pred_index(space(1 << 20)), PRED_BUCKETS - 1);
  }

  #[test]
  fn free_merges_with_free_right_neighbour() {
    let mut allocator = arena(8);
    let a = allocator.malloc(100).unwrap();
    let b = allocator.malloc(100).unwrap();
    assert_eq!(allocator.chunk_count(), 3);

    unsafe {
      assert!(allocator.free(b));
      assert_eq!(allocator.chunk_count(), 2);
      assert!(allocator.free(a));
    }
    assert_eq!(allocator.chunk_count(), 1);
    assert!(allocator.malloc(allocator.max_request()).is_some());
  }

  #[test]
  fn scan_coalesces_runs_left_behind_by_free() {
    let mut allocator = arena(8);
    let blocks: Vec<_> = (0..8).map(|_| allocator.malloc(1).unwrap()).collect();
    assert!(allocator.malloc(1).is_none());

    // Freed left to right, each chunk only sees allocated neighbours.
    for data in blocks.iter().step_by(2) {
      assert!(unsafe { allocator.free(*data) });
    }
    for data in blocks.iter().skip(1).step_by(2) {
      assert!(unsafe { allocator.free(*data) });
    }
    assert_eq!(allocator.free_bytes(), 8 * PAGE);

    let whole = allocator.malloc(allocator.max_request()).unwrap();
    assert_eq!(whole, blocks[0]);
  }

  #[test]
  fn realloc_grows_into_free_neighbours() {
    let mut allocator = arena(16);
    let a = allocator.malloc(100).unwrap();
    unsafe {
      a.as_ptr().write_bytes(0x5a, 100);
      let grown = allocator.realloc(a, 3 * PAGE).unwrap();
      assert_eq!(grown, a);
      assert_eq!(allocator.size_of(grown), Some(3 * PAGE));
      assert_eq!(*grown.as_ptr().add(99), 0x5a);

      let shrunk = allocator.realloc(grown, 10).unwrap();
      assert_eq!(shrunk, a);
    }
    assert_eq!(allocator.free_bytes(), 15 * PAGE);
  }

  #[test]
  fn realloc_moves_when_blocked() {
    let mut allocator = arena(16);
    let a = allocator.malloc(100).unwrap();
    let _wall = allocator.malloc(100).unwrap();
    unsafe {
      for i in 0..100 {
        *a.as_ptr().add(i) = i as u8;
      }
      let moved = allocator.realloc(a, 2 * PAGE).unwrap();
      assert_ne!(moved, a);
      for i in 0..100 {
        assert_eq!(*moved.as_ptr().add(i), i as u8);
      }
    }
    assert_eq!(allocator.live_count(), 2);
  }

  #[test]
  fn exhaustion_leaves_the_arena_intact() {
    let mut allocator = arena(4);
    let all: Vec<_> = core::iter::from_fn(|| allocator.malloc(PAGE / 2)).collect();
    assert_eq!(all.len(), 4);
    assert!(allocator.malloc(1).is_none());
    for data in all {
      assert!(unsafe { allocator.free(data) });
    }
    assert_eq!(allocator.free_bytes(), 4 * PAGE);
  }

  #[test]
  fn oversized_requests_fail() {
    let mut allocator = arena(4);
    assert!(allocator.malloc(0).is_none());
    assert!(allocator.malloc(usize::MAX).is_none());
    assert!(allocator.malloc(MAX_SPACE + 1).is_none());
    assert!(allocator.malloc(4 * PAGE).is_none());
  }

  #[test]
  fn rejects_foreign_and_double_frees() {
    corruption::intercept();
    let mut allocator = arena(4);
    let data = allocator.malloc(10).unwrap();
    let mut outside = 0u8;

    unsafe {
      assert!(!allocator.free(NonNull::from(&mut outside)));
      assert!(!allocator.free(NonNull::new_unchecked(data.as_ptr().add(8))));
      assert!(allocator.free(data));
      assert!(!allocator.free(data));
    }
    if cfg!(tripwire) {
      assert_eq!(corruption::take(), Some(CorruptionKind::DoubleFree));
    }
    assert_eq!(allocator.live_count(), 0);
  }

  #[cfg(tripwire)]
  #[test]
  fn overflow_is_caught_on_free() {
    corruption::intercept();
    let mut allocator = arena(4);
    let data = allocator.malloc(10).unwrap();
    unsafe {
      *data.as_ptr().add(10) = 0;
      assert!(!allocator.free(data));
    }
    assert_eq!(corruption::take(), Some(CorruptionKind::Overflow));
    assert_eq!(allocator.live_count(), 1);
  }

  #[test]
  fn clear_forgets_everything() {
    let mut allocator = arena(8);
    for _ in 0..3 {
      allocator.malloc(PAGE).unwrap();
    }
    allocator.clear();
    assert_eq!(allocator.live_count(), 0);
    assert_eq!(allocator.chunk_count(), 1);
    assert!(allocator.malloc(allocator.max_request()).is_some());
  }

  #[traced_test]
  #[test]
  fn dump_lists_live_chunks_as_leaks() {
    let mut allocator = arena(8);
    let _kept = allocator.malloc(300).unwrap();
    allocator.dump();
    assert!(logs_contain("leak"));
    assert!(logs_contain("summary"));
    if cfg!(tripwire) {
      assert!(logs_contain("allocated at"));
      assert!(logs_contain("static_large.rs"));
    }
  }

  #[test]
  fn predictor_can_be_toggled() {
    let mut allocator = arena(16);
    let a = allocator.malloc(PAGE).unwrap();
    let _b = allocator.malloc(PAGE).unwrap();
    unsafe { allocator.free(a) };

    allocator.set_predictor(false);
    assert!(allocator.pred.iter().all(Option::is_none));
    let c = allocator.malloc(10).unwrap();
    assert_eq!(c, a);

    allocator.set_predictor(true);
    assert!(allocator.pred.iter().any(Option::is_some));
  }
}
