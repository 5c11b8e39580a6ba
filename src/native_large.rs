//! Large allocator backed by one native mapping per block.
//!
//! Blocks are linked through their heads so leaks can be listed and the whole set
//! released on clear.

use core::{
  fmt,
  mem::{offset_of, size_of},
  ptr::{self, NonNull, null_mut},
};

use crate::{
  DATA_ALIGN, RawAllocator, checked_align_up,
  debug::{self, CorruptionKind, DataHead, PATCH},
  platform::{self, os_mmap, os_munmap},
  sealed,
};

#[cfg(tripwire)]
use crate::debug::{DATA_MAGIC, DATA_PATCH};

const NAME: &str = "native_large";

#[repr(C, align(16))]
struct NativeHead {
  prev: *mut NativeHead,
  next: *mut NativeHead,
  map_len: usize,
  base: DataHead,
}

const NATIVE_HEAD_SIZE: usize = size_of::<NativeHead>();

const _: () = assert!(NATIVE_HEAD_SIZE % DATA_ALIGN == 0);
const _: () = assert!(offset_of!(NativeHead, base) + size_of::<DataHead>() == NATIVE_HEAD_SIZE);

#[cfg(tripwire)]
#[derive(Default)]
struct NativeStats {
  peak: usize,
  total: usize,
  malloc_count: usize,
  ralloc_count: usize,
  free_count: usize,
}

pub struct NativeLargeAllocator {
  head: *mut NativeHead,
  page_size: usize,
  live: usize,
  mapped: usize,
  #[cfg(tripwire)]
  stats: NativeStats,
}

// Every mapping is reachable only through this value.
unsafe impl Send for NativeLargeAllocator {}

impl fmt::Debug for NativeLargeAllocator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NativeLargeAllocator")
      .field("page_size", &self.page_size)
      .field("live", &self.live)
      .field("mapped", &self.mapped)
      .finish_non_exhaustive()
  }
}

impl Default for NativeLargeAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl NativeLargeAllocator {
  pub fn new() -> Self {
    Self {
      head: null_mut(),
      page_size: platform::page_size(),
      live: 0,
      mapped: 0,
      #[cfg(tripwire)]
      stats: NativeStats::default(),
    }
  }

  #[inline]
  fn data(head: *mut NativeHead) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(head.cast::<u8>().add(NATIVE_HEAD_SIZE)) }
  }

  #[inline]
  fn map_len(&self, size: usize) -> Option<usize> {
    let need = NATIVE_HEAD_SIZE.checked_add(size)?.checked_add(PATCH)?;
    checked_align_up(need, self.page_size)
  }

  fn link(&mut self, head: *mut NativeHead) {
    unsafe {
      (*head).prev = null_mut();
      (*head).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = head;
      }
    }
    self.head = head;
  }

  fn unlink(&mut self, head: *mut NativeHead) {
    unsafe {
      let (prev, next) = ((*head).prev, (*head).next);
      if prev.is_null() {
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
    }
  }

  fn heads(&self) -> impl Iterator<Item = *mut NativeHead> + '_ {
    let mut cursor = self.head;
    core::iter::from_fn(move || {
      let current = cursor;
      if current.is_null() {
        return None;
      }
      cursor = unsafe { (*current).next };
      Some(current)
    })
  }

  /// Head of a live block, reporting rejected pointers.
  fn live_head(&self, data: NonNull<u8>) -> Option<*mut NativeHead> {
    let start = (data.as_ptr() as usize).wrapping_sub(NATIVE_HEAD_SIZE);
    if start % self.page_size != 0 {
      debug::violation(CorruptionKind::Misaligned, NAME, data.as_ptr());
      return None;
    }
    let head = start as *mut NativeHead;

    #[cfg(tripwire)]
    {
      if !self.heads().any(|live| live == head) {
        debug::violation(CorruptionKind::ForeignPointer, NAME, data.as_ptr());
        return None;
      }
      let limit = unsafe { (*head).map_len } - NATIVE_HEAD_SIZE - PATCH;
      let base = unsafe { &(*head).base };
      let intact = unsafe {
        debug::check_data(NAME, data.as_ptr(), &base.debug, DATA_MAGIC, base.size, limit)
      };
      if !intact {
        return None;
      }
    }

    Some(head)
  }

  #[track_caller]
  fn malloc_done(&mut self, size: usize, want_real: bool) -> Option<(NonNull<u8>, usize)> {
    if size == 0 {
      return None;
    }
    let len = self.map_len(size)?;
    let head = unsafe { os_mmap(len) }.cast::<NativeHead>();
    if head.is_null() {
      tracing::debug!(size, len, "malloc: native mapping failed");
      return None;
    }

    unsafe { (*head).map_len = len };
    self.link(head);

    let real = if want_real {
      len - NATIVE_HEAD_SIZE - PATCH
    } else {
      size
    };
    let data = Self::data(head);
    unsafe { (*head).base.size = real };
    self.live += 1;
    self.mapped += len;

    #[cfg(tripwire)]
    {
      unsafe {
        (*head).base.debug.record(DATA_MAGIC);
        data.as_ptr().write_bytes(DATA_PATCH, real + PATCH);
      }
      self.stats.total += real;
      self.stats.peak = self.stats.peak.max(self.stats.total);
      self.stats.malloc_count += 1;
    }

    Some((data, real))
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
    let head = self.live_head(data)?;
    let len = self.map_len(size)?;
    let (map_len, prev_size) = unsafe { ((*head).map_len, (*head).base.size) };

    #[cfg(tripwire)]
    {
      self.stats.ralloc_count += 1;
    }

    // The mapping's slack already covers the request.
    if len <= map_len {
      let real = if want_real {
        map_len - NATIVE_HEAD_SIZE - PATCH
      } else {
        size
      };
      unsafe { (*head).base.size = real };

      #[cfg(tripwire)]
      {
        unsafe {
          (*head).base.debug.record(DATA_MAGIC);
          if real > prev_size {
            data.as_ptr().add(prev_size).write_bytes(DATA_PATCH, real - prev_size);
          }
          *data.as_ptr().add(real) = DATA_PATCH;
        }
        self.stats.total = self.stats.total + real - prev_size;
        self.stats.peak = self.stats.peak.max(self.stats.total);
      }

      return Some((data, real));
    }

    let (fresh, real) = self.malloc_done(size, want_real)?;
    unsafe {
      ptr::copy_nonoverlapping(data.as_ptr(), fresh.as_ptr(), prev_size.min(size));
      self.free(data);
    }
    Some((fresh, real))
  }

  #[track_caller]
  pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.malloc_done(size, false).map(|(data, _)| data)
  }

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
    let Some(head) = self.live_head(data) else {
      return false;
    };

    #[cfg(tripwire)]
    {
      self.stats.total -= unsafe { (*head).base.size };
      self.stats.free_count += 1;
    }

    let len = unsafe { (*head).map_len };
    self.unlink(head);
    self.live -= 1;
    self.mapped -= len;
    unsafe { os_munmap(head.cast(), len) };
    true
  }

  /// Unmaps every block.
  pub fn clear(&mut self) {
    let mut cursor = self.head;
    while !cursor.is_null() {
      let (next, len) = unsafe { ((*cursor).next, (*cursor).map_len) };
      unsafe { os_munmap(cursor.cast(), len) };
      cursor = next;
    }
    self.head = null_mut();
    self.live = 0;
    self.mapped = 0;
    #[cfg(tripwire)]
    {
      self.stats = NativeStats::default();
    }
  }

  pub fn have(&self, data: *const u8) -> bool {
    let addr = data as usize;
    self.heads().any(|head| {
      let start = head as usize + NATIVE_HEAD_SIZE;
      addr >= start && addr < head as usize + unsafe { (*head).map_len }
    })
  }

  pub unsafe fn size_of(&self, data: NonNull<u8>) -> Option<usize> {
    let head = self.live_head(data)?;
    Some(unsafe { (*head).base.size })
  }

  pub fn dump(&self) {
    for head in self.heads() {
      let data = Self::data(head);
      let size = unsafe { (*head).base.size };
      tracing::warn!(allocator = NAME, data = ?data, size, "leak");

      #[cfg(tripwire)]
      {
        unsafe { debug::dump_data(NAME, data.as_ptr(), &(*head).base.debug, size) };
      }
    }

    tracing::info!(allocator = NAME, live = self.live, mapped = self.mapped, "summary");

    #[cfg(tripwire)]
    tracing::info!(
      allocator = NAME,
      peak_size = self.stats.peak,
      free_count = self.stats.free_count,
      malloc_count = self.stats.malloc_count,
      ralloc_count = self.stats.ralloc_count,
      "statistics"
    );
  }

  #[inline]
  pub fn live_count(&self) -> usize {
    self.live
  }

  /// Bytes currently mapped, heads included.
  #[inline]
  pub fn mapped_bytes(&self) -> usize {
    self.mapped
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }
}

impl Drop for NativeLargeAllocator {
  fn drop(&mut self) {
    self.clear();
  }
}

impl sealed::Sealed for NativeLargeAllocator {}

impl RawAllocator for NativeLargeAllocator {
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    NativeLargeAllocator::malloc(self, size)
  }

  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    unsafe { NativeLargeAllocator::realloc(self, data, size) }
  }

  unsafe fn free(&mut self, data: NonNull<u8>) -> bool {
    unsafe { NativeLargeAllocator::free(self, data) }
  }

  fn clear(&mut self) {
    NativeLargeAllocator::clear(self)
  }

  fn dump(&self) {
    NativeLargeAllocator::dump(self)
  }

  fn have(&self, data: *const u8) -> bool {
    NativeLargeAllocator::have(self, data)
  }
}
