#![allow(clippy::missing_safety_doc)]
//! A tiered pool allocator.
//!
//! Requests of up to [`SMALL_MAX_SIZE`] bytes are served from fixed-size-class pools,
//! larger ones from page-granular chunks. Both tiers work over a caller buffer or native
//! page mappings and never call into the process allocator.
//!
//! ```text
//! DefaultAllocator ─┬─ SmallAllocator ── FixedPool ── StaticFixedPool (bitmap slots)
//!                   └─ LargeAllocator ─┬─ StaticLargeAllocator (boundary-tag chunks)
//!                                      └─ NativeLargeAllocator (one mapping per block)
//! ```

use core::{cell::UnsafeCell, ptr::NonNull};

mod debug;
mod default_allocator;
mod error;
mod fixed_pool;
pub mod global;
mod large;
mod native_large;
pub mod platform;
mod small;
mod static_fixed;
mod static_large;
mod sync;

pub use debug::{
  BACKTRACE_DEPTH, Corruption, CorruptionHandler, CorruptionKind, DATA_EMPTY_MAGIC, DATA_MAGIC,
  DATA_PATCH, abort_on_corruption, set_corruption_handler,
};
pub use default_allocator::DefaultAllocator;
pub use error::InitError;
pub use fixed_pool::{FixedPool, ItemExit, ItemInit};
pub use large::LargeAllocator;
pub use native_large::NativeLargeAllocator;
pub use small::{SIZE_CLASSES, SmallAllocator, size_class};
pub use static_fixed::StaticFixedPool;
pub use static_large::{CHUNK_HEAD_SIZE, MAX_SPACE, PRED_BUCKETS, StaticLargeAllocator};
pub use sync::{SpinGuard, SpinLock};

// =============================================================================
// Constants
// =============================================================================

/// Largest request served by the small tier.
pub const SMALL_MAX_SIZE: usize = 3072;

/// Alignment of every pointer handed out.
pub const DATA_ALIGN: usize = 16;

/// Whether heads, patch bytes and corruption checks are compiled in.
pub const TRIPWIRE: bool = cfg!(tripwire);

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(DATA_ALIGN.is_power_of_two());
const _: () = assert!(SIZE_CLASSES[SIZE_CLASSES.len() - 1] == SMALL_MAX_SIZE);
const _: () = assert!(SIZE_CLASSES[0] % DATA_ALIGN == 0);

// =============================================================================
// Allocator
// =============================================================================

mod sealed {
  pub trait Sealed {}
}

/// The operations every tier provides. Implemented only by this crate's allocators.
pub trait RawAllocator: sealed::Sealed + Send {
  /// Allocates `size` bytes; `None` when `size` is zero or memory is exhausted.
  #[track_caller]
  fn malloc(&mut self, size: usize) -> Option<NonNull<u8>>;

  /// Resizes a live block, moving it when it cannot grow in place.
  /// On `None` the original block is untouched.
  #[track_caller]
  unsafe fn realloc(&mut self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

  /// Releases a live block. Returns `false` when the pointer was rejected.
  unsafe fn free(&mut self, data: NonNull<u8>) -> bool;

  /// Drops every allocation at once.
  fn clear(&mut self);

  /// Logs live blocks as leaks, followed by statistics.
  fn dump(&self);

  /// Whether `data` lies in memory managed by this allocator.
  fn have(&self, data: *const u8) -> bool;
}

/// A tier behind its own spinlock, usable through `&self` from many threads.
///
/// Every call holds the lock for its full duration. Callbacks run from inside a call
/// (fixed-pool item hooks, the corruption handler) must not re-enter the same handle.
pub struct Allocator<A> {
  lock: SpinLock,
  inner: UnsafeCell<A>,
}

unsafe impl<A: Send> Sync for Allocator<A> {}

impl<A: RawAllocator> Allocator<A> {
  pub const fn new(inner: A) -> Self {
    Self {
      lock: SpinLock::new(),
      inner: UnsafeCell::new(inner),
    }
  }

  #[track_caller]
  pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).malloc(size) }
  }

  /// Allocates `size` zeroed bytes.
  #[track_caller]
  pub fn malloc_zeroed(&self, size: usize) -> Option<NonNull<u8>> {
    let data = self.malloc(size)?;
    unsafe { data.as_ptr().write_bytes(0, size) };
    Some(data)
  }

  /// Allocates `count` items of `size` bytes.
  #[track_caller]
  pub fn nalloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
    self.malloc(count.checked_mul(size)?)
  }

  #[track_caller]
  pub fn nalloc_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
    self.malloc_zeroed(count.checked_mul(size)?)
  }

  #[track_caller]
  pub unsafe fn realloc(&self, data: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).realloc(data, size) }
  }

  pub unsafe fn free(&self, data: NonNull<u8>) -> bool {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).free(data) }
  }

  pub fn clear(&self) {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).clear() }
  }

  pub fn dump(&self) {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).dump() }
  }

  pub fn have(&self, data: *const u8) -> bool {
    let _guard = self.lock.lock();
    unsafe { (*self.inner.get()).have(data) }
  }

  /// Runs `f` on the tier with the lock held.
  pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
    let _guard = self.lock.lock();
    f(unsafe { &mut *self.inner.get() })
  }

  /// Tears the handle down and returns the tier.
  pub fn exit(self) -> A {
    self.inner.into_inner()
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline(always)]
pub(crate) const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(sum) => Some(sum & !mask),
    None => None,
  }
}

#[inline(always)]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}
