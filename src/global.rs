//! The process-wide allocator.
//!
//! A [`DefaultAllocator`] behind one spinlock, built on first use over per-block native
//! mappings, or over a caller-supplied [`LargeAllocator`] through [`install`]. It is
//! torn down at process exit and rebuilt if used again afterwards.
//!
//! A thread holding the allocator can be called back into it: a log subscriber
//! formatting an event, or the corruption handler. Those calls never take the lock.
//! They allocate from single mappings of their own, and their frees of tier blocks are
//! queued until the lock holder is done.

use core::{
  cell::{Cell, UnsafeCell},
  mem,
  ptr::NonNull,
  sync::atomic::{AtomicBool, Ordering},
};

use crate::{DefaultAllocator, LargeAllocator, SpinGuard, SpinLock, debug::DataHead};

/// Lifecycle of the process-wide allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalState {
  Uninitialized,
  Ready,
  Exited,
}

enum State {
  Uninitialized,
  Ready(DefaultAllocator),
  Exited,
}

struct Global {
  lock: SpinLock,
  state: UnsafeCell<State>,
}

// The state is only reached with the lock held.
unsafe impl Sync for Global {}

static GLOBAL: Global = Global {
  lock: SpinLock::new(),
  state: UnsafeCell::new(State::Uninitialized),
};

static TEARDOWN_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Passes over the queue of deferred frees before giving up the lock.
const DRAIN_ROUNDS: usize = 4;

impl Global {
  /// # Safety
  /// The lock must be held for as long as the reference is used.
  #[allow(clippy::mut_from_ref)]
  unsafe fn state(&self) -> &mut State {
    unsafe { &mut *self.state.get() }
  }
}

// =============================================================================
// Re-entry
// =============================================================================

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside the allocator until dropped.
struct Entered;

impl Entered {
  fn enter() -> Option<Self> {
    match IN_ALLOC.try_with(|flag| flag.replace(true)) {
      Ok(false) => Some(Self),
      _ => None,
    }
  }
}

impl Drop for Entered {
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

/// Whether this thread is already inside the allocator.
fn inside() -> bool {
  IN_ALLOC.try_with(Cell::get).unwrap_or(true)
}

/// Blocks for calls made from inside the allocator, and the frees they queue.
mod side {
  use core::{
    ptr::{NonNull, null_mut},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
  };

  use crate::{
    DATA_ALIGN, checked_align_up,
    platform::{self, os_mmap, os_munmap},
  };

  /// Live side blocks, and queued frees, each at most.
  const SLOTS: usize = 64;
  const HEAD_SIZE: usize = DATA_ALIGN;

  /// Mapping length and requested size, stored in front of the data.
  #[repr(C)]
  struct Head {
    len: usize,
    size: usize,
  }

  const _: () = assert!(core::mem::size_of::<Head>() <= HEAD_SIZE);

  static BLOCKS: [AtomicPtr<u8>; SLOTS] = [const { AtomicPtr::new(null_mut()) }; SLOTS];
  static LIVE: AtomicUsize = AtomicUsize::new(0);

  static DEFERRED: [AtomicPtr<u8>; SLOTS] = [const { AtomicPtr::new(null_mut()) }; SLOTS];
  static PENDING: AtomicUsize = AtomicUsize::new(0);

  #[inline]
  fn head(data: NonNull<u8>) -> *mut Head {
    data.as_ptr().wrapping_sub(HEAD_SIZE).cast()
  }

  fn slot(data: NonNull<u8>) -> Option<&'static AtomicPtr<u8>> {
    if LIVE.load(Ordering::Acquire) == 0 {
      return None;
    }
    BLOCKS
      .iter()
      .find(|slot| slot.load(Ordering::Acquire) == data.as_ptr())
  }

  #[cfg(test)]
  pub(super) fn live() -> usize {
    LIVE.load(Ordering::Acquire)
  }

  pub(super) fn pending() -> usize {
    PENDING.load(Ordering::Acquire)
  }

  pub(super) fn malloc(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let len = checked_align_up(size.checked_add(HEAD_SIZE)?, platform::page_size())?;
    let map = NonNull::new(unsafe { os_mmap(len) })?;
    let data = unsafe { map.add(HEAD_SIZE) };
    unsafe { head(data).write(Head { len, size }) };

    LIVE.fetch_add(1, Ordering::AcqRel);
    let claimed = BLOCKS.iter().any(|slot| {
      slot
        .compare_exchange(null_mut(), data.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    });
    if !claimed {
      LIVE.fetch_sub(1, Ordering::AcqRel);
      unsafe { os_munmap(map.as_ptr(), len) };
      return None;
    }
    Some(data)
  }

  /// Requested size of a live side block; `None` for any other pointer.
  pub(super) fn size_of(data: NonNull<u8>) -> Option<usize> {
    slot(data)?;
    Some(unsafe { (*head(data)).size })
  }

  /// Releases a side block. `false` when `data` is not one.
  pub(super) unsafe fn free(data: NonNull<u8>) -> bool {
    let Some(slot) = slot(data) else {
      return false;
    };
    if slot
      .compare_exchange(data.as_ptr(), null_mut(), Ordering::AcqRel, Ordering::Relaxed)
      .is_err()
    {
      return false;
    }
    LIVE.fetch_sub(1, Ordering::AcqRel);
    unsafe {
      let len = (*head(data)).len;
      os_munmap(head(data).cast(), len);
    }
    true
  }

  /// Queues a tier block for release by the lock holder. `false` when the queue is full
  /// and the block is leaked.
  pub(super) fn defer(data: NonNull<u8>) -> bool {
    PENDING.fetch_add(1, Ordering::AcqRel);
    let queued = DEFERRED.iter().any(|slot| {
      slot
        .compare_exchange(null_mut(), data.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
    });
    if !queued {
      PENDING.fetch_sub(1, Ordering::AcqRel);
    }
    queued
  }

  /// Hands every queued block to `f`. Returns how many there were.
  pub(super) fn take_deferred(mut f: impl FnMut(NonNull<u8>)) -> usize {
    if pending() == 0 {
      return 0;
    }
    let mut taken = 0;
    for slot in &DEFERRED {
      if let Some(data) = NonNull::new(slot.swap(null_mut(), Ordering::AcqRel)) {
        PENDING.fetch_sub(1, Ordering::AcqRel);
        f(data);
        taken += 1;
      }
    }
    taken
  }
}

/// Releases frees queued from inside the allocator. Each free may queue more.
fn drain(tiers: &mut DefaultAllocator) {
  for _ in 0..DRAIN_ROUNDS {
    let taken = side::take_deferred(|data| {
      unsafe { tiers.free(data) };
    });
    if taken == 0 {
      break;
    }
  }
}

// =============================================================================
// Locking
// =============================================================================

/// The running allocator, locked. Queued frees are drained before the lock is released.
struct Ready {
  tiers: &'static mut DefaultAllocator,
  _guard: SpinGuard<'static>,
  _entered: Entered,
}

impl Drop for Ready {
  fn drop(&mut self) {
    drain(&mut *self.tiers);
  }
}

extern "C" fn teardown() {
  exit();
}

/// Registers [`teardown`] once. Called without the lock: `atexit` may allocate, and in
/// C ABI builds that allocation comes back here.
fn register_teardown() -> bool {
  if TEARDOWN_REGISTERED.swap(true, Ordering::AcqRel) {
    return false;
  }
  if unsafe { libc::atexit(teardown) } != 0 {
    tracing::warn!("could not register allocator teardown at exit");
  }
  true
}

/// Locks the allocator, building it first when it is not running. `None` from inside
/// the allocator.
fn ready() -> Option<Ready> {
  if !TEARDOWN_REGISTERED.load(Ordering::Acquire) {
    register_teardown();
  }

  let entered = Entered::enter()?;
  let guard = GLOBAL.lock.lock();
  let state = unsafe { GLOBAL.state() };
  if !matches!(state, State::Ready(_)) {
    *state = State::Ready(DefaultAllocator::new(LargeAllocator::native()));
    tracing::debug!("global allocator ready");
  }

  match state {
    State::Ready(tiers) => Some(Ready {
      tiers,
      _guard: guard,
      _entered: entered,
    }),
    _ => None,
  }
}

/// Locks the allocator only if it is running.
fn running() -> Option<Ready> {
  let entered = Entered::enter()?;
  let guard = GLOBAL.lock.lock();
  match unsafe { GLOBAL.state() } {
    State::Ready(tiers) => Some(Ready {
      tiers,
      _guard: guard,
      _entered: entered,
    }),
    _ => None,
  }
}

#[inline]
unsafe fn recorded_size(data: NonNull<u8>) -> usize {
  unsafe { (*DataHead::of(data.as_ptr())).size }
}

// =============================================================================
// API
// =============================================================================

#[track_caller]
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
  match ready() {
    Some(ready) => ready.tiers.malloc(size),
    None => side::malloc(size),
  }
}

#[track_caller]
pub fn malloc_zeroed(size: usize) -> Option<NonNull<u8>> {
  let data = malloc(size)?;
  unsafe { data.as_ptr().write_bytes(0, size) };
  Some(data)
}

/// Resizes `data`, or allocates when it is `None`.
#[track_caller]
pub unsafe fn realloc(data: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
  let Some(data) = data else {
    return malloc(size);
  };

  // Side blocks move to wherever `malloc` serves the caller now.
  if let Some(old) = side::size_of(data) {
    let fresh = malloc(size)?;
    unsafe {
      fresh.as_ptr().copy_from_nonoverlapping(data.as_ptr(), old.min(size));
      side::free(data);
    }
    return Some(fresh);
  }

  if inside() {
    let old = unsafe { recorded_size(data) };
    let fresh = side::malloc(size)?;
    unsafe { fresh.as_ptr().copy_from_nonoverlapping(data.as_ptr(), old.min(size)) };
    side::defer(data);
    return Some(fresh);
  }

  let ready = ready()?;
  unsafe { ready.tiers.realloc(data, size) }
}

/// Releases `data`. `None` is accepted and ignored.
pub unsafe fn free(data: Option<NonNull<u8>>) -> bool {
  let Some(data) = data else {
    return true;
  };
  if unsafe { side::free(data) } {
    return true;
  }
  if inside() {
    return side::defer(data);
  }
  match running() {
    Some(ready) => unsafe { ready.tiers.free(data) },
    None => false,
  }
}

/// Recorded size of a live block.
pub unsafe fn size_of(data: NonNull<u8>) -> Option<usize> {
  if let Some(size) = side::size_of(data) {
    return Some(size);
  }
  if inside() {
    return Some(unsafe { recorded_size(data) });
  }
  let ready = running()?;
  unsafe { ready.tiers.size_of(data) }
}

/// Logs live blocks of both tiers. Does nothing from inside the allocator.
pub fn dump() {
  if let Some(ready) = running() {
    ready.tiers.dump();
  }
}

/// Must not be called from inside the allocator.
pub fn state() -> GlobalState {
  let _guard = GLOBAL.lock.lock();
  match unsafe { GLOBAL.state() } {
    State::Uninitialized => GlobalState::Uninitialized,
    State::Ready(_) => GlobalState::Ready,
    State::Exited => GlobalState::Exited,
  }
}

/// Runs the allocator over `large` instead of native mappings. Fails, handing `large`
/// back, while an allocator is already running or when called from inside one.
pub fn install(large: LargeAllocator) -> Result<(), LargeAllocator> {
  let Some(_entered) = Entered::enter() else {
    return Err(large);
  };
  {
    let _guard = GLOBAL.lock.lock();
    let state = unsafe { GLOBAL.state() };
    if matches!(state, State::Ready(_)) {
      return Err(large);
    }
    *state = State::Ready(DefaultAllocator::new(large));
  }
  tracing::debug!("global allocator installed over a caller allocator");
  register_teardown();
  Ok(())
}

/// Tears the allocator down. The next allocation builds a fresh one. Ignored from
/// inside the allocator.
pub fn exit() {
  let Some(entered) = Entered::enter() else {
    return;
  };
  let previous = {
    let _guard = GLOBAL.lock.lock();
    let state = unsafe { GLOBAL.state() };
    if !matches!(state, State::Ready(_)) {
      return;
    }
    mem::replace(state, State::Exited)
  };

  if let State::Ready(mut tiers) = previous {
    drain(&mut tiers);
    if cfg!(tripwire) {
      tiers.dump();
    }
    drop(tiers);
    // Anything queued since belonged to the allocator just dropped.
    side::take_deferred(|_| {});
    drop(entered);
    tracing::debug!("global allocator exited");
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::ptr::{NonNull, null_mut};

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    super::malloc(size.max(1)).map_or(null_mut(), NonNull::as_ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { super::free(NonNull::new(ptr)) };
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      return null_mut();
    };
    super::malloc_zeroed(total.max(1)).map_or(null_mut(), NonNull::as_ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if size == 0 {
      unsafe { super::free(NonNull::new(ptr)) };
      return null_mut();
    }
    unsafe { super::realloc(NonNull::new(ptr), size) }.map_or(null_mut(), NonNull::as_ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { super::size_of(ptr) }.unwrap_or(0),
      None => 0,
    }
  }
}
