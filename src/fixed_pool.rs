//! Growable pool of equal-size items.
//!
//! Items live in slots: arenas taken from a [`LargeAllocator`], each managed by a
//! [`StaticFixedPool`] written in place at the start of the arena. One slot is
//! *current* and serves allocations; the others sit on a *partial* or *full* list.
//! An address-sorted table of every slot, itself kept in large memory, maps a pointer
//! back to its slot on free.

use core::{
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  slice,
};

use crate::{
  DATA_ALIGN, LargeAllocator, StaticFixedPool, align_up,
  debug::{self, CorruptionKind, DATA_HEAD_SIZE, EMPTY_HEAD_SIZE, PATCH},
  platform,
};

const NAME: &str = "fixed_pool";

/// Entries the slot table starts with.
const TABLE_INITIAL: usize = 64;

/// Called on every new item; returning `false` releases the item and fails the malloc.
pub type ItemInit = Box<dyn FnMut(NonNull<u8>) -> bool + Send>;

/// Called on every item before it is released, including by `clear`.
pub type ItemExit = Box<dyn FnMut(NonNull<u8>) + Send>;

// =============================================================================
// Slots
// =============================================================================

#[repr(C)]
struct Slot {
  /// Arena bytes, this head included.
  size: usize,
  pool: StaticFixedPool,
  prev: *mut Slot,
  next: *mut Slot,
}

const SLOT_HEAD_SIZE: usize = align_up(size_of::<Slot>(), DATA_ALIGN);

impl Slot {
  #[inline]
  fn compare(slot: *mut Slot, addr: usize) -> core::cmp::Ordering {
    use core::cmp::Ordering;

    let start = slot as usize;
    let end = start + unsafe { (*slot).size };
    if end <= addr {
      Ordering::Less
    } else if start > addr {
      Ordering::Greater
    } else {
      Ordering::Equal
    }
  }
}

/// Intrusive list threaded through the slot heads.
struct SlotList {
  head: *mut Slot,
  len: usize,
}

impl SlotList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  unsafe fn push(&mut self, slot: *mut Slot) {
    unsafe {
      (*slot).prev = null_mut();
      (*slot).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = slot;
      }
    }
    self.head = slot;
    self.len += 1;
  }

  unsafe fn remove(&mut self, slot: *mut Slot) {
    unsafe {
      let (prev, next) = ((*slot).prev, (*slot).next);
      if prev.is_null() {
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*slot).prev = null_mut();
      (*slot).next = null_mut();
    }
    self.len -= 1;
  }

  fn pop(&mut self) -> Option<*mut Slot> {
    let slot = self.head;
    if slot.is_null() {
      return None;
    }
    unsafe { self.remove(slot) };
    Some(slot)
  }

  fn iter(&self) -> impl Iterator<Item = *mut Slot> + '_ {
    core::iter::successors((!self.head.is_null()).then_some(self.head), |&slot| {
      let next = unsafe { (*slot).next };
      (!next.is_null()).then_some(next)
    })
  }
}

/// Address-sorted table of every slot, grown by doubling in large memory.
struct SlotTable {
  entries: Option<NonNull<*mut Slot>>,
  len: usize,
  cap: usize,
}

impl SlotTable {
  const fn new() -> Self {
    Self {
      entries: None,
      len: 0,
      cap: 0,
    }
  }

  fn as_slice(&self) -> &[*mut Slot] {
    match self.entries {
      Some(entries) => unsafe { slice::from_raw_parts(entries.as_ptr(), self.len) },
      None => &[],
    }
  }

  /// Makes room for one more entry. On failure the table is unchanged.
  fn reserve(&mut self, large: &mut LargeAllocator) -> Option<()> {
    if self.len < self.cap {
      return Some(());
    }
    let entry = size_of::<*mut Slot>();
    let (entries, bytes) = match self.entries {
      None => large.malloc_real(TABLE_INITIAL * entry)?,
      Some(entries) => {
        let bytes = self.cap.checked_mul(2)?.checked_mul(entry)?;
        unsafe { large.realloc_real(entries.cast(), bytes)? }
      }
    };
    self.entries = Some(entries.cast());
    self.cap = bytes / entry;
    tracing::trace!(cap = self.cap, "slot table grown");
    Some(())
  }

  /// Inserts in address order; room must have been reserved.
  unsafe fn insert(&mut self, slot: *mut Slot) {
    let Some(entries) = self.entries else {
      return;
    };
    let at = self.as_slice().partition_point(|&other| other < slot);
    unsafe {
      let base = entries.as_ptr();
      ptr::copy(base.add(at), base.add(at + 1), self.len - at);
      base.add(at).write(slot);
    }
    self.len += 1;
  }

  fn position(&self, data: *const u8) -> Option<usize> {
    let addr = data as usize;
    self
      .as_slice()
      .binary_search_by(|&slot| Slot::compare(slot, addr))
      .ok()
  }

  fn remove(&mut self, at: usize) -> *mut Slot {
    let slot = self.as_slice()[at];
    if let Some(entries) = self.entries {
      unsafe {
        let base = entries.as_ptr();
        ptr::copy(base.add(at + 1), base.add(at), self.len - at - 1);
      }
    }
    self.len -= 1;
    slot
  }

  fn release(&mut self, large: &mut LargeAllocator) {
    if let Some(entries) = self.entries.take() {
      unsafe { large.free(entries.cast()) };
    }
    self.len = 0;
    self.cap = 0;
  }
}

// =============================================================================
// Fixed Pool
// =============================================================================

/// Growable pool of `item_size` items carved from large-allocator slots.
///
/// The pool does not own its [`LargeAllocator`]; every call that may touch slot memory
/// takes it, and the same allocator must be passed for the pool's whole life. Call
/// [`FixedPool::exit`] to hand the slots back.
pub struct FixedPool {
  slot_items: usize,
  item_size: usize,
  for_small: bool,
  current: *mut Slot,
  partial: SlotList,
  full: SlotList,
  table: SlotTable,
  count: usize,
  init: Option<ItemInit>,
  exit: Option<ItemExit>,
}

// Slot memory is reachable only through this value.
unsafe impl Send for FixedPool {}

impl FixedPool {
  /// A pool of `item_size` items, `slot_items` per slot; zero picks `page_size / 16`.
  pub fn new(slot_items: usize, item_size: usize, for_small: bool) -> Self {
    let slot_items = match slot_items {
      0 => (platform::page_size() >> 4).max(1),
      n => n,
    };
    Self {
      slot_items,
      item_size,
      for_small,
      current: null_mut(),
      partial: SlotList::new(),
      full: SlotList::new(),
      table: SlotTable::new(),
      count: 0,
      init: None,
      exit: None,
    }
  }

  pub fn with_item_init(mut self, init: impl FnMut(NonNull<u8>) -> bool + Send + 'static) -> Self {
    self.init = Some(Box::new(init));
    self
  }

  pub fn with_item_exit(mut self, exit: impl FnMut(NonNull<u8>) + Send + 'static) -> Self {
    self.exit = Some(Box::new(exit));
    self
  }

  fn slot_init(&mut self, large: &mut LargeAllocator) -> Option<*mut Slot> {
    let head = if self.for_small {
      DATA_HEAD_SIZE
    } else {
      EMPTY_HEAD_SIZE
    };
    let item_space = align_up(head + self.item_size + PATCH, DATA_ALIGN);
    let bitmap = align_up(self.slot_items.div_ceil(64) * 8, DATA_ALIGN);
    let need = self
      .slot_items
      .checked_mul(item_space)?
      .checked_add(SLOT_HEAD_SIZE + bitmap + DATA_ALIGN)?;

    // Grow the table first so a failure leaves nothing to undo.
    self.table.reserve(large)?;
    let (arena, size) = large.malloc_real(need)?;

    let pool = unsafe {
      StaticFixedPool::from_raw(
        NonNull::new_unchecked(arena.as_ptr().add(SLOT_HEAD_SIZE)),
        size - SLOT_HEAD_SIZE,
        self.item_size,
        self.for_small,
      )
    };
    let pool = match pool {
      Ok(pool) => pool,
      Err(err) => {
        tracing::warn!(%err, item_size = self.item_size, "slot pool rejected its arena");
        unsafe { large.free(arena) };
        return None;
      }
    };

    let slot = arena.as_ptr().cast::<Slot>();
    tracing::debug!(
      item_size = self.item_size,
      need,
      size,
      maxn = pool.maxn(),
      "slot ready"
    );
    unsafe {
      slot.write(Slot {
        size,
        pool,
        prev: null_mut(),
        next: null_mut(),
      });
      self.table.insert(slot);
    }
    Some(slot)
  }

  unsafe fn slot_exit(&mut self, large: &mut LargeAllocator, at: usize) {
    let slot = self.table.remove(at);
    tracing::debug!(item_size = self.item_size, slot = ?slot, "slot released");
    unsafe { large.free(NonNull::new_unchecked(slot.cast())) };
  }

  #[track_caller]
  pub fn malloc(&mut self, large: &mut LargeAllocator) -> Option<NonNull<u8>> {
    let current_full = !self.current.is_null() && unsafe { (*self.current).pool.full() };
    if self.current.is_null() || current_full {
      if current_full {
        unsafe { self.full.push(self.current) };
        self.current = null_mut();
      }
      self.current = match self.partial.pop() {
        Some(slot) => slot,
        None => self.slot_init(large)?,
      };
    }

    let pool = unsafe { &mut (*self.current).pool };
    let data = pool.malloc()?;
    if let Some(init) = self.init.as_mut()
      && !init(data)
    {
      unsafe { pool.free(data) };
      return None;
    }

    self.count += 1;
    Some(data)
  }

  /// Releases an item. Emptied slots other than the current one go back to `large`.
  pub unsafe fn free(&mut self, large: &mut LargeAllocator, data: NonNull<u8>) -> bool {
    let Some(at) = self.table.position(data.as_ptr()) else {
      debug::violation(CorruptionKind::ForeignPointer, NAME, data.as_ptr());
      return false;
    };
    let slot = self.table.as_slice()[at];
    let pool = unsafe { &mut (*slot).pool };
    if !pool.is_live(data) {
      return false;
    }

    if let Some(exit) = self.exit.as_mut() {
      exit(data);
    }
    let was_full = pool.full();
    if !unsafe { pool.free(data) } {
      return false;
    }
    self.count -= 1;

    if slot != self.current {
      unsafe {
        if was_full {
          self.full.remove(slot);
          self.partial.push(slot);
        }
        if (*slot).pool.is_empty() {
          self.partial.remove(slot);
          self.slot_exit(large, at);
        }
      }
    }
    true
  }

  /// Whether `data` is a live item of this pool.
  pub fn is_live(&self, data: NonNull<u8>) -> bool {
    match self.table.position(data.as_ptr()) {
      Some(at) => unsafe { (*self.table.as_slice()[at]).pool.is_live(data) },
      None => false,
    }
  }

  /// Exits every live item and keeps only the current slot, emptied.
  pub fn clear(&mut self, large: &mut LargeAllocator) {
    if let Some(exit) = self.exit.as_mut() {
      for &slot in self.table.as_slice() {
        unsafe { (*slot).pool.walk(|data| exit(data)) };
      }
    }

    let current = self.current;
    for &slot in self.table.as_slice() {
      if slot != current {
        unsafe { large.free(NonNull::new_unchecked(slot.cast())) };
      }
    }
    self.table.len = 0;
    if !current.is_null() {
      unsafe {
        (*current).pool.clear();
        self.table.insert(current);
      }
    }

    self.partial = SlotList::new();
    self.full = SlotList::new();
    self.count = 0;
  }

  /// Clears the pool and returns all of its memory to `large`.
  pub fn exit(&mut self, large: &mut LargeAllocator) {
    self.clear(large);
    if !self.current.is_null() {
      unsafe { large.free(NonNull::new_unchecked(self.current.cast())) };
      self.current = null_mut();
    }
    self.table.release(large);
  }

  fn slots(&self) -> impl Iterator<Item = *mut Slot> + '_ {
    (!self.current.is_null())
      .then_some(self.current)
      .into_iter()
      .chain(self.partial.iter())
      .chain(self.full.iter())
  }

  /// Visits every live item: current slot first, then partial, then full slots.
  pub fn walk(&self, mut f: impl FnMut(NonNull<u8>)) {
    for slot in self.slots() {
      unsafe { (*slot).pool.walk(&mut f) };
    }
  }

  pub fn dump(&self) {
    for slot in self.slots() {
      unsafe { (*slot).pool.dump() };
    }
    tracing::info!(
      allocator = NAME,
      item_size = self.item_size,
      count = self.count,
      slots = self.table.len,
      partial = self.partial.len,
      full = self.full.len,
      "summary"
    );
  }

  pub fn have(&self, data: *const u8) -> bool {
    self.table.position(data).is_some()
  }

  /// Live items.
  #[inline]
  pub fn size(&self) -> usize {
    self.count
  }

  #[inline]
  pub fn item_size(&self) -> usize {
    self.item_size
  }

  #[inline]
  pub fn slot_count(&self) -> usize {
    self.table.len
  }
}
