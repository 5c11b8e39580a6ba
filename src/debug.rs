//! Allocation heads and heap-corruption reporting.
//!
//! Every block a tier hands out is preceded by a [`DataHead`] carrying the requested
//! size. Instrumented builds (`debug_assertions` or the `debug-tripwire` feature) grow the
//! head with a magic value, the call site and a short backtrace, and reserve one patch
//! byte right after the requested size so a one-byte overflow is caught on release.

use core::{fmt, mem::size_of};
use std::sync::{PoisonError, RwLock};

#[cfg(tripwire)]
use core::{ffi::CStr, panic::Location};

use crate::DATA_ALIGN;

// =============================================================================
// Constants
// =============================================================================

/// Magic of a live block that carries a full data head.
pub const DATA_MAGIC: u16 = 0xdead;
/// Magic of a live fixed-pool item without a size field.
pub const DATA_EMPTY_MAGIC: u16 = 0xdeaf;
/// Fill value of fresh blocks and of the trailing patch byte.
pub const DATA_PATCH: u8 = 0xcc;
/// Return addresses kept per block.
pub const BACKTRACE_DEPTH: usize = 16;

/// Bytes reserved after every block for the patch.
pub(crate) const PATCH: usize = if cfg!(tripwire) { 1 } else { 0 };

/// Bytes of a block dumped as hex next to a leak or corruption report.
#[cfg(tripwire)]
const HEXDUMP_LIMIT: usize = 64;

// =============================================================================
// Heads
// =============================================================================

#[cfg(tripwire)]
#[repr(C)]
pub(crate) struct DebugHead {
  pub magic: u16,
  pub line: u16,
  pub column: u32,
  pub location: *const Location<'static>,
  pub frames: [usize; BACKTRACE_DEPTH],
}

/// Metadata immediately preceding a user pointer.
#[repr(C, align(16))]
pub(crate) struct DataHead {
  #[cfg(tripwire)]
  pub debug: DebugHead,
  pub size: usize,
}

pub(crate) const DATA_HEAD_SIZE: usize = size_of::<DataHead>();

/// Head of a fixed-pool item that stores no size.
#[cfg(tripwire)]
pub(crate) const EMPTY_HEAD_SIZE: usize = crate::align_up(size_of::<DebugHead>(), DATA_ALIGN);
#[cfg(not(tripwire))]
pub(crate) const EMPTY_HEAD_SIZE: usize = 0;

const _: () = assert!(DATA_HEAD_SIZE % DATA_ALIGN == 0);
const _: () = assert!(EMPTY_HEAD_SIZE % DATA_ALIGN == 0);
const _: () = assert!(EMPTY_HEAD_SIZE <= DATA_HEAD_SIZE);

impl DataHead {
  /// The head stored right before `data`.
  #[inline]
  pub unsafe fn of(data: *const u8) -> *mut DataHead {
    unsafe { data.sub(DATA_HEAD_SIZE) as *mut DataHead }
  }
}

#[cfg(tripwire)]
impl DebugHead {
  /// Stamps `magic`, the caller's location and the current backtrace.
  #[track_caller]
  #[inline]
  pub fn record(&mut self, magic: u16) {
    let location = Location::caller();
    self.magic = magic;
    self.line = u16::try_from(location.line()).unwrap_or(u16::MAX);
    self.column = location.column();
    self.location = location;
    capture_frames(&mut self.frames);
  }

  /// Flips the magic so a second release reads as a double free.
  #[inline]
  pub fn retire(&mut self) {
    self.magic = !self.magic;
  }

  pub fn location(&self) -> Option<&'static Location<'static>> {
    unsafe { self.location.as_ref() }
  }
}

// =============================================================================
// Backtraces
// =============================================================================

#[cfg(all(
  tripwire,
  not(feature = "c_api"),
  any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")
))]
unsafe extern "C" {
  fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
}

#[cfg(all(
  tripwire,
  not(feature = "c_api"),
  any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")
))]
#[inline(never)]
fn capture_frames(frames: &mut [usize; BACKTRACE_DEPTH]) {
  // This frame and the head recorder.
  const SKIP: usize = 2;

  let mut raw = [core::ptr::null_mut::<libc::c_void>(); BACKTRACE_DEPTH + SKIP];
  let taken = unsafe { backtrace(raw.as_mut_ptr(), raw.len() as libc::c_int) };
  let taken = usize::try_from(taken).unwrap_or(0);

  frames.fill(0);
  for (slot, addr) in frames.iter_mut().zip(raw.iter().take(taken).skip(SKIP)) {
    *slot = *addr as usize;
  }
}

// The C ABI build may be the process malloc, and the unwinder allocates on first use.
#[cfg(all(
  tripwire,
  not(all(
    not(feature = "c_api"),
    any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")
  ))
))]
fn capture_frames(frames: &mut [usize; BACKTRACE_DEPTH]) {
  frames.fill(0);
}

/// Nearest exported symbol and the offset into it. Borrowed from the loader, so no
/// allocation happens while an allocator lock is held.
#[cfg(tripwire)]
fn symbolize(addr: usize) -> Option<(&'static CStr, usize)> {
  let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
  let found = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
  if found == 0 || info.dli_sname.is_null() {
    return None;
  }
  let name = unsafe { CStr::from_ptr(info.dli_sname) };
  Some((name, addr.wrapping_sub(info.dli_saddr as usize)))
}

// =============================================================================
// Checks and dumps
// =============================================================================

/// Validates a live block: magic intact, `size` within `limit`, patch byte intact.
#[cfg(tripwire)]
pub(crate) unsafe fn check_data(
  allocator: &'static str,
  data: *const u8,
  head: &DebugHead,
  magic: u16,
  size: usize,
  limit: usize,
) -> bool {
  let kind = if head.magic == !magic {
    Some(CorruptionKind::DoubleFree)
  } else if head.magic != magic || size > limit {
    Some(CorruptionKind::BadMagic)
  } else if unsafe { *data.add(size) } != DATA_PATCH {
    Some(CorruptionKind::Overflow)
  } else {
    None
  };

  let Some(kind) = kind else {
    return true;
  };
  if kind != CorruptionKind::BadMagic {
    unsafe { dump_data(allocator, data, head, size) };
  }
  violation(kind, allocator, data);
  false
}

/// Logs the call site, backtrace and leading bytes of one block.
#[cfg(tripwire)]
pub(crate) unsafe fn dump_data(allocator: &'static str, data: *const u8, head: &DebugHead, size: usize) {
  match head.location() {
    Some(site) => tracing::warn!(
      allocator,
      data = ?data,
      size,
      "allocated at {}:{}:{}",
      site.file(),
      site.line(),
      site.column()
    ),
    None => tracing::warn!(allocator, data = ?data, size, "allocated at an unknown site"),
  }

  for (depth, &frame) in head
    .frames
    .iter()
    .enumerate()
    .take_while(|(_, frame)| **frame != 0)
  {
    match symbolize(frame) {
      Some((name, offset)) => {
        tracing::warn!("    [{depth:02}] {frame:#x} {}+{offset:#x}", name.to_string_lossy())
      }
      None => tracing::warn!("    [{depth:02}] {frame:#x}"),
    }
  }

  let shown = unsafe { core::slice::from_raw_parts(data, size.min(HEXDUMP_LIMIT)) };
  for (row, bytes) in shown.chunks(16).enumerate() {
    tracing::warn!("    {:04x}: {}", row * 16, HexRow(bytes));
  }
}

#[cfg(tripwire)]
struct HexRow<'a>(&'a [u8]);

#[cfg(tripwire)]
impl fmt::Display for HexRow<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in self.0 {
      write!(f, "{byte:02x} ")?;
    }
    Ok(())
  }
}

// =============================================================================
// Corruption handler
// =============================================================================

/// What a failed heap check found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
  /// The block was already released.
  DoubleFree,
  /// The pointer lies outside every arena of the allocator.
  ForeignPointer,
  /// The pointer lies inside an arena but not on a block boundary.
  Misaligned,
  /// The head magic or size was overwritten.
  BadMagic,
  /// The patch byte after the requested size was overwritten.
  Overflow,
}

impl fmt::Display for CorruptionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::DoubleFree => "double free",
      Self::ForeignPointer => "foreign pointer",
      Self::Misaligned => "misaligned pointer",
      Self::BadMagic => "damaged head",
      Self::Overflow => "overflow past the requested size",
    })
  }
}

/// A detected heap violation, handed to the installed [`CorruptionHandler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corruption {
  pub kind: CorruptionKind,
  pub allocator: &'static str,
  pub address: usize,
}

impl fmt::Display for Corruption {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} at {:#x} in {}", self.kind, self.address, self.allocator)
  }
}

/// Called with the allocator lock held; must not re-enter the allocator.
/// When it returns, the offending call fails without touching allocator state.
pub type CorruptionHandler = fn(&Corruption);

static HANDLER: RwLock<CorruptionHandler> = RwLock::new(abort_on_corruption as CorruptionHandler);

/// Installs `handler` and returns the previous one.
pub fn set_corruption_handler(handler: CorruptionHandler) -> CorruptionHandler {
  let mut slot = HANDLER.write().unwrap_or_else(PoisonError::into_inner);
  core::mem::replace(&mut *slot, handler)
}

/// The default handler.
pub fn abort_on_corruption(corruption: &Corruption) {
  tracing::error!(%corruption, "aborting on heap corruption");
  std::process::abort();
}

/// Reports a violation in instrumented builds; a no-op otherwise.
pub(crate) fn violation(kind: CorruptionKind, allocator: &'static str, data: *const u8) {
  #[cfg(tripwire)]
  {
    let corruption = Corruption {
      kind,
      allocator,
      address: data as usize,
    };
    tracing::error!(%corruption, "heap corruption detected");
    let handler = *HANDLER.read().unwrap_or_else(PoisonError::into_inner);
    handler(&corruption);
  }

  #[cfg(not(tripwire))]
  let _ = (kind, allocator, data);
}
