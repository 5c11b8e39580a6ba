//! The process-wide allocator. One test, so nothing else in this binary touches it.

use tieralloc::{
  LargeAllocator,
  global::{self, GlobalState},
};

#[test]
fn lifecycle() {
  assert_eq!(global::state(), GlobalState::Uninitialized);
  assert!(unsafe { global::free(None) });

  // First use builds the allocator.
  let data = global::malloc(100).unwrap();
  assert_eq!(global::state(), GlobalState::Ready);
  assert_eq!(unsafe { global::size_of(data) }, Some(100));

  unsafe {
    data.as_ptr().write_bytes(0x42, 100);
    let grown = global::realloc(Some(data), 10_000).unwrap();
    assert_eq!(*grown.as_ptr().add(99), 0x42);
    assert!(global::free(Some(grown)));
  }

  let zeroed = global::malloc_zeroed(5000).unwrap();
  let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 5000) };
  assert!(bytes.iter().all(|&b| b == 0));
  assert!(unsafe { global::free(Some(zeroed)) });

  // A caller allocator cannot replace a running one.
  let arena = LargeAllocator::with_native_arena(4096 * 4096, 4096).unwrap();
  let arena = global::install(arena).unwrap_err();

  global::exit();
  assert_eq!(global::state(), GlobalState::Exited);
  assert_eq!(unsafe { global::size_of(data) }, None);

  // Used again after exit, it comes back.
  let data = unsafe { global::realloc(None, 64) }.unwrap();
  assert_eq!(global::state(), GlobalState::Ready);
  assert!(unsafe { global::free(Some(data)) });
  global::exit();

  // Over a caller arena.
  global::install(arena).unwrap();
  assert_eq!(global::state(), GlobalState::Ready);
  let data = global::malloc(20_000).unwrap();
  assert_eq!(unsafe { global::size_of(data) }, Some(20_000));
  global::dump();
  assert!(unsafe { global::free(Some(data)) });
  global::exit();
  assert_eq!(global::state(), GlobalState::Exited);
}
