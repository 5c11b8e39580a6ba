use std::{
  alloc::{Layout, alloc_zeroed},
  ptr::NonNull,
  sync::Mutex,
};

use proptest::prelude::*;
use tieralloc::{
  CHUNK_HEAD_SIZE, Corruption, CorruptionKind, DefaultAllocator, LargeAllocator, SMALL_MAX_SIZE,
  StaticFixedPool, StaticLargeAllocator, TRIPWIRE, set_corruption_handler,
};

const PAGE: usize = 4096;

/// Guard byte reserved behind every instrumented block.
const PATCH: usize = TRIPWIRE as usize;

fn static_buffer(len: usize) -> &'static mut [u8] {
  let layout = Layout::from_size_align(len, PAGE).unwrap();
  unsafe {
    let ptr = alloc_zeroed(layout);
    assert!(!ptr.is_null());
    std::slice::from_raw_parts_mut(ptr, len)
  }
}

fn tiers(pages: usize) -> DefaultAllocator {
  DefaultAllocator::new(LargeAllocator::with_native_arena(pages * PAGE, PAGE).unwrap())
}

/// Live counts of both tiers and the large arena's free bytes.
fn footprint(tiers: &DefaultAllocator) -> (usize, usize, Option<usize>) {
  let large = tiers.large();
  (tiers.small_live_count(), large.live_count(), large.free_bytes())
}

fn pattern(seed: usize, i: usize) -> u8 {
  (seed.wrapping_mul(31).wrapping_add(i) % 251) as u8
}

fn fill(data: NonNull<u8>, len: usize, seed: usize) {
  for i in 0..len {
    unsafe { *data.as_ptr().add(i) = pattern(seed, i) };
  }
}

fn intact(data: NonNull<u8>, len: usize, seed: usize) -> bool {
  (0..len).all(|i| unsafe { *data.as_ptr().add(i) } == pattern(seed, i))
}

const ROUND_TRIP_SIZES: [usize; 10] = [1, 16, 17, 64, 65, 192, 193, 3072, 3073, 1_000_000];

#[test]
fn round_trip_leaves_the_large_arena_unchanged() {
  let mut large = StaticLargeAllocator::with_native_arena(1024 * PAGE, PAGE).unwrap();
  for size in ROUND_TRIP_SIZES {
    let before = (large.live_count(), large.free_bytes(), large.chunk_count());
    let data = large.malloc(size).unwrap();
    assert!(unsafe { large.free(data) });
    assert_eq!((large.live_count(), large.free_bytes(), large.chunk_count()), before, "size {size}");
  }
}

#[test]
fn round_trip_is_steady_once_classes_are_warm() {
  let mut tiers = tiers(4096);
  for size in ROUND_TRIP_SIZES {
    // The first allocation of a class creates a slot that stays around.
    let warm = tiers.malloc(size).unwrap();
    assert!(unsafe { tiers.free(warm) });

    let before = footprint(&tiers);
    let data = tiers.malloc(size).unwrap();
    assert!(unsafe { tiers.free(data) });
    assert_eq!(footprint(&tiers), before, "size {size}");
  }
}

#[test]
fn fixed_pool_reuses_the_slot_just_freed() {
  for item_size in [8, 48, 200] {
    let mut pool = StaticFixedPool::from_static(static_buffer(8 * PAGE), item_size, false).unwrap();
    let items: Vec<_> = std::iter::from_fn(|| pool.malloc()).collect();
    assert!(pool.full());
    assert_eq!(items.len(), pool.maxn());

    for victim in [items.len() - 1, 0, items.len() / 3] {
      assert!(unsafe { pool.free(items[victim]) });
      assert_eq!(pool.malloc(), Some(items[victim]), "item size {item_size}");
      assert!(pool.full());
    }
  }
}

#[test]
fn realloc_across_the_small_limit_moves_to_the_large_tier() {
  let mut tiers = DefaultAllocator::new(LargeAllocator::native());
  let data = tiers.malloc(3000).unwrap();
  fill(data, 3000, 7);

  let grown = unsafe { tiers.realloc(data, 4000) }.unwrap();
  assert!(tiers.large().have(grown.as_ptr()));
  assert_eq!(unsafe { tiers.large().size_of(grown) }, Some(4000));
  assert_eq!(tiers.small_live_count(), 0);
  assert!(intact(grown, 3000, 7));
  assert!(unsafe { tiers.free(grown) });
}

#[test]
fn arena_one_byte_short_of_a_chunk_is_exhausted() {
  let buffer = static_buffer(CHUNK_HEAD_SIZE + PAGE - 1);
  let mut large = StaticLargeAllocator::from_static(buffer, PAGE).unwrap();
  assert!(large.malloc(PAGE).is_none());

  // The single page is still whole and usable.
  assert_eq!(large.chunk_count(), 1);
  assert_eq!(large.live_count(), 0);
  let data = large.malloc(large.max_request()).unwrap();
  assert!(unsafe { large.free(data) });
}

static SEEN: Mutex<Vec<Corruption>> = Mutex::new(Vec::new());

fn record(corruption: &Corruption) {
  SEEN.lock().unwrap().push(*corruption);
}

#[test]
fn one_byte_overflow_reaches_the_corruption_handler() {
  if !TRIPWIRE {
    return;
  }
  set_corruption_handler(record);

  let mut tiers = tiers(1024);
  for size in [20, 64, SMALL_MAX_SIZE, SMALL_MAX_SIZE + 1, 3 * PAGE] {
    let data = tiers.malloc(size).unwrap();
    SEEN.lock().unwrap().clear();
    unsafe {
      *data.as_ptr().add(size) = 0;
      assert!(!tiers.free(data), "size {size}");
    }

    let seen = SEEN.lock().unwrap();
    assert!(
      seen
        .iter()
        .any(|c| c.kind == CorruptionKind::Overflow && c.address == data.as_ptr() as usize),
      "size {size}: {seen:?}"
    );
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn live_blocks_never_overlap(
    ops in prop::collection::vec((any::<bool>(), 1usize..9000, any::<prop::sample::Index>()), 1..200)
  ) {
    let mut tiers = tiers(4096);
    let mut live: Vec<(NonNull<u8>, usize, usize)> = Vec::new();

    for (seed, (alloc, size, pick)) in ops.into_iter().enumerate() {
      if alloc || live.is_empty() {
        let data = tiers.malloc(size).unwrap();
        let start = data.as_ptr() as usize;
        for &(other, len, _) in &live {
          let other = other.as_ptr() as usize;
          prop_assert!(start + size <= other || other + len <= start);
        }
        fill(data, size, seed);
        live.push((data, size, seed));
      } else {
        let (data, size, seed) = live.swap_remove(pick.index(live.len()));
        prop_assert!(intact(data, size, seed));
        let freed = unsafe { tiers.free(data) };
        prop_assert!(freed);
      }
    }

    for (data, size, seed) in live {
      prop_assert!(intact(data, size, seed));
      let freed = unsafe { tiers.free(data) };
      prop_assert!(freed);
    }
    prop_assert_eq!(tiers.small_live_count(), 0);
  }

  #[test]
  fn freed_chunks_coalesce_in_any_order(
    (sizes, order) in prop::collection::vec(1usize..3 * PAGE, 2..12).prop_flat_map(|sizes| {
      let n = sizes.len();
      (Just(sizes), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    })
  ) {
    let mut large = StaticLargeAllocator::with_native_arena(64 * PAGE, PAGE).unwrap();
    let blocks: Vec<_> = sizes.iter().map(|&size| large.malloc_real(size).unwrap()).collect();
    // Fill the rest so the blocks' own run is the only free space left.
    let fillers: Vec<_> = std::iter::from_fn(|| large.malloc(1)).collect();

    for &i in &order {
      let freed = unsafe { large.free(blocks[i].0) };
      prop_assert!(freed);
    }
    prop_assert_eq!(large.live_count(), fillers.len());

    // Only the whole run, merged back into one chunk, can hold this.
    let run: usize = blocks.iter().map(|&(_, real)| CHUNK_HEAD_SIZE + real + PATCH).sum();
    let merged = large.malloc(run - CHUNK_HEAD_SIZE - PATCH);
    prop_assert_eq!(merged, blocks.iter().map(|&(data, _)| data).min());

    let freed = merged.is_some_and(|data| unsafe { large.free(data) });
    prop_assert!(freed);
    for data in fillers {
      let freed = unsafe { large.free(data) };
      prop_assert!(freed);
    }
    prop_assert!(large.malloc(large.max_request()).is_some());
  }

  #[test]
  fn predictor_never_changes_outcomes(
    ops in prop::collection::vec((any::<bool>(), 1usize..4 * PAGE, any::<prop::sample::Index>()), 1..300)
  ) {
    let mut predicted = StaticLargeAllocator::with_native_arena(256 * PAGE, PAGE).unwrap();
    let mut scanned = StaticLargeAllocator::with_native_arena(256 * PAGE, PAGE).unwrap();
    scanned.set_predictor(false);

    let mut live: Vec<(NonNull<u8>, NonNull<u8>, usize, usize)> = Vec::new();
    for (seed, (alloc, size, pick)) in ops.into_iter().enumerate() {
      if (alloc && live.len() < 16) || live.is_empty() {
        let a = predicted.malloc(size);
        let b = scanned.malloc(size);
        prop_assert_eq!(a.is_some(), b.is_some());
        if let (Some(a), Some(b)) = (a, b) {
          fill(a, size, seed);
          fill(b, size, seed);
          live.push((a, b, size, seed));
        }
      } else {
        let (a, b, size, seed) = live.swap_remove(pick.index(live.len()));
        prop_assert!(intact(a, size, seed));
        prop_assert!(intact(b, size, seed));
        let freed = unsafe { (predicted.free(a), scanned.free(b)) };
        prop_assert_eq!(freed, (true, true));
      }
      prop_assert_eq!(predicted.live_count(), scanned.live_count());
    }

    for (a, b, size, seed) in live {
      prop_assert!(intact(a, size, seed));
      prop_assert!(intact(b, size, seed));
      let freed = unsafe { (predicted.free(a), scanned.free(b)) };
      prop_assert_eq!(freed, (true, true));
    }
    prop_assert_eq!(predicted.free_bytes(), predicted.data_size());
    prop_assert_eq!(scanned.free_bytes(), scanned.data_size());

    // Both arenas merge back into one whole-arena chunk.
    prop_assert!(predicted.malloc(predicted.max_request()).is_some());
    prop_assert!(scanned.malloc(scanned.max_request()).is_some());
  }
}
