use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tieralloc::{Allocator, DefaultAllocator, LargeAllocator};

const OPS: u64 = 100_000;

/// tieralloc malloc/free throughput through the process-wide allocator.
fn global_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = tieralloc::global::malloc(size);
      black_box(ptr);
      tieralloc::global::free(ptr);
    }
  }
}

/// tieralloc malloc/free throughput over one preallocated arena.
fn arena_malloc_free(allocator: &Allocator<DefaultAllocator>, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = allocator.malloc(size);
      black_box(ptr);
      if let Some(ptr) = ptr {
        allocator.free(ptr);
      }
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  let large = LargeAllocator::with_native_arena(64 << 20, 0).expect("arena");
  let arena = Allocator::new(DefaultAllocator::new(large));

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("global", size), &size, |b, &size| {
      b.iter(|| global_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("arena", size), &size, |b, &size| {
      b.iter(|| arena_malloc_free(&arena, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
