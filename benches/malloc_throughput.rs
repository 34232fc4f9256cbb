use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spanheap::{Allocator, Config, SystemBackend};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// spanheap alloc/free throughput through the static global instance.
fn spanheap_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = spanheap::spanheap_malloc(size);
      black_box(ptr);
      spanheap::spanheap_free(ptr);
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

  for size in [16, 64, 256, 1024, 4096, 40_000] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("spanheap", size), &size, |b, &size| {
      b.iter(|| spanheap_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Keeps a batch of blocks alive so spans cycle through the caches.
fn benchmark_heap_batches(c: &mut Criterion) {
  let allocator = Allocator::new(Config::default(), SystemBackend::new()).unwrap();
  let heap = allocator.heap().unwrap();
  let mut group = c.benchmark_group("heap_batches");

  for size in [48, 2000, 100_000] {
    group.throughput(Throughput::Elements(1024));
    group.bench_with_input(BenchmarkId::new("spanheap", size), &size, |b, &size| {
      let mut blocks = Vec::with_capacity(1024);
      b.iter(|| {
        for _ in 0..1024 {
          blocks.push(heap.allocate(size).unwrap());
        }
        for block in blocks.drain(..) {
          unsafe { heap.free(black_box(block)) };
        }
      })
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_heap_batches);
criterion_main!(benches);
