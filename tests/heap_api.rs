use rand::prelude::*;
use rand::rngs::StdRng;
use spanheap::{Allocator, ArenaBackend, Config, Error, ReallocFlags, SPAN_HEADER_SIZE, SystemBackend};

fn allocator(config: Config) -> Allocator {
  Allocator::new(config, SystemBackend::new()).unwrap()
}

#[test]
fn random_blocks_never_overlap() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  let mut rng = StdRng::seed_from_u64(0x5eed);

  let mut live = Vec::new();
  for round in 0..4000 {
    let size = match rng.gen_range(0..10) {
      0 => rng.gen_range(33_000..300_000),
      1..=3 => rng.gen_range(1025..32_000),
      _ => rng.gen_range(0..1025),
    };
    let ptr = heap.allocate(size).unwrap();
    assert!(unsafe { heap.usable_size(ptr) } >= size);
    let tag = (round % 251) as u8;
    unsafe { ptr.as_ptr().write_bytes(tag, size) };
    live.push((ptr, size, tag));

    if rng.gen_bool(0.4) {
      let idx = rng.gen_range(0..live.len());
      let (ptr, size, tag) = live.swap_remove(idx);
      let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
      assert!(bytes.iter().all(|&b| b == tag), "block {:p} was overwritten", ptr);
      unsafe { heap.free(ptr) };
    }
  }

  let mut ranges: Vec<_> = live
    .iter()
    .map(|(ptr, size, _)| (ptr.as_ptr() as usize, ptr.as_ptr() as usize + size))
    .collect();
  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    assert!(pair[0].1 <= pair[1].0, "{:x?} overlaps {:x?}", pair[0], pair[1]);
  }

  live.shuffle(&mut rng);
  for (ptr, size, tag) in live {
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == tag));
    unsafe { heap.free(ptr) };
  }
}

#[test]
fn small_blocks_are_naturally_aligned() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  for size in [1, 16, 24, 64, 128, 256, 512, 1024] {
    let ptr = heap.allocate(size).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    if size % 128 == 0 {
      assert_eq!(ptr.as_ptr() as usize % 128, 0, "size {}", size);
    }
    unsafe { heap.free(ptr) };
  }
}

#[test]
fn large_and_huge_boundary() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  let settings = *alloc.settings();
  let large_limit = alloc.size_classes().large_size_limit();
  assert_eq!(large_limit, 63 * settings.span_size - SPAN_HEADER_SIZE);

  let large = heap.allocate(large_limit).unwrap();
  assert_eq!(unsafe { heap.usable_size(large) }, large_limit);
  assert_eq!(alloc.global_statistics().huge_alloc, 0);

  let huge_size = large_limit + 1;
  let huge = heap.allocate(huge_size).unwrap();
  let pages = (huge_size + SPAN_HEADER_SIZE).div_ceil(settings.page_size);
  assert_eq!(unsafe { heap.usable_size(huge) }, pages * settings.page_size - SPAN_HEADER_SIZE);
  assert_eq!(alloc.global_statistics().huge_alloc, pages * settings.page_size);
  assert_eq!(heap.statistics().huge_alloc, pages * settings.page_size);

  unsafe {
    heap.free(huge);
    heap.free(large);
  }
  assert_eq!(alloc.global_statistics().huge_alloc, 0);
  assert_eq!(heap.statistics().huge_alloc, 0);
}

#[test]
fn zeroed_allocations_are_clean() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();

  // Dirty a block, free it, then get it back zeroed.
  let dirty = heap.allocate(256).unwrap();
  unsafe {
    dirty.as_ptr().write_bytes(0xFF, 256);
    heap.free(dirty);
  }
  for (count, size) in [(16, 16), (1, 5000), (10, 10_000), (1, 5 << 20)] {
    let ptr = heap.allocate_zeroed(count, size).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), count * size) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { heap.free(ptr) };
  }

  assert!(matches!(heap.allocate_zeroed(usize::MAX, 2), Err(Error::InvalidArgument(_))));
}

#[test]
fn oversized_requests_are_rejected() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  assert!(matches!(heap.allocate(usize::MAX), Err(Error::InvalidArgument(_))));
  assert!(matches!(heap.aligned_allocate(3 * 16, 10), Err(Error::InvalidArgument(_))));
  let span_size = alloc.settings().span_size;
  assert!(matches!(heap.aligned_allocate(span_size, 10), Err(Error::Unsupported(_))));
}

#[test]
fn invalid_configs_fail() {
  let bad_span = Config::default().with_span_size(3000);
  assert!(matches!(Allocator::new(bad_span, SystemBackend::new()), Err(Error::InvalidArgument(_))));
  let bad_page = Config::default().with_page_size(100);
  assert!(Allocator::new(bad_page, SystemBackend::new()).is_err());
}

#[test]
fn reallocate_keeps_contents_and_hysteresis() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();

  unsafe {
    // Small: growth inside the block stays put.
    let ptr = heap.allocate(100).unwrap();
    for i in 0..100 {
      *ptr.as_ptr().add(i) = i as u8;
    }
    let same = heap.reallocate(ptr, 110, 100, ReallocFlags::NONE).unwrap();
    assert_eq!(same, ptr);

    let moved = heap.reallocate(same, 5000, 100, ReallocFlags::NONE).unwrap();
    assert_ne!(moved, ptr);
    for i in 0..100 {
      assert_eq!(*moved.as_ptr().add(i), i as u8);
    }

    // Growth overshoots by 11/8 of the preserved size.
    let grown = heap.reallocate(moved, 6000, 0, ReallocFlags::NONE).unwrap();
    assert!(heap.usable_size(grown) >= 5120 * 11 / 8);
    heap.free(grown);

    // Large: shrinking to at least half the spans keeps the block.
    let large = heap.allocate(200_000).unwrap();
    *large.as_ptr() = 42;
    let shrunk = heap.reallocate(large, 150_000, 0, ReallocFlags::NONE).unwrap();
    assert_eq!(shrunk, large);
    let small = heap.reallocate(shrunk, 50_000, 0, ReallocFlags::NONE).unwrap();
    assert_ne!(small, large);
    assert_eq!(*small.as_ptr(), 42);
    heap.free(small);
  }
}

#[test]
fn grow_or_fail_leaves_block_alone() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  unsafe {
    let ptr = heap.allocate(100).unwrap();
    *ptr.as_ptr() = 7;
    let result = heap.reallocate(ptr, 5000, 0, ReallocFlags::GROW_OR_FAIL);
    assert!(matches!(result, Err(Error::Unsupported(_))));
    assert_eq!(*ptr.as_ptr(), 7);
    let fits = heap.reallocate(ptr, 112, 0, ReallocFlags::GROW_OR_FAIL).unwrap();
    assert_eq!(fits, ptr);
    heap.free(ptr);
  }
}

#[test]
fn aligned_allocations() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  let mut blocks = Vec::new();
  for alignment in [32, 64, 128, 256, 1024, 4096, 8192, 32768] {
    for size in [1, 100, 3000, 70_000] {
      let ptr = heap.aligned_allocate(alignment, size).unwrap();
      assert_eq!(ptr.as_ptr() as usize % alignment, 0, "alignment {} size {}", alignment, size);
      assert!(unsafe { heap.usable_size(ptr) } >= size);
      unsafe { ptr.as_ptr().write_bytes(0x5A, size) };
      blocks.push(ptr);
    }
  }
  for ptr in blocks {
    unsafe { heap.free(ptr) };
  }
  assert_eq!(alloc.global_statistics().huge_alloc, 0);
}

#[test]
fn aligned_reallocate_keeps_alignment() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  unsafe {
    let ptr = heap.aligned_allocate(256, 300).unwrap();
    ptr.as_ptr().write_bytes(3, 300);
    let grown = heap.aligned_reallocate(ptr, 256, 9000, 300, ReallocFlags::NONE).unwrap();
    assert_eq!(grown.as_ptr() as usize % 256, 0);
    let bytes = core::slice::from_raw_parts(grown.as_ptr(), 300);
    assert!(bytes.iter().all(|&b| b == 3));
    heap.free(grown);
  }
}

#[test]
fn single_span_cache_settles() {
  let config = Config::default().with_span_map_count(4);
  let alloc = allocator(config);
  let heap = alloc.heap().unwrap();

  let run = || {
    let blocks: Vec<_> = (0..20).map(|_| heap.allocate(40_000).unwrap()).collect();
    for block in blocks {
      unsafe { heap.free(block) };
    }
  };

  run();
  assert_eq!(heap.thread_cache_len(1), 4);
  let stats = heap.statistics();
  assert_eq!(stats.span_use[0].to_global, 16);
  assert_eq!(alloc.global_statistics().cached, 16 * alloc.settings().span_size);

  let mapped_total = alloc.global_statistics().mapped_total;
  run();
  assert_eq!(alloc.global_statistics().mapped_total, mapped_total);
  assert!(heap.statistics().span_use[0].from_global >= 16);
}

#[test]
fn arena_backend_respects_memory_limit() {
  let arena = ArenaBackend::new(1 << 24, 4096).unwrap();
  let config = Config::default().with_span_map_count(4).with_memory_limit(1 << 20);
  let alloc = Allocator::new(config, arena).unwrap();
  let heap = alloc.heap().unwrap();

  let mut blocks = Vec::new();
  let err = loop {
    match heap.allocate(40_000) {
      Ok(ptr) => blocks.push(ptr),
      Err(err) => break err,
    }
    assert!(blocks.len() < 1000, "memory limit never hit");
  };
  assert_eq!(err, Error::OutOfMemory);
  assert!(!blocks.is_empty());
  assert!(alloc.global_statistics().mapped <= 1 << 20);
  assert!(alloc.backend().used() > 0);

  for block in blocks.drain(..) {
    unsafe { heap.free(block) };
  }
  // Cached spans serve new requests without mapping.
  let again = heap.allocate(40_000).unwrap();
  unsafe { heap.free(again) };
}

#[test]
fn disabled_caches_still_work() {
  let config = Config::default()
    .with_thread_cache(false)
    .with_global_cache(false)
    .with_span_map_count(1);
  let alloc = allocator(config);
  let heap = alloc.heap().unwrap();
  for _ in 0..3 {
    let blocks: Vec<_> = (0..50).map(|i| heap.allocate(16 + i * 700).unwrap()).collect();
    for block in blocks {
      unsafe { heap.free(block) };
    }
  }
  assert_eq!(heap.thread_cache_len(1), 0);
  assert_eq!(alloc.global_statistics().cached, 0);
}

#[test]
fn adaptive_cache_follows_peak_usage() {
  let config = Config::default()
    .with_span_map_count(4)
    .with_adaptive_thread_cache(true);
  let alloc = allocator(config);
  let heap = alloc.heap().unwrap();

  let blocks: Vec<_> = (0..20).map(|_| heap.allocate(40_000).unwrap()).collect();
  for block in blocks {
    unsafe { heap.free(block) };
  }
  // release_count + peak / 4 + 1
  assert_eq!(heap.thread_cache_len(1), 4 + 20 / 4 + 1);
  assert_eq!(heap.statistics().span_use[0].peak, 20);
}

#[test]
fn unlimited_global_cache_takes_every_span() {
  let config = Config::default()
    .with_span_map_count(4)
    .with_thread_cache(false)
    .with_unlimited_global_cache(true)
    .with_huge_pages(false);
  let alloc = allocator(config);
  let heap = alloc.heap().unwrap();

  let run = || {
    let blocks: Vec<_> = (0..20).map(|_| heap.allocate(40_000).unwrap()).collect();
    for block in blocks {
      unsafe { heap.free(block) };
    }
  };
  run();
  assert_eq!(alloc.global_statistics().cached, 20 * alloc.settings().span_size);
  let mapped_total = alloc.global_statistics().mapped_total;
  run();
  assert_eq!(alloc.global_statistics().mapped_total, mapped_total);
}

#[test]
fn heap_statistics_by_id() {
  let alloc = allocator(Config::default().with_validate_args(false));
  let heap = alloc.heap().unwrap();
  let block = heap.allocate(5000).unwrap();

  let by_id = unsafe { alloc.heap_statistics(heap.id()) }.unwrap();
  assert_eq!(by_id, heap.statistics());
  let class = alloc.size_classes().class_index(5000).unwrap();
  assert_eq!(by_id.class_use[class].spans_current, 1);
  assert!(unsafe { alloc.heap_statistics(heap.id() + 100) }.is_none());

  // Without validation an impossible size still fails cleanly.
  assert!(heap.allocate(usize::MAX).is_err());
  unsafe { heap.free(block) };
}

#[test]
fn zero_sized_requests_share_the_smallest_class() {
  let alloc = allocator(Config::default());
  let heap = alloc.heap().unwrap();
  let span_mask = !(alloc.settings().span_size - 1);
  let empty = heap.allocate(0).unwrap();
  let tiny = heap.allocate(16).unwrap();
  assert_eq!(empty.as_ptr() as usize & span_mask, tiny.as_ptr() as usize & span_mask);
  assert_eq!(unsafe { heap.usable_size(empty) }, 16);
  unsafe {
    heap.free(empty);
    heap.free(tiny);
  }
}

#[test]
fn header_aligned_requests_avoid_folded_classes() {
  // In a 4 KiB span the 896 byte class folds into 992 byte blocks.
  let alloc = allocator(Config::default().with_span_size(4096).with_page_size(4096));
  let heap = alloc.heap().unwrap();
  let classes = alloc.size_classes();
  assert_eq!(classes.get(classes.class_index(896).unwrap()).block_size, 992);

  let mut blocks = Vec::new();
  for _ in 0..12 {
    for (alignment, size) in [(128, 800), (64, 850), (32, 896), (128, 120)] {
      let ptr = heap.aligned_allocate(alignment, size).unwrap();
      assert_eq!(ptr.as_ptr() as usize % alignment, 0, "alignment {} size {}", alignment, size);
      unsafe { ptr.as_ptr().write_bytes(0x11, size) };
      blocks.push(ptr);
    }
  }
  for ptr in blocks {
    unsafe { heap.free(ptr) };
  }
}

#[test]
fn aligned_overflow_fails_without_validation() {
  let alloc = allocator(Config::default().with_validate_args(false));
  let heap = alloc.heap().unwrap();
  assert!(matches!(
    heap.aligned_allocate(256, usize::MAX - 100),
    Err(Error::InvalidArgument(_))
  ));
  assert!(matches!(heap.aligned_allocate(64, usize::MAX), Err(Error::InvalidArgument(_))));
  assert!(matches!(
    heap.aligned_allocate(1 << 13, usize::MAX - 4096),
    Err(Error::InvalidArgument(_))
  ));
  assert!(heap.aligned_allocate(1 << 13, usize::MAX - (1 << 16)).is_err());

  // The heap is still usable afterwards.
  let ptr = heap.aligned_allocate(256, 1000).unwrap();
  assert_eq!(ptr.as_ptr() as usize % 256, 0);
  unsafe { heap.free(ptr) };
}

#[test]
fn superspan_is_unmapped_after_its_last_piece() {
  let config = Config::default()
    .with_thread_cache(false)
    .with_global_cache(false)
    .with_span_map_count(4);
  let alloc = allocator(config);
  let heap = alloc.heap().unwrap();
  let span_size = alloc.settings().span_size;
  let size = alloc.size_classes().medium_size_limit() + 1;

  // One mapping of four spans: the master first, then three subspans.
  let spans: Vec<_> = (0..4).map(|_| heap.allocate(size).unwrap()).collect();
  let base = spans[0].as_ptr() as usize & !(span_size - 1);
  for (idx, ptr) in spans.iter().enumerate() {
    assert_eq!(ptr.as_ptr() as usize & !(span_size - 1), base + idx * span_size);
  }

  let before = alloc.global_statistics().unmapped_total;
  let mut deltas = Vec::new();
  for ptr in &spans {
    unsafe { heap.free(*ptr) };
    deltas.push(alloc.global_statistics().unmapped_total - before);
  }
  assert_eq!(deltas, [0, 0, 0, 4 * span_size]);
}
