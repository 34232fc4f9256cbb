// =============================================================================
// Size Classes
// =============================================================================

use crate::span::SPAN_HEADER_SIZE;

/// Granularity of small classes.
pub const SMALL_GRANULARITY: usize = 16;
const SMALL_GRANULARITY_SHIFT: u32 = SMALL_GRANULARITY.trailing_zeros();
/// Number of small classes (0...1024 in steps of 16).
pub const SMALL_CLASS_COUNT: usize = 65;
/// Largest small allocation.
pub const SMALL_SIZE_LIMIT: usize = SMALL_GRANULARITY * (SMALL_CLASS_COUNT - 1);

/// Granularity of medium classes.
pub const MEDIUM_GRANULARITY: usize = 512;
const MEDIUM_GRANULARITY_SHIFT: u32 = MEDIUM_GRANULARITY.trailing_zeros();
/// Upper bound on the number of medium classes.
pub const MEDIUM_CLASS_COUNT: usize = 61;
/// Largest medium allocation before the span-size cap is applied.
pub const MEDIUM_SIZE_LIMIT: usize = SMALL_SIZE_LIMIT + MEDIUM_GRANULARITY * MEDIUM_CLASS_COUNT;

/// Total number of small and medium classes.
pub const SIZE_CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT;
/// Largest span count of a large allocation.
pub const LARGE_CLASS_COUNT: usize = 63;

/// Size class marker of a large span.
pub const SIZE_CLASS_LARGE: u32 = SIZE_CLASS_COUNT as u32;
/// Size class marker of a huge, directly mapped span.
pub const SIZE_CLASS_HUGE: u32 = u32::MAX;

const _: () = assert!(SMALL_SIZE_LIMIT == 1024);
const _: () = assert!(MEDIUM_SIZE_LIMIT == 32256);
const _: () = assert!(SPAN_HEADER_SIZE % SMALL_GRANULARITY == 0);

/// One allocation bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeClass {
  /// Size of every block in the class.
  pub block_size: u32,
  /// Blocks carved out of one span.
  pub block_count: u32,
  /// Canonical index. Differs from the table slot when the class was merged
  /// into a larger one with the same span layout.
  pub class_idx: u32,
}

/// Static mapping from request size to size class, built once per span size.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
  classes: [SizeClass; SIZE_CLASS_COUNT],
  medium_size_limit: usize,
  large_size_limit: usize,
}

impl SizeClassTable {
  pub fn new(span_size: usize) -> Self {
    let usable = span_size - SPAN_HEADER_SIZE;
    let mut classes = [SizeClass::default(); SIZE_CLASS_COUNT];

    for (iclass, class) in classes.iter_mut().enumerate().take(SMALL_CLASS_COUNT) {
      class.block_size = (iclass * SMALL_GRANULARITY).max(SMALL_GRANULARITY) as u32;
    }

    // At least two blocks per medium span.
    let mut medium_size_limit = (usable / 2).min(MEDIUM_SIZE_LIMIT);
    let mut count = SMALL_CLASS_COUNT;
    for iclass in 0..MEDIUM_CLASS_COUNT {
      let size = SMALL_SIZE_LIMIT + (iclass + 1) * MEDIUM_GRANULARITY;
      if size > medium_size_limit {
        medium_size_limit = SMALL_SIZE_LIMIT + iclass * MEDIUM_GRANULARITY;
        break;
      }
      classes[SMALL_CLASS_COUNT + iclass].block_size = size as u32;
      count += 1;
    }

    for (iclass, class) in classes.iter_mut().enumerate().take(count) {
      class.block_count = (usable / class.block_size as usize) as u32;
      class.class_idx = iclass as u32;
    }

    // Walk backwards and fold a class into its successor whenever both
    // produce the same number of blocks per span.
    for iclass in (0..count - 1).rev() {
      if classes[iclass].block_count == classes[iclass + 1].block_count {
        classes[iclass] = classes[iclass + 1];
      }
    }

    Self {
      classes,
      medium_size_limit,
      large_size_limit: LARGE_CLASS_COUNT * span_size - SPAN_HEADER_SIZE,
    }
  }

  /// Canonical class index serving `size`, or `None` above the medium limit.
  #[inline(always)]
  pub fn class_index(&self, size: usize) -> Option<usize> {
    let slot = if size <= SMALL_SIZE_LIMIT {
      (size + (SMALL_GRANULARITY - 1)) >> SMALL_GRANULARITY_SHIFT
    } else if size <= self.medium_size_limit {
      SMALL_CLASS_COUNT + ((size - (SMALL_SIZE_LIMIT + 1)) >> MEDIUM_GRANULARITY_SHIFT)
    } else {
      return None;
    };
    Some(self.classes[slot].class_idx as usize)
  }

  #[inline(always)]
  pub fn get(&self, class_idx: usize) -> &SizeClass {
    &self.classes[class_idx]
  }

  /// Largest size served from size classes.
  #[inline]
  pub fn medium_size_limit(&self) -> usize {
    self.medium_size_limit
  }

  /// Largest size served from whole spans; anything above is huge.
  #[inline]
  pub fn large_size_limit(&self) -> usize {
    self.large_size_limit
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn small_classes_follow_granularity() {
    let table = SizeClassTable::new(64 * 1024);
    let class = table.get(table.class_index(48).unwrap());
    assert_eq!(class.block_size, 48);
    assert_eq!(class.block_count, ((64 * 1024 - SPAN_HEADER_SIZE) / 48) as u32);
    // Zero-sized requests share the 16 byte class.
    assert_eq!(table.class_index(0), table.class_index(16));
  }

  #[test]
  fn every_size_fits_its_class() {
    for span_size in [4096, 16 * 1024, 64 * 1024, 1 << 20] {
      let table = SizeClassTable::new(span_size);
      let mut last = 0;
      for size in 0..=table.medium_size_limit() {
        let class = table.get(table.class_index(size).unwrap());
        assert!(class.block_size as usize >= size);
        assert!(class.block_count >= 2, "size {} span {}", size, span_size);
        assert!(class.block_size >= last, "block sizes must not decrease");
        last = class.block_size;
      }
      assert!(table.class_index(table.medium_size_limit() + 1).is_none());
    }
  }

  #[test]
  fn medium_cutoff_tracks_span_size() {
    let table = SizeClassTable::new(4096);
    assert!(table.medium_size_limit() <= (4096 - SPAN_HEADER_SIZE) / 2);
    let table = SizeClassTable::new(64 * 1024);
    assert_eq!(table.medium_size_limit(), MEDIUM_SIZE_LIMIT);
    assert_eq!(table.large_size_limit(), 63 * 64 * 1024 - SPAN_HEADER_SIZE);
  }

  #[test]
  fn merged_classes_share_layout() {
    let table = SizeClassTable::new(16 * 1024);
    // 4096, 4608 and 5120 all yield 3 blocks in a 16 KiB span.
    let a = table.class_index(4000).unwrap();
    let b = table.class_index(4097).unwrap();
    let c = table.class_index(5120).unwrap();
    assert_eq!(a, c);
    assert_eq!(b, c);
    assert_eq!(table.get(a).block_size, 5120);
    assert_eq!(table.get(a).block_count, 3);
    // Small classes fold the same way: 960 to 1008 all give 16 blocks.
    let wide = table.class_index(1008).unwrap();
    for size in [950, 976, 992, 1000] {
      assert_eq!(table.class_index(size), Some(wide), "size {}", size);
    }
    assert_eq!(table.get(wide).block_size, 1008);
    assert_eq!(table.get(table.class_index(944).unwrap()).block_size, 944);
  }

  #[test]
  fn no_two_slots_share_a_layout() {
    for span_size in [4096, 16 * 1024, 64 * 1024, 1 << 20] {
      let table = SizeClassTable::new(span_size);
      let mut canonical: Vec<usize> = (0..=table.medium_size_limit())
        .map(|size| table.class_index(size).unwrap())
        .collect();
      canonical.dedup();
      for pair in canonical.windows(2) {
        let (a, b) = (table.get(pair[0]), table.get(pair[1]));
        assert_ne!(a.block_count, b.block_count, "span {} classes {:?} {:?}", span_size, a, b);
      }
    }
  }
}
