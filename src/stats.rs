//! Read-only instrumentation.
//!
//! Heap counters are plain integers updated by the owning thread; global
//! counters are relaxed atomics. Snapshots are copies and never feed back
//! into allocator decisions, except the span high-water mark used by the
//! adaptive thread cache.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::size_class::{LARGE_CLASS_COUNT, SIZE_CLASS_COUNT};
use crate::span::SpanState;

/// Traffic of spans of one span count through the caching tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanUse {
  /// Spans of this count currently in use by the heap.
  pub current: usize,
  /// High-water mark of `current`.
  pub peak: usize,
  pub to_global: usize,
  pub from_global: usize,
  pub to_cache: usize,
  pub from_cache: usize,
  pub to_reserved: usize,
  pub from_reserved: usize,
  /// Backend mappings made to serve this span count.
  pub map_calls: usize,
}

impl SpanUse {
  pub const ZERO: SpanUse = SpanUse {
    current: 0,
    peak: 0,
    to_global: 0,
    from_global: 0,
    to_cache: 0,
    from_cache: 0,
    to_reserved: 0,
    from_reserved: 0,
    map_calls: 0,
  };

  #[inline]
  pub(crate) fn inc_current(&mut self) {
    self.current += 1;
    if self.current > self.peak {
      self.peak = self.current;
    }
  }

  #[inline]
  pub(crate) fn dec_current(&mut self) {
    // Large spans may be freed by a heap that never counted them.
    self.current = self.current.saturating_sub(1);
  }
}

/// Span usage of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassUse {
  /// Spans currently serving the class.
  pub spans_current: usize,
  pub spans_peak: usize,
  /// Spans of the class released to the thread cache.
  pub spans_to_cache: usize,
  /// Spans initialised for the class.
  pub spans_initialized: usize,
  /// Spans released after their blocks were all freed by other threads.
  pub spans_deferred: usize,
}

impl ClassUse {
  pub const ZERO: ClassUse = ClassUse {
    spans_current: 0,
    spans_peak: 0,
    spans_to_cache: 0,
    spans_initialized: 0,
    spans_deferred: 0,
  };
}

/// Counters of one heap, as returned by
/// [`HeapHandle::statistics`](crate::HeapHandle::statistics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
  /// Indexed by span count - 1.
  pub span_use: [SpanUse; LARGE_CLASS_COUNT],
  /// Indexed by size class.
  pub class_use: [ClassUse; SIZE_CLASS_COUNT],
  /// Bytes held by the thread cache at snapshot time.
  pub thread_cache_bytes: usize,
  /// Bytes moved from the thread cache to the global cache.
  pub thread_to_global: usize,
  /// Bytes moved from the global cache to the thread cache.
  pub global_to_thread: usize,
  /// Bytes held by the heap reserve at snapshot time.
  pub reserved_bytes: usize,
  /// Huge allocations currently made through this heap, in bytes.
  pub huge_alloc: usize,
}

impl HeapStats {
  pub const fn new() -> Self {
    Self {
      span_use: [SpanUse::ZERO; LARGE_CLASS_COUNT],
      class_use: [ClassUse::ZERO; SIZE_CLASS_COUNT],
      thread_cache_bytes: 0,
      thread_to_global: 0,
      global_to_thread: 0,
      reserved_bytes: 0,
      huge_alloc: 0,
    }
  }
}

impl Default for HeapStats {
  fn default() -> Self {
    Self::new()
  }
}

/// Allocator-wide counters, as returned by
/// [`Allocator::global_statistics`](crate::Allocator::global_statistics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
  /// Bytes currently reserved from the backend.
  pub mapped: usize,
  pub mapped_peak: usize,
  /// Bytes ever mapped.
  pub mapped_total: usize,
  /// Bytes ever released back to the backend.
  pub unmapped_total: usize,
  /// Bytes currently held by huge allocations.
  pub huge_alloc: usize,
  pub huge_alloc_peak: usize,
  /// Bytes parked in the global cache.
  pub cached: usize,
  /// Heaps ever created.
  pub heaps: usize,
  /// Heaps currently waiting on the orphan stack.
  pub orphaned_heaps: usize,
}

/// One span of a size class, as seen by
/// [`HeapHandle::inspect_class`](crate::HeapHandle::inspect_class).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
  pub state: SpanState,
  pub block_size: usize,
  pub block_count: usize,
  /// Blocks currently held by callers.
  pub used_blocks: usize,
}

// =============================================================================
// Shared counters
// =============================================================================

/// Relaxed atomic counter with a high-water mark.
pub(crate) struct PeakCounter {
  current: AtomicUsize,
  peak: AtomicUsize,
}

impl PeakCounter {
  pub const fn new() -> Self {
    Self {
      current: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    }
  }

  /// Adds `amount` unless the result would exceed `limit`.
  #[inline]
  pub fn try_add(&self, amount: usize, limit: Option<usize>) -> bool {
    let previous = self.current.fetch_add(amount, Ordering::Relaxed);
    let now = previous + amount;
    if let Some(limit) = limit
      && now > limit
    {
      self.current.fetch_sub(amount, Ordering::Relaxed);
      return false;
    }
    self.peak.fetch_max(now, Ordering::Relaxed);
    true
  }

  #[inline]
  pub fn sub(&self, amount: usize) {
    self.current.fetch_sub(amount, Ordering::Relaxed);
  }

  #[inline]
  pub fn current(&self) -> usize {
    self.current.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::Relaxed)
  }
}

/// Counters of one allocator instance.
pub(crate) struct GlobalCounters {
  pub mapped: PeakCounter,
  pub mapped_total: AtomicUsize,
  pub unmapped_total: AtomicUsize,
  pub huge_alloc: PeakCounter,
  pub heaps: AtomicUsize,
  pub orphaned_heaps: AtomicUsize,
}

impl GlobalCounters {
  pub const fn new() -> Self {
    Self {
      mapped: PeakCounter::new(),
      mapped_total: AtomicUsize::new(0),
      unmapped_total: AtomicUsize::new(0),
      huge_alloc: PeakCounter::new(),
      heaps: AtomicUsize::new(0),
      orphaned_heaps: AtomicUsize::new(0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn peak_counter_respects_limit() {
    let counter = PeakCounter::new();
    assert!(counter.try_add(100, Some(150)));
    assert!(!counter.try_add(100, Some(150)));
    assert_eq!(counter.current(), 100);
    counter.sub(60);
    assert!(counter.try_add(100, None));
    assert_eq!(counter.current(), 140);
    assert_eq!(counter.peak(), 140);
  }

  #[test]
  fn span_use_tracks_peak() {
    let mut usage = SpanUse::ZERO;
    usage.inc_current();
    usage.inc_current();
    usage.dec_current();
    usage.dec_current();
    usage.dec_current();
    assert_eq!(usage.current, 0);
    assert_eq!(usage.peak, 2);
  }
}
