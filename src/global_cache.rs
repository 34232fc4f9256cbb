// =============================================================================
// Global Cache (per span count)
// =============================================================================

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::span::Span;
use crate::tagged::TaggedHead;

/// Process-wide pool of span lists for one span count.
///
/// The stack holds whole lists: the lead span of each carries `list_size`
/// and links to the next list through `next_list`, so pushing or popping a
/// list is a single CAS regardless of its length. The head's low bits (free
/// because spans are span-aligned) hold an ABA counter.
pub(crate) struct GlobalCache {
  head: TaggedHead,
  /// Spans currently in the cache.
  size: AtomicUsize,
}

impl GlobalCache {
  pub const fn new() -> Self {
    Self {
      head: TaggedHead::new(),
      size: AtomicUsize::new(0),
    }
  }

  /// Spans currently held.
  #[inline]
  pub fn len(&self) -> usize {
    self.size.load(Ordering::Relaxed)
  }

  /// Pushes the list headed by `list`. Returns `false` without touching the
  /// list when that would take the cache past `limit` spans.
  pub unsafe fn insert(&self, list: *mut Span, limit: Option<usize>, tag_mask: usize) -> bool {
    let list_size = unsafe { (*list).list_size } as usize;
    debug_assert!(list_size >= 1);

    let previous = self.size.fetch_add(list_size, Ordering::Relaxed);
    if let Some(limit) = limit
      && previous + list_size > limit
    {
      self.size.fetch_sub(list_size, Ordering::Relaxed);
      return false;
    }

    loop {
      let current = self.head.load(Ordering::Relaxed);
      unsafe { (*list).next_list.store(current.ptr(tag_mask), Ordering::Relaxed) };
      let new = current.successor(list, tag_mask);
      if self
        .head
        .compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed)
      {
        return true;
      }
    }
  }

  /// Pops one list, or null when the cache is empty.
  pub unsafe fn extract(&self, tag_mask: usize) -> *mut Span {
    loop {
      let current = self.head.load(Ordering::Acquire);
      let list: *mut Span = current.ptr(tag_mask);
      if list.is_null() {
        return null_mut();
      }
      // The list may be popped by a contender before our CAS; the counter
      // in the head makes the CAS fail in that case. The read itself is not
      // guarded: if the contender releases the last piece of the superspan
      // before this load, the backend may already have unmapped `list`.
      // Backends that never return memory to the OS (the arena) are immune;
      // with `SystemBackend` the window is the few instructions between our
      // head load and this read.
      let next = unsafe { (*list).next_list.load(Ordering::Relaxed) };
      if self.head.compare_exchange_weak(
        current,
        current.successor(next, tag_mask),
        Ordering::AcqRel,
        Ordering::Relaxed,
      ) {
        let list_size = unsafe { (*list).list_size } as usize;
        self.size.fetch_sub(list_size, Ordering::Relaxed);
        unsafe { (*list).next_list.store(null_mut(), Ordering::Relaxed) };
        return list;
      }
    }
  }
}
