//! Pointer-plus-counter words for ABA-safe lock-free stacks.
//!
//! Nodes of these stacks are aligned well beyond a byte, so the low bits of
//! their addresses are always zero and can carry a counter. Every successful
//! compare-and-swap bumps the counter, so a head that was popped, reused and
//! pushed again between a load and the CAS no longer compares equal.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A decoded head word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Tagged {
  raw: usize,
}

impl Tagged {
  /// Pointer part; `tag_mask` covers the bits reserved for the counter.
  #[inline(always)]
  pub fn ptr<T>(self, tag_mask: usize) -> *mut T {
    (self.raw & !tag_mask) as *mut T
  }

  #[inline(always)]
  pub fn tag(self, tag_mask: usize) -> usize {
    self.raw & tag_mask
  }

  /// Word replacing `self` with `ptr` as the new head.
  #[inline(always)]
  pub fn successor<T>(self, ptr: *mut T, tag_mask: usize) -> Tagged {
    debug_assert!(ptr as usize & tag_mask == 0, "pointer {:p} collides with tag bits", ptr);
    Tagged {
      raw: ptr as usize | (self.tag(tag_mask).wrapping_add(1) & tag_mask),
    }
  }
}

/// Atomic head of a tagged stack.
pub(crate) struct TaggedHead {
  raw: AtomicUsize,
}

impl TaggedHead {
  pub const fn new() -> Self {
    Self {
      raw: AtomicUsize::new(0),
    }
  }

  #[inline]
  pub fn load(&self, order: Ordering) -> Tagged {
    Tagged {
      raw: self.raw.load(order),
    }
  }

  #[inline]
  pub fn compare_exchange_weak(&self, current: Tagged, new: Tagged, success: Ordering, failure: Ordering) -> bool {
    self
      .raw
      .compare_exchange_weak(current.raw, new.raw, success, failure)
      .is_ok()
  }
}
