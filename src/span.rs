//! Span headers and the intrusive lists built out of them.
//!
//! A span is one or more contiguous, span-aligned pages. Its header sits at
//! offset 0, so any block pointer recovers its span by masking the address
//! with the span mask. Most header fields are only touched by the owning heap;
//! the ones other threads race on are atomics.

use core::{
  hint,
  mem::size_of,
  ptr::null_mut,
  sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::heap::Heap;

/// Bytes reserved at the start of every span for its header.
pub const SPAN_HEADER_SIZE: usize = 128;

/// First span of a mapping; owns the reservation.
pub(crate) const SPAN_FLAG_MASTER: u32 = 1;
/// Span carved out of a master's reservation.
pub(crate) const SPAN_FLAG_SUBSPAN: u32 = 2;
/// Some pointer handed out from this span was shifted for alignment.
pub(crate) const SPAN_FLAG_ALIGNED_BLOCKS: u32 = 4;

const _: () = assert!(size_of::<Span>() <= SPAN_HEADER_SIZE);
const _: () = assert!(SPAN_HEADER_SIZE.is_power_of_two());

/// Where a span sits in its heap's bookkeeping.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanState {
  /// Feeding its heap's per-class free list.
  Active = 0,
  /// On its class's partial list, holding free blocks.
  Partial = 1,
  /// Every block is out; tracked by no list until a block comes back.
  Full = 2,
  /// Parked in a thread cache, the global cache or a heap reserve.
  Cached = 3,
}

#[repr(C)]
pub(crate) struct FreeBlock {
  pub next: *mut FreeBlock,
}

// =============================================================================
// Deferred free list
// =============================================================================

/// Snapshot of a [`DeferredList`] head.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Deferred {
  Unlocked(*mut FreeBlock),
  Locked,
}

/// Blocks freed into a span by threads that do not own it.
///
/// The head doubles as a spin lock: a remote free or the owner's extraction
/// moves it to `Locked`, updates the list and the count, then publishes the
/// new head. Blocks are at least 16-byte aligned, so `1` never collides with
/// a real head.
pub(crate) struct DeferredList {
  head: AtomicUsize,
}

const DEFERRED_LOCKED: usize = 1;

impl DeferredList {
  #[inline]
  fn decode(raw: usize) -> Deferred {
    if raw == DEFERRED_LOCKED {
      Deferred::Locked
    } else {
      Deferred::Unlocked(raw as *mut FreeBlock)
    }
  }

  #[inline]
  pub fn load(&self) -> Deferred {
    Self::decode(self.head.load(Ordering::Relaxed))
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.load(Ordering::Relaxed) == 0
  }

  /// Moves the list to `Locked`, returning the head it held.
  pub fn lock(&self) -> *mut FreeBlock {
    loop {
      match Self::decode(self.head.load(Ordering::Relaxed)) {
        Deferred::Locked => hint::spin_loop(),
        Deferred::Unlocked(head) => {
          if self
            .head
            .compare_exchange_weak(head as usize, DEFERRED_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
          {
            return head;
          }
        }
      }
    }
  }

  /// Publishes `head` and releases the lock.
  #[inline]
  pub fn unlock(&self, head: *mut FreeBlock) {
    debug_assert!(self.load() == Deferred::Locked);
    self.head.store(head as usize, Ordering::Release);
  }

  #[inline]
  pub fn reset(&self) {
    self.head.store(0, Ordering::Relaxed);
  }
}

// =============================================================================
// Span header
// =============================================================================

/// Span metadata. Sits at offset 0 of each span.
#[repr(C)]
pub(crate) struct Span {
  /// Blocks freed by the owning heap (owner-thread only).
  pub free_list: *mut FreeBlock,
  /// Partial list / cache list link.
  pub next: *mut Span,
  /// Partial list back link.
  pub prev: *mut Span,
  /// Owning heap.
  pub heap: *mut Heap,
  /// Blocks freed by other threads.
  pub deferred: DeferredList,
  /// Link in the owning heap's list of fully deferred spans.
  pub next_deferred: *mut Span,
  /// Link between span lists stacked in the global cache. Read by
  /// contending poppers before their CAS, hence atomic.
  pub next_list: AtomicPtr<Span>,
  /// Reservation data of a master span (or a huge mapping).
  pub align_offset: usize,
  pub map_extra: usize,
  pub size_class: u32,
  pub block_size: u32,
  pub block_count: u32,
  /// Blocks linked so far by the lazy page-by-page initialisation.
  pub free_list_limit: u32,
  /// Blocks not in `free_list`; includes blocks in the heap free list while
  /// the span is active and blocks parked in `deferred`.
  pub used_count: u32,
  /// Length of `deferred`, updated under its lock.
  pub deferred_count: AtomicU32,
  /// Length of the cache list headed by this span.
  pub list_size: u32,
  /// Spans covered (large) or pages mapped (huge).
  pub span_count: u32,
  /// Master: spans in the whole reservation. Subspan: distance to master.
  pub total_spans_or_distance: u32,
  /// Master only: spans of the reservation not yet unmapped.
  pub remaining_spans: AtomicI32,
  pub flags: AtomicU32,
  pub state: SpanState,
}

impl Span {
  #[inline(always)]
  pub fn from_ptr(ptr: *const u8, span_mask: usize) -> *mut Span {
    (ptr as usize & span_mask) as *mut Span
  }

  #[inline(always)]
  pub fn blocks_start(span: *mut Span) -> *mut u8 {
    unsafe { (span as *mut u8).add(SPAN_HEADER_SIZE) }
  }

  #[inline]
  pub unsafe fn has_flag(span: *mut Span, flag: u32) -> bool {
    unsafe { (*span).flags.load(Ordering::Relaxed) & flag != 0 }
  }

  #[inline]
  pub unsafe fn set_flag(span: *mut Span, flag: u32) {
    unsafe { (*span).flags.fetch_or(flag, Ordering::Relaxed) };
  }

  /// Every block is out of the span: nothing left to link or pop.
  #[inline]
  pub unsafe fn is_fully_utilized(span: *mut Span) -> bool {
    unsafe { (*span).free_list.is_null() && (*span).free_list_limit >= (*span).block_count }
  }

  /// Header of the first span of a fresh reservation of `total` spans.
  pub unsafe fn init_master(span: *mut Span, total: usize, span_count: usize, align_offset: usize, extra: usize) {
    unsafe {
      (*span).total_spans_or_distance = total as u32;
      (*span).span_count = span_count as u32;
      (*span).align_offset = align_offset;
      (*span).map_extra = extra;
      (*span).flags.store(SPAN_FLAG_MASTER, Ordering::Relaxed);
      (*span).remaining_spans.store(total as i32, Ordering::Relaxed);
    }
  }

  /// Stamps `subspan` with its distance to `master`; a master only gets its
  /// new span count.
  pub unsafe fn mark_subspan_unless_master(master: *mut Span, subspan: *mut Span, span_count: usize, span_shift: u32) {
    debug_assert!(subspan != master || unsafe { Span::has_flag(subspan, SPAN_FLAG_MASTER) });
    unsafe {
      if subspan != master {
        (*subspan).flags.store(SPAN_FLAG_SUBSPAN, Ordering::Relaxed);
        (*subspan).total_spans_or_distance = ((subspan as usize - master as usize) >> span_shift) as u32;
        (*subspan).align_offset = 0;
        (*subspan).map_extra = 0;
      }
      (*subspan).span_count = span_count as u32;
    }
  }

  /// Master of the reservation `span` belongs to.
  #[inline]
  pub unsafe fn master(span: *mut Span, span_shift: u32) -> *mut Span {
    unsafe {
      if Span::has_flag(span, SPAN_FLAG_MASTER) {
        span
      } else {
        (span as *mut u8).sub(((*span).total_spans_or_distance as usize) << span_shift) as *mut Span
      }
    }
  }

  /// Prepares a cached or fresh span to serve `class`.
  pub unsafe fn init_for_class(span: *mut Span, heap: *mut Heap, class_idx: usize, block_size: u32, block_count: u32) {
    unsafe {
      (*span).heap = heap;
      (*span).size_class = class_idx as u32;
      (*span).block_size = block_size;
      (*span).block_count = block_count;
      (*span).free_list = null_mut();
      (*span).free_list_limit = 0;
      (*span).used_count = 0;
      (*span).deferred.reset();
      (*span).deferred_count.store(0, Ordering::Relaxed);
      (*span).flags.fetch_and(!SPAN_FLAG_ALIGNED_BLOCKS, Ordering::Relaxed);
      (*span).next = null_mut();
      (*span).prev = null_mut();
      (*span).state = SpanState::Active;
    }
  }

  /// Links the next page worth of never-used blocks and returns the list
  /// with its length. At least one block is always linked; blocks of half a
  /// page or more are linked all at once.
  pub unsafe fn link_next_page(span: *mut Span, page_size: usize) -> (*mut FreeBlock, u32) {
    unsafe {
      let block_size = (*span).block_size as usize;
      let remaining = ((*span).block_count - (*span).free_list_limit) as usize;
      debug_assert!(remaining > 0, "link_next_page: span {:p} already fully linked", span);

      let first = Span::blocks_start(span).add((*span).free_list_limit as usize * block_size);
      let mut end = first.add(remaining * block_size);
      if block_size < page_size >> 1 {
        let page_end = ((first as usize & !(page_size - 1)) + page_size) as *mut u8;
        if page_end < end {
          end = page_end;
        }
      }

      let mut count = 1u32;
      let mut block = first as *mut FreeBlock;
      let mut next = first.add(block_size);
      while next < end {
        (*block).next = next as *mut FreeBlock;
        block = next as *mut FreeBlock;
        next = next.add(block_size);
        count += 1;
      }
      (*block).next = null_mut();

      (*span).free_list_limit += count;
      debug_assert!((*span).free_list_limit <= (*span).block_count);
      (first as *mut FreeBlock, count)
    }
  }

  /// Moves blocks freed by other threads into the span's own free list.
  pub unsafe fn extract_deferred(span: *mut Span) {
    unsafe {
      let list = (*span).deferred.lock();
      let count = (*span).deferred_count.swap(0, Ordering::Relaxed);
      if !list.is_null() && !(*span).free_list.is_null() {
        // Only during teardown; the allocation path always drains the local
        // list first.
        let mut tail = list;
        while !(*tail).next.is_null() {
          tail = (*tail).next;
        }
        (*tail).next = (*span).free_list;
      }
      if !list.is_null() {
        (*span).free_list = list;
      }
      debug_assert!((*span).used_count >= count, "deferred count exceeds used count");
      (*span).used_count -= count;
      (*span).deferred.unlock(null_mut());
    }
  }

  /// Number of blocks on `list`.
  #[cfg(test)]
  pub unsafe fn count_blocks(mut list: *mut FreeBlock) -> usize {
    let mut count = 0;
    while !list.is_null() {
      count += 1;
      list = unsafe { (*list).next };
    }
    count
  }
}

// =============================================================================
// Span lists
// =============================================================================

/// Singly linked list of spans; the head carries the list size so push, pop
/// and split never walk more than they keep.
pub(crate) mod list {
  use super::*;

  #[inline]
  pub unsafe fn push(head: &mut *mut Span, span: *mut Span) -> u32 {
    unsafe {
      (*span).next = *head;
      (*span).list_size = if head.is_null() { 1 } else { (**head).list_size + 1 };
      *head = span;
      (*span).list_size
    }
  }

  #[inline]
  pub unsafe fn pop(head: &mut *mut Span) -> *mut Span {
    let span = *head;
    if span.is_null() {
      return span;
    }
    unsafe {
      let mut next = null_mut();
      if (*span).list_size > 1 {
        next = (*span).next;
        (*next).list_size = (*span).list_size - 1;
      }
      *head = next;
      (*span).next = null_mut();
      (*span).list_size = 1;
    }
    span
  }

  /// Cuts the list after `limit` spans and returns the remainder.
  pub unsafe fn split(span: *mut Span, limit: usize) -> *mut Span {
    let limit = limit.max(1) as u32;
    unsafe {
      if (*span).list_size <= limit {
        return null_mut();
      }
      let mut kept = 1;
      let mut last = span;
      let mut next = (*span).next;
      while kept < limit {
        last = next;
        next = (*next).next;
        kept += 1;
      }
      (*last).next = null_mut();
      (*next).list_size = (*span).list_size - kept;
      (*span).list_size = kept;
      next
    }
  }

  // Doubly linked partial lists.

  #[inline]
  pub unsafe fn add_double(head: &mut *mut Span, span: *mut Span) {
    unsafe {
      if !head.is_null() {
        (**head).prev = span;
      }
      (*span).next = *head;
      (*span).prev = null_mut();
      *head = span;
    }
  }

  #[inline]
  pub unsafe fn remove_double(head: &mut *mut Span, span: *mut Span) {
    unsafe {
      if *head == span {
        *head = (*span).next;
        if !head.is_null() {
          (**head).prev = null_mut();
        }
      } else {
        let prev = (*span).prev;
        let next = (*span).next;
        (*prev).next = next;
        if !next.is_null() {
          (*next).prev = prev;
        }
      }
      (*span).next = null_mut();
      (*span).prev = null_mut();
    }
  }
}
