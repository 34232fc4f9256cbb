//! Thread-owned heaps.
//!
//! A heap serves small and medium blocks from per-class free lists and whole
//! spans for large requests. Everything in [`HeapLocal`] belongs to the one
//! thread holding the heap; other threads only ever touch
//! `span_free_deferred`, through `&Heap`.

use core::{
  cell::UnsafeCell,
  mem,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::backend::{Backend, Mapping};
use crate::context::Context;
use crate::error::Result;
use crate::size_class::{LARGE_CLASS_COUNT, SIZE_CLASS_COUNT, SIZE_CLASS_LARGE};
use crate::span::{FreeBlock, SPAN_FLAG_ALIGNED_BLOCKS, SPAN_HEADER_SIZE, Span, SpanState, list};
use crate::stats::{HeapStats, SpanInfo};

/// Allocation state of one size class.
struct HeapClass {
  /// Blocks ready to hand out. Refilled only when empty, so outside
  /// teardown every block belongs to `free_span`.
  free_list: *mut FreeBlock,
  /// Span the blocks of `free_list` were taken from.
  free_span: *mut Span,
  /// Length of `free_list`.
  free_count: u32,
  /// Span currently feeding `free_list`.
  active: *mut Span,
  /// Spans with free blocks, doubly linked.
  partial: *mut Span,
}

/// Owner-thread state.
pub(crate) struct HeapLocal {
  classes: [HeapClass; SIZE_CLASS_COUNT],
  /// Thread cache, indexed by span count - 1.
  span_cache: [*mut Span; LARGE_CLASS_COUNT],
  /// Mapped spans not handed out yet, carved front to back.
  span_reserve: *mut Span,
  reserve_master: *mut Span,
  spans_reserved: usize,
  stats: HeapStats,
}

/// A heap lives in its own zero-filled mapping; all-zero is its empty state.
pub(crate) struct Heap {
  local: UnsafeCell<HeapLocal>,
  /// Spans whose blocks were all freed by other threads, linked through
  /// `Span::next_deferred`.
  span_free_deferred: AtomicPtr<Span>,
  /// Orphan stack link.
  pub next_orphan: AtomicPtr<Heap>,
  /// Heap table bucket link.
  pub next_heap: AtomicPtr<Heap>,
  pub id: u32,
  pub map_size: usize,
  pub align_offset: usize,
  pub map_extra: usize,
}

impl Heap {
  /// Stamps identity into a fresh heap mapping.
  ///
  /// # Safety
  /// `heap` must point to at least `map_size` zero-filled, writable bytes.
  pub unsafe fn init_in_place(heap: *mut Heap, id: u32, map_size: usize, mapping: &Mapping) {
    unsafe {
      (&raw mut (*heap).id).write(id);
      (&raw mut (*heap).map_size).write(map_size);
      (&raw mut (*heap).align_offset).write(mapping.align_offset);
      (&raw mut (*heap).map_extra).write(mapping.extra);
    }
  }

  #[allow(clippy::mut_from_ref)]
  #[inline(always)]
  unsafe fn local(&self) -> &mut HeapLocal {
    unsafe { &mut *self.local.get() }
  }

  #[inline(always)]
  fn as_ptr(&self) -> *mut Heap {
    self as *const Heap as *mut Heap
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// Pops a block of `class_idx`.
  #[inline(always)]
  pub unsafe fn allocate_small<B: Backend>(&self, ctx: &Context<B>, class_idx: usize) -> Result<NonNull<u8>> {
    let local = unsafe { self.local() };
    let class = &mut local.classes[class_idx];
    if let Some(block) = NonNull::new(class.free_list) {
      class.free_list = unsafe { (*block.as_ptr()).next };
      class.free_count -= 1;
      return Ok(block.cast());
    }
    unsafe { local.allocate_from_spans(self, ctx, class_idx) }
  }

  /// Hands out a whole run of spans for `size` bytes.
  pub unsafe fn allocate_large<B: Backend>(&self, ctx: &Context<B>, size: usize) -> Result<NonNull<u8>> {
    let local = unsafe { self.local() };
    let span_count = (size + SPAN_HEADER_SIZE).div_ceil(ctx.settings.span_size);
    debug_assert!(span_count <= LARGE_CLASS_COUNT);
    unsafe {
      let span = local.extract_new_span(self, ctx, span_count)?;
      debug_assert_eq!((*span).span_count as usize, span_count);
      (*span).size_class = SIZE_CLASS_LARGE;
      (*span).heap = self.as_ptr();
      (*span).state = SpanState::Full;
      (*span).flags.fetch_and(!SPAN_FLAG_ALIGNED_BLOCKS, Ordering::Relaxed);
      Ok(NonNull::new_unchecked(Span::blocks_start(span)))
    }
  }

  /// Records a huge span mapped on behalf of this heap.
  pub unsafe fn adopt_huge(&self, span: *mut Span, bytes: usize) {
    unsafe {
      (*span).heap = self.as_ptr();
      self.local().stats.huge_alloc += bytes;
    }
  }

  // ---------------------------------------------------------------------------
  // Deallocation
  // ---------------------------------------------------------------------------

  /// Frees a block of a small or medium span, local or remote.
  #[inline]
  pub unsafe fn free_small<B: Backend>(&self, ctx: &Context<B>, span: *mut Span, ptr: *mut u8) {
    unsafe {
      let block = Self::block_start(span, ptr) as *mut FreeBlock;
      if (*span).heap == self.as_ptr() {
        self.local().free_local(ctx, span, block);
      } else {
        Self::free_remote(span, block);
      }
    }
  }

  /// Start of the block containing `ptr`, undoing any alignment shift.
  #[inline(always)]
  pub unsafe fn block_start(span: *mut Span, ptr: *mut u8) -> *mut u8 {
    unsafe {
      if Span::has_flag(span, SPAN_FLAG_ALIGNED_BLOCKS) {
        let offset = ptr as usize - Span::blocks_start(span) as usize;
        ptr.sub(offset % (*span).block_size as usize)
      } else {
        ptr
      }
    }
  }

  /// Pushes a block onto a span owned by another heap.
  unsafe fn free_remote(span: *mut Span, block: *mut FreeBlock) {
    unsafe {
      let head = (*span).deferred.lock();
      (*block).next = head;
      let count = (*span).deferred_count.fetch_add(1, Ordering::Relaxed) + 1;
      let all_deferred = count == (*span).block_count;
      let owner = (*span).heap;
      (*span).deferred.unlock(block);

      // The owner cannot reach a span whose every block is out, so nobody
      // else looks at it until the owner adopts it.
      if all_deferred {
        (*owner).push_deferred_span(span);
      }
    }
  }

  fn push_deferred_span(&self, span: *mut Span) {
    let mut head = self.span_free_deferred.load(Ordering::Relaxed);
    loop {
      unsafe { (*span).next_deferred = head };
      match self
        .span_free_deferred
        .compare_exchange_weak(head, span, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => return,
        Err(current) => head = current,
      }
    }
  }

  /// Takes over a large span; the freeing heap becomes its owner.
  pub unsafe fn free_large<B: Backend>(&self, ctx: &Context<B>, span: *mut Span) {
    unsafe { self.local().free_large(self, ctx, span) }
  }

  /// Books the release of a huge span freed through this heap.
  pub unsafe fn forget_huge(&self, bytes: usize) {
    let stats = unsafe { &mut self.local().stats };
    stats.huge_alloc = stats.huge_alloc.saturating_sub(bytes);
  }

  // ---------------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------------

  /// Returns every cached span to the global cache. Active and partial spans
  /// and the reserve stay with the heap for its next owner.
  pub unsafe fn flush_caches<B: Backend>(&self, ctx: &Context<B>) {
    let local = unsafe { self.local() };
    unsafe {
      local.adopt_deferred_spans(self, ctx, false);
      for idx in 0..LARGE_CLASS_COUNT {
        let list = mem::replace(&mut local.span_cache[idx], null_mut());
        if !list.is_null() {
          local.flush_to_global(ctx, list, idx + 1);
        }
      }
    }
  }

  /// Releases every span the heap can prove empty. Returns the number of
  /// tracked spans still holding live blocks.
  pub unsafe fn teardown<B: Backend>(&self, ctx: &Context<B>) -> usize {
    let local = unsafe { self.local() };
    let mut leaked = 0;
    unsafe {
      local.adopt_deferred_spans(self, ctx, false);

      for class_idx in 0..SIZE_CLASS_COUNT {
        // Hand the blocks parked in the heap free list back to their spans.
        let class = &mut local.classes[class_idx];
        let mut block = mem::replace(&mut class.free_list, null_mut());
        class.free_span = null_mut();
        class.free_count = 0;
        while !block.is_null() {
          let next = (*block).next;
          let span = Span::from_ptr(block as *const u8, ctx.settings.span_mask);
          local.free_local(ctx, span, block);
          block = next;
        }

        let class = &mut local.classes[class_idx];
        let active = mem::replace(&mut class.active, null_mut());
        let mut partial = mem::replace(&mut class.partial, null_mut());
        if !active.is_null() {
          leaked += local.release_if_empty(ctx, active);
        }
        while !partial.is_null() {
          let next = (*partial).next;
          leaked += local.release_if_empty(ctx, partial);
          partial = next;
        }
      }

      if local.spans_reserved > 0 {
        let reserve = local.span_reserve;
        Span::mark_subspan_unless_master(
          local.reserve_master,
          reserve,
          local.spans_reserved,
          ctx.settings.span_shift,
        );
        local.span_reserve = null_mut();
        local.reserve_master = null_mut();
        local.spans_reserved = 0;
        ctx.unmap_span(reserve);
      }

      for idx in 0..LARGE_CLASS_COUNT {
        let mut list = mem::replace(&mut local.span_cache[idx], null_mut());
        while !list.is_null() {
          ctx.unmap_span(list::pop(&mut list));
        }
      }
    }
    leaked
  }

  // ---------------------------------------------------------------------------
  // Introspection
  // ---------------------------------------------------------------------------

  pub unsafe fn statistics(&self, span_size: usize) -> HeapStats {
    let local = unsafe { self.local() };
    let mut stats = local.stats.clone();
    stats.thread_cache_bytes = local
      .span_cache
      .iter()
      .enumerate()
      .filter(|(_, head)| !head.is_null())
      .map(|(idx, head)| unsafe { (**head).list_size } as usize * (idx + 1) * span_size)
      .sum();
    stats.reserved_bytes = local.spans_reserved * span_size;
    stats
  }

  /// Length of the thread cache list for `span_count` spans.
  pub unsafe fn thread_cache_len(&self, span_count: usize) -> usize {
    let local = unsafe { self.local() };
    match local.span_cache.get(span_count.wrapping_sub(1)) {
      Some(head) if !head.is_null() => unsafe { (**head).list_size as usize },
      _ => 0,
    }
  }

  /// Reports the active span then every partial span of `class_idx`. An
  /// active span that got blocks back is reported as partial.
  pub unsafe fn inspect_class<F: FnMut(SpanInfo)>(&self, class_idx: usize, mut f: F) {
    let local = unsafe { self.local() };
    let class = &local.classes[class_idx];
    let info = |span: *mut Span| unsafe {
      let out = (*span).used_count as usize;
      let deferred = (*span).deferred_count.load(Ordering::Relaxed) as usize;
      let held = if span == class.free_span { class.free_count as usize } else { 0 };
      let state = match (*span).state {
        SpanState::Active if !(*span).free_list.is_null() || deferred > 0 => SpanState::Partial,
        state => state,
      };
      SpanInfo {
        state,
        block_size: (*span).block_size as usize,
        block_count: (*span).block_count as usize,
        used_blocks: out.saturating_sub(deferred + held),
      }
    };

    if !class.active.is_null() {
      f(info(class.active));
    }
    let mut span = class.partial;
    while !span.is_null() {
      f(info(span));
      span = unsafe { (*span).next };
    }
  }
}

impl HeapLocal {
  /// Refills the class free list from the active span, a partial span or a
  /// new span, then pops a block.
  #[inline(never)]
  unsafe fn allocate_from_spans<B: Backend>(
    &mut self,
    heap: &Heap,
    ctx: &Context<B>,
    class_idx: usize,
  ) -> Result<NonNull<u8>> {
    loop {
      let span = self.classes[class_idx].active;
      if span.is_null() {
        let class = &mut self.classes[class_idx];
        let partial = class.partial;
        if !partial.is_null() {
          unsafe {
            list::remove_double(&mut class.partial, partial);
            (*partial).state = SpanState::Active;
          }
          class.active = partial;
        } else {
          let span = unsafe { self.extract_new_span(heap, ctx, 1)? };
          let size_class = ctx.classes.get(class_idx);
          unsafe {
            Span::init_for_class(
              span,
              heap.as_ptr(),
              class_idx,
              size_class.block_size,
              size_class.block_count,
            )
          };
          let usage = &mut self.stats.class_use[class_idx];
          usage.spans_initialized += 1;
          usage.spans_current += 1;
          usage.spans_peak = usage.spans_peak.max(usage.spans_current);
          self.classes[class_idx].active = span;
        }
        continue;
      }

      let class = &mut self.classes[class_idx];
      unsafe {
        // Every linked block not on the span's own list is out, so the list
        // holds `free_list_limit - used_count` blocks.
        if !(*span).free_list.is_null() {
          class.free_count = (*span).free_list_limit - (*span).used_count;
          class.free_list = mem::replace(&mut (*span).free_list, null_mut());
        } else if (*span).free_list_limit < (*span).block_count {
          let (list, count) = Span::link_next_page(span, ctx.settings.page_size);
          class.free_list = list;
          class.free_count = count;
        } else {
          class.free_count = 0;
        }
        class.free_span = span;
        (*span).used_count = (*span).free_list_limit;

        if !(*span).deferred.is_empty() {
          Span::extract_deferred(span);
        }

        if Span::is_fully_utilized(span) {
          (*span).state = SpanState::Full;
          class.active = null_mut();
        }

        if let Some(block) = NonNull::new(class.free_list) {
          class.free_list = (*block.as_ptr()).next;
          class.free_count -= 1;
          return Ok(block.cast());
        }
      }
    }
  }

  /// Frees a block into a span owned by this heap.
  unsafe fn free_local<B: Backend>(&mut self, ctx: &Context<B>, span: *mut Span, block: *mut FreeBlock) {
    unsafe {
      let class_idx = (*span).size_class as usize;
      if (*span).state == SpanState::Full {
        (*span).state = SpanState::Partial;
        list::add_double(&mut self.classes[class_idx].partial, span);
      }

      (*block).next = (*span).free_list;
      (*span).free_list = block;
      debug_assert!((*span).used_count > 0, "free_local: span {:p} has no used blocks", span);
      (*span).used_count -= 1;

      // Blocks still parked in the heap free list are not in use either.
      let class = &mut self.classes[class_idx];
      let held = if class.free_span == span { class.free_count } else { 0 };
      let live = (*span).used_count - held;
      if live == (*span).deferred_count.load(Ordering::Acquire) {
        if live != 0 {
          // A remote free may still be inside the deferred lock.
          let head = (*span).deferred.lock();
          (*span).deferred.unlock(head);
        }
        if held != 0 {
          class.free_list = null_mut();
          class.free_count = 0;
        }
        if class.free_span == span {
          class.free_span = null_mut();
        }
        match (*span).state {
          SpanState::Partial => list::remove_double(&mut class.partial, span),
          SpanState::Active => class.active = null_mut(),
          state => debug_assert!(false, "free_local: span {:p} in state {:?}", span, state),
        }
        self.release_span(ctx, span);
      }
    }
  }

  unsafe fn free_large<B: Backend>(&mut self, heap: &Heap, ctx: &Context<B>, span: *mut Span) {
    unsafe {
      let span_count = (*span).span_count as usize;
      (*span).heap = heap.as_ptr();
      if span_count > 1 && self.spans_reserved == 0 {
        let usage = &mut self.stats.span_use[span_count - 1];
        usage.dec_current();
        usage.to_reserved += 1;
        (*span).state = SpanState::Cached;
        self.span_reserve = span;
        self.reserve_master = Span::master(span, ctx.settings.span_shift);
        self.spans_reserved = span_count;
      } else {
        self.release_span(ctx, span);
      }
    }
  }

  /// Teardown helper: releases `span` when no block is out.
  unsafe fn release_if_empty<B: Backend>(&mut self, ctx: &Context<B>, span: *mut Span) -> usize {
    unsafe {
      if !(*span).deferred.is_empty() {
        Span::extract_deferred(span);
      }
      (*span).next = null_mut();
      (*span).prev = null_mut();
      if (*span).used_count == 0 {
        self.release_span(ctx, span);
        0
      } else {
        1
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Span extraction chain
  // ---------------------------------------------------------------------------

  /// Finds `span_count` contiguous spans: thread cache, reserve, global
  /// cache, then a fresh mapping.
  unsafe fn extract_new_span<B: Backend>(
    &mut self,
    heap: &Heap,
    ctx: &Context<B>,
    span_count: usize,
  ) -> Result<*mut Span> {
    let idx = span_count - 1;
    let mut span = null_mut();
    unsafe {
      if span_count == 1 {
        span = self.adopt_deferred_spans(heap, ctx, true);
      }
      if span.is_null() {
        span = list::pop(&mut self.span_cache[idx]);
        if !span.is_null() {
          self.stats.span_use[idx].from_cache += 1;
        }
      }
      if span.is_null() && self.spans_reserved >= span_count {
        span = self.take_from_reserve(ctx, span_count);
        self.stats.span_use[idx].from_reserved += 1;
      }
      if span.is_null() && ctx.settings.global_cache {
        span = self.take_from_global(ctx, span_count);
      }
      if span.is_null() {
        span = self.map_spans(ctx, span_count)?;
      }
    }
    self.stats.span_use[idx].inc_current();
    Ok(span)
  }

  /// Empties the list of spans freed entirely by other threads. With
  /// `keep_one`, the first span is returned for reuse instead of cached.
  unsafe fn adopt_deferred_spans<B: Backend>(&mut self, heap: &Heap, ctx: &Context<B>, keep_one: bool) -> *mut Span {
    if heap.span_free_deferred.load(Ordering::Relaxed).is_null() {
      return null_mut();
    }
    let mut span = heap.span_free_deferred.swap(null_mut(), Ordering::Acquire);
    let mut kept: *mut Span = null_mut();
    while !span.is_null() {
      unsafe {
        let next = (*span).next_deferred;
        debug_assert_eq!((*span).heap, heap.as_ptr());
        debug_assert_eq!((*span).deferred_count.load(Ordering::Relaxed), (*span).block_count);
        self.stats.class_use[(*span).size_class as usize].spans_deferred += 1;
        if keep_one && kept.is_null() {
          let usage = &mut self.stats.class_use[(*span).size_class as usize];
          usage.spans_current = usage.spans_current.saturating_sub(1);
          self.stats.span_use[0].dec_current();
          kept = span;
        } else {
          self.release_span(ctx, span);
        }
        span = next;
      }
    }
    kept
  }

  unsafe fn take_from_reserve<B: Backend>(&mut self, ctx: &Context<B>, span_count: usize) -> *mut Span {
    let span = self.span_reserve;
    let shift = ctx.settings.span_shift;
    self.spans_reserved -= span_count;
    unsafe {
      Span::mark_subspan_unless_master(self.reserve_master, span, span_count, shift);
      if self.spans_reserved == 0 {
        self.span_reserve = null_mut();
        self.reserve_master = null_mut();
      } else {
        self.span_reserve = (span as *mut u8).add(span_count << shift) as *mut Span;
      }
    }
    span
  }

  unsafe fn take_from_global<B: Backend>(&mut self, ctx: &Context<B>, span_count: usize) -> *mut Span {
    let idx = span_count - 1;
    let mut list = unsafe { ctx.take_from_global(span_count) };
    if list.is_null() {
      return list;
    }
    unsafe {
      let size = (*list).list_size as usize;
      let usage = &mut self.stats.span_use[idx];
      usage.from_global += size;
      self.stats.global_to_thread += size * span_count * ctx.settings.span_size;

      let span = list::pop(&mut list);
      if !list.is_null() {
        if ctx.settings.thread_cache && self.span_cache[idx].is_null() {
          self.span_cache[idx] = list;
        } else {
          ctx.release_to_global(list, span_count);
        }
      }
      span
    }
  }

  /// Maps a new superspan. The spans past `span_count` become the reserve.
  unsafe fn map_spans<B: Backend>(&mut self, ctx: &Context<B>, span_count: usize) -> Result<*mut Span> {
    let settings = &ctx.settings;
    let total = settings.map_span_count(span_count);
    let mapping = ctx.map(total << settings.span_shift, settings.span_size)?;
    let span = mapping.ptr.as_ptr() as *mut Span;
    unsafe {
      Span::init_master(span, total, span_count, mapping.align_offset, mapping.extra);
      self.stats.span_use[span_count - 1].map_calls += 1;

      if total > span_count {
        if self.spans_reserved > 0 {
          let old = self.span_reserve;
          Span::mark_subspan_unless_master(self.reserve_master, old, self.spans_reserved, settings.span_shift);
          self.spans_reserved = 0;
          self.cache_span(ctx, old);
        }
        self.span_reserve = (span as *mut u8).add(span_count << settings.span_shift) as *mut Span;
        self.reserve_master = span;
        self.spans_reserved = total - span_count;
      }
    }
    Ok(span)
  }

  // ---------------------------------------------------------------------------
  // Thread cache
  // ---------------------------------------------------------------------------

  /// Returns an emptied span to the caches.
  unsafe fn release_span<B: Backend>(&mut self, ctx: &Context<B>, span: *mut Span) {
    unsafe {
      let span_count = (*span).span_count as usize;
      if let Some(usage) = self.stats.span_use.get_mut(span_count - 1) {
        usage.dec_current();
      }
      let class_idx = (*span).size_class as usize;
      if class_idx < SIZE_CLASS_COUNT {
        let usage = &mut self.stats.class_use[class_idx];
        usage.spans_current = usage.spans_current.saturating_sub(1);
        usage.spans_to_cache += 1;
      }
      self.cache_span(ctx, span);
    }
  }

  unsafe fn cache_span<B: Backend>(&mut self, ctx: &Context<B>, span: *mut Span) {
    unsafe {
      let span_count = (*span).span_count as usize;
      (*span).state = SpanState::Cached;
      if span_count > LARGE_CLASS_COUNT {
        ctx.unmap_span(span);
        return;
      }
      if !ctx.settings.thread_cache {
        (*span).next = null_mut();
        (*span).list_size = 1;
        ctx.release_to_global(span, span_count);
        return;
      }

      let idx = span_count - 1;
      self.stats.span_use[idx].to_cache += 1;
      let size = list::push(&mut self.span_cache[idx], span) as usize;
      let keep = self.cache_threshold(ctx, span_count);
      if size > keep {
        let excess = list::split(self.span_cache[idx], keep);
        self.flush_to_global(ctx, excess, span_count);
      }
    }
  }

  /// Spans a thread cache bucket keeps before spilling into the global cache.
  fn cache_threshold<B: Backend>(&self, ctx: &Context<B>, span_count: usize) -> usize {
    let settings = &ctx.settings;
    let release = settings.release_count(span_count);
    if settings.adaptive_thread_cache {
      let high = self.stats.span_use[span_count - 1].peak;
      (release + high / 4 + 1).min(settings.thread_cache_limit(span_count))
    } else {
      release
    }
  }

  unsafe fn flush_to_global<B: Backend>(&mut self, ctx: &Context<B>, list: *mut Span, span_count: usize) {
    unsafe {
      let moved = (*list).list_size as usize;
      self.stats.span_use[span_count - 1].to_global += moved;
      self.stats.thread_to_global += moved * span_count * ctx.settings.span_size;
      ctx.release_to_global(list, span_count);
    }
  }
}
