//! State shared by every heap of one allocator instance.
//!
//! The context lives in memory mapped from its own backend, so an allocator
//! never needs another allocator to exist. Heaps reach it through a plain
//! reference handed down each call.

use core::{
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use log::{debug, trace};

use crate::backend::{Backend, Mapping, align_up};
use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::global_cache::GlobalCache;
use crate::heap::Heap;
use crate::size_class::{LARGE_CLASS_COUNT, SIZE_CLASS_COUNT, SIZE_CLASS_HUGE, SIZE_CLASS_LARGE, SMALL_GRANULARITY, SizeClassTable};
use crate::span::{SPAN_FLAG_ALIGNED_BLOCKS, SPAN_FLAG_MASTER, SPAN_FLAG_SUBSPAN, SPAN_HEADER_SIZE, Span, SpanState, list};
use crate::stats::{GlobalCounters, GlobalStats};

/// Buckets of the heap table.
pub(crate) const HEAP_TABLE_SIZE: usize = 47;
/// ABA counter bits of the orphan stack head. Heaps are page aligned.
const ORPHAN_TAG_MASK: usize = 0x1FF;
/// Largest request accepted when argument validation is on.
const MAX_ALLOC_SIZE: usize = isize::MAX as usize;

const _: () = assert!(ORPHAN_TAG_MASK < crate::config::MIN_PAGE_SIZE);

/// Caller intent for [`reallocate`](crate::HeapHandle::reallocate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ReallocFlags(u32);

impl ReallocFlags {
  pub const NONE: ReallocFlags = ReallocFlags(0);
  /// Contents need not survive a move.
  pub const NO_PRESERVE: ReallocFlags = ReallocFlags(1);
  /// Fail instead of moving the block.
  pub const GROW_OR_FAIL: ReallocFlags = ReallocFlags(2);

  #[inline]
  pub const fn contains(self, other: ReallocFlags) -> bool {
    self.0 & other.0 == other.0
  }
}

impl core::ops::BitOr for ReallocFlags {
  type Output = ReallocFlags;

  fn bitor(self, rhs: ReallocFlags) -> ReallocFlags {
    ReallocFlags(self.0 | rhs.0)
  }
}

pub(crate) struct Context<B: Backend> {
  pub backend: B,
  pub settings: Settings,
  pub classes: SizeClassTable,
  /// Indexed by span count - 1.
  global_caches: [GlobalCache; LARGE_CLASS_COUNT],
  heaps: [AtomicPtr<Heap>; HEAP_TABLE_SIZE],
  orphans: crate::tagged::TaggedHead,
  next_heap_id: AtomicU32,
  pub counters: GlobalCounters,
  self_mapping: Mapping,
  self_size: usize,
}

impl<B: Backend> Context<B> {
  /// Validates `config` against `backend` and maps the context. Never logs:
  /// a global allocator may be calling.
  pub fn create(config: &Config, mut backend: B) -> Result<NonNull<Context<B>>> {
    let huge_pages = config.enable_huge_pages && backend.use_huge_pages();
    let mut settings = config.validate(backend.page_size())?;
    settings.huge_pages = huge_pages;

    let backend_page = backend.page_size();
    let self_size = align_up(size_of::<Self>(), backend_page);
    let self_mapping = backend
      .map(self_size, backend_page.max(align_of::<Self>()))
      .ok_or(Error::OutOfMemory)?;
    let ctx = self_mapping.ptr.cast::<Context<B>>();
    unsafe {
      ctx.as_ptr().write(Context {
        backend,
        settings,
        classes: SizeClassTable::new(settings.span_size),
        global_caches: [const { GlobalCache::new() }; LARGE_CLASS_COUNT],
        heaps: [const { AtomicPtr::new(null_mut()) }; HEAP_TABLE_SIZE],
        orphans: crate::tagged::TaggedHead::new(),
        next_heap_id: AtomicU32::new(1),
        counters: GlobalCounters::new(),
        self_mapping,
        self_size,
      })
    };
    Ok(ctx)
  }

  /// Releases every heap, cached span and the context itself. Spans still
  /// holding blocks stay mapped.
  ///
  /// # Safety
  /// No heap of this context may be used afterwards.
  pub unsafe fn destroy(ctx: NonNull<Context<B>>) {
    let this = unsafe { ctx.as_ref() };

    let mut leaked = 0;
    this.for_each_heap(|heap| leaked += unsafe { heap.as_ref().teardown(this) });
    let tag_mask = this.global_tag_mask();
    for cache in &this.global_caches {
      loop {
        let list = unsafe { cache.extract(tag_mask) };
        if list.is_null() {
          break;
        }
        unsafe { this.unmap_list(list) };
      }
    }
    this.for_each_heap(|heap| unsafe {
      let h = heap.as_ref();
      this.unmap_region(heap.cast(), h.map_size, h.align_offset, h.map_size, h.map_extra);
    });

    let stats = this.statistics();
    if leaked > 0 {
      debug!("finalize: {} spans still hold live blocks and stay mapped", leaked);
    }
    debug!(
      "finalize: {} heaps, {} bytes still mapped, {} bytes mapped in total",
      stats.heaps, stats.mapped, stats.mapped_total
    );

    let Context {
      backend,
      self_mapping,
      self_size,
      ..
    } = unsafe { ptr::read(ctx.as_ptr()) };
    unsafe {
      backend.unmap(
        self_mapping.ptr,
        self_size,
        self_mapping.align_offset,
        self_size,
        self_mapping.extra,
      )
    };
  }

  // ---------------------------------------------------------------------------
  // Virtual memory
  // ---------------------------------------------------------------------------

  #[inline]
  fn global_tag_mask(&self) -> usize {
    self.settings.span_size - 1
  }

  /// Maps `size` bytes through the backend within the memory limit.
  pub fn map(&self, size: usize, align: usize) -> Result<Mapping> {
    if !self.counters.mapped.try_add(size, self.settings.memory_limit) {
      debug!("memory limit reached mapping {} bytes", size);
      return Err(Error::OutOfMemory);
    }
    match self.backend.map(size, align) {
      Some(mapping) => {
        self.counters.mapped_total.fetch_add(size, Ordering::Relaxed);
        Ok(mapping)
      }
      None => {
        self.counters.mapped.sub(size);
        debug!("backend failed to map {} bytes", size);
        Err(Error::OutOfMemory)
      }
    }
  }

  unsafe fn unmap_region(&self, ptr: NonNull<u8>, size: usize, align_offset: usize, release: usize, extra: usize) {
    unsafe { self.backend.unmap(ptr, size, align_offset, release, extra) };
    if release != 0 {
      self.counters.mapped.sub(release);
      self.counters.unmapped_total.fetch_add(release, Ordering::Relaxed);
    }
  }

  /// Gives a span back to the backend. Subspans are decommitted at once; the
  /// reservation goes when its last span does.
  pub unsafe fn unmap_span(&self, span: *mut Span) {
    let settings = &self.settings;
    unsafe {
      let is_master = Span::has_flag(span, SPAN_FLAG_MASTER);
      let master = Span::master(span, settings.span_shift);
      debug_assert!(Span::has_flag(master, SPAN_FLAG_MASTER));
      let span_count = (*span).span_count as usize;

      if !is_master {
        debug_assert!(Span::has_flag(span, SPAN_FLAG_SUBSPAN));
        if settings.span_size >= settings.page_size {
          self.unmap_region(
            NonNull::new_unchecked(span as *mut u8),
            span_count << settings.span_shift,
            0,
            0,
            0,
          );
        }
      } else {
        // Header of a range that is otherwise gone.
        Span::set_flag(span, SPAN_FLAG_MASTER | SPAN_FLAG_SUBSPAN);
      }

      let remaining = (*master).remaining_spans.fetch_sub(span_count as i32, Ordering::AcqRel) - span_count as i32;
      debug_assert!(remaining >= 0, "negative remaining span count on master {:p}", master);
      if remaining <= 0 {
        debug_assert!(Span::has_flag(master, SPAN_FLAG_SUBSPAN), "master {:p} still in use", master);
        let total = (*master).total_spans_or_distance as usize;
        let unmap_count = if settings.span_size < settings.page_size {
          total
        } else {
          (*master).span_count as usize
        };
        trace!("releasing superspan {:p} of {} spans", master, total);
        self.unmap_region(
          NonNull::new_unchecked(master as *mut u8),
          unmap_count << settings.span_shift,
          (*master).align_offset,
          total << settings.span_shift,
          (*master).map_extra,
        );
      }
    }
  }

  unsafe fn unmap_list(&self, mut list: *mut Span) {
    while !list.is_null() {
      unsafe { self.unmap_span(list::pop(&mut list)) };
    }
  }

  /// Maps a dedicated page run for `size` bytes.
  fn map_huge(&self, size: usize) -> Result<*mut Span> {
    let settings = &self.settings;
    let pages = size
      .checked_add(SPAN_HEADER_SIZE)
      .ok_or(Error::InvalidArgument("allocation size overflow"))?
      .div_ceil(settings.page_size);
    if pages > u32::MAX as usize {
      return Err(Error::Unsupported("allocation too large"));
    }
    let mapping = self.map(pages << settings.page_shift, settings.span_size)?;
    Ok(unsafe { self.init_huge(&mapping, pages) })
  }

  unsafe fn init_huge(&self, mapping: &Mapping, pages: usize) -> *mut Span {
    let span = mapping.ptr.as_ptr() as *mut Span;
    unsafe {
      (*span).size_class = SIZE_CLASS_HUGE;
      (*span).span_count = pages as u32;
      (*span).align_offset = mapping.align_offset;
      (*span).map_extra = mapping.extra;
      (*span).state = SpanState::Full;
    }
    self.counters.huge_alloc.try_add(pages << self.settings.page_shift, None);
    span
  }

  unsafe fn unmap_huge(&self, span: *mut Span) -> usize {
    unsafe {
      let size = ((*span).span_count as usize) << self.settings.page_shift;
      self.unmap_region(
        NonNull::new_unchecked(span as *mut u8),
        size,
        (*span).align_offset,
        size,
        (*span).map_extra,
      );
      self.counters.huge_alloc.sub(size);
      size
    }
  }

  // ---------------------------------------------------------------------------
  // Global cache
  // ---------------------------------------------------------------------------

  /// Parks a span list in the global cache, or unmaps it when caching is off
  /// or the bucket is full.
  pub unsafe fn release_to_global(&self, list: *mut Span, span_count: usize) {
    if self.settings.global_cache {
      let limit = if self.settings.unlimited_global_cache {
        None
      } else {
        Some(self.settings.global_cache_limit(span_count))
      };
      if unsafe { self.global_caches[span_count - 1].insert(list, limit, self.global_tag_mask()) } {
        return;
      }
    }
    unsafe { self.unmap_list(list) };
  }

  pub unsafe fn take_from_global(&self, span_count: usize) -> *mut Span {
    unsafe { self.global_caches[span_count - 1].extract(self.global_tag_mask()) }
  }

  // ---------------------------------------------------------------------------
  // Heap registry
  // ---------------------------------------------------------------------------

  /// Adopts an orphaned heap or maps a new one. Never logs.
  pub fn acquire_heap(&self) -> Result<NonNull<Heap>> {
    match self.adopt_orphan() {
      Some(heap) => Ok(heap),
      None => self.create_heap(),
    }
  }

  fn adopt_orphan(&self) -> Option<NonNull<Heap>> {
    loop {
      let head = self.orphans.load(Ordering::Acquire);
      let heap = NonNull::new(head.ptr::<Heap>(ORPHAN_TAG_MASK))?;
      // Heaps are never unmapped while the context lives, so a stale `heap`
      // is still readable; the counter rejects the CAS.
      let next = unsafe { heap.as_ref().next_orphan.load(Ordering::Relaxed) };
      if self.orphans.compare_exchange_weak(
        head,
        head.successor(next, ORPHAN_TAG_MASK),
        Ordering::AcqRel,
        Ordering::Relaxed,
      ) {
        self.counters.orphaned_heaps.fetch_sub(1, Ordering::Relaxed);
        return Some(heap);
      }
    }
  }

  fn create_heap(&self) -> Result<NonNull<Heap>> {
    let page_size = self.settings.page_size;
    let size = align_up(size_of::<Heap>(), page_size);
    let mapping = self.map(size, page_size.max(align_of::<Heap>()))?;
    let heap = mapping.ptr.cast::<Heap>();
    let id = self.next_heap_id.fetch_add(1, Ordering::Relaxed);
    unsafe { Heap::init_in_place(heap.as_ptr(), id, size, &mapping) };

    let bucket = &self.heaps[id as usize % HEAP_TABLE_SIZE];
    let mut head = bucket.load(Ordering::Acquire);
    loop {
      unsafe { heap.as_ref().next_heap.store(head, Ordering::Relaxed) };
      match bucket.compare_exchange_weak(head, heap.as_ptr(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => break,
        Err(current) => head = current,
      }
    }
    self.counters.heaps.fetch_add(1, Ordering::Relaxed);
    Ok(heap)
  }

  /// Flushes the heap's caches and publishes it for adoption.
  ///
  /// # Safety
  /// The caller must own `heap` and never use it again.
  pub unsafe fn release_heap(&self, heap: NonNull<Heap>) {
    unsafe { heap.as_ref().flush_caches(self) };
    let mut head = self.orphans.load(Ordering::Relaxed);
    loop {
      unsafe {
        heap
          .as_ref()
          .next_orphan
          .store(head.ptr(ORPHAN_TAG_MASK), Ordering::Relaxed)
      };
      let new = head.successor(heap.as_ptr(), ORPHAN_TAG_MASK);
      if self
        .orphans
        .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
      {
        break;
      }
      head = self.orphans.load(Ordering::Relaxed);
    }
    self.counters.orphaned_heaps.fetch_add(1, Ordering::Relaxed);
  }

  pub fn find_heap(&self, id: u32) -> Option<NonNull<Heap>> {
    let mut heap = self.heaps[id as usize % HEAP_TABLE_SIZE].load(Ordering::Acquire);
    while let Some(found) = NonNull::new(heap) {
      let h = unsafe { found.as_ref() };
      if h.id == id {
        return Some(found);
      }
      heap = h.next_heap.load(Ordering::Relaxed);
    }
    None
  }

  fn for_each_heap(&self, mut f: impl FnMut(NonNull<Heap>)) {
    for bucket in &self.heaps {
      let mut heap = bucket.load(Ordering::Acquire);
      while let Some(found) = NonNull::new(heap) {
        // Read the link first; `f` may unmap the heap.
        heap = unsafe { found.as_ref().next_heap.load(Ordering::Relaxed) };
        f(found);
      }
    }
  }

  pub fn statistics(&self) -> GlobalStats {
    let counters = &self.counters;
    let cached = self
      .global_caches
      .iter()
      .enumerate()
      .map(|(idx, cache)| cache.len() * (idx + 1) * self.settings.span_size)
      .sum();
    GlobalStats {
      mapped: counters.mapped.current(),
      mapped_peak: counters.mapped.peak(),
      mapped_total: counters.mapped_total.load(Ordering::Relaxed),
      unmapped_total: counters.unmapped_total.load(Ordering::Relaxed),
      huge_alloc: counters.huge_alloc.current(),
      huge_alloc_peak: counters.huge_alloc.peak(),
      cached,
      heaps: counters.heaps.load(Ordering::Relaxed),
      orphaned_heaps: counters.orphaned_heaps.load(Ordering::Relaxed),
    }
  }

  // ---------------------------------------------------------------------------
  // Requests
  // ---------------------------------------------------------------------------

  #[inline]
  pub unsafe fn allocate(&self, heap: &Heap, size: usize) -> Result<NonNull<u8>> {
    if let Some(class_idx) = self.classes.class_index(size) {
      return unsafe { heap.allocate_small(self, class_idx) };
    }
    unsafe { self.allocate_spans(heap, size) }
  }

  #[inline(never)]
  unsafe fn allocate_spans(&self, heap: &Heap, size: usize) -> Result<NonNull<u8>> {
    if size <= self.classes.large_size_limit() {
      return unsafe { heap.allocate_large(self, size) };
    }
    if self.settings.validate_args && size > MAX_ALLOC_SIZE {
      return Err(Error::InvalidArgument("allocation size overflow"));
    }
    let span = self.map_huge(size)?;
    unsafe {
      heap.adopt_huge(span, ((*span).span_count as usize) << self.settings.page_shift);
      Ok(NonNull::new_unchecked(Span::blocks_start(span)))
    }
  }

  pub unsafe fn allocate_zeroed(&self, heap: &Heap, count: usize, size: usize) -> Result<NonNull<u8>> {
    let total = count
      .checked_mul(size)
      .ok_or(Error::InvalidArgument("allocation size overflow"))?;
    let block = unsafe { self.allocate(heap, total)? };
    let span = Span::from_ptr(block.as_ptr(), self.settings.span_mask);
    // Huge mappings come zero-filled from the backend.
    if unsafe { (*span).size_class } != SIZE_CLASS_HUGE {
      unsafe { block.as_ptr().write_bytes(0, total) };
    }
    Ok(block)
  }

  #[inline]
  pub unsafe fn free(&self, heap: &Heap, ptr: NonNull<u8>) {
    let span = Span::from_ptr(ptr.as_ptr(), self.settings.span_mask);
    unsafe {
      let size_class = (*span).size_class;
      if size_class < SIZE_CLASS_LARGE {
        heap.free_small(self, span, ptr.as_ptr());
      } else if size_class == SIZE_CLASS_LARGE {
        heap.free_large(self, span);
      } else {
        let bytes = self.unmap_huge(span);
        heap.forget_huge(bytes);
      }
    }
  }

  /// Bytes usable at `ptr`, from `ptr` to the end of its block.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    let ptr = ptr.as_ptr();
    let span = Span::from_ptr(ptr, self.settings.span_mask);
    unsafe {
      let size_class = (*span).size_class;
      if size_class < SIZE_CLASS_LARGE {
        let block_size = (*span).block_size as usize;
        let offset = ptr as usize - Span::blocks_start(span) as usize;
        block_size - offset % block_size
      } else if size_class == SIZE_CLASS_LARGE {
        (((*span).span_count as usize) << self.settings.span_shift) - (ptr as usize - span as usize)
      } else {
        (((*span).span_count as usize) << self.settings.page_shift) - (ptr as usize - span as usize)
      }
    }
  }

  pub unsafe fn reallocate(
    &self,
    heap: &Heap,
    ptr: NonNull<u8>,
    size: usize,
    old_size: usize,
    flags: ReallocFlags,
  ) -> Result<NonNull<u8>> {
    if self.settings.validate_args && size > MAX_ALLOC_SIZE {
      return Err(Error::InvalidArgument("allocation size overflow"));
    }
    let settings = &self.settings;
    let p = ptr.as_ptr();
    let span = Span::from_ptr(p, settings.span_mask);
    let mut old_size = old_size;

    unsafe {
      let size_class = (*span).size_class;
      if size_class < SIZE_CLASS_LARGE {
        let block_size = (*span).block_size as usize;
        let block = Heap::block_start(span, p);
        let shift = p as usize - block as usize;
        if old_size == 0 {
          old_size = block_size - shift;
        }
        if block_size >= size {
          // Fits; drop any alignment shift.
          if shift != 0 && !flags.contains(ReallocFlags::NO_PRESERVE) {
            ptr::copy(p, block, old_size.min(size));
          }
          return Ok(NonNull::new_unchecked(block));
        }
      } else {
        let (unit_shift, current) = if size_class == SIZE_CLASS_LARGE {
          (settings.span_shift, (*span).span_count as usize)
        } else {
          (settings.page_shift, (*span).span_count as usize)
        };
        let block = Span::blocks_start(span);
        let shift = p as usize - block as usize;
        if old_size == 0 {
          old_size = (current << unit_shift) - SPAN_HEADER_SIZE - shift;
        }
        let needed = size
          .checked_add(SPAN_HEADER_SIZE)
          .map(|total| total.div_ceil(1 << unit_shift))
          .unwrap_or(usize::MAX);
        if current >= needed && needed >= current / 2 {
          if shift != 0 && !flags.contains(ReallocFlags::NO_PRESERVE) {
            ptr::copy(p, block, old_size.min(size));
          }
          return Ok(NonNull::new_unchecked(block));
        }
      }
    }

    if flags.contains(ReallocFlags::GROW_OR_FAIL) {
      return Err(Error::Unsupported("block cannot be resized in place"));
    }

    let new_size = if size > old_size {
      size.max(grown_size(old_size))
    } else {
      size
    };
    let block = unsafe { self.allocate(heap, new_size)? };
    unsafe {
      if !flags.contains(ReallocFlags::NO_PRESERVE) {
        ptr::copy_nonoverlapping(p, block.as_ptr(), old_size.min(new_size));
      }
      self.free(heap, ptr);
    }
    Ok(block)
  }

  pub unsafe fn aligned_allocate(&self, heap: &Heap, alignment: usize, size: usize) -> Result<NonNull<u8>> {
    if !alignment.is_power_of_two() {
      return Err(Error::InvalidArgument("alignment must be a power of two"));
    }
    if alignment <= SMALL_GRANULARITY {
      return unsafe { self.allocate(heap, size) };
    }
    let settings = &self.settings;
    let Some(padded) = size.checked_add(alignment) else {
      return Err(Error::InvalidArgument("allocation size overflow"));
    };
    if settings.validate_args && padded > MAX_ALLOC_SIZE {
      return Err(Error::InvalidArgument("allocation size overflow"));
    }
    if alignment >= settings.span_size {
      return Err(Error::Unsupported("alignment must be smaller than the span size"));
    }

    // Blocks start a header past the span start, so a class whose block
    // size is a multiple of the alignment only hands out aligned blocks.
    if alignment <= SPAN_HEADER_SIZE
      && let Some(multiple) = size.max(1).checked_next_multiple_of(SPAN_HEADER_SIZE)
      && let Some(class_idx) = self.classes.class_index(multiple)
      && self.classes.get(class_idx).block_size as usize % alignment == 0
    {
      return unsafe { self.allocate(heap, multiple) };
    }

    let align_mask = alignment - 1;
    if alignment <= settings.page_size && alignment + SPAN_HEADER_SIZE <= settings.span_size {
      let ptr = unsafe { self.allocate(heap, padded)? };
      if ptr.as_ptr() as usize & align_mask == 0 {
        return Ok(ptr);
      }
      let aligned = ((ptr.as_ptr() as usize & !align_mask) + alignment) as *mut u8;
      unsafe {
        Span::set_flag(Span::from_ptr(aligned, settings.span_mask), SPAN_FLAG_ALIGNED_BLOCKS);
        return Ok(NonNull::new_unchecked(aligned));
      }
    }

    unsafe { self.allocate_aligned_pages(heap, alignment, size) }
  }

  /// Maps pages until an aligned pointer with `size` bytes behind it fits in
  /// the first span of the mapping.
  unsafe fn allocate_aligned_pages(&self, heap: &Heap, alignment: usize, size: usize) -> Result<NonNull<u8>> {
    let settings = &self.settings;
    let align_mask = alignment - 1;
    let mut pages = size
      .checked_add(SPAN_HEADER_SIZE)
      .ok_or(Error::InvalidArgument("allocation size overflow"))?
      .div_ceil(settings.page_size);
    pages = pages.max(1 + alignment / settings.page_size);
    let limit = (2 * settings.span_size / settings.page_size).max(pages.saturating_mul(2));

    loop {
      let mapped_size = pages
        .checked_mul(settings.page_size)
        .ok_or(Error::InvalidArgument("allocation size overflow"))?;
      let mapping = self.map(mapped_size, settings.span_size)?;
      let start = mapping.ptr.as_ptr() as usize;
      let mut ptr = start + SPAN_HEADER_SIZE;
      if ptr & align_mask != 0 {
        ptr = (ptr & !align_mask) + alignment;
      }
      if ptr - start < settings.span_size && ptr + size <= start + mapped_size && ptr & settings.span_mask == start {
        unsafe {
          let span = self.init_huge(&mapping, pages);
          heap.adopt_huge(span, mapped_size);
          return Ok(NonNull::new_unchecked(ptr as *mut u8));
        }
      }
      unsafe {
        self.unmap_region(mapping.ptr, mapped_size, mapping.align_offset, mapped_size, mapping.extra);
      }
      pages += 1;
      if pages > limit {
        return Err(Error::Unsupported("cannot satisfy alignment"));
      }
    }
  }

  pub unsafe fn aligned_reallocate(
    &self,
    heap: &Heap,
    ptr: NonNull<u8>,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: ReallocFlags,
  ) -> Result<NonNull<u8>> {
    if alignment <= SMALL_GRANULARITY {
      return unsafe { self.reallocate(heap, ptr, size, old_size, flags) };
    }
    if !alignment.is_power_of_two() {
      return Err(Error::InvalidArgument("alignment must be a power of two"));
    }
    let usable = unsafe { self.usable_size(ptr) };
    if usable >= size && ptr.as_ptr() as usize & (alignment - 1) == 0 {
      if flags.contains(ReallocFlags::GROW_OR_FAIL) || size >= usable / 2 {
        return Ok(ptr);
      }
    }
    if flags.contains(ReallocFlags::GROW_OR_FAIL) {
      return Err(Error::Unsupported("block cannot be resized in place"));
    }

    let block = unsafe { self.aligned_allocate(heap, alignment, size)? };
    unsafe {
      if !flags.contains(ReallocFlags::NO_PRESERVE) {
        let old_size = if old_size == 0 { usable } else { old_size };
        ptr::copy_nonoverlapping(ptr.as_ptr(), block.as_ptr(), old_size.min(size));
      }
      self.free(heap, ptr);
    }
    Ok(block)
  }
}

/// `floor(size * 11 / 8)` without overflowing.
#[inline]
pub(crate) const fn grown_size(size: usize) -> usize {
  size.saturating_add(3 * (size >> 3) + (((size & 7) * 3) >> 3))
}

const _: () = assert!(SIZE_CLASS_LARGE as usize == SIZE_CLASS_COUNT);

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn growth_factor_floors() {
    for size in [0usize, 1, 7, 8, 100, 4096, 12345, 1 << 40] {
      assert_eq!(grown_size(size), (size as u128 * 11 / 8) as usize, "size {}", size);
    }
    assert_eq!(grown_size(usize::MAX), usize::MAX);
  }

  #[test]
  fn flags_combine() {
    let flags = ReallocFlags::NO_PRESERVE | ReallocFlags::GROW_OR_FAIL;
    assert!(flags.contains(ReallocFlags::NO_PRESERVE));
    assert!(flags.contains(ReallocFlags::GROW_OR_FAIL));
    assert!(!ReallocFlags::NONE.contains(ReallocFlags::NO_PRESERVE));
  }
}
