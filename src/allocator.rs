//! Public allocator and heap handles.

use core::{marker::PhantomData, ptr::NonNull};

use log::{debug, trace};

use crate::backend::{Backend, SystemBackend};
use crate::config::{Config, Settings};
use crate::context::{Context, ReallocFlags};
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::size_class::SizeClassTable;
use crate::stats::{GlobalStats, HeapStats, SpanInfo};

/// An independent allocator instance over backend `B`.
///
/// Any number of instances can live side by side, each with its own heaps,
/// caches and backend. Dropping the allocator (or calling
/// [`finalize`](Self::finalize)) returns all of its memory that is no longer
/// in use; blocks still allocated at that point are leaked, not invalidated.
pub struct Allocator<B: Backend = SystemBackend> {
  ctx: NonNull<Context<B>>,
  _owns: PhantomData<Context<B>>,
}

// The context only holds atomics, immutable settings and the backend.
unsafe impl<B: Backend> Send for Allocator<B> {}
unsafe impl<B: Backend> Sync for Allocator<B> {}

impl Allocator<SystemBackend> {
  /// Default configuration over anonymous OS mappings.
  pub fn with_defaults() -> Result<Self> {
    Self::new(Config::default(), SystemBackend::new())
  }
}

impl<B: Backend> Allocator<B> {
  pub fn new(config: Config, backend: B) -> Result<Self> {
    let allocator = Self::new_quiet(config, backend)?;
    let settings = allocator.settings();
    debug!(
      "allocator ready: page size {}, span size {}, {} spans per mapping, huge pages {}",
      settings.page_size, settings.span_size, settings.span_map_count, settings.huge_pages
    );
    Ok(allocator)
  }

  /// Like [`new`](Self::new) without logging, for use inside a global
  /// allocator.
  pub(crate) fn new_quiet(config: Config, backend: B) -> Result<Self> {
    Context::create(&config, backend).map(|ctx| Self {
      ctx,
      _owns: PhantomData,
    })
  }

  #[inline(always)]
  pub(crate) fn context(&self) -> &Context<B> {
    unsafe { self.ctx.as_ref() }
  }

  /// Resolved configuration.
  pub fn settings(&self) -> &Settings {
    &self.context().settings
  }

  pub fn size_classes(&self) -> &SizeClassTable {
    &self.context().classes
  }

  pub fn backend(&self) -> &B {
    &self.context().backend
  }

  /// Hands the calling thread a heap, adopting an orphaned one when
  /// available.
  pub fn heap(&self) -> Result<HeapHandle<'_, B>> {
    let heap = self.context().acquire_heap()?;
    trace!("heap {} acquired", unsafe { heap.as_ref().id });
    Ok(HeapHandle {
      allocator: self,
      heap,
      _not_send: PhantomData,
    })
  }

  /// Usable bytes behind a pointer returned by any heap of this allocator.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this allocator.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { self.context().usable_size(ptr) }
  }

  pub fn global_statistics(&self) -> GlobalStats {
    self.context().statistics()
  }

  /// Counters of the heap with `id`.
  ///
  /// # Safety
  /// No other thread may be using that heap during the call.
  pub unsafe fn heap_statistics(&self, id: u32) -> Option<HeapStats> {
    let ctx = self.context();
    let heap = ctx.find_heap(id)?;
    Some(unsafe { heap.as_ref().statistics(ctx.settings.span_size) })
  }

  /// Tears the allocator down. Same as dropping it.
  pub fn finalize(self) {}
}

impl<B: Backend> Drop for Allocator<B> {
  fn drop(&mut self) {
    unsafe { Context::destroy(self.ctx) };
  }
}

/// Exclusive use of one heap by the current thread.
///
/// Blocks may be freed through any handle of the same allocator, from any
/// thread. Dropping the handle flushes its caches and leaves the heap, with
/// its partially used spans, to the next thread asking for one.
pub struct HeapHandle<'a, B: Backend = SystemBackend> {
  allocator: &'a Allocator<B>,
  heap: NonNull<Heap>,
  _not_send: PhantomData<*mut ()>,
}

impl<B: Backend> HeapHandle<'_, B> {
  #[inline(always)]
  fn parts(&self) -> (&Context<B>, &Heap) {
    (self.allocator.context(), unsafe { self.heap.as_ref() })
  }

  /// Identifier of the underlying heap, stable across orphaning.
  pub fn id(&self) -> u32 {
    self.parts().1.id
  }

  #[inline]
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    let (ctx, heap) = self.parts();
    unsafe { ctx.allocate(heap, size) }
  }

  /// Zero-filled memory for `count` elements of `size` bytes.
  pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
    let (ctx, heap) = self.parts();
    unsafe { ctx.allocate_zeroed(heap, count, size) }
  }

  /// # Safety
  /// `ptr` must be a live allocation of this allocator; it is invalid
  /// afterwards.
  #[inline]
  pub unsafe fn free(&self, ptr: NonNull<u8>) {
    let (ctx, heap) = self.parts();
    unsafe { ctx.free(heap, ptr) }
  }

  /// Resizes `ptr` to `size` bytes, in place when possible. `old_size` is
  /// the number of bytes to preserve, 0 for the whole usable size.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this allocator. Unless an error is
  /// returned, it is invalid afterwards except as the returned pointer.
  pub unsafe fn reallocate(
    &self,
    ptr: NonNull<u8>,
    size: usize,
    old_size: usize,
    flags: ReallocFlags,
  ) -> Result<NonNull<u8>> {
    let (ctx, heap) = self.parts();
    unsafe { ctx.reallocate(heap, ptr, size, old_size, flags) }
  }

  /// `size` bytes at a multiple of `alignment`, which must be a power of two
  /// smaller than the span size.
  pub fn aligned_allocate(&self, alignment: usize, size: usize) -> Result<NonNull<u8>> {
    let (ctx, heap) = self.parts();
    unsafe { ctx.aligned_allocate(heap, alignment, size) }
  }

  /// # Safety
  /// Same contract as [`reallocate`](Self::reallocate).
  pub unsafe fn aligned_reallocate(
    &self,
    ptr: NonNull<u8>,
    alignment: usize,
    size: usize,
    old_size: usize,
    flags: ReallocFlags,
  ) -> Result<NonNull<u8>> {
    let (ctx, heap) = self.parts();
    unsafe { ctx.aligned_reallocate(heap, ptr, alignment, size, old_size, flags) }
  }

  /// # Safety
  /// `ptr` must be a live allocation of this allocator.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { self.parts().0.usable_size(ptr) }
  }

  pub fn statistics(&self) -> HeapStats {
    let (ctx, heap) = self.parts();
    unsafe { heap.statistics(ctx.settings.span_size) }
  }

  /// Walks the active and partial spans of the class serving `size`.
  pub fn inspect_class(&self, size: usize, f: impl FnMut(SpanInfo)) -> Result<()> {
    let (ctx, heap) = self.parts();
    let class_idx = ctx
      .classes
      .class_index(size)
      .ok_or(Error::InvalidArgument("size is not served by a size class"))?;
    unsafe { heap.inspect_class(class_idx, f) };
    Ok(())
  }

  /// Spans of `span_count` held by this heap's thread cache.
  pub fn thread_cache_len(&self, span_count: usize) -> usize {
    unsafe { self.parts().1.thread_cache_len(span_count) }
  }

  /// Gives the heap up. Same as dropping the handle.
  pub fn finalize(self) {}
}

impl<B: Backend> Drop for HeapHandle<'_, B> {
  fn drop(&mut self) {
    let id = self.id();
    unsafe { self.allocator.context().release_heap(self.heap) };
    trace!("heap {} orphaned", id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::span::SpanState;

  #[test]
  fn half_freed_class_keeps_partial_spans() {
    let alloc = Allocator::with_defaults().unwrap();
    let heap = alloc.heap().unwrap();
    let blocks: Vec<_> = (0..1000).map(|_| heap.allocate(48).unwrap()).collect();

    for block in blocks.iter().step_by(2) {
      unsafe { heap.free(*block) };
    }

    let mut seen = Vec::new();
    heap
      .inspect_class(48, |info| {
        assert_eq!(info.block_size, 48);
        seen.push((info.state, info.used_blocks));
      })
      .unwrap();
    assert_eq!(seen, [(SpanState::Partial, 500)]);
    assert_eq!(heap.thread_cache_len(1), 0);

    for block in blocks.iter().skip(1).step_by(2) {
      unsafe { heap.free(*block) };
    }
    let mut tracked = 0;
    heap.inspect_class(48, |_| tracked += 1).unwrap();
    assert_eq!(tracked, 0);
    assert_eq!(heap.thread_cache_len(1), 1);
    let class_idx = alloc.size_classes().class_index(48).unwrap();
    let usage = heap.statistics().class_use[class_idx];
    assert_eq!(usage.spans_to_cache, 1);
    assert_eq!(usage.spans_current, 0);

    // The released span is handed out again for the next block.
    let again = heap.allocate(48).unwrap();
    assert_eq!(heap.thread_cache_len(1), 0);
    unsafe { heap.free(again) };
  }

  #[test]
  fn emptied_partial_span_drops_parked_blocks() {
    let alloc = Allocator::with_defaults().unwrap();
    let heap = alloc.heap().unwrap();
    let class = *alloc.size_classes().get(alloc.size_classes().class_index(48).unwrap());
    // Exhaust one span so the next allocation opens a second one.
    let first: Vec<_> = (0..class.block_count).map(|_| heap.allocate(48).unwrap()).collect();
    let second = heap.allocate(48).unwrap();

    for block in &first {
      unsafe { heap.free(*block) };
    }
    unsafe { heap.free(second) };
    let mut tracked = 0;
    heap.inspect_class(48, |_| tracked += 1).unwrap();
    assert_eq!(tracked, 0);
    assert_eq!(heap.thread_cache_len(1), 2);

    let block = heap.allocate(48).unwrap();
    unsafe { block.as_ptr().write_bytes(0xAB, 48) };
    unsafe { heap.free(block) };
  }

  #[test]
  fn orphaned_heap_is_adopted() {
    let alloc = Allocator::with_defaults().unwrap();
    let first = alloc.heap().unwrap();
    let id = first.id();
    let block = first.allocate(100).unwrap();
    drop(first);
    assert_eq!(alloc.global_statistics().orphaned_heaps, 1);

    let second = alloc.heap().unwrap();
    assert_eq!(second.id(), id);
    unsafe { second.free(block) };
    assert_eq!(alloc.global_statistics().heaps, 1);
  }

  #[test]
  fn finalize_returns_every_mapping() {
    let alloc = Allocator::with_defaults().unwrap();
    {
      let heap = alloc.heap().unwrap();
      let mut blocks = Vec::new();
      for size in [16, 500, 5000, 40_000, 300_000, 5 << 20] {
        blocks.push(heap.allocate(size).unwrap());
      }
      for block in blocks {
        unsafe { heap.free(block) };
      }
    }
    let stats = alloc.global_statistics();
    assert!(stats.mapped > 0);
    assert_eq!(stats.huge_alloc, 0);
    alloc.finalize();
  }
}
