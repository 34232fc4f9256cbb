use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  mem::ManuallyDrop,
  ptr::{NonNull, null, null_mut},
};
use std::sync::OnceLock;

use crate::allocator::Allocator;
use crate::backend::SystemBackend;
use crate::config::Config;
use crate::context::{Context, ReallocFlags};
use crate::error::Result;
use crate::heap::Heap;
use crate::size_class::SMALL_GRANULARITY;
use crate::stats::GlobalStats;

/// Allocators a thread can hold a heap of at the same time.
const THREAD_SLOTS: usize = 4;

// =============================================================================
// TLS
// =============================================================================

#[derive(Clone, Copy)]
struct ThreadSlot {
  owner: *const Context<SystemBackend>,
  heap: *mut Heap,
}

const EMPTY_SLOT: ThreadSlot = ThreadSlot {
  owner: null(),
  heap: null_mut(),
};

/// Heaps of the current thread, one per global allocator instance.
struct ThreadHeaps {
  slots: [Cell<ThreadSlot>; THREAD_SLOTS],
}

impl ThreadHeaps {
  const fn new() -> Self {
    Self {
      slots: [const { Cell::new(EMPTY_SLOT) }; THREAD_SLOTS],
    }
  }

  fn get(&self, ctx: &Context<SystemBackend>) -> Option<NonNull<Heap>> {
    let owner = ctx as *const Context<SystemBackend>;
    self
      .slots
      .iter()
      .map(Cell::get)
      .find(|slot| slot.owner == owner)
      .and_then(|slot| NonNull::new(slot.heap))
  }

  fn get_or_acquire(&self, ctx: &Context<SystemBackend>) -> Option<NonNull<Heap>> {
    if let Some(heap) = self.get(ctx) {
      return Some(heap);
    }
    let free = self.slots.iter().find(|slot| slot.get().owner.is_null())?;
    let heap = ctx.acquire_heap().ok()?;
    free.set(ThreadSlot {
      owner: ctx,
      heap: heap.as_ptr(),
    });
    Some(heap)
  }

  fn release(&self, ctx: &Context<SystemBackend>) {
    let owner = ctx as *const Context<SystemBackend>;
    for slot in &self.slots {
      let current = slot.get();
      if current.owner == owner {
        slot.set(EMPTY_SLOT);
        if let Some(heap) = NonNull::new(current.heap) {
          unsafe { ctx.release_heap(heap) };
        }
      }
    }
  }
}

impl Drop for ThreadHeaps {
  fn drop(&mut self) {
    for slot in &self.slots {
      let current = slot.replace(EMPTY_SLOT);
      if let Some(heap) = NonNull::new(current.heap) {
        // Global allocators are never torn down, so `owner` outlives every
        // thread.
        unsafe { (*current.owner).release_heap(heap) };
      }
    }
  }
}

thread_local! {
  static THREAD_HEAPS: ThreadHeaps = const { ThreadHeaps::new() };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

// =============================================================================
// GlobalSpanHeap
// =============================================================================

/// Allocator usable as `#[global_allocator]`.
///
/// The underlying [`Allocator`] is created on first use and never torn
/// down. Each thread gets its own heap on its first allocation; the heap is
/// orphaned when the thread exits.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: spanheap::GlobalSpanHeap = spanheap::GlobalSpanHeap::new();
/// ```
pub struct GlobalSpanHeap {
  config: Config,
  allocator: OnceLock<Option<ManuallyDrop<Allocator>>>,
}

impl GlobalSpanHeap {
  pub const fn new() -> Self {
    Self::with_config(Config::DEFAULT)
  }

  pub const fn with_config(config: Config) -> Self {
    Self {
      config,
      allocator: OnceLock::new(),
    }
  }

  /// The allocator, or `None` if it could not be created.
  pub fn allocator(&self) -> Option<&Allocator> {
    self
      .allocator
      .get_or_init(|| {
        Allocator::new_quiet(self.config, SystemBackend::new())
          .ok()
          .map(ManuallyDrop::new)
      })
      .as_deref()
  }

  pub fn statistics(&self) -> Option<GlobalStats> {
    self.allocator().map(Allocator::global_statistics)
  }

  /// Gives the calling thread its heap now instead of on first allocation.
  /// Idempotent.
  pub fn acquire_for_thread(&self) -> bool {
    let Some(allocator) = self.allocator() else {
      return false;
    };
    let ctx = allocator.context();
    THREAD_HEAPS
      .try_with(|heaps| heaps.get_or_acquire(ctx).is_some())
      .unwrap_or(false)
  }

  /// Orphans the calling thread's heap ahead of thread exit.
  pub fn release_for_thread(&self) {
    if let Some(allocator) = self.allocator() {
      let ctx = allocator.context();
      let _ = THREAD_HEAPS.try_with(|heaps| heaps.release(ctx));
    }
  }

  /// Runs `f` on the calling thread's heap. Re-entrant calls, calls during
  /// thread teardown and threads out of heap slots borrow a heap for the
  /// duration of the call.
  #[inline]
  fn with_heap<R>(&self, fallback: R, f: impl FnOnce(&Context<SystemBackend>, &Heap) -> R) -> R {
    let Some(allocator) = self.allocator() else {
      return fallback;
    };
    let ctx = allocator.context();

    let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).unwrap_or(false);
    if entered {
      let heap = THREAD_HEAPS
        .try_with(|heaps| heaps.get_or_acquire(ctx))
        .ok()
        .flatten();
      if let Some(heap) = heap {
        let result = f(ctx, unsafe { heap.as_ref() });
        let _ = IN_ALLOC.try_with(|flag| flag.set(false));
        return result;
      }
      let _ = IN_ALLOC.try_with(|flag| flag.set(false));
    }

    match ctx.acquire_heap() {
      Ok(heap) => {
        let result = f(ctx, unsafe { heap.as_ref() });
        unsafe { ctx.release_heap(heap) };
        result
      }
      Err(_) => fallback,
    }
  }

  // Raw entry points shared by `GlobalAlloc` and the C ABI.

  pub(crate) fn raw_allocate(&self, size: usize) -> *mut u8 {
    self.with_heap(null_mut(), |ctx, heap| to_raw(unsafe { ctx.allocate(heap, size) }))
  }

  pub(crate) fn raw_allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
    self.with_heap(null_mut(), |ctx, heap| {
      to_raw(unsafe { ctx.allocate_zeroed(heap, count, size) })
    })
  }

  pub(crate) fn raw_aligned_allocate(&self, alignment: usize, size: usize) -> *mut u8 {
    self.with_heap(null_mut(), |ctx, heap| {
      to_raw(unsafe { ctx.aligned_allocate(heap, alignment, size) })
    })
  }

  pub(crate) unsafe fn raw_free(&self, ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
      self.with_heap((), |ctx, heap| unsafe { ctx.free(heap, ptr) });
    }
  }

  pub(crate) unsafe fn raw_reallocate(&self, ptr: NonNull<u8>, alignment: usize, size: usize, old_size: usize) -> *mut u8 {
    self.with_heap(null_mut(), |ctx, heap| {
      to_raw(unsafe {
        if alignment <= SMALL_GRANULARITY {
          ctx.reallocate(heap, ptr, size, old_size, ReallocFlags::NONE)
        } else {
          ctx.aligned_reallocate(heap, ptr, alignment, size, old_size, ReallocFlags::NONE)
        }
      })
    })
  }

  #[cfg(any(test, feature = "c_api"))]
  pub(crate) unsafe fn raw_usable_size(&self, ptr: *mut u8) -> usize {
    match (NonNull::new(ptr), self.allocator()) {
      (Some(ptr), Some(allocator)) => unsafe { allocator.usable_size(ptr) },
      _ => 0,
    }
  }
}

impl Default for GlobalSpanHeap {
  fn default() -> Self {
    Self::new()
  }
}

#[inline(always)]
fn to_raw(result: Result<NonNull<u8>>) -> *mut u8 {
  result.map_or(null_mut(), NonNull::as_ptr)
}

unsafe impl GlobalAlloc for GlobalSpanHeap {
  #[inline]
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= SMALL_GRANULARITY {
      self.raw_allocate(layout.size())
    } else {
      self.raw_aligned_allocate(layout.align(), layout.size())
    }
  }

  #[inline]
  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.raw_free(ptr) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= SMALL_GRANULARITY {
      return self.raw_allocate_zeroed(1, layout.size());
    }
    let ptr = self.raw_aligned_allocate(layout.align(), layout.size());
    if !ptr.is_null() {
      unsafe { ptr.write_bytes(0, layout.size()) };
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { self.raw_reallocate(ptr, layout.align(), new_size, layout.size()) },
      None => unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) },
    }
  }
}

// =============================================================================
// Plain entry points
// =============================================================================

static GLOBAL: GlobalSpanHeap = GlobalSpanHeap::new();

/// Allocates from the crate's default global instance.
pub fn spanheap_malloc(size: usize) -> *mut u8 {
  GLOBAL.raw_allocate(size)
}

/// # Safety
/// `ptr` must come from [`spanheap_malloc`] or be null.
pub unsafe fn spanheap_free(ptr: *mut u8) {
  unsafe { GLOBAL.raw_free(ptr) }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  GLOBAL.raw_allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { GLOBAL.raw_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  GLOBAL.raw_allocate_zeroed(nmemb, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(block) = NonNull::new(ptr) else {
    return GLOBAL.raw_allocate(size);
  };
  if size == 0 {
    unsafe { GLOBAL.raw_free(ptr) };
    return null_mut();
  }
  // C callers give no old size; the whole usable block is preserved.
  unsafe { GLOBAL.raw_reallocate(block, 0, size, 0) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  GLOBAL.raw_aligned_allocate(alignment, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  let ptr = GLOBAL.raw_aligned_allocate(alignment, size);
  if ptr.is_null() {
    return libc::ENOMEM;
  }
  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { GLOBAL.raw_usable_size(ptr) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raw_entry_points_round_trip() {
    let heap = GlobalSpanHeap::with_config(Config::DEFAULT.with_span_size(32 * 1024));
    assert!(heap.acquire_for_thread());
    assert!(heap.acquire_for_thread());

    let ptr = heap.raw_allocate(200);
    assert!(!ptr.is_null());
    assert!(unsafe { heap.raw_usable_size(ptr) } >= 200);
    unsafe { ptr.write_bytes(0xAB, 200) };

    let grown = unsafe { heap.raw_reallocate(NonNull::new(ptr).unwrap(), 8, 5000, 200) };
    assert!(!grown.is_null());
    assert_eq!(unsafe { *grown.add(199) }, 0xAB);
    unsafe { heap.raw_free(grown) };

    let aligned = heap.raw_aligned_allocate(4096, 100);
    assert_eq!(aligned as usize % 4096, 0);
    unsafe { heap.raw_free(aligned) };

    heap.release_for_thread();
    assert_eq!(heap.statistics().unwrap().orphaned_heaps, 1);
  }

  #[test]
  fn layouts_honour_alignment() {
    let heap = GlobalSpanHeap::new();
    for align in [1, 8, 16, 32, 256, 4096, 16384] {
      let layout = Layout::from_size_align(100, align).unwrap();
      let ptr = unsafe { heap.alloc_zeroed(layout) };
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % align, 0);
      assert!(unsafe { core::slice::from_raw_parts(ptr, 100) }.iter().all(|&b| b == 0));
      unsafe { heap.dealloc(ptr, layout) };
    }
  }
}
