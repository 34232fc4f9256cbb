use core::{
  cell::UnsafeCell,
  hint,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use log::debug;

use super::os::{os_decommit, os_mmap, os_munmap};
use super::{Backend, Mapping, align_up};
use crate::error::{Error, Result};

/// Largest buddy order; an arena holds at most `2^MAX_ORDER` pages.
const MAX_ORDER: usize = 40;

// =============================================================================
// Spin lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Buddy free lists
// =============================================================================

/// Link stored in the first word of every free buddy block.
#[repr(C)]
struct FreeBuddy {
  next: *mut FreeBuddy,
}

/// Intrusive free list for one buddy order.
struct FreeList {
  head: *mut FreeBuddy,
  count: usize,
}

/// Lock-protected free list per buddy order.
struct LockedFreeList {
  lock: SpinLock,
  list: UnsafeCell<FreeList>,
}

impl LockedFreeList {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      list: UnsafeCell::new(FreeList {
        head: null_mut(),
        count: 0,
      }),
    }
  }
}

/// A fixed, pre-reserved region carved into naturally aligned power-of-two
/// blocks with a buddy system.
///
/// Useful to confine an allocator to a budget of address space (a device
/// pool, a sandbox) or to run several allocators side by side with disjoint
/// memory.
pub struct ArenaBackend {
  base: *mut u8,
  capacity: usize,
  page_shift: u32,
  max_order: usize,
  orders: [LockedFreeList; MAX_ORDER + 1],
  /// Bytes currently handed out.
  in_use: AtomicUsize,
  /// Reservation to give back on drop.
  raw: *mut u8,
  raw_size: usize,
}

unsafe impl Sync for ArenaBackend {}
unsafe impl Send for ArenaBackend {}

impl ArenaBackend {
  /// Reserves `capacity` bytes (a power of two, at least one page) aligned
  /// to `capacity`, handed out in multiples of `page_size`.
  pub fn new(capacity: usize, page_size: usize) -> Result<Self> {
    if !page_size.is_power_of_two() || !capacity.is_power_of_two() || capacity < page_size {
      return Err(Error::InvalidArgument(
        "arena capacity and page size must be powers of two",
      ));
    }
    let max_order = (capacity / page_size).trailing_zeros() as usize;
    if max_order > MAX_ORDER {
      return Err(Error::Unsupported("arena too large"));
    }

    // Over-reserve so the arena can be aligned to its own size; every buddy
    // block is then naturally aligned in absolute terms.
    let raw_size = capacity.checked_mul(2).ok_or(Error::InvalidArgument("arena too large"))?;
    let raw = unsafe { os_mmap(raw_size, libc::MAP_NORESERVE) };
    if raw.is_null() {
      debug!("arena reservation of {} bytes failed", raw_size);
      return Err(Error::OutOfMemory);
    }
    let base = align_up(raw as usize, capacity) as *mut u8;

    const LOCKED_LIST: LockedFreeList = LockedFreeList::new();
    let arena = Self {
      base,
      capacity,
      page_shift: page_size.trailing_zeros(),
      max_order,
      orders: [LOCKED_LIST; MAX_ORDER + 1],
      in_use: AtomicUsize::new(0),
      raw,
      raw_size,
    };
    // Whole arena as one max-order block.
    unsafe { arena.push(base, max_order) };
    Ok(arena)
  }

  /// Bytes currently mapped out of the arena.
  pub fn used(&self) -> usize {
    self.in_use.load(Ordering::Relaxed)
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  fn contains(&self, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    addr >= self.base as usize && addr < self.base as usize + self.capacity
  }

  #[inline]
  fn block_to_idx(&self, block: *mut u8) -> usize {
    (block as usize - self.base as usize) >> self.page_shift
  }

  #[inline]
  fn idx_to_block(&self, idx: usize) -> *mut u8 {
    unsafe { self.base.add(idx << self.page_shift) }
  }

  /// Smallest order whose block holds `size` bytes at alignment `align`.
  fn order_for(&self, size: usize, align: usize) -> Option<usize> {
    let pages = size.max(align).div_ceil(1 << self.page_shift);
    let order = pages.checked_next_power_of_two()?.trailing_zeros() as usize;
    (order <= self.max_order).then_some(order)
  }

  unsafe fn push(&self, block: *mut u8, order: usize) {
    let entry = &self.orders[order];
    entry.lock.lock();
    unsafe {
      let list = &mut *entry.list.get();
      let node = block as *mut FreeBuddy;
      (*node).next = list.head;
      list.head = node;
      list.count += 1;
    }
    entry.lock.unlock();
  }

  fn pop(&self, order: usize) -> Option<*mut u8> {
    let entry = &self.orders[order];
    entry.lock.lock();
    let list = unsafe { &mut *entry.list.get() };
    let head = list.head;
    let result = if head.is_null() {
      None
    } else {
      list.head = unsafe { (*head).next };
      list.count -= 1;
      Some(head as *mut u8)
    };
    entry.lock.unlock();
    result
  }

  /// Try to remove buddy block from the free list of `order`.
  /// Returns true if buddy was found and removed.
  fn try_remove(&self, buddy: *mut u8, order: usize) -> bool {
    let entry = &self.orders[order];
    entry.lock.lock();
    let list = unsafe { &mut *entry.list.get() };
    let target = buddy as *mut FreeBuddy;
    let mut removed = false;

    if list.head == target {
      list.head = unsafe { (*target).next };
      list.count -= 1;
      removed = true;
    } else {
      // Walk the list to find buddy
      let mut prev = list.head;
      while !prev.is_null() {
        let next = unsafe { (*prev).next };
        if next == target {
          unsafe { (*prev).next = (*target).next };
          list.count -= 1;
          removed = true;
          break;
        }
        prev = next;
      }
    }

    entry.lock.unlock();
    removed
  }

  /// Allocate block of given order, splitting larger blocks if needed.
  fn alloc(&self, order: usize) -> Option<*mut u8> {
    for o in order..=self.max_order {
      if let Some(block) = self.pop(o) {
        let idx = self.block_to_idx(block);
        for split in (order..o).rev() {
          unsafe { self.push(self.idx_to_block(idx + (1 << split)), split) };
        }
        self.in_use.fetch_add(1 << (order + self.page_shift as usize), Ordering::Relaxed);
        return Some(block);
      }
    }
    None
  }

  /// Free block with buddy coalescing.
  fn free(&self, block: *mut u8, mut order: usize) {
    self.in_use.fetch_sub(1 << (order + self.page_shift as usize), Ordering::Relaxed);
    let mut idx = self.block_to_idx(block);

    // Coalesce with buddy, climbing orders
    while order < self.max_order {
      let buddy_idx = idx ^ (1 << order);
      if self.try_remove(self.idx_to_block(buddy_idx), order) {
        idx = idx.min(buddy_idx);
        order += 1;
      } else {
        break;
      }
    }

    unsafe { self.push(self.idx_to_block(idx), order) };
  }
}

unsafe impl Backend for ArenaBackend {
  fn page_size(&self) -> usize {
    1 << self.page_shift
  }

  fn map(&self, size: usize, align: usize) -> Option<Mapping> {
    let order = self.order_for(size, align)?;
    let block = self.alloc(order)?;
    // Recycled blocks may carry a free-list link and stale contents.
    unsafe { block.write_bytes(0, size) };
    Some(Mapping {
      ptr: NonNull::new(block)?,
      align_offset: 0,
      extra: order,
    })
  }

  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align_offset: usize, release: usize, extra: usize) {
    debug_assert!(self.contains(ptr.as_ptr()), "pointer {:p} outside arena", ptr);
    debug_assert_eq!(align_offset, 0);
    if release != 0 {
      self.free(ptr.as_ptr(), extra);
    } else {
      unsafe { os_decommit(ptr.as_ptr(), size) };
    }
  }
}

impl Drop for ArenaBackend {
  fn drop(&mut self) {
    unsafe { os_munmap(self.raw, self.raw_size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn split_and_coalesce() {
    let arena = ArenaBackend::new(1 << 20, 4096).unwrap();
    let a = arena.map(4096, 4096).unwrap();
    let b = arena.map(64 * 1024, 64 * 1024).unwrap();
    assert_eq!(b.ptr.as_ptr() as usize % (64 * 1024), 0);
    assert_eq!(arena.used(), 4096 + 64 * 1024);

    unsafe {
      arena.unmap(a.ptr, 4096, 0, 4096, a.extra);
      arena.unmap(b.ptr, 64 * 1024, 0, 64 * 1024, b.extra);
    }
    assert_eq!(arena.used(), 0);

    // Everything coalesced back into a single block.
    let whole = arena.map(1 << 20, 4096).unwrap();
    unsafe { arena.unmap(whole.ptr, 1 << 20, 0, 1 << 20, whole.extra) };
  }

  #[test]
  fn exhaustion_returns_none() {
    let arena = ArenaBackend::new(64 * 1024, 4096).unwrap();
    let all = arena.map(64 * 1024, 4096).unwrap();
    assert!(arena.map(4096, 4096).is_none());
    unsafe { arena.unmap(all.ptr, 64 * 1024, 0, 64 * 1024, all.extra) };
    assert!(arena.map(4096, 4096).is_some());
  }
}
