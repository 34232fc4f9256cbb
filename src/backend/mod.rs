//! Virtual memory backends.
//!
//! A backend is the only OS-facing seam of the allocator. Everything above it
//! deals in span-aligned regions and never calls into the platform directly.

use core::ptr::NonNull;

mod arena;
mod os;

pub use arena::ArenaBackend;
pub use os::SystemBackend;

/// A region returned by [`Backend::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
  /// Start of the usable, aligned region.
  pub ptr: NonNull<u8>,
  /// Distance from the start of the underlying reservation to `ptr`.
  pub align_offset: usize,
  /// Backend private data, handed back unchanged to [`Backend::unmap`].
  pub extra: usize,
}

/// Source of virtual memory for an allocator.
///
/// # Safety
/// Implementations must return regions that are readable, writable, zero
/// filled, aligned to the requested alignment and not aliased by any other
/// live mapping. `unmap` must accept every region previously produced by
/// `map` with the same `align_offset` and `extra`.
pub unsafe trait Backend: Send + Sync {
  /// Granularity of mappings. Must be a power of two.
  fn page_size(&self) -> usize;

  /// Switches to huge pages when the platform supports them. Returns whether
  /// huge pages are in use afterwards; `page_size` reflects the switch.
  fn use_huge_pages(&mut self) -> bool {
    false
  }

  /// Maps `size` bytes (a multiple of the page size) aligned to `align`
  /// (a power of two). Returns `None` when the memory is not available.
  fn map(&self, size: usize, align: usize) -> Option<Mapping>;

  /// Returns memory to the backend.
  ///
  /// With `release == 0` the `size` bytes at `ptr` are only decommitted and
  /// stay reserved. Otherwise the whole reservation of `release` bytes that
  /// started at `ptr` when mapped is given back.
  ///
  /// # Safety
  /// `ptr`, `align_offset` and `extra` must describe a live mapping from
  /// [`Backend::map`]; the memory must not be used afterwards.
  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align_offset: usize, release: usize, extra: usize);
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
