#![allow(clippy::missing_safety_doc)]
//! Thread-caching span allocator.
//!
//! Memory is carved into power-of-two aligned spans. Small and medium
//! requests are served from size-classed spans owned by a heap, large
//! requests take runs of whole spans and huge requests go straight to the
//! backend. Freed spans flow through a per-heap cache and a shared lock-free
//! cache before being returned.
//!
//! ```no_run
//! use spanheap::Allocator;
//!
//! let allocator = Allocator::with_defaults()?;
//! let heap = allocator.heap()?;
//! let block = heap.allocate(100)?;
//! unsafe { heap.free(block) };
//! # Ok::<(), spanheap::Error>(())
//! ```

mod allocator;
mod backend;
mod config;
mod context;
mod error;
mod global;
mod global_cache;
mod heap;
mod size_class;
mod span;
mod stats;
mod tagged;

pub use allocator::{Allocator, HeapHandle};
pub use backend::{ArenaBackend, Backend, Mapping, SystemBackend};
pub use config::{Config, DEFAULT_SPAN_MAP_COUNT, DEFAULT_SPAN_SIZE, MAX_SPAN_SIZE, MIN_PAGE_SIZE, MIN_SPAN_SIZE, Settings};
pub use context::ReallocFlags;
pub use error::{Error, Result};
pub use global::{GlobalSpanHeap, spanheap_free, spanheap_malloc};
pub use size_class::{
  LARGE_CLASS_COUNT, MEDIUM_CLASS_COUNT, MEDIUM_GRANULARITY, SIZE_CLASS_COUNT, SMALL_CLASS_COUNT, SMALL_GRANULARITY, SMALL_SIZE_LIMIT,
  SizeClass, SizeClassTable,
};
pub use span::{SPAN_HEADER_SIZE, SpanState};
pub use stats::{ClassUse, GlobalStats, HeapStats, SpanInfo, SpanUse};

#[cfg(feature = "c_api")]
pub use global::{aligned_alloc, calloc, free, malloc, malloc_usable_size, posix_memalign, realloc};
