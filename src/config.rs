use crate::error::{Error, Result};

/// Default span size (64 KiB).
pub const DEFAULT_SPAN_SIZE: usize = 64 * 1024;
/// Default number of spans requested from the backend per mapping call.
pub const DEFAULT_SPAN_MAP_COUNT: usize = 64;
/// Smallest span size accepted by [`Config::validate`].
pub const MIN_SPAN_SIZE: usize = 4 * 1024;
/// Largest span size accepted by [`Config::validate`].
pub const MAX_SPAN_SIZE: usize = 256 * 1024 * 1024;
/// Heaps are mapped at page granularity; the orphan stack needs this many
/// low bits for its ABA tag.
pub const MIN_PAGE_SIZE: usize = 512;

/// Thread cache hard limit, as a multiple of the release threshold.
pub(crate) const THREAD_CACHE_MULTIPLIER: usize = 4;

/// Runtime configuration of an [`Allocator`](crate::Allocator).
///
/// Zero values mean "pick the default". Everything is resolved once in
/// [`Config::validate`] and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Page size used for huge allocations and decommit granularity.
  /// 0 = ask the backend.
  pub page_size: usize,
  /// Size and alignment of a span. Must be a power of two.
  pub span_size: usize,
  /// Number of spans mapped per backend call. Excess becomes heap reserve.
  pub span_map_count: usize,
  /// Ask the backend for huge pages.
  pub enable_huge_pages: bool,
  /// Upper bound on bytes mapped through the backend.
  pub memory_limit: Option<usize>,
  /// Keep freed spans in per-heap caches.
  pub thread_cache: bool,
  /// Keep spans released by thread caches in the shared cache.
  pub global_cache: bool,
  /// Size thread caches from their high-water mark instead of a fixed threshold.
  pub adaptive_thread_cache: bool,
  /// Never unmap spans offered to the global cache.
  pub unlimited_global_cache: bool,
  /// Global cache capacity, as a multiple of the thread cache hard limit.
  pub global_cache_multiplier: usize,
  /// Check sizes and alignments for overflow before using them.
  pub validate_args: bool,
}

impl Config {
  pub const DEFAULT: Config = Config {
    page_size: 0,
    span_size: DEFAULT_SPAN_SIZE,
    span_map_count: DEFAULT_SPAN_MAP_COUNT,
    enable_huge_pages: false,
    memory_limit: None,
    thread_cache: true,
    global_cache: true,
    adaptive_thread_cache: false,
    unlimited_global_cache: false,
    global_cache_multiplier: 8,
    validate_args: true,
  };

  pub const fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub const fn with_span_size(mut self, span_size: usize) -> Self {
    self.span_size = span_size;
    self
  }

  pub const fn with_span_map_count(mut self, count: usize) -> Self {
    self.span_map_count = count;
    self
  }

  pub const fn with_huge_pages(mut self, enable: bool) -> Self {
    self.enable_huge_pages = enable;
    self
  }

  pub const fn with_memory_limit(mut self, limit: usize) -> Self {
    self.memory_limit = Some(limit);
    self
  }

  pub const fn with_thread_cache(mut self, enable: bool) -> Self {
    self.thread_cache = enable;
    self
  }

  pub const fn with_global_cache(mut self, enable: bool) -> Self {
    self.global_cache = enable;
    self
  }

  pub const fn with_adaptive_thread_cache(mut self, enable: bool) -> Self {
    self.adaptive_thread_cache = enable;
    self
  }

  pub const fn with_unlimited_global_cache(mut self, enable: bool) -> Self {
    self.unlimited_global_cache = enable;
    self
  }

  pub const fn with_validate_args(mut self, enable: bool) -> Self {
    self.validate_args = enable;
    self
  }

  /// Resolves defaults against the backend page size and checks every value.
  pub fn validate(&self, backend_page_size: usize) -> Result<Settings> {
    let page_size = if self.page_size == 0 {
      backend_page_size
    } else {
      self.page_size
    };
    if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
      return Err(Error::InvalidArgument("page size must be a power of two >= 512"));
    }
    if page_size % backend_page_size != 0 {
      return Err(Error::InvalidArgument(
        "page size must be a multiple of the backend page size",
      ));
    }

    let span_size = if self.span_size == 0 {
      DEFAULT_SPAN_SIZE
    } else {
      self.span_size
    };
    if !span_size.is_power_of_two() {
      return Err(Error::InvalidArgument("span size must be a power of two"));
    }
    if !(MIN_SPAN_SIZE..=MAX_SPAN_SIZE).contains(&span_size) {
      return Err(Error::Unsupported("span size out of range"));
    }

    let mut span_map_count = if self.span_map_count == 0 {
      DEFAULT_SPAN_MAP_COUNT
    } else {
      self.span_map_count
    };
    if span_map_count > u32::MAX as usize / 2 {
      return Err(Error::InvalidArgument("span map count too large"));
    }
    // A mapping must cover at least one whole page.
    if page_size > span_size && span_map_count * span_size < page_size {
      span_map_count = page_size / span_size;
    }
    if page_size >= span_size && (span_map_count * span_size) % page_size != 0 {
      span_map_count = page_size / span_size;
    }

    let release_count = span_map_count.clamp(4, 64);
    let release_count_large = if release_count > 8 {
      release_count / 4
    } else {
      2
    };

    if self.global_cache_multiplier == 0 {
      return Err(Error::InvalidArgument("global cache multiplier must be non-zero"));
    }

    Ok(Settings {
      page_size,
      page_shift: page_size.trailing_zeros(),
      span_size,
      span_shift: span_size.trailing_zeros(),
      span_mask: !(span_size - 1),
      span_map_count,
      release_count,
      release_count_large,
      huge_pages: self.enable_huge_pages,
      memory_limit: self.memory_limit,
      thread_cache: self.thread_cache,
      global_cache: self.global_cache,
      adaptive_thread_cache: self.adaptive_thread_cache,
      unlimited_global_cache: self.unlimited_global_cache,
      global_cache_multiplier: self.global_cache_multiplier,
      validate_args: self.validate_args,
    })
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// Fully resolved configuration, shared by every heap of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
  pub page_size: usize,
  pub page_shift: u32,
  pub span_size: usize,
  pub span_shift: u32,
  /// Mask that rounds an address down to its span start.
  pub span_mask: usize,
  pub span_map_count: usize,
  /// Thread cache threshold for single spans.
  pub release_count: usize,
  /// Thread cache threshold for multi-span buckets.
  pub release_count_large: usize,
  pub huge_pages: bool,
  pub memory_limit: Option<usize>,
  pub thread_cache: bool,
  pub global_cache: bool,
  pub adaptive_thread_cache: bool,
  pub unlimited_global_cache: bool,
  pub global_cache_multiplier: usize,
  pub validate_args: bool,
}

impl Settings {
  /// Release threshold of the thread cache bucket holding `span_count` spans.
  #[inline]
  pub(crate) fn release_count(&self, span_count: usize) -> usize {
    if span_count == 1 {
      self.release_count
    } else {
      self.release_count_large
    }
  }

  /// Hard limit of a thread cache bucket.
  #[inline]
  pub(crate) fn thread_cache_limit(&self, span_count: usize) -> usize {
    self.release_count(span_count) * THREAD_CACHE_MULTIPLIER
  }

  /// Number of spans the global cache keeps for one span-count bucket.
  #[inline]
  pub(crate) fn global_cache_limit(&self, span_count: usize) -> usize {
    self.global_cache_multiplier * self.thread_cache_limit(span_count)
  }

  /// Spans to request from the backend when `span_count` are needed.
  pub(crate) fn map_span_count(&self, span_count: usize) -> usize {
    let mut request = span_count.max(self.span_map_count);
    if self.page_size > self.span_size && (request * self.span_size) % self.page_size != 0 {
      request += self.span_map_count - (request % self.span_map_count);
    }
    request
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_resolve() {
    let settings = Config::default().validate(4096).unwrap();
    assert_eq!(settings.page_size, 4096);
    assert_eq!(settings.span_size, DEFAULT_SPAN_SIZE);
    assert_eq!(settings.span_shift, 16);
    assert_eq!(settings.span_mask, !0xFFFF);
    assert_eq!(settings.span_map_count, 64);
    assert_eq!(settings.release_count, 64);
    assert_eq!(settings.release_count_large, 16);
  }

  #[test]
  fn rejects_bad_span_sizes() {
    assert!(matches!(
      Config::default().with_span_size(3000).validate(4096),
      Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
      Config::default().with_span_size(2048).validate(4096),
      Err(Error::Unsupported(_))
    ));
    assert!(matches!(
      Config::default().with_page_size(100).validate(4096),
      Err(Error::InvalidArgument(_))
    ));
  }

  #[test]
  fn huge_pages_round_map_count() {
    let settings = Config::default()
      .with_span_size(64 * 1024)
      .with_span_map_count(4)
      .validate(2 * 1024 * 1024)
      .unwrap();
    // 4 * 64 KiB does not fill a 2 MiB page.
    assert_eq!(settings.span_map_count, 32);
    assert_eq!(settings.map_span_count(1) * settings.span_size % settings.page_size, 0);
  }
}
