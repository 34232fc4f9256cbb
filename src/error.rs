use thiserror::Error;

/// Failure of an allocator operation.
///
/// Allocation failures are plain values: nothing in this crate retries a
/// failed mapping or unwinds on exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The backend refused to map memory, or the configured memory limit
  /// would be exceeded.
  #[error("out of memory")]
  OutOfMemory,
  /// A size or alignment argument overflowed or was malformed.
  #[error("invalid argument: {0}")]
  InvalidArgument(&'static str),
  /// The request is well formed but cannot be served by this allocator.
  #[error("unsupported: {0}")]
  Unsupported(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
