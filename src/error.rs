use thiserror::Error;

/// Why an allocator could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
  #[error("buffer of {len} bytes is smaller than the {need} bytes of fixed overhead")]
  BufferTooSmall { len: usize, need: usize },

  #[error("page size {0} is not usable")]
  InvalidPageSize(usize),

  #[error("item size must be non-zero")]
  ZeroItemSize,

  #[error("native mapping of {0} bytes failed")]
  MapFailed(usize),
}
