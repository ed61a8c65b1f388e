#[cfg(test)]
mod tests;

use std::io;
use thiserror::Error;

/// Canonical error type shared across the storage engine.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("capacity exhausted: {0}")]
    Capacity(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Logical identifier for a table registered with a `Database`.
pub type TableName = String;

/// Number of bytes a single fixed-width column cell occupies on disk.
pub const CELL_SIZE: usize = 8;

/// Design-fixed engine constants, exposed as a builder so tests can shrink
/// them (page size, buffer pool capacity, range width, merge threshold).
///
/// # Example
/// ```
/// use common::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .page_size(4096)
///     .buffer_pool_frames(64)
///     .base_pages_per_range(16)
///     .merge_tail_page_threshold(4)
///     .build();
/// assert_eq!(config.records_per_page(), 512);
/// ```
#[derive(Clone, Copy, Debug, bon::Builder)]
pub struct EngineConfig {
    /// Fixed-size page allocation in bytes.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Number of frames the buffer pool keeps resident.
    #[builder(default = 64)]
    pub buffer_pool_frames: usize,
    /// Number of base pages grouped into one range.
    #[builder(default = 16)]
    pub base_pages_per_range: u64,
    /// Tail pages created for the RID column before a merge is requested.
    #[builder(default = 4)]
    pub merge_tail_page_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            buffer_pool_frames: 64,
            base_pages_per_range: 16,
            merge_tail_page_threshold: 4,
        }
    }
}

impl EngineConfig {
    /// Records a single column page can hold, `page_size / CELL_SIZE`.
    pub fn records_per_page(&self) -> usize {
        self.page_size / CELL_SIZE
    }

    /// Base records grouped into a single range.
    pub fn records_per_range(&self) -> u64 {
        self.base_pages_per_range * self.records_per_page() as u64
    }
}
