//! Error types for BrambleDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using BrambleError.
pub type Result<T> = std::result::Result<T, BrambleError>;

/// Errors that can occur in BrambleDB operations.
#[derive(Debug, Error)]
pub enum BrambleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("page {0} does not exist on disk")]
    PageOutOfBounds(PageId),

    #[error("key not found")]
    KeyNotFound,

    #[error("invalid node type tag {0}")]
    InvalidNodeType(u8),

    #[error("header page full, cannot register another index")]
    HeaderFull,

    #[error("b+ tree corrupted: {0}")]
    TreeCorrupted(String),

    #[error("configuration error: {0}")]
    Config(String),
}
