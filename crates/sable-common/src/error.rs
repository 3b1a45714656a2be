//! Error types for SableDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using SableError.
pub type Result<T> = std::result::Result<T, SableError>;

/// Errors that can occur in SableDB operations.
#[derive(Debug, Error)]
pub enum SableError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page corrupted: {page_id}, reason: {reason}")]
    PageCorrupted { page_id: PageId, reason: String },

    // B+ tree errors
    #[error("Invalid node kind byte: {0:#04x}")]
    InvalidNodeKind(u8),

    #[error("B+ tree corrupted: {0}")]
    TreeCorrupted(String),
}
