//! Buffer pool management for SableDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - Clock eviction policy for cache management
//! - Pin counting for concurrent access
//! - Dirty page tracking for write-back
//! - Latched page guards (read / write / pin-only) for index operations

mod frame;
mod guard;
mod page_table;
mod pool;
mod replacer;

pub use frame::{BufferFrame, FrameId};
pub use guard::{BasicPageGuard, ReadPageGuard, WritePageGuard};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats, EvictedPage};
pub use replacer::ClockReplacer;
