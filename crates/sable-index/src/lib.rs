//! Disk-resident concurrent B+ tree index for SableDB.
//!
//! The tree maps fixed-width keys to fixed-width tuple identifiers with
//! unique-key semantics. It supports point lookup, range scan via a forward
//! iterator, insertion with node splits, and deletion with borrow/merge
//! rebalancing. All node pages live in the buffer pool; the tree never
//! touches page bytes except through latched page guards.
//!
//! Concurrency follows crab-latching with safe-node release: write descents
//! latch root-to-leaf, dropping every retained ancestor (and the header
//! guard) the moment a node proves it can absorb the pending structural
//! change. Read descents hold at most two shared latches at a time.

mod context;
mod iterator;
mod key;
mod page;
mod tree;

pub use iterator::IndexIterator;
pub use key::{IndexKey, KeyComparator, OrdComparator};
pub use page::{
    node_kind, node_min_size, BTreeHeaderPage, BTreeHeaderPageMut, BTreeInternalPage,
    BTreeInternalPageMut, BTreeLeafPage, BTreeLeafPageMut, NodeKind, NODE_HEADER_SIZE,
};
pub use tree::BTreeIndex;
