//! Forward leaf-sibling cursor.

use crate::key::IndexKey;
use crate::page::{node_kind, BTreeLeafPage, NodeKind};
use sable_buffer::{BufferPool, ReadPageGuard};
use sable_common::page::PageId;
use sable_common::types::TupleId;
use std::marker::PhantomData;

/// Forward-only cursor over the tree's leaves.
///
/// Holds a shared latch on the current leaf between `advance` calls and
/// nothing else. Moving to the right sibling captures `next_page_id`
/// while the current leaf is still latched, then releases it before
/// latching the sibling, so the cursor never holds two latches and never
/// blocks while holding one.
///
/// A concurrent merge may free the captured sibling before the cursor
/// reaches it. The pool never reuses page ids, so the stale fetch fails
/// (or finds a non-leaf or drained page) and the scan terminates instead
/// of reading freed bytes.
pub struct IndexIterator<'a, K> {
    pool: &'a BufferPool,
    guard: Option<ReadPageGuard<'a>>,
    page_id: PageId,
    slot: usize,
    _marker: PhantomData<K>,
}

impl<'a, K: IndexKey> IndexIterator<'a, K> {
    /// Cursor positioned at `slot` of the latched leaf.
    ///
    /// If `slot` is past the leaf's last entry the cursor moves on to the
    /// first following leaf with entries, or becomes the end cursor.
    pub(crate) fn from_position(
        pool: &'a BufferPool,
        guard: ReadPageGuard<'a>,
        slot: usize,
    ) -> Self {
        let page_id = guard.page_id();
        let mut iter = Self {
            pool,
            guard: Some(guard),
            page_id,
            slot,
            _marker: PhantomData,
        };
        let (size, next) = {
            let leaf = BTreeLeafPage::<K>::new(iter.guard.as_ref().unwrap().data());
            (leaf.size(), leaf.next_page_id())
        };
        if slot >= size {
            iter.guard = None;
            iter.move_to_leaf(next);
        }
        iter
    }

    /// The end cursor.
    pub(crate) fn end(pool: &'a BufferPool) -> Self {
        Self {
            pool,
            guard: None,
            page_id: PageId::INVALID,
            slot: 0,
            _marker: PhantomData,
        }
    }

    /// Returns true if the cursor is past the last entry.
    pub fn is_end(&self) -> bool {
        !self.page_id.is_valid()
    }

    /// Returns the entry under the cursor.
    ///
    /// Panics if the cursor is at the end.
    pub fn entry(&self) -> (K, TupleId) {
        let guard = self.guard.as_ref().expect("dereferenced end iterator");
        let leaf = BTreeLeafPage::<K>::new(guard.data());
        (leaf.key_at(self.slot), leaf.value_at(self.slot))
    }

    /// Returns the key under the cursor.
    pub fn key(&self) -> K {
        self.entry().0
    }

    /// Returns the value under the cursor.
    pub fn value(&self) -> TupleId {
        self.entry().1
    }

    /// Moves the cursor one entry forward.
    ///
    /// A no-op at the end.
    pub fn advance(&mut self) {
        let Some(guard) = self.guard.as_ref() else {
            return;
        };
        let (size, next) = {
            let leaf = BTreeLeafPage::<K>::new(guard.data());
            (leaf.size(), leaf.next_page_id())
        };

        self.slot += 1;
        if self.slot < size {
            return;
        }

        // Sibling id captured above, under the current leaf's latch.
        self.guard = None;
        self.move_to_leaf(next);
    }

    /// Latches the first leaf with entries at or after `next`, walking the
    /// sibling chain. Becomes the end cursor when the chain runs out or a
    /// captured sibling no longer resolves to a live leaf.
    fn move_to_leaf(&mut self, mut next: PageId) {
        debug_assert!(self.guard.is_none());
        while next.is_valid() {
            let Ok(guard) = self.pool.fetch_read(next) else {
                break; // leaf merged away and freed mid-scan
            };
            if node_kind(guard.data()) != Some(NodeKind::Leaf) {
                break;
            }
            let leaf = BTreeLeafPage::<K>::new(guard.data());
            if leaf.size() > 0 {
                let page_id = guard.page_id();
                drop(leaf);
                self.guard = Some(guard);
                self.page_id = page_id;
                self.slot = 0;
                return;
            }
            // Drained by a merge; its entries moved left, behind the cursor.
            next = leaf.next_page_id();
        }
        self.page_id = PageId::INVALID;
        self.slot = 0;
    }
}

impl<K> PartialEq for IndexIterator<'_, K> {
    /// Two cursors are equal iff both are at the end or both name the
    /// same leaf slot.
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.slot == other.slot
    }
}

impl<K> Eq for IndexIterator<'_, K> {}

impl<K: IndexKey> Iterator for IndexIterator<'_, K> {
    type Item = (K, TupleId);

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_end() {
            return None;
        }
        let entry = self.entry();
        self.advance();
        Some(entry)
    }
}
