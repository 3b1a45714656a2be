//! B+ tree index over buffer-pool pages.

use crate::context::Context;
use crate::iterator::IndexIterator;
use crate::key::{IndexKey, KeyComparator};
use crate::page::{
    node_kind, node_max_size, node_min_size, node_size, BTreeHeaderPage, BTreeHeaderPageMut,
    BTreeInternalPage, BTreeInternalPageMut, BTreeLeafPage, BTreeLeafPageMut, NodeKind,
};
use sable_buffer::{BufferPool, WritePageGuard};
use sable_common::page::PageId;
use sable_common::types::TupleId;
use sable_common::{Result, SableError};
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Concurrent B+ tree mapping fixed-width keys to tuple ids.
///
/// Keys are unique. All page access goes through latched guards from the
/// buffer pool; reads crab-latch root-to-leaf with shared latches, writes
/// descend with exclusive latches and release retained ancestors at the
/// first safe node.
pub struct BTreeIndex<K, C> {
    name: String,
    header_page_id: PageId,
    pool: Arc<BufferPool>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<fn(K)>,
}

impl<K: IndexKey, C: KeyComparator<K>> BTreeIndex<K, C> {
    /// Creates a tree over an already-allocated header page and resets it
    /// to empty (`root_page_id = INVALID`).
    pub fn new(
        name: impl Into<String>,
        header_page_id: PageId,
        pool: Arc<BufferPool>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(
            (3..=BTreeLeafPage::<K>::slot_capacity()).contains(&leaf_max_size),
            "leaf_max_size out of range"
        );
        assert!(
            (3..=BTreeInternalPage::<K>::slot_capacity()).contains(&internal_max_size),
            "internal_max_size out of range"
        );

        let tree = Self {
            name: name.into(),
            header_page_id,
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        };

        let mut header = tree.pool.fetch_write(header_page_id)?;
        BTreeHeaderPageMut::new(header.data_mut()).set_root_page_id(PageId::INVALID);
        drop(header);

        Ok(tree)
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let guard = self.pool.fetch_read(self.header_page_id)?;
        Ok(!BTreeHeaderPage::new(guard.data()).root_page_id().is_valid())
    }

    /// Returns the current root page id (`INVALID` when empty).
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.pool.fetch_read(self.header_page_id)?;
        Ok(BTreeHeaderPage::new(guard.data()).root_page_id())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Point lookup. On a hit the value is appended to `result` and true
    /// is returned; keys are unique, so at most one value is appended.
    pub fn get(&self, key: &K, result: &mut Vec<TupleId>) -> Result<bool> {
        let header = self.pool.fetch_read(self.header_page_id)?;
        let root_id = BTreeHeaderPage::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(false);
        }

        let mut guard = self.pool.fetch_read(root_id)?;
        drop(header);

        loop {
            match self.kind_of(guard.page_id(), guard.data())? {
                NodeKind::Leaf => break,
                NodeKind::Internal => {
                    let child = {
                        let node = BTreeInternalPage::<K>::new(guard.data());
                        node.child_at(self.route(&node, key))
                    };
                    // Child latched by the fetch before the assignment
                    // releases the parent.
                    guard = self.pool.fetch_read(child)?;
                }
            }
        }

        let leaf = BTreeLeafPage::<K>::new(guard.data());
        if let Some(pos) = self.floor_slot(&leaf, key) {
            if self.comparator.compare(&leaf.key_at(pos), key) == Ordering::Equal {
                result.push(leaf.value_at(pos));
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Inserts a key/value pair. Returns false (and changes nothing) if
    /// the key is already present.
    pub fn insert(&self, key: K, value: TupleId) -> Result<bool> {
        let mut ctx = Context::new();
        let mut header = self.pool.fetch_write(self.header_page_id)?;
        let root_id = BTreeHeaderPage::new(header.data()).root_page_id();

        if !root_id.is_valid() {
            // Start a new tree: a single leaf holding the pair.
            let root = self.pool.allocate_page()?;
            let new_root_id = root.page_id();
            let mut root_guard = root.upgrade_write();
            let mut leaf = BTreeLeafPageMut::<K>::new(root_guard.data_mut());
            leaf.init(self.leaf_max_size);
            leaf.set_size(1);
            leaf.set_key_at(0, &key);
            leaf.set_value_at(0, value);
            BTreeHeaderPageMut::new(header.data_mut()).set_root_page_id(new_root_id);
            debug!(index = %self.name, root = %new_root_id, "started new tree");
            return Ok(true);
        }

        ctx.root_page_id = root_id;
        // Latch the root before the header guard moves out of scope: the
        // header is the root's parent in the latch order.
        let mut guard = self.pool.fetch_write(root_id)?;
        ctx.header = Some(header);

        loop {
            match self.kind_of(guard.page_id(), guard.data())? {
                NodeKind::Leaf => {
                    ctx.write_set.push_back(guard);
                    break;
                }
                NodeKind::Internal => {
                    let child = {
                        let node = BTreeInternalPage::<K>::new(guard.data());
                        // Safe for insert: can absorb a separator without
                        // splitting, so nothing above can be touched.
                        if node.size() < node.max_size() - 1 {
                            ctx.release_ancestors();
                        }
                        node.child_at(self.route(&node, &key))
                    };
                    ctx.write_set.push_back(guard);
                    guard = self.pool.fetch_write(child)?;
                }
            }
        }

        // Insert into the leaf; duplicate keys fail without mutating.
        {
            let back = ctx.write_set.back_mut().expect("leaf guard");
            let pos = {
                let leaf = BTreeLeafPage::<K>::new(back.data());
                let pos = self.floor_slot(&leaf, &key);
                if let Some(p) = pos {
                    if self.comparator.compare(&leaf.key_at(p), &key) == Ordering::Equal {
                        return Ok(false);
                    }
                }
                pos
            };
            let insert_at = pos.map_or(0, |p| p + 1);
            let mut leaf = BTreeLeafPageMut::<K>::new(back.data_mut());
            leaf.shift_right(insert_at);
            leaf.set_key_at(insert_at, &key);
            leaf.set_value_at(insert_at, value);
        }

        // Split cascade: every retained ancestor below the topmost can
        // absorb exactly the one separator its child's split promotes.
        while ctx.write_set.len() > 1 {
            let full = {
                let back = ctx.write_set.back().expect("cascade node");
                node_size(back.data()) == node_max_size(back.data())
            };
            if !full {
                break;
            }

            let mut node_guard = ctx.write_set.pop_back().expect("cascade node");
            let (mid_key, right_id) = self.split_node(&mut node_guard)?;
            drop(node_guard);

            let parent = ctx.write_set.back_mut().expect("cascade parent");
            let pos = {
                let node = BTreeInternalPage::<K>::new(parent.data());
                self.route(&node, &mid_key)
            };
            let mut node = BTreeInternalPageMut::<K>::new(parent.data_mut());
            node.shift_right(pos + 1);
            node.set_key_at(pos + 1, &mid_key);
            node.set_child_at(pos + 1, right_id);
        }

        // Root growth: only the root may still be full here, because any
        // other topmost ancestor was retained for being safe.
        let full = {
            let back = ctx.write_set.back().expect("topmost node");
            node_size(back.data()) == node_max_size(back.data())
        };
        if full {
            let mut old_root_guard = ctx.write_set.pop_back().expect("topmost node");
            let old_root_id = old_root_guard.page_id();
            if old_root_id != ctx.root_page_id {
                return Err(SableError::TreeCorrupted(
                    "full topmost ancestor is not the root".to_string(),
                ));
            }
            let (mid_key, right_id) = self.split_node(&mut old_root_guard)?;

            let new_root = self.pool.allocate_page()?;
            let new_root_id = new_root.page_id();
            let mut new_root_guard = new_root.upgrade_write();
            let mut root = BTreeInternalPageMut::<K>::new(new_root_guard.data_mut());
            root.init(self.internal_max_size);
            root.set_size(2);
            root.set_child_at(0, old_root_id);
            root.set_key_at(1, &mid_key);
            root.set_child_at(1, right_id);

            let header = ctx.header.as_mut().ok_or_else(|| {
                SableError::TreeCorrupted("header released before root growth".to_string())
            })?;
            BTreeHeaderPageMut::new(header.data_mut()).set_root_page_id(new_root_id);
            debug!(index = %self.name, old_root = %old_root_id, new_root = %new_root_id, "root grew");
        }

        Ok(true)
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Removes a key. Absent keys are a no-op.
    pub fn remove(&self, key: &K) -> Result<()> {
        let mut ctx = Context::new();
        let header = self.pool.fetch_write(self.header_page_id)?;
        let root_id = BTreeHeaderPage::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(());
        }

        ctx.root_page_id = root_id;
        let mut guard = self.pool.fetch_write(root_id)?;
        ctx.header = Some(header);

        loop {
            match self.kind_of(guard.page_id(), guard.data())? {
                NodeKind::Leaf => {
                    ctx.write_set.push_back(guard);
                    break;
                }
                NodeKind::Internal => {
                    let child = {
                        let node = BTreeInternalPage::<K>::new(guard.data());
                        // Safe for delete: losing a separator cannot push
                        // this node below minimum occupancy.
                        if node.size() > node.min_size() {
                            ctx.release_ancestors();
                        }
                        node.child_at(self.route(&node, key))
                    };
                    ctx.write_set.push_back(guard);
                    guard = self.pool.fetch_write(child)?;
                }
            }
        }

        // Delete from the leaf.
        {
            let back = ctx.write_set.back_mut().expect("leaf guard");
            let pos = {
                let leaf = BTreeLeafPage::<K>::new(back.data());
                match self.floor_slot(&leaf, key) {
                    Some(p)
                        if self.comparator.compare(&leaf.key_at(p), key) == Ordering::Equal =>
                    {
                        p
                    }
                    _ => return Ok(()),
                }
            };
            let mut leaf = BTreeLeafPageMut::<K>::new(back.data_mut());
            leaf.shift_left(pos);
        }

        // Underflow cascade. The loop never reaches the topmost retained
        // guard: a safe ancestor stays above minimum after losing one
        // separator, and the root is handled separately below.
        while ctx.write_set.len() > 1 {
            let underfull = {
                let back = ctx.write_set.back().expect("cascade node");
                node_size(back.data()) < node_min_size(node_max_size(back.data()))
            };
            if !underfull {
                break;
            }
            self.rebalance_once(&mut ctx)?;
        }

        self.adjust_root(&mut ctx)?;

        let freed = std::mem::take(&mut ctx.freed_pages);
        drop(ctx);
        for page_id in freed {
            self.pool.deallocate_page(page_id);
        }
        Ok(())
    }

    // ========================================================================
    // Iterators
    // ========================================================================

    /// Cursor at the first entry of the tree.
    pub fn begin(&self) -> Result<IndexIterator<'_, K>> {
        let pool: &BufferPool = &self.pool;
        let header = pool.fetch_read(self.header_page_id)?;
        let root_id = BTreeHeaderPage::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(IndexIterator::end(pool));
        }

        let mut guard = pool.fetch_read(root_id)?;
        drop(header);

        loop {
            match self.kind_of(guard.page_id(), guard.data())? {
                NodeKind::Leaf => break,
                NodeKind::Internal => {
                    let child = BTreeInternalPage::<K>::new(guard.data()).child_at(0);
                    guard = pool.fetch_read(child)?;
                }
            }
        }

        Ok(IndexIterator::from_position(pool, guard, 0))
    }

    /// Cursor at the smallest entry with key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<IndexIterator<'_, K>> {
        let pool: &BufferPool = &self.pool;
        let header = pool.fetch_read(self.header_page_id)?;
        let root_id = BTreeHeaderPage::new(header.data()).root_page_id();
        if !root_id.is_valid() {
            return Ok(IndexIterator::end(pool));
        }

        let mut guard = pool.fetch_read(root_id)?;
        drop(header);

        loop {
            match self.kind_of(guard.page_id(), guard.data())? {
                NodeKind::Leaf => break,
                NodeKind::Internal => {
                    let child = {
                        let node = BTreeInternalPage::<K>::new(guard.data());
                        node.child_at(self.route(&node, key))
                    };
                    guard = pool.fetch_read(child)?;
                }
            }
        }

        let slot = {
            let leaf = BTreeLeafPage::<K>::new(guard.data());
            match self.floor_slot(&leaf, key) {
                Some(p)
                    if self.comparator.compare(&leaf.key_at(p), key) == Ordering::Equal =>
                {
                    p
                }
                Some(p) => p + 1,
                None => 0,
            }
        };
        Ok(IndexIterator::from_position(pool, guard, slot))
    }

    /// The end cursor.
    pub fn end(&self) -> IndexIterator<'_, K> {
        IndexIterator::end(&self.pool)
    }

    // ========================================================================
    // Binary search
    // ========================================================================

    /// Rightmost leaf slot whose key is <= `key`, or None if every key is
    /// greater.
    fn floor_slot(&self, leaf: &BTreeLeafPage<'_, K>, key: &K) -> Option<usize> {
        let mut lo = 0;
        let mut hi = leaf.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.comparator.compare(&leaf.key_at(mid), key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo.checked_sub(1)
    }

    /// Slot of the child to descend into for `key`.
    ///
    /// Searches slots `1..size` for the rightmost separator <= `key` and
    /// returns 0 when `key` sorts before every separator: slot 0's key is
    /// treated as negative infinity, so `child_0` covers that range. At
    /// equal keys the rightmost matching separator wins, keeping routing
    /// consistent with the left-closed ranges the separators bound.
    fn route(&self, node: &BTreeInternalPage<'_, K>, key: &K) -> usize {
        let mut lo = 1;
        let mut hi = node.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.comparator.compare(&node.key_at(mid), key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo - 1
    }

    // ========================================================================
    // Structural helpers
    // ========================================================================

    fn kind_of(&self, page_id: PageId, data: &[u8]) -> Result<NodeKind> {
        node_kind(data).ok_or_else(|| SableError::PageCorrupted {
            page_id,
            reason: "not a b+ tree node".to_string(),
        })
    }

    /// Splits the full node behind `guard` and returns the separator to
    /// promote along with the new right sibling's page id.
    fn split_node(&self, guard: &mut WritePageGuard<'_>) -> Result<(K, PageId)> {
        let page_id = guard.page_id();
        match self.kind_of(page_id, guard.data())? {
            NodeKind::Leaf => self.split_leaf(guard),
            NodeKind::Internal => self.split_internal(guard),
        }
    }

    /// Leaf split: upper half moves to a fresh right sibling, the sibling
    /// chain is relinked, and the promoted separator is the right page's
    /// first key (which stays stored there).
    fn split_leaf(&self, guard: &mut WritePageGuard<'_>) -> Result<(K, PageId)> {
        let right = self.pool.allocate_page()?;
        let right_id = right.page_id();
        let mut right_guard = right.upgrade_write();

        let mut left = BTreeLeafPageMut::<K>::new(guard.data_mut());
        let mut right = BTreeLeafPageMut::<K>::new(right_guard.data_mut());
        right.init(self.leaf_max_size);
        right.set_next_page_id(left.next_page_id());
        left.set_next_page_id(right_id);

        let size = left.size();
        let lsize = size / 2;
        for i in lsize..size {
            right.set_key_at(i - lsize, &left.key_at(i));
            right.set_value_at(i - lsize, left.value_at(i));
        }
        right.set_size(size - lsize);
        left.set_size(lsize);

        let mid_key = right.key_at(0);
        debug!(index = %self.name, left = %guard.page_id(), right = %right_id, "leaf split");
        Ok((mid_key, right_id))
    }

    /// Internal split: the middle key is promoted (not stored in the right
    /// page, whose slot 0 keeps only the child pointer), the upper slots
    /// move right.
    fn split_internal(&self, guard: &mut WritePageGuard<'_>) -> Result<(K, PageId)> {
        let right = self.pool.allocate_page()?;
        let right_id = right.page_id();
        let mut right_guard = right.upgrade_write();

        let mut left = BTreeInternalPageMut::<K>::new(guard.data_mut());
        let mut right = BTreeInternalPageMut::<K>::new(right_guard.data_mut());
        right.init(self.internal_max_size);

        let size = left.size();
        let lsize = size / 2;
        let mid_key = left.key_at(lsize);
        for i in lsize..size {
            if i > lsize {
                right.set_key_at(i - lsize, &left.key_at(i));
            }
            right.set_child_at(i - lsize, left.child_at(i));
        }
        right.set_size(size - lsize);
        left.set_size(lsize);

        debug!(index = %self.name, left = %guard.page_id(), right = %right_id, "internal split");
        Ok((mid_key, right_id))
    }

    /// Repairs the underfull node at the back of the write set using its
    /// parent (the guard directly above it) and a sibling: borrow when the
    /// sibling is above minimum, merge otherwise. The parent being
    /// write-latched is what licenses latching the sibling out of
    /// root-to-leaf order.
    fn rebalance_once(&self, ctx: &mut Context<'_>) -> Result<()> {
        let mut node_guard = ctx.write_set.pop_back().expect("underfull node");
        let node_id = node_guard.page_id();
        let parent_guard = ctx.write_set.back_mut().expect("parent of underfull node");

        let (node_pos, parent_size) = {
            let parent = BTreeInternalPage::<K>::new(parent_guard.data());
            let pos = parent.position_of_child(node_id).ok_or_else(|| {
                SableError::TreeCorrupted("node missing from its parent".to_string())
            })?;
            (pos, parent.size())
        };
        if parent_size < 2 {
            return Err(SableError::TreeCorrupted(
                "internal node with a single child".to_string(),
            ));
        }

        // Prefer the left sibling; child 0 falls back to the right one.
        let sibling_pos = if node_pos > 0 { node_pos - 1 } else { 1 };
        let sibling_id = BTreeInternalPage::<K>::new(parent_guard.data()).child_at(sibling_pos);
        let mut sibling_guard = self.pool.fetch_write(sibling_id)?;

        let kind = self.kind_of(node_id, node_guard.data())?;
        let sibling_rich = {
            let data = sibling_guard.data();
            node_size(data) > node_min_size(node_max_size(data))
        };

        if sibling_rich {
            match (kind, node_pos > 0) {
                (NodeKind::Leaf, true) => {
                    self.borrow_leaf_from_left(parent_guard, &mut node_guard, &mut sibling_guard, node_pos)
                }
                (NodeKind::Leaf, false) => {
                    self.borrow_leaf_from_right(parent_guard, &mut node_guard, &mut sibling_guard, 1)
                }
                (NodeKind::Internal, true) => {
                    self.borrow_internal_from_left(parent_guard, &mut node_guard, &mut sibling_guard, node_pos)
                }
                (NodeKind::Internal, false) => {
                    self.borrow_internal_from_right(parent_guard, &mut node_guard, &mut sibling_guard, 1)
                }
            }
            // Back at minimum occupancy; the cascade stops at this node.
            ctx.write_set.push_back(node_guard);
        } else {
            // Merge right into left; the right page is spliced out of the
            // parent and freed once every latch is gone.
            let (mut left_guard, mut right_guard, right_slot) = if node_pos > 0 {
                (sibling_guard, node_guard, node_pos)
            } else {
                (node_guard, sibling_guard, 1)
            };
            match kind {
                NodeKind::Leaf => {
                    self.merge_leaves(parent_guard, &mut left_guard, &mut right_guard, right_slot)
                }
                NodeKind::Internal => {
                    self.merge_internals(parent_guard, &mut left_guard, &mut right_guard, right_slot)
                }
            }
            ctx.freed_pages.push(right_guard.page_id());
        }
        Ok(())
    }

    /// Rotates the left sibling's last entry into the front of `node` and
    /// rewrites the parent separator to the node's new first key.
    fn borrow_leaf_from_left(
        &self,
        parent: &mut WritePageGuard<'_>,
        node: &mut WritePageGuard<'_>,
        left: &mut WritePageGuard<'_>,
        node_pos: usize,
    ) {
        let (key, value) = {
            let mut view = BTreeLeafPageMut::<K>::new(left.data_mut());
            let last = view.size() - 1;
            let entry = (view.key_at(last), view.value_at(last));
            view.increase_size(-1);
            entry
        };
        {
            let mut view = BTreeLeafPageMut::<K>::new(node.data_mut());
            view.shift_right(0);
            view.set_key_at(0, &key);
            view.set_value_at(0, value);
        }
        BTreeInternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_pos, &key);
        debug!(index = %self.name, node = %node.page_id(), from = %left.page_id(), "leaf borrowed from left");
    }

    /// Rotates the right sibling's first entry onto the end of `node` and
    /// rewrites the parent separator to the sibling's new first key.
    fn borrow_leaf_from_right(
        &self,
        parent: &mut WritePageGuard<'_>,
        node: &mut WritePageGuard<'_>,
        right: &mut WritePageGuard<'_>,
        right_pos: usize,
    ) {
        let (key, value, new_separator) = {
            let mut view = BTreeLeafPageMut::<K>::new(right.data_mut());
            let entry = (view.key_at(0), view.value_at(0));
            view.shift_left(0);
            (entry.0, entry.1, view.key_at(0))
        };
        {
            let mut view = BTreeLeafPageMut::<K>::new(node.data_mut());
            let size = view.size();
            view.set_key_at(size, &key);
            view.set_value_at(size, value);
            view.increase_size(1);
        }
        BTreeInternalPageMut::<K>::new(parent.data_mut()).set_key_at(right_pos, &new_separator);
        debug!(index = %self.name, node = %node.page_id(), from = %right.page_id(), "leaf borrowed from right");
    }

    /// Parent-key rotation from the left sibling: the parent separator
    /// drops in above the node's old first child, the sibling's last key
    /// rises into the parent, and the sibling's last child becomes the
    /// node's new first child.
    fn borrow_internal_from_left(
        &self,
        parent: &mut WritePageGuard<'_>,
        node: &mut WritePageGuard<'_>,
        left: &mut WritePageGuard<'_>,
        node_pos: usize,
    ) {
        let separator = BTreeInternalPage::<K>::new(parent.data()).key_at(node_pos);
        let (risen_key, moved_child) = {
            let mut view = BTreeInternalPageMut::<K>::new(left.data_mut());
            let last = view.size() - 1;
            let entry = (view.key_at(last), view.child_at(last));
            view.increase_size(-1);
            entry
        };
        {
            let mut view = BTreeInternalPageMut::<K>::new(node.data_mut());
            view.shift_right(0);
            // The old first child now sits in slot 1 with the dropped
            // separator as its lower bound.
            view.set_key_at(1, &separator);
            view.set_child_at(0, moved_child);
        }
        BTreeInternalPageMut::<K>::new(parent.data_mut()).set_key_at(node_pos, &risen_key);
        debug!(index = %self.name, node = %node.page_id(), from = %left.page_id(), "internal borrowed from left");
    }

    /// Parent-key rotation from the right sibling: the parent separator
    /// drops in above the sibling's first child, and the sibling's first
    /// real key rises into the parent.
    fn borrow_internal_from_right(
        &self,
        parent: &mut WritePageGuard<'_>,
        node: &mut WritePageGuard<'_>,
        right: &mut WritePageGuard<'_>,
        right_pos: usize,
    ) {
        let separator = BTreeInternalPage::<K>::new(parent.data()).key_at(right_pos);
        let (risen_key, moved_child) = {
            let view = BTreeInternalPage::<K>::new(right.data());
            (view.key_at(1), view.child_at(0))
        };
        {
            let mut view = BTreeInternalPageMut::<K>::new(node.data_mut());
            let size = view.size();
            view.set_key_at(size, &separator);
            view.set_child_at(size, moved_child);
            view.increase_size(1);
        }
        {
            let mut view = BTreeInternalPageMut::<K>::new(right.data_mut());
            view.shift_left(0);
        }
        BTreeInternalPageMut::<K>::new(parent.data_mut()).set_key_at(right_pos, &risen_key);
        debug!(index = %self.name, node = %node.page_id(), from = %right.page_id(), "internal borrowed from right");
    }

    /// Moves every entry of the right leaf into the left one, splices the
    /// right leaf out of the sibling chain and the parent, and drains it
    /// so a racing scan that captured its id sees an empty dead leaf.
    fn merge_leaves(
        &self,
        parent: &mut WritePageGuard<'_>,
        left: &mut WritePageGuard<'_>,
        right: &mut WritePageGuard<'_>,
        right_slot: usize,
    ) {
        {
            let source = BTreeLeafPage::<K>::new(right.data());
            let mut target = BTreeLeafPageMut::<K>::new(left.data_mut());
            let base = target.size();
            let moved = source.size();
            for i in 0..moved {
                target.set_key_at(base + i, &source.key_at(i));
                target.set_value_at(base + i, source.value_at(i));
            }
            target.set_size(base + moved);
            target.set_next_page_id(source.next_page_id());
        }
        {
            let mut drained = BTreeLeafPageMut::<K>::new(right.data_mut());
            drained.set_size(0);
            drained.set_next_page_id(PageId::INVALID);
        }
        BTreeInternalPageMut::<K>::new(parent.data_mut()).shift_left(right_slot);
        debug!(index = %self.name, left = %left.page_id(), right = %right.page_id(), "leaves merged");
    }

    /// Fuses the right internal node into the left one. The parent
    /// separator drops down above the right node's first child, then the
    /// right node is spliced out of the parent.
    fn merge_internals(
        &self,
        parent: &mut WritePageGuard<'_>,
        left: &mut WritePageGuard<'_>,
        right: &mut WritePageGuard<'_>,
        right_slot: usize,
    ) {
        let separator = BTreeInternalPage::<K>::new(parent.data()).key_at(right_slot);
        {
            let source = BTreeInternalPage::<K>::new(right.data());
            let mut target = BTreeInternalPageMut::<K>::new(left.data_mut());
            let base = target.size();
            let moved = source.size();
            target.set_key_at(base, &separator);
            target.set_child_at(base, source.child_at(0));
            for i in 1..moved {
                target.set_key_at(base + i, &source.key_at(i));
                target.set_child_at(base + i, source.child_at(i));
            }
            target.set_size(base + moved);
        }
        BTreeInternalPageMut::<K>::new(right.data_mut()).set_size(0);
        BTreeInternalPageMut::<K>::new(parent.data_mut()).shift_left(right_slot);
        debug!(index = %self.name, left = %left.page_id(), right = %right.page_id(), "internal nodes merged");
    }

    /// Shrinks the root after a delete cascade: an internal root left with
    /// a single child hands the root role to that child, an empty leaf
    /// root empties the tree. Requires the header guard, which is always
    /// still held when the root was retained.
    fn adjust_root(&self, ctx: &mut Context<'_>) -> Result<()> {
        if ctx.write_set.len() != 1 {
            return Ok(());
        }
        let top = ctx.write_set.back().expect("topmost node");
        if top.page_id() != ctx.root_page_id {
            return Ok(());
        }

        let kind = self.kind_of(top.page_id(), top.data())?;
        let size = node_size(top.data());
        match kind {
            NodeKind::Internal if size == 1 => {
                let new_root_id = BTreeInternalPage::<K>::new(top.data()).child_at(0);
                let header = ctx.header.as_mut().ok_or_else(|| {
                    SableError::TreeCorrupted("header released before root shrink".to_string())
                })?;
                BTreeHeaderPageMut::new(header.data_mut()).set_root_page_id(new_root_id);
                let old = ctx.write_set.pop_back().expect("old root");
                ctx.freed_pages.push(old.page_id());
                debug!(index = %self.name, old_root = %old.page_id(), new_root = %new_root_id, "root shrank");
            }
            NodeKind::Leaf if size == 0 => {
                let header = ctx.header.as_mut().ok_or_else(|| {
                    SableError::TreeCorrupted("header released before root shrink".to_string())
                })?;
                BTreeHeaderPageMut::new(header.data_mut()).set_root_page_id(PageId::INVALID);
                let old = ctx.write_set.pop_back().expect("old root");
                ctx.freed_pages.push(old.page_id());
                debug!(index = %self.name, old_root = %old.page_id(), "tree emptied");
            }
            _ => {}
        }
        Ok(())
    }
}
