use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, PageRef, INVALID_PAGE_ID};
use crate::config::BTreeConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
};
use crate::storage::index::index_iterator::TreeIndexIterator;
use crate::storage::index::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId,
};
use crate::utils::util::page_bytes_to_array;

#[derive(Debug, Clone, Copy)]
struct TreeMeta {
    root_page_id: PageId,
    // leftmost leaf, where full scans start
    begin_page_id: PageId,
}

/// Disk-backed B+Tree over the buffer pool. Keys are raw byte strings
/// ordered by the comparator; values are `RecordId`s. One tree-wide latch
/// serializes writers; point lookups and scan anchoring share it.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub buffer_pool: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    leaf_max_size: u32,
    internal_max_size: u32,
    meta: RwLock<TreeMeta>,
}

impl BPlusTreeIndex {
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(
            internal_max_size >= 2,
            "internal_max_size must be at least 2"
        );
        Self {
            buffer_pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            meta: RwLock::new(TreeMeta {
                root_page_id: INVALID_PAGE_ID,
                begin_page_id: INVALID_PAGE_ID,
            }),
        }
    }

    pub fn with_config(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        config: BTreeConfig,
    ) -> Self {
        Self::new(
            buffer_pool,
            comparator,
            config.leaf_max_size,
            config.internal_max_size,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.meta.read().root_page_id == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.meta.read().root_page_id
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> VellumResult<Option<RecordId>> {
        let meta = self.meta.read();
        if meta.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let leaf_page_id = self.find_leaf_page_id(key, meta.root_page_id)?;
        let (_leaf_ref, leaf) = self.fetch_leaf(leaf_page_id)?;
        Ok(leaf.look_up(key))
    }

    /// Insert a unique key. Returns false without modifying the tree if the
    /// key already exists.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> VellumResult<bool> {
        let mut meta = self.meta.write();

        if meta.root_page_id == INVALID_PAGE_ID {
            let (page_ref, mut leaf) = self.new_leaf(INVALID_PAGE_ID)?;
            leaf.insert(key.to_vec(), rid);
            self.write_leaf(&page_ref, &leaf);
            meta.root_page_id = leaf.page_id;
            meta.begin_page_id = leaf.page_id;
            debug!("started new tree at page {}", leaf.page_id);
            return Ok(true);
        }

        let leaf_page_id = self.find_leaf_page_id(key, meta.root_page_id)?;
        let (leaf_ref, mut leaf) = self.fetch_leaf(leaf_page_id)?;
        if !leaf.insert(key.to_vec(), rid) {
            return Ok(false);
        }

        if !leaf.is_overflow() {
            self.write_leaf(&leaf_ref, &leaf);
            return Ok(true);
        }

        self.split_leaf(&mut meta, leaf_ref, leaf)?;
        Ok(true)
    }

    /// Remove a key if present, redistributing or merging under-filled
    /// nodes on the way back up.
    pub fn remove(&self, key: &[u8]) -> VellumResult<()> {
        let mut meta = self.meta.write();
        if meta.root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let leaf_page_id = self.find_leaf_page_id(key, meta.root_page_id)?;
        let (leaf_ref, mut leaf) = self.fetch_leaf(leaf_page_id)?;
        if !leaf.remove(key) {
            return Ok(());
        }

        if leaf.is_root() {
            if leaf.size() == 0 {
                drop(leaf_ref);
                self.buffer_pool.delete_page(leaf_page_id)?;
                meta.root_page_id = INVALID_PAGE_ID;
                meta.begin_page_id = INVALID_PAGE_ID;
                debug!("tree became empty");
            } else {
                self.write_leaf(&leaf_ref, &leaf);
            }
            return Ok(());
        }

        if !leaf.is_underflow() {
            self.write_leaf(&leaf_ref, &leaf);
            return Ok(());
        }

        let mut page_id = self.rebalance_leaf(leaf_ref, leaf)?;
        loop {
            let (node_ref, node) = self.fetch_internal(page_id)?;
            if node.is_root() {
                if node.size() == 1 {
                    // a root with a single child is freed; the child is the
                    // new root
                    let only_child = node.value_at(0);
                    self.reparent(only_child, INVALID_PAGE_ID)?;
                    drop(node_ref);
                    self.buffer_pool.delete_page(page_id)?;
                    meta.root_page_id = only_child;
                    debug!("root collapsed into page {}", only_child);
                }
                return Ok(());
            }
            if !node.is_underflow() {
                return Ok(());
            }
            page_id = self.rebalance_internal(node_ref, node)?;
        }
    }

    /// Cursor at the leftmost key.
    pub fn begin(&self) -> VellumResult<TreeIndexIterator> {
        let meta = self.meta.read();
        if meta.begin_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::end(
                self.buffer_pool.clone(),
                self.comparator,
            ));
        }
        let (page_ref, leaf) = self.fetch_leaf(meta.begin_page_id)?;
        Ok(TreeIndexIterator::new(
            self.buffer_pool.clone(),
            self.comparator,
            Some((page_ref, leaf)),
            0,
        ))
    }

    /// Cursor at the smallest key >= `key`.
    pub fn begin_from(&self, key: &[u8]) -> VellumResult<TreeIndexIterator> {
        let meta = self.meta.read();
        if meta.root_page_id == INVALID_PAGE_ID {
            return Ok(TreeIndexIterator::end(
                self.buffer_pool.clone(),
                self.comparator,
            ));
        }
        let leaf_page_id = self.find_leaf_page_id(key, meta.root_page_id)?;
        let (page_ref, leaf) = self.fetch_leaf(leaf_page_id)?;
        let slot = leaf.lower_bound(key);
        Ok(TreeIndexIterator::new(
            self.buffer_pool.clone(),
            self.comparator,
            Some((page_ref, leaf)),
            slot,
        ))
    }

    /// Render the tree level by level; test helper.
    pub fn debug_string(&self) -> VellumResult<String> {
        let meta = self.meta.read();
        if meta.root_page_id == INVALID_PAGE_ID {
            return Ok("(empty)".to_string());
        }
        let mut out = String::new();
        let mut level = vec![meta.root_page_id];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            for page_id in level.iter() {
                let page_ref = self.buffer_pool.fetch_page(*page_id)?;
                let (node, _) = BPlusTreePageCodec::decode(page_ref.read().data(), self.comparator)?;
                match node {
                    BPlusTreePage::Internal(internal) => {
                        out.push_str(&format!(
                            "int[{}: {} children] ",
                            internal.page_id,
                            internal.size()
                        ));
                        next_level.extend(internal.array.iter().map(|(_, child)| *child));
                    }
                    BPlusTreePage::Leaf(leaf) => {
                        out.push_str(&format!("leaf[{}: {} keys] ", leaf.page_id, leaf.size()));
                    }
                }
            }
            out.push('\n');
            level = next_level;
        }
        Ok(out)
    }

    fn find_leaf_page_id(&self, key: &[u8], root_page_id: PageId) -> VellumResult<PageId> {
        let mut page_id = root_page_id;
        loop {
            let page_ref = self.buffer_pool.fetch_page(page_id)?;
            let (node, _) = BPlusTreePageCodec::decode(page_ref.read().data(), self.comparator)?;
            match node {
                BPlusTreePage::Internal(internal) => page_id = internal.look_up(key),
                BPlusTreePage::Leaf(_) => return Ok(page_id),
            }
        }
    }

    fn split_leaf(
        &self,
        meta: &mut TreeMeta,
        leaf_ref: PageRef,
        mut leaf: BPlusTreeLeafPage,
    ) -> VellumResult<()> {
        let (sibling_ref, mut sibling) = self.new_leaf(leaf.parent_page_id)?;
        sibling.array = leaf.array.split_off(leaf.min_size());
        sibling.next_page_id = leaf.next_page_id;
        leaf.next_page_id = sibling.page_id;
        let separator = sibling.array[0].0.clone();
        debug!(
            "split leaf {} -> sibling {}",
            leaf.page_id, sibling.page_id
        );

        if leaf.is_root() {
            let (root_ref, mut root) = self.new_internal(INVALID_PAGE_ID)?;
            root.array.push((Vec::new(), leaf.page_id));
            root.array.push((separator, sibling.page_id));
            leaf.parent_page_id = root.page_id;
            sibling.parent_page_id = root.page_id;
            meta.root_page_id = root.page_id;
            self.write_internal(&root_ref, &root);
            self.write_leaf(&leaf_ref, &leaf);
            self.write_leaf(&sibling_ref, &sibling);
            return Ok(());
        }

        let parent_page_id = leaf.parent_page_id;
        let sibling_page_id = sibling.page_id;
        self.write_leaf(&leaf_ref, &leaf);
        self.write_leaf(&sibling_ref, &sibling);
        drop(leaf_ref);
        drop(sibling_ref);
        self.insert_into_parent(meta, parent_page_id, separator, sibling_page_id)
    }

    /// Insert a (separator, child) into the parent, splitting internal
    /// nodes upward while they overflow. The pivot key moves up, never
    /// staying in either half.
    fn insert_into_parent(
        &self,
        meta: &mut TreeMeta,
        mut parent_page_id: PageId,
        mut key: Vec<u8>,
        mut child_page_id: PageId,
    ) -> VellumResult<()> {
        loop {
            let (node_ref, mut node) = self.fetch_internal(parent_page_id)?;
            node.insert_kv(key, child_page_id);
            if !node.is_overflow() {
                self.write_internal(&node_ref, &node);
                return Ok(());
            }

            let (sibling_ref, mut sibling) = self.new_internal(node.parent_page_id)?;
            let mut right = node.array.split_off(node.min_size());
            let pivot = std::mem::take(&mut right[0].0);
            sibling.array = right;
            for (_, child) in sibling.array.iter() {
                self.reparent(*child, sibling.page_id)?;
            }
            debug!(
                "split internal {} -> sibling {}",
                node.page_id, sibling.page_id
            );

            if node.is_root() {
                let (root_ref, mut root) = self.new_internal(INVALID_PAGE_ID)?;
                root.array.push((Vec::new(), node.page_id));
                root.array.push((pivot, sibling.page_id));
                node.parent_page_id = root.page_id;
                sibling.parent_page_id = root.page_id;
                meta.root_page_id = root.page_id;
                self.write_internal(&root_ref, &root);
                self.write_internal(&node_ref, &node);
                self.write_internal(&sibling_ref, &sibling);
                return Ok(());
            }

            let grandparent_page_id = node.parent_page_id;
            let sibling_page_id = sibling.page_id;
            self.write_internal(&node_ref, &node);
            self.write_internal(&sibling_ref, &sibling);
            drop(node_ref);
            drop(sibling_ref);

            parent_page_id = grandparent_page_id;
            key = pivot;
            child_page_id = sibling_page_id;
        }
    }

    /// Fix an under-filled leaf: borrow from the left sibling, then the
    /// right, else merge. Returns the parent page id for the upward walk.
    fn rebalance_leaf(
        &self,
        leaf_ref: PageRef,
        mut leaf: BPlusTreeLeafPage,
    ) -> VellumResult<PageId> {
        let parent_page_id = leaf.parent_page_id;
        let (parent_ref, mut parent) = self.fetch_internal(parent_page_id)?;
        let pos = parent.child_position(leaf.page_id).ok_or_else(|| {
            VellumError::Internal(format!(
                "leaf {} not found in parent {}",
                leaf.page_id, parent_page_id
            ))
        })?;

        if pos > 0 {
            let (left_ref, mut left) = self.fetch_leaf(parent.value_at(pos - 1))?;
            if left.size() > left.min_size() {
                let moved = left.array.pop().unwrap();
                parent.array[pos].0 = moved.0.clone();
                leaf.array.insert(0, moved);
                self.write_leaf(&left_ref, &left);
                self.write_leaf(&leaf_ref, &leaf);
                self.write_internal(&parent_ref, &parent);
                return Ok(parent_page_id);
            }
        }

        if pos + 1 < parent.size() {
            let (right_ref, mut right) = self.fetch_leaf(parent.value_at(pos + 1))?;
            if right.size() > right.min_size() {
                let moved = right.array.remove(0);
                leaf.array.push(moved);
                parent.array[pos + 1].0 = right.array[0].0.clone();
                self.write_leaf(&right_ref, &right);
                self.write_leaf(&leaf_ref, &leaf);
                self.write_internal(&parent_ref, &parent);
                return Ok(parent_page_id);
            }
        }

        if pos > 0 {
            // merge into the left sibling and unlink from the leaf chain
            let (left_ref, mut left) = self.fetch_leaf(parent.value_at(pos - 1))?;
            left.array.append(&mut leaf.array);
            left.next_page_id = leaf.next_page_id;
            self.write_leaf(&left_ref, &left);
            parent.array.remove(pos);
            self.write_internal(&parent_ref, &parent);
            let removed_page_id = leaf.page_id;
            debug!("merged leaf {} into {}", removed_page_id, left.page_id);
            drop(leaf_ref);
            self.buffer_pool.delete_page(removed_page_id)?;
        } else if pos + 1 < parent.size() {
            // no left sibling: pull the right sibling in
            let (right_ref, mut right) = self.fetch_leaf(parent.value_at(pos + 1))?;
            leaf.array.append(&mut right.array);
            leaf.next_page_id = right.next_page_id;
            self.write_leaf(&leaf_ref, &leaf);
            parent.array.remove(pos + 1);
            self.write_internal(&parent_ref, &parent);
            let removed_page_id = right.page_id;
            debug!("merged leaf {} into {}", removed_page_id, leaf.page_id);
            drop(right_ref);
            self.buffer_pool.delete_page(removed_page_id)?;
        } else {
            // no sibling at all (fan-out of one): tolerate the underflow
            self.write_leaf(&leaf_ref, &leaf);
        }
        Ok(parent_page_id)
    }

    /// Fix an under-filled internal node. Borrowing rotates a child through
    /// the parent separator; merging pulls the separator down as the first
    /// key of the merged right half.
    fn rebalance_internal(
        &self,
        node_ref: PageRef,
        mut node: BPlusTreeInternalPage,
    ) -> VellumResult<PageId> {
        let parent_page_id = node.parent_page_id;
        let (parent_ref, mut parent) = self.fetch_internal(parent_page_id)?;
        let pos = parent.child_position(node.page_id).ok_or_else(|| {
            VellumError::Internal(format!(
                "node {} not found in parent {}",
                node.page_id, parent_page_id
            ))
        })?;

        if pos > 0 {
            let (left_ref, mut left) = self.fetch_internal(parent.value_at(pos - 1))?;
            if left.size() > left.min_size() {
                let (moved_key, moved_child) = left.array.pop().unwrap();
                let parent_sep = std::mem::replace(&mut parent.array[pos].0, moved_key);
                node.array.insert(0, (Vec::new(), moved_child));
                node.array[1].0 = parent_sep;
                self.reparent(moved_child, node.page_id)?;
                self.write_internal(&left_ref, &left);
                self.write_internal(&node_ref, &node);
                self.write_internal(&parent_ref, &parent);
                return Ok(parent_page_id);
            }
        }

        if pos + 1 < parent.size() {
            let (right_ref, mut right) = self.fetch_internal(parent.value_at(pos + 1))?;
            if right.size() > right.min_size() {
                let (_, moved_child) = right.array.remove(0);
                let new_sep = std::mem::take(&mut right.array[0].0);
                let old_sep = std::mem::replace(&mut parent.array[pos + 1].0, new_sep);
                node.array.push((old_sep, moved_child));
                self.reparent(moved_child, node.page_id)?;
                self.write_internal(&right_ref, &right);
                self.write_internal(&node_ref, &node);
                self.write_internal(&parent_ref, &parent);
                return Ok(parent_page_id);
            }
        }

        if pos > 0 {
            let (left_ref, mut left) = self.fetch_internal(parent.value_at(pos - 1))?;
            let separator = parent.array[pos].0.clone();
            let mut moved = std::mem::take(&mut node.array);
            moved[0].0 = separator;
            for (_, child) in moved.iter() {
                self.reparent(*child, left.page_id)?;
            }
            left.array.extend(moved);
            self.write_internal(&left_ref, &left);
            parent.array.remove(pos);
            self.write_internal(&parent_ref, &parent);
            let removed_page_id = node.page_id;
            debug!("merged internal {} into {}", removed_page_id, left.page_id);
            drop(node_ref);
            self.buffer_pool.delete_page(removed_page_id)?;
        } else if pos + 1 < parent.size() {
            let (right_ref, mut right) = self.fetch_internal(parent.value_at(pos + 1))?;
            let separator = parent.array[pos + 1].0.clone();
            let mut moved = std::mem::take(&mut right.array);
            moved[0].0 = separator;
            for (_, child) in moved.iter() {
                self.reparent(*child, node.page_id)?;
            }
            node.array.extend(moved);
            self.write_internal(&node_ref, &node);
            parent.array.remove(pos + 1);
            self.write_internal(&parent_ref, &parent);
            let removed_page_id = right.page_id;
            debug!("merged internal {} into {}", removed_page_id, node.page_id);
            drop(right_ref);
            self.buffer_pool.delete_page(removed_page_id)?;
        } else {
            self.write_internal(&node_ref, &node);
        }
        Ok(parent_page_id)
    }

    /// Point a child's parent back-pointer at a new parent.
    fn reparent(&self, child_page_id: PageId, parent_page_id: PageId) -> VellumResult<()> {
        let page_ref = self.buffer_pool.fetch_page(child_page_id)?;
        let (mut node, _) = BPlusTreePageCodec::decode(page_ref.read().data(), self.comparator)?;
        node.set_parent_page_id(parent_page_id);
        page_ref
            .write()
            .set_data(page_bytes_to_array(&BPlusTreePageCodec::encode(&node)));
        Ok(())
    }

    fn fetch_leaf(&self, page_id: PageId) -> VellumResult<(PageRef, BPlusTreeLeafPage)> {
        let page_ref = self.buffer_pool.fetch_page(page_id)?;
        let (leaf, _) = BPlusTreeLeafPageCodec::decode(page_ref.read().data(), self.comparator)?;
        Ok((page_ref, leaf))
    }

    fn fetch_internal(&self, page_id: PageId) -> VellumResult<(PageRef, BPlusTreeInternalPage)> {
        let page_ref = self.buffer_pool.fetch_page(page_id)?;
        let (node, _) =
            BPlusTreeInternalPageCodec::decode(page_ref.read().data(), self.comparator)?;
        Ok((page_ref, node))
    }

    fn new_leaf(&self, parent_page_id: PageId) -> VellumResult<(PageRef, BPlusTreeLeafPage)> {
        let page_ref = self.buffer_pool.new_page()?;
        let page_id = page_ref.read().page_id;
        let leaf =
            BPlusTreeLeafPage::new(page_id, parent_page_id, self.leaf_max_size, self.comparator);
        Ok((page_ref, leaf))
    }

    fn new_internal(
        &self,
        parent_page_id: PageId,
    ) -> VellumResult<(PageRef, BPlusTreeInternalPage)> {
        let page_ref = self.buffer_pool.new_page()?;
        let page_id = page_ref.read().page_id;
        let node = BPlusTreeInternalPage::new(
            page_id,
            parent_page_id,
            self.internal_max_size,
            self.comparator,
        );
        Ok((page_ref, node))
    }

    fn write_leaf(&self, page_ref: &PageRef, leaf: &BPlusTreeLeafPage) {
        page_ref
            .write()
            .set_data(page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(leaf)));
    }

    fn write_internal(&self, page_ref: &PageRef, node: &BPlusTreeInternalPage) {
        page_ref
            .write()
            .set_data(page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
                node,
            )));
    }
}
