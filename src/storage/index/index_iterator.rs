use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageRef, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::index::KeyComparator;
use crate::storage::page::{BPlusTreeLeafPage, LeafKV};

/// Forward cursor over the leaf chain. The current leaf stays pinned while
/// the cursor points into it; crossing to the next leaf releases the pin
/// first, then pins the successor.
#[derive(Debug)]
pub struct TreeIndexIterator {
    buffer_pool: Arc<BufferPoolManager>,
    comparator: KeyComparator,
    current: Option<(PageRef, BPlusTreeLeafPage)>,
    slot: usize,
}

impl TreeIndexIterator {
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        comparator: KeyComparator,
        current: Option<(PageRef, BPlusTreeLeafPage)>,
        slot: usize,
    ) -> Self {
        Self {
            buffer_pool,
            comparator,
            current,
            slot,
        }
    }

    pub(crate) fn end(buffer_pool: Arc<BufferPoolManager>, comparator: KeyComparator) -> Self {
        Self::new(buffer_pool, comparator, None, 0)
    }

    pub fn is_end(&self) -> bool {
        self.current.is_none()
    }

    /// Yield the next (key, rid) pair in key order, or `None` at the end of
    /// the index.
    pub fn next(&mut self) -> VellumResult<Option<LeafKV>> {
        loop {
            let Some((_page_ref, leaf)) = self.current.as_ref() else {
                return Ok(None);
            };

            if self.slot < leaf.size() {
                let kv = leaf.array[self.slot].clone();
                self.slot += 1;
                return Ok(Some(kv));
            }

            let next_page_id = leaf.next_page_id;
            // unpin the exhausted leaf before following the link
            self.current = None;
            self.slot = 0;
            if next_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page_ref = self.buffer_pool.fetch_page(next_page_id)?;
            let (next_leaf, _) =
                BPlusTreeLeafPageCodec::decode(page_ref.read().data(), self.comparator)?;
            self.current = Some((page_ref, next_leaf));
        }
    }
}
