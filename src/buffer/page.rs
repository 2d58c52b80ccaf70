use crate::buffer::buffer_pool::FrameId;
use crate::container::ExtendibleHashTable;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;
use derive_with::With;
use log::error;
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

pub type PageId = i32;
pub type AtomicPageId = AtomicI32;

pub const INVALID_PAGE_ID: PageId = -1;
pub const PAGE_SIZE: usize = 4096;

/// One buffer frame: a page-sized byte buffer plus residency metadata.
#[derive(Debug, With)]
pub struct Page {
    pub page_id: PageId,
    data: [u8; PAGE_SIZE],
    // outstanding borrowers of this frame
    pub pin_count: AtomicU32,
    // set when the cached bytes diverge from disk
    pub is_dirty: bool,
}

impl Page {
    pub fn empty() -> Self {
        Self::new(INVALID_PAGE_ID)
    }

    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
            pin_count: AtomicU32::new(0),
            is_dirty: false,
        }
    }

    pub fn destroy(&mut self) {
        self.replace(Page::empty());
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the cached bytes; taking it marks the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.is_dirty = true;
        &mut self.data
    }

    pub fn set_data(&mut self, data: [u8; PAGE_SIZE]) {
        self.data = data;
        self.is_dirty = true;
    }

    /// Install loaded bytes without marking the frame dirty.
    pub(crate) fn load_data(&mut self, data: [u8; PAGE_SIZE]) {
        self.data = data;
    }

    pub fn replace(&mut self, other: Page) {
        *self = other;
    }
}

/// Pinned handle to a resident page. Dropping the handle releases the pin;
/// a pin count reaching zero makes the frame evictable again. Dirtiness is
/// recorded by `Page::set_data`, so every exit path unpins with the right
/// dirty flag.
#[derive(Debug)]
pub struct PageRef {
    pub page: Arc<RwLock<Page>>,
    // the pool-wide latch; unpinning must not interleave with an eviction
    pub(crate) pool_latch: Arc<RwLock<()>>,
    pub(crate) page_table: Arc<ExtendibleHashTable<PageId, FrameId>>,
    pub(crate) replacer: Arc<RwLock<LRUKReplacer>>,
}

impl Deref for PageRef {
    type Target = Arc<RwLock<Page>>;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let _pool_guard = self.pool_latch.write();
        let page_guard = self.page.read();
        let page_id = page_guard.page_id;

        if page_guard.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(frame_id) = self.page_table.find(&page_id) {
                if let Err(e) = self.replacer.write().set_evictable(frame_id, true) {
                    error!("failed to mark frame {} evictable: {:?}", frame_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ref_releases_pin() {
        let page = Arc::new(RwLock::new(Page::new(1)));
        page.read().pin_count.store(1, Ordering::SeqCst);
        let page_table = Arc::new(ExtendibleHashTable::new(8));
        let replacer = Arc::new(RwLock::new(LRUKReplacer::new(10, 2)));

        let page_ref = PageRef {
            page: page.clone(),
            pool_latch: Arc::new(RwLock::new(())),
            page_table,
            replacer,
        };
        assert_eq!(Arc::strong_count(&page), 2);
        assert_eq!(page_ref.read().page_id, 1);
        drop(page_ref);
        assert_eq!(Arc::strong_count(&page), 1);
        assert_eq!(page.read().pin_count.load(Ordering::SeqCst), 0);
    }
}
