use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::page::{AtomicPageId, Page, PageId, PageRef, INVALID_PAGE_ID};
use crate::config::BufferPoolConfig;
use crate::container::ExtendibleHashTable;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_manager::DiskManager;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

pub type FrameId = usize;

const PAGE_TABLE_BUCKET_SIZE: usize = 8;

/// Fixed-size page cache in front of the disk manager. Frames are handed
/// out pinned through `PageRef`; a frame becomes an eviction candidate only
/// once every handle to it is dropped.
///
/// One pool-wide latch serializes every public operation and pin release,
/// so evicting a page, dropping it from the page table and installing its
/// replacement is a single step as seen by concurrent fetches.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Vec<Arc<RwLock<Page>>>,
    pub replacer: Arc<RwLock<LRUKReplacer>>,
    pub disk_manager: Arc<DiskManager>,
    page_table: Arc<ExtendibleHashTable<PageId, FrameId>>,
    free_list: Mutex<VecDeque<FrameId>>,
    next_page_id: AtomicPageId,
    latch: Arc<RwLock<()>>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut free_list = VecDeque::with_capacity(pool_size);
        let mut pool = Vec::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            free_list.push_back(frame_id);
            pool.push(Arc::new(RwLock::new(Page::empty())));
        }
        Self {
            pool,
            replacer: Arc::new(RwLock::new(LRUKReplacer::new(pool_size, replacer_k))),
            disk_manager,
            page_table: Arc::new(ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE)),
            free_list: Mutex::new(free_list),
            next_page_id: AtomicPageId::new(0),
            latch: Arc::new(RwLock::new(())),
        }
    }

    pub fn with_config(config: BufferPoolConfig, disk_manager: Arc<DiskManager>) -> Self {
        Self::new(config.pool_size, config.replacer_k, disk_manager)
    }

    /// Allocate a fresh page id and cache a zeroed page for it, pinned.
    pub fn new_page(&self) -> VellumResult<PageRef> {
        let _guard = self.latch.write();
        let frame_id = self.allocate_frame()?;
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);

        self.page_table.insert(page_id, frame_id);
        self.pool[frame_id]
            .write()
            .replace(Page::new(page_id).with_pin_count(1u32));

        let mut replacer = self.replacer.write();
        replacer.record_access(frame_id)?;
        replacer.set_evictable(frame_id, false)?;
        drop(replacer);

        debug!("new page {} in frame {}", page_id, frame_id);
        Ok(self.page_ref(frame_id))
    }

    /// Pin a page, loading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> VellumResult<PageRef> {
        let _guard = self.latch.write();
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(
                "fetch_page: invalid page id".to_string(),
            ));
        }

        if let Some(frame_id) = self.page_table.find(&page_id) {
            self.pool[frame_id]
                .read()
                .pin_count
                .fetch_add(1, Ordering::SeqCst);
            let mut replacer = self.replacer.write();
            replacer.record_access(frame_id)?;
            replacer.set_evictable(frame_id, false)?;
            drop(replacer);
            return Ok(self.page_ref(frame_id));
        }

        let frame_id = self.allocate_frame()?;
        let data = self.disk_manager.read_page(page_id)?;

        self.page_table.insert(page_id, frame_id);
        {
            let mut frame = self.pool[frame_id].write();
            frame.replace(Page::new(page_id).with_pin_count(1u32));
            frame.load_data(data);
        }

        let mut replacer = self.replacer.write();
        replacer.record_access(frame_id)?;
        replacer.set_evictable(frame_id, false)?;
        drop(replacer);

        Ok(self.page_ref(frame_id))
    }

    /// Write a resident page back to disk and clear its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        let _guard = self.latch.write();
        self.flush_page_internal(page_id)
    }

    /// Flush every resident page, walking the page table rather than the
    /// allocated id range.
    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let _guard = self.latch.write();
        for page_id in self.page_table.keys() {
            self.flush_page_internal(page_id)?;
        }
        Ok(())
    }

    fn flush_page_internal(&self, page_id: PageId) -> VellumResult<bool> {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        let mut frame = self.pool[frame_id].write();
        self.disk_manager.write_page(page_id, frame.data())?;
        frame.is_dirty = false;
        Ok(true)
    }

    /// Drop a page from the cache. Non-resident pages succeed trivially;
    /// pinned pages refuse.
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        let _guard = self.latch.write();
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(true);
        };

        let mut frame = self.pool[frame_id].write();
        if frame.pin_count.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        if frame.is_dirty {
            self.disk_manager.write_page(page_id, frame.data())?;
        }
        frame.destroy();
        drop(frame);

        self.page_table.remove(&page_id);
        self.replacer.write().remove(frame_id);
        self.free_list.lock().push_back(frame_id);
        debug!("deleted page {} from frame {}", page_id, frame_id);
        Ok(true)
    }

    /// Pop a free frame or evict one, writing back a dirty victim. The
    /// caller holds the pool latch, so the eviction and the page table
    /// update below are atomic against concurrent fetches.
    fn allocate_frame(&self) -> VellumResult<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.write().evict() else {
            return Err(VellumError::Storage(
                "cannot allocate a frame: buffer pool is full and nothing is evictable"
                    .to_string(),
            ));
        };

        let frame = self.pool[frame_id].read();
        let evicted_page_id = frame.page_id;
        if frame.is_dirty {
            self.disk_manager.write_page(evicted_page_id, frame.data())?;
        }
        drop(frame);

        self.page_table.remove(&evicted_page_id);
        debug!("evicted page {} from frame {}", evicted_page_id, frame_id);
        Ok(frame_id)
    }

    fn page_ref(&self, frame_id: FrameId) -> PageRef {
        PageRef {
            page: self.pool[frame_id].clone(),
            pool_latch: self.latch.clone(),
            page_table: self.page_table.clone(),
            replacer: self.replacer.clone(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn free_list_len(&self) -> usize {
        let _guard = self.latch.read();
        self.free_list.lock().len()
    }

    pub fn resident_len(&self) -> usize {
        let _guard = self.latch.read();
        self.page_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PAGE_SIZE;
    use crate::utils::util::page_bytes_to_array;
    use tempfile::TempDir;

    fn setup(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, disk_manager));
        (temp_dir, buffer_pool)
    }

    #[test]
    pub fn test_buffer_pool_new_page() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.read().page_id;
        assert_eq!(page1_id, 0);
        assert_eq!(buffer_pool.free_list_len(), 2);
        assert_eq!(buffer_pool.replacer.read().size(), 0);

        let _page2 = buffer_pool.new_page().unwrap();
        let _page3 = buffer_pool.new_page().unwrap();
        assert_eq!(buffer_pool.free_list_len(), 0);

        // all three frames pinned: no frame available
        assert!(buffer_pool.new_page().is_err());

        drop(page1);
        let page5 = buffer_pool.new_page().unwrap();
        assert_eq!(page5.read().page_id, 3);
        // page1's frame was recycled
        assert_eq!(buffer_pool.resident_len(), 3);
    }

    #[test]
    pub fn test_buffer_pool_free_list_accounting() {
        let (_temp_dir, buffer_pool) = setup(4);
        assert_eq!(
            buffer_pool.free_list_len() + buffer_pool.resident_len(),
            buffer_pool.pool_size()
        );
        let pages: Vec<_> = (0..3).map(|_| buffer_pool.new_page().unwrap()).collect();
        assert_eq!(
            buffer_pool.free_list_len() + buffer_pool.resident_len(),
            buffer_pool.pool_size()
        );
        drop(pages);
        let _p = buffer_pool.new_page().unwrap();
        assert_eq!(
            buffer_pool.free_list_len() + buffer_pool.resident_len(),
            buffer_pool.pool_size()
        );
    }

    #[test]
    pub fn test_buffer_pool_unpin_makes_evictable() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let _page2 = buffer_pool.new_page().unwrap();
        let _page3 = buffer_pool.new_page().unwrap();
        assert!(buffer_pool.new_page().is_err());

        drop(page1);
        assert_eq!(buffer_pool.replacer.read().size(), 1);

        assert!(buffer_pool.new_page().is_ok());
        assert_eq!(buffer_pool.replacer.read().size(), 0);
    }

    #[test]
    pub fn test_buffer_pool_fetch_page() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.read().page_id;
        drop(page1);
        let page2 = buffer_pool.new_page().unwrap();
        let page2_id = page2.read().page_id;
        drop(page2);
        drop(buffer_pool.new_page().unwrap());

        assert_eq!(buffer_pool.replacer.read().size(), 3);

        let page = buffer_pool.fetch_page(page1_id).unwrap();
        assert_eq!(page.read().page_id, page1_id);
        assert_eq!(page.read().pin_count.load(Ordering::SeqCst), 1);
        assert_eq!(buffer_pool.replacer.read().size(), 2);
        drop(page);
        assert_eq!(buffer_pool.replacer.read().size(), 3);

        let page = buffer_pool.fetch_page(page2_id).unwrap();
        assert_eq!(page.read().page_id, page2_id);
        drop(page);
    }

    #[test]
    pub fn test_buffer_pool_round_trip_through_eviction() {
        let (_temp_dir, buffer_pool) = setup(2);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.read().page_id;
        let mut payload = [0u8; PAGE_SIZE];
        payload[0] = 0xab;
        payload[PAGE_SIZE - 1] = 0xcd;
        page1.write().set_data(page_bytes_to_array(&payload));
        assert!(page1.read().is_dirty);
        drop(page1);

        // force page1 out of the pool
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(buffer_pool.new_page().unwrap());
        }
        assert!(buffer_pool.page_table.find(&page1_id).is_none());
        drop(held);

        let page = buffer_pool.fetch_page(page1_id).unwrap();
        assert_eq!(page.read().data()[0], 0xab);
        assert_eq!(page.read().data()[PAGE_SIZE - 1], 0xcd);
        // a freshly fetched page is clean
        assert!(!page.read().is_dirty);
    }

    #[test]
    pub fn test_buffer_pool_delete_page() {
        let (_temp_dir, buffer_pool) = setup(3);

        let page1 = buffer_pool.new_page().unwrap();
        let page1_id = page1.read().page_id;

        // pinned pages cannot be deleted
        assert!(!buffer_pool.delete_page(page1_id).unwrap());
        drop(page1);

        drop(buffer_pool.new_page().unwrap());
        drop(buffer_pool.new_page().unwrap());
        assert_eq!(buffer_pool.replacer.read().size(), 3);
        assert_eq!(buffer_pool.resident_len(), 3);
        assert_eq!(buffer_pool.free_list_len(), 0);

        assert!(buffer_pool.delete_page(page1_id).unwrap());
        assert_eq!(buffer_pool.free_list_len(), 1);
        assert_eq!(buffer_pool.replacer.read().size(), 2);
        assert_eq!(buffer_pool.resident_len(), 2);

        // deleting a non-resident page succeeds trivially
        assert!(buffer_pool.delete_page(page1_id).unwrap());

        let page = buffer_pool.fetch_page(page1_id).unwrap();
        assert!(page.read().data().iter().all(|&b| b == 0));
    }

    #[test]
    pub fn test_buffer_pool_flush_all() {
        let (temp_dir, buffer_pool) = setup(4);

        let mut page_ids = Vec::new();
        for i in 0..3u8 {
            let page = buffer_pool.new_page().unwrap();
            let mut payload = [0u8; PAGE_SIZE];
            payload[0] = i + 1;
            page.write().set_data(payload);
            page_ids.push(page.read().page_id);
        }

        buffer_pool.flush_all_pages().unwrap();

        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        for (i, page_id) in page_ids.iter().enumerate() {
            let data = disk_manager.read_page(*page_id).unwrap();
            assert_eq!(data[0], i as u8 + 1);
        }
    }

    #[test]
    pub fn test_buffer_pool_flush() {
        let (temp_dir, buffer_pool) = setup(3);

        let page = buffer_pool.new_page().unwrap();
        let page_id = page.read().page_id;
        page.write().data_mut()[7] = 7;
        assert!(page.read().is_dirty);

        assert!(buffer_pool.flush_page(page_id).unwrap());
        assert!(!page.read().is_dirty);
        drop(page);

        // reopen the file through a second pool: the bytes survived
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let other_pool = BufferPoolManager::new(3, 2, disk_manager);
        let page = other_pool.fetch_page(page_id).unwrap();
        assert_eq!(page.read().data()[7], 7);

        assert!(!buffer_pool.flush_page(12345).unwrap());
    }
}
