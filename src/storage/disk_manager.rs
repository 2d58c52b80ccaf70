use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};

/// Page-addressed block I/O over a single database file. Page `n` lives at
/// byte offset `n * PAGE_SIZE`; page id allocation is the buffer pool's
/// concern, not ours.
#[derive(Debug)]
pub struct DiskManager {
    // one thread in the file at a time
    db_file: Mutex<File>,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> VellumResult<Self> {
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        debug!("disk manager opened {:?}", db_path.as_ref());
        Ok(Self {
            db_file: Mutex::new(db_file),
        })
    }

    /// Read one page. Pages that were allocated but never flushed read back
    /// as zeroes.
    pub fn read_page(&self, page_id: PageId) -> VellumResult<[u8; PAGE_SIZE]> {
        if page_id < 0 || page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(format!(
                "read_page: invalid page id {}",
                page_id
            )));
        }
        let mut guard = self.db_file.lock();
        let mut buf = [0u8; PAGE_SIZE];

        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= guard.metadata()?.len() {
            return Ok(buf);
        }

        guard.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            let n = guard.read(&mut buf[read_total..])?;
            if n == 0 {
                // short read at the tail stays zero-padded
                break;
            }
            read_total += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumResult<()> {
        if page_id < 0 || page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage(format!(
                "write_page: invalid page id {}",
                page_id
            )));
        }
        if data.len() != PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "write_page: expected {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut guard = self.db_file.lock();
        guard.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        guard.write_all(data)?;
        guard.flush()?;
        Ok(())
    }

    pub fn db_file_len(&self) -> VellumResult<u64> {
        Ok(self.db_file.lock().metadata()?.len())
    }
}
