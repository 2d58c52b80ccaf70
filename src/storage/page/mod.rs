pub mod index_page;

pub use index_page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, BPlusTreePageType, InternalKV, LeafKV,
};

use crate::buffer::{PageId, INVALID_PAGE_ID};

/// Location of a tuple: heap page plus slot number. The B+Tree stores these
/// as leaf values and the lock manager locks rows by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RecordId {
    pub const INVALID: RecordId = RecordId {
        page_id: INVALID_PAGE_ID,
        slot: 0,
    };

    pub const fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot)
    }
}
