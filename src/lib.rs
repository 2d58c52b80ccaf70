pub mod background;
pub mod buffer;
pub mod config;
pub mod container;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod utils;

pub use buffer::{BufferPoolManager, PageId, PageRef, INVALID_PAGE_ID, PAGE_SIZE};
pub use error::{VellumError, VellumResult};
pub use storage::disk_manager::DiskManager;
pub use storage::index::bplus_tree::BPlusTreeIndex;
pub use transaction::{IsolationLevel, LockManager, LockMode, Transaction, TransactionManager};
