pub mod common;
pub mod index_page;

pub use common::CommonCodec;
pub use index_page::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec, RecordIdCodec,
};

/// Decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);
