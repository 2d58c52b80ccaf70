pub mod bplus_tree;
pub mod index_iterator;

pub use bplus_tree::BPlusTreeIndex;
pub use index_iterator::TreeIndexIterator;

use std::cmp::Ordering;

/// Total order over raw index keys.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Lexicographic byte order. Fixed-width big-endian integer encodings sort
/// numerically under it.
pub fn default_comparator(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}
