use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

/// In-memory extendible hash table with a dynamic-depth directory.
///
/// The directory is a dense vector indexed by the low `global_depth` bits of
/// `hash(key)`. Buckets live in an arena; several directory slots alias the
/// same bucket while its `local_depth` is below `global_depth`. One
/// structure-wide latch guards everything: lookups take it shared, inserts
/// and removals exclusive.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hash_builder: S,
    inner: RwLock<Directory<K, V>>,
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    // directory slot -> bucket arena index
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

#[derive(Debug)]
struct Bucket<K, V> {
    depth: u32,
    items: Vec<(K, V)>,
}

impl<K, V> Bucket<K, V>
where
    K: Eq,
{
    fn new(depth: u32, capacity: usize) -> Self {
        Self {
            depth,
            items: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            true
        } else {
            false
        }
    }
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hash_builder: S) -> Self {
        assert!(bucket_size >= 1, "bucket size must be positive");
        Self {
            bucket_size,
            hash_builder,
            inner: RwLock::new(Directory {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket::new(0, bucket_size)],
            }),
        }
    }

    fn hash_of(&self, key: &K) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn index_of(hash: u64, global_depth: u32) -> usize {
        (hash as usize) & ((1usize << global_depth) - 1)
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash_of(key);
        let inner = self.inner.read();
        let index = Self::index_of(hash, inner.global_depth);
        inner.buckets[inner.dir[index]].find(key).cloned()
    }

    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        let mut inner = self.inner.write();
        let index = Self::index_of(hash, inner.global_depth);
        let bucket = inner.dir[index];
        inner.buckets[bucket].remove(key)
    }

    /// Insert or overwrite. A full target bucket is split until the key
    /// fits, doubling the directory whenever the bucket already constrains
    /// all `global_depth` addressing bits.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash_of(&key);
        let mut inner = self.inner.write();

        let mut index = Self::index_of(hash, inner.global_depth);
        let bucket = inner.dir[index];
        if let Some(slot) = inner.buckets[bucket]
            .items
            .iter_mut()
            .find(|(k, _)| *k == key)
        {
            slot.1 = value;
            return;
        }

        while inner.buckets[inner.dir[index]].items.len() >= self.bucket_size {
            let old_bucket = inner.dir[index];
            let local_depth = inner.buckets[old_bucket].depth;
            let local_mask = 1usize << local_depth;

            if local_depth == inner.global_depth {
                let n = inner.dir.len();
                inner.global_depth += 1;
                inner.dir.extend_from_within(0..n);
            }

            inner.buckets[old_bucket].depth = local_depth + 1;
            let new_bucket = inner.buckets.len();
            let capacity = self.bucket_size;
            inner
                .buckets
                .push(Bucket::new(local_depth + 1, capacity));

            // rehash by the newly-constrained bit: zero goes to the peer
            let old_items = std::mem::take(&mut inner.buckets[old_bucket].items);
            for (k, v) in old_items {
                if (self.hash_of(&k) >> local_depth) & 1 == 0 {
                    inner.buckets[new_bucket].items.push((k, v));
                } else {
                    inner.buckets[old_bucket].items.push((k, v));
                }
            }

            // every slot aliasing the old bucket whose bit at the old depth
            // is zero now points at the peer
            let mut slot = (hash as usize) & (local_mask - 1);
            let dir_len = inner.dir.len();
            while slot < dir_len {
                if (slot >> local_depth) & 1 == 0 {
                    inner.dir[slot] = new_bucket;
                }
                slot += local_mask;
            }

            index = Self::index_of(hash, inner.global_depth);
        }

        let bucket = inner.dir[index];
        inner.buckets[bucket].items.push((key, value));
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.read().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let inner = self.inner.read();
        inner.buckets[inner.dir[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// All resident keys, in unspecified order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let inner = self.inner.read();
        inner
            .buckets
            .iter()
            .flat_map(|bucket| bucket.items.iter().map(|(k, _)| k.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.buckets.iter().map(|bucket| bucket.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{BuildHasher, Hasher};

    /// Hashes a key to its own little-endian integer value so directory
    /// shapes are predictable in tests.
    #[derive(Debug, Default, Clone)]
    struct IdentityState;

    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }

        fn write(&mut self, bytes: &[u8]) {
            for (i, byte) in bytes.iter().enumerate().take(8) {
                self.0 |= (*byte as u64) << (8 * i);
            }
        }
    }

    impl BuildHasher for IdentityState {
        type Hasher = IdentityHasher;

        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn identity_table(bucket_size: usize) -> ExtendibleHashTable<i32, String, IdentityState> {
        ExtendibleHashTable::with_hasher(bucket_size, IdentityState)
    }

    #[test]
    pub fn test_insert_find_remove() {
        let table = identity_table(2);
        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());
        assert_eq!(table.find(&1), Some("a".to_string()));
        assert_eq!(table.find(&2), Some("b".to_string()));
        assert_eq!(table.find(&3), None);

        table.insert(1, "a2".to_string());
        assert_eq!(table.find(&1), Some("a2".to_string()));
        assert_eq!(table.len(), 2);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
    }

    #[test]
    pub fn test_split_local_depths() {
        let table = identity_table(2);
        for (key, value) in [
            (1, "a"),
            (2, "b"),
            (3, "c"),
            (4, "d"),
            (5, "e"),
            (6, "f"),
            (7, "g"),
            (8, "h"),
            (9, "i"),
        ] {
            table.insert(key, value.to_string());
        }

        assert_eq!(table.local_depth(0), 2);
        assert_eq!(table.local_depth(1), 3);
        assert_eq!(table.local_depth(2), 2);
        assert_eq!(table.local_depth(3), 2);

        assert_eq!(table.find(&9), Some("i".to_string()));
        assert_eq!(table.find(&10), None);
        for key in 1..=9 {
            assert!(table.find(&key).is_some(), "lost key {}", key);
        }
    }

    #[test]
    pub fn test_split_bucket_counts() {
        let table = identity_table(2);
        for key in [4, 12, 16] {
            table.insert(key, key.to_string());
        }
        assert_eq!(table.num_buckets(), 4);

        for key in [64, 31, 10, 51] {
            table.insert(key, key.to_string());
        }
        assert_eq!(table.num_buckets(), 4);

        for key in [15, 18, 20] {
            table.insert(key, key.to_string());
        }
        assert_eq!(table.num_buckets(), 7);

        for key in [7, 23] {
            table.insert(key, key.to_string());
        }
        assert_eq!(table.num_buckets(), 8);

        for key in [4, 12, 16, 64, 31, 10, 51, 15, 18, 20, 7, 23] {
            assert_eq!(table.find(&key), Some(key.to_string()));
        }
    }

    #[test]
    pub fn test_directory_mask_invariant() {
        let table = identity_table(3);
        for key in 0..200 {
            table.insert(key, (key * 10).to_string());
        }
        for key in (0..200).step_by(3) {
            assert!(table.remove(&key));
        }

        // every key still resident must hash into a slot whose low
        // local-depth bits match the slot index
        let inner = table.inner.read();
        for slot in 0..inner.dir.len() {
            let bucket = &inner.buckets[inner.dir[slot]];
            let mask = (1usize << bucket.depth) - 1;
            for (key, _) in bucket.items.iter() {
                assert_eq!(
                    (*key as usize) & mask,
                    slot & mask,
                    "key {} misplaced at slot {}",
                    key,
                    slot
                );
            }
        }
        drop(inner);

        for key in 0..200 {
            let expect = if key % 3 == 0 {
                None
            } else {
                Some((key * 10).to_string())
            };
            assert_eq!(table.find(&key), expect);
        }
    }

    #[test]
    pub fn test_default_hasher_smoke() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);
        for key in 0..500u64 {
            table.insert(key, key + 1);
        }
        assert_eq!(table.len(), 500);
        for key in 0..500u64 {
            assert_eq!(table.find(&key), Some(key + 1));
        }
    }
}
