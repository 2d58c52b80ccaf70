use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    /// Number of frames held by the pool.
    pub pool_size: usize,
    /// K parameter of the LRU-K replacer.
    pub replacer_k: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            pool_size: 1000,
            replacer_k: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Max number of (key, rid) pairs in a leaf node. Must be >= 2.
    pub leaf_max_size: u32,
    /// Max number of children of an internal node. Must be >= 2.
    pub internal_max_size: u32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_max_size: 128,
            internal_max_size: 128,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    /// Sleep period of the background deadlock detector.
    pub cycle_detection_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        LockManagerConfig {
            cycle_detection_interval: Duration::from_millis(50),
        }
    }
}
