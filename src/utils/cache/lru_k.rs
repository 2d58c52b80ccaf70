use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{VellumError, VellumResult};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LruKNode {
    k: usize,
    // last k access timestamps, oldest first
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            k,
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64) {
        if self.history.len() == self.k {
            self.history.pop_front();
        }
        self.history.push_back(timestamp);
    }
}

/// Evicts the evictable frame with the largest backward k-distance. Frames
/// with fewer than k recorded accesses have infinite distance and beat every
/// frame with a full history; ties among them fall back to classic LRU on
/// the first access timestamp.
#[derive(Debug)]
pub struct LRUKReplacer {
    // number of frames currently evictable
    current_size: usize,
    // max number of tracked frames
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LruKNode>,
    // logical clock, bumped on every access
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }
}

impl Replacer for LRUKReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(self.current_timestamp);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(VellumError::Internal(format!(
                    "frame {} exceeds replacer capacity {}",
                    frame_id, self.replacer_size
                )));
            }
            let mut node = LruKNode::new(self.k);
            node.record_access(self.current_timestamp);
            self.node_store.insert(frame_id, node);
        }
        self.current_timestamp += 1;
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let mut victim: Option<FrameId> = None;
        let mut max_distance: u64 = 0;
        let mut earliest_first = u64::MAX;

        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable || node.history.is_empty() {
                continue;
            }
            let first = *node.history.front().unwrap();
            if node.history.len() < self.k {
                // infinite k-distance, tie-break on the oldest first access
                if max_distance < u64::MAX || first < earliest_first {
                    victim = Some(*frame_id);
                    max_distance = u64::MAX;
                    earliest_first = first;
                }
            } else if max_distance < u64::MAX && self.current_timestamp - first > max_distance {
                // history holds exactly k entries, so the front is the k-th
                // most recent access
                victim = Some(*frame_id);
                max_distance = self.current_timestamp - first;
            }
        }

        if let Some(frame_id) = victim {
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
        victim
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumResult<()> {
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            // never accessed (or already evicted): nothing to flip
            return Ok(());
        };
        if evictable && !node.is_evictable {
            self.current_size += 1;
        } else if !evictable && node.is_evictable {
            self.current_size -= 1;
        }
        node.is_evictable = evictable;
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(
                node.is_evictable,
                "removing a pinned frame {} from the replacer",
                frame_id
            );
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cache::Replacer;

    #[test]
    pub fn test_lru_k_set_evictable() {
        let mut replacer = LRUKReplacer::new(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);

        // flipping a never-accessed frame is a no-op
        replacer.set_evictable(2, true).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    pub fn test_lru_k_empty_evict() {
        let mut replacer = LRUKReplacer::new(4, 2);
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    pub fn test_lru_k_evict_all_frames_at_least_k() {
        let mut replacer = LRUKReplacer::new(2, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(2).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(2).unwrap(); // ts=4
        replacer.record_access(1).unwrap(); // ts=5
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        // frame 1 history [0,3,5], frame 2 history [1,2,4]; k-distance of
        // frame 1 (6-0) beats frame 2 (6-1)
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    pub fn test_lru_k_infinite_distance_wins() {
        let mut replacer = LRUKReplacer::new(3, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(3).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(1).unwrap(); // ts=4, frame 1 has k accesses
        replacer.record_access(3).unwrap(); // ts=5
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(3, true).unwrap();
        // frames 2 and 3 have fewer than k accesses; frame 2's first access
        // (ts=1) is older than frame 3's (ts=2)
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    pub fn test_lru_k_full_scenario() {
        let mut replacer = LRUKReplacer::new(7, 2);

        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(3).unwrap(); // ts=2
        replacer.record_access(4).unwrap(); // ts=3
        replacer.record_access(5).unwrap(); // ts=4
        replacer.record_access(6).unwrap(); // ts=5
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(3, true).unwrap();
        replacer.set_evictable(4, true).unwrap();
        replacer.set_evictable(5, true).unwrap();
        replacer.set_evictable(6, false).unwrap();
        assert_eq!(replacer.size(), 5);

        // frame 1 now has two accesses; the rest have one
        replacer.record_access(1).unwrap(); // ts=6

        // infinite-distance frames leave first, oldest first access first
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 2);

        replacer.record_access(3).unwrap(); // ts=7
        replacer.record_access(4).unwrap(); // ts=8
        replacer.record_access(5).unwrap(); // ts=9
        replacer.record_access(4).unwrap(); // ts=10
        replacer.set_evictable(3, true).unwrap();
        replacer.set_evictable(4, true).unwrap();
        assert_eq!(replacer.size(), 4);

        // frame 3 is the only one below k accesses
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.size(), 3);

        replacer.set_evictable(6, true).unwrap();
        assert_eq!(replacer.size(), 4);
        // frame 6 has a single access from ts=5
        assert_eq!(replacer.evict(), Some(6));

        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 2);
        // frame 5 history [4,9] vs frame 4 history [8,10]
        assert_eq!(replacer.evict(), Some(5));

        replacer.record_access(1).unwrap(); // ts=11
        replacer.record_access(1).unwrap(); // ts=12
        replacer.set_evictable(1, true).unwrap();
        // frame 4 history [8,10] vs frame 1 history [11,12]
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    pub fn test_lru_k_capacity() {
        let mut replacer = LRUKReplacer::new(1, 2);
        replacer.record_access(0).unwrap();
        assert!(replacer.record_access(1).is_err());
    }
}
