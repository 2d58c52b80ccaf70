use crate::buffer::FrameId;
use crate::error::VellumResult;

pub mod lru_k;

/// Eviction policy seam for the buffer pool.
pub trait Replacer {
    /// Record that a frame was touched at the current logical time.
    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()>;

    /// Pick the eviction victim, clear its history and mark it pinned.
    fn evict(&mut self) -> Option<FrameId>;

    /// Flip the evictable flag of a frame, adjusting the evictable count.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> VellumResult<()>;

    /// Drop a frame from the replacer entirely.
    fn remove(&mut self, frame_id: FrameId);

    /// Number of currently evictable frames.
    fn size(&self) -> usize;
}
