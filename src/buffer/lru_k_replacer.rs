use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameAccessInfo {
    /// Timestamps of the last up to K accesses (oldest at front)
    history: VecDeque<Timestamp>,
    /// Total number of accesses ever recorded
    access_count: u64,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameAccessInfo {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            access_count: 0,
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.access_count += 1;
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// True once the frame has been accessed at least K times. The history
    /// is truncated to K entries, so for a mature frame the front of the
    /// history is exactly the K-th-most-recent access.
    fn is_mature(&self, k: usize) -> bool {
        self.access_count >= k as u64
    }

    fn oldest_timestamp(&self) -> Timestamp {
        *self.history.front().expect("access history is never empty")
    }
}

struct ReplacerInner {
    frame_info: HashMap<FrameId, FrameAccessInfo>,
    num_evictable: usize,
}

/// LRU-K replacement policy.
///
/// Frames fall into two cohorts. Frames with fewer than K recorded accesses
/// ("young") are evicted first, in FIFO order of their first access. Frames
/// with at least K accesses ("mature") are evicted in ascending order of
/// their K-th-most-recent access timestamp, i.e. the frame whose K-th-back
/// access is oldest loses. Every young frame outranks every mature frame
/// as an eviction candidate.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    /// Monotonic logical clock
    current_timestamp: AtomicU64,
    /// Per-frame history and the evictable-frame count
    inner: Mutex<ReplacerInner>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum
    /// frame count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            max_frames,
            current_timestamp: AtomicU64::new(0),
            inner: Mutex::new(ReplacerInner {
                frame_info: HashMap::new(),
                num_evictable: 0,
            }),
        }
    }

    /// Picks and removes the eviction victim, if any evictable frame exists.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.num_evictable == 0 {
            return None;
        }

        let mut young_victim: Option<(FrameId, Timestamp)> = None;
        let mut mature_victim: Option<(FrameId, Timestamp)> = None;

        for (&frame_id, info) in inner.frame_info.iter() {
            if !info.is_evictable {
                continue;
            }
            let ts = info.oldest_timestamp();
            let slot = if info.is_mature(self.k) {
                &mut mature_victim
            } else {
                &mut young_victim
            };
            if slot.map_or(true, |(_, best)| ts < best) {
                *slot = Some((frame_id, ts));
            }
        }

        let victim = young_victim.or(mature_victim).map(|(frame_id, _)| frame_id);

        if let Some(frame_id) = victim {
            inner.frame_info.remove(&frame_id);
            inner.num_evictable -= 1;
        }

        victim
    }

    /// Records that the given frame was accessed now. Creates the tracking
    /// node if the frame is unseen; migrating from young to mature happens
    /// implicitly once the access count reaches K.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.max_frames,
            "frame id {} out of range (max {})",
            frame_id,
            self.max_frames
        );

        let timestamp = self.current_timestamp.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        inner
            .frame_info
            .entry(frame_id)
            .or_insert_with(FrameAccessInfo::new)
            .record_access(timestamp, self.k);
    }

    /// Sets whether a frame is evictable. No-op if the flag is unchanged
    /// or the frame is unknown.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        assert!(
            frame_id.as_usize() < self.max_frames,
            "frame id {} out of range (max {})",
            frame_id,
            self.max_frames
        );

        let mut inner = self.inner.lock();

        if let Some(info) = inner.frame_info.get_mut(&frame_id) {
            if info.is_evictable != is_evictable {
                info.is_evictable = is_evictable;
                if is_evictable {
                    inner.num_evictable += 1;
                } else {
                    inner.num_evictable -= 1;
                }
            }
        }
    }

    /// Removes a frame from the replacer entirely. The frame must be
    /// evictable; removing a pinned frame is a caller bug.
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();

        if let Some(info) = inner.frame_info.remove(&frame_id) {
            assert!(
                info.is_evictable,
                "removed frame {} while it was not evictable",
                frame_id
            );
            inner.num_evictable -= 1;
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}
