//! Heap statistics and sweep metrics.

use std::time::Duration;

/// Space accounting of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes of page and large-object payload owned by the heap.
    pub allocated_space: usize,
    /// Bytes occupied by objects, headers included.
    pub object_space: usize,
}

impl HeapStats {
    /// Empty accounting.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocated_space: 0,
            object_space: 0,
        }
    }

    /// Adds `bytes` of payload owned by the heap.
    pub fn increase_allocated_space(&mut self, bytes: usize) {
        self.allocated_space += bytes;
    }

    /// Adds `bytes` occupied by objects.
    pub fn increase_object_space(&mut self, bytes: usize) {
        self.object_space += bytes;
    }

    /// Resets both counters.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Adds `other` into `self`.
    pub fn add(&mut self, other: &Self) {
        self.allocated_space += other.allocated_space;
        self.object_space += other.object_space;
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepMetrics {
    /// Unmarked objects that were finalized.
    pub objects_finalized: usize,
    /// Marked objects that survived.
    pub objects_surviving: usize,
    /// Pages emptied and moved to the page pool.
    pub pages_pooled: usize,
    /// Pages emptied and released to the OS.
    pub pages_released: usize,
    /// Large objects finalized and released.
    pub large_objects_released: usize,
    /// Large objects that survived.
    pub large_objects_surviving: usize,
    /// Wall-clock time spent sweeping.
    pub duration: Duration,
}

impl SweepMetrics {
    /// Metrics of a sweep that did nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects_finalized: 0,
            objects_surviving: 0,
            pages_pooled: 0,
            pages_released: 0,
            large_objects_released: 0,
            large_objects_surviving: 0,
            duration: Duration::ZERO,
        }
    }

    /// Folds the metrics of another heap's sweep into these.
    pub fn merge(&mut self, other: &Self) {
        self.objects_finalized += other.objects_finalized;
        self.objects_surviving += other.objects_surviving;
        self.pages_pooled += other.pages_pooled;
        self.pages_released += other.pages_released;
        self.large_objects_released += other.large_objects_released;
        self.large_objects_surviving += other.large_objects_surviving;
        self.duration += other.duration;
    }

    /// Objects reclaimed, large ones included.
    #[must_use]
    pub const fn total_finalized(&self) -> usize {
        self.objects_finalized + self.large_objects_released
    }
}
