//! Per-queue counters and the stats snapshot built from them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Monotonic counters owned by one queue instance.
///
/// Each state transition bumps exactly one counter (dead-lettering also counts
/// as an abandon, timeouts are a subset of abandons).
#[derive(Debug, Default)]
pub struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    completed: AtomicU64,
    abandoned: AtomicU64,
    worker_errors: AtomicU64,
    deadlettered: AtomicU64,
    timeouts: AtomicU64,
}

impl QueueCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        let n = self.enqueued.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(enqueued = n, "counter");
    }

    pub fn record_dequeued(&self) {
        let n = self.dequeued.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(dequeued = n, "counter");
    }

    pub fn record_completed(&self) {
        let n = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(completed = n, "counter");
    }

    pub fn record_abandoned(&self) {
        let n = self.abandoned.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(abandoned = n, "counter");
    }

    pub fn record_timeout(&self) {
        let n = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(timeouts = n, "counter");
    }

    pub fn record_worker_error(&self) {
        let n = self.worker_errors.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(worker_errors = n, "counter");
    }

    pub fn record_deadlettered(&self) {
        let n = self.deadlettered.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(deadlettered = n, "counter");
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn worker_errors(&self) -> u64 {
        self.worker_errors.load(Ordering::Relaxed)
    }

    pub fn deadlettered(&self) -> u64 {
        self.deadlettered.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Only `delete_queue` resets; counters are otherwise monotonic.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.enqueued,
            &self.dequeued,
            &self.completed,
            &self.abandoned,
            &self.worker_errors,
            &self.deadlettered,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Combine the counters with the backend's current storage sizes.
    pub fn snapshot(&self, sizes: StorageSizes) -> QueueStats {
        QueueStats {
            queued: sizes.queued,
            working: sizes.working,
            scheduled: sizes.scheduled,
            deadletter: sizes.deadletter,
            enqueued: self.enqueued(),
            dequeued: self.dequeued(),
            completed: self.completed(),
            abandoned: self.abandoned(),
            worker_errors: self.worker_errors(),
            deadlettered: self.deadlettered(),
            timeouts: self.timeouts(),
        }
    }
}

/// Current item counts per location, as reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageSizes {
    pub queued: u64,
    pub working: u64,
    pub scheduled: u64,
    pub deadletter: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items ready for dequeue (`Count`).
    pub queued: u64,
    /// Items in flight.
    pub working: u64,
    /// Items waiting out a retry delay.
    pub scheduled: u64,
    /// Items currently held in the dead-letter queue.
    pub deadletter: u64,

    pub enqueued: u64,
    pub dequeued: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub worker_errors: u64,
    /// Items ever moved to the dead-letter queue (`DeadletterCount`).
    pub deadlettered: u64,
    pub timeouts: u64,
}
