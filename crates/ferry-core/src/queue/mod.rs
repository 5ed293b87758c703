//! Queue port and its backends.

mod entry;
mod memory;
#[cfg(feature = "nats")]
mod nats_queue;
#[cfg(feature = "redis")]
mod redis_queue;
mod retry;

pub use entry::QueueEntry;
pub use memory::InMemoryQueue;
#[cfg(feature = "nats")]
pub use nats_queue::NatsQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisQueue;
pub use retry::{RetryDecision, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{QueueOptions, WorkerOptions};
use crate::domain::{ItemId, Payload, QueueItem};
use crate::error::QueueError;
use crate::observability::{QueueCounters, QueueStats};
use crate::worker::{WorkItemHandler, WorkerGroup};

/// Reliable work queue: at-least-once delivery with visibility timeouts,
/// bounded retries and a dead-letter queue.
///
/// Design:
/// - The backend owns every item state transition (ready -> in flight -> ...).
/// - Consumers get a `QueueEntry` handle and report the outcome through it
///   (or through `complete`/`abandon` here, which is the same thing).
/// - Deliveries that are never resolved are abandoned by the backend's
///   timeout sweep once `work_item_timeout` passes.
#[async_trait]
pub trait Queue<T: Payload>: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> &QueueOptions;

    fn counters(&self) -> &QueueCounters;

    /// Store a new item at the tail of the ready queue.
    async fn enqueue(&self, payload: T) -> Result<ItemId, QueueError>;

    /// Take the oldest ready item.
    ///
    /// `wait`:
    /// - `None` blocks until an item arrives or the queue is disposed.
    /// - `Some(Duration::ZERO)` checks once and returns immediately.
    /// - `Some(d)` gives up after `d` and returns `Ok(None)`.
    async fn dequeue(&self, wait: Option<Duration>) -> Result<Option<QueueEntry<T>>, QueueError>;

    /// Remove the delivered item for good.
    async fn complete(&self, entry: &QueueEntry<T>) -> Result<(), QueueError>;

    /// Give the item back: redelivered while retries remain, dead-lettered after.
    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<(), QueueError>;

    /// Extend the visibility deadline of an in-flight entry by `work_item_timeout`.
    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Dead-lettered items, oldest first. Does not remove them.
    async fn dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError>;

    /// Remove and return every dead-lettered item.
    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError>;

    /// Drop every stored item and reset the counters.
    async fn delete_queue(&self) -> Result<(), QueueError>;

    /// Stop background tasks and wake blocked dequeuers. Idempotent.
    async fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// Run `handler` for every delivered item on a background worker loop.
    fn start_working<H>(&self, handler: H, auto_complete: bool) -> WorkerGroup
    where
        Self: Clone + Sized + 'static,
        H: WorkItemHandler<T> + 'static,
    {
        WorkerGroup::spawn(
            1,
            Arc::new(self.clone()),
            Arc::new(handler),
            auto_complete,
            WorkerOptions::default(),
        )
    }
}
