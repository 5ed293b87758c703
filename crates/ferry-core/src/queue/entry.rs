//! Consumer-side handle for one delivery.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::Queue;
use crate::domain::{EntryState, EntryStateCell, ItemId, Payload, QueueItem};
use crate::error::QueueError;

/// One delivered item.
///
/// Clones share the resolution state: completing through one clone makes every
/// other clone report `is_completed()`. An entry can be resolved once; a second
/// `complete`/`abandon` fails with `QueueError::InvalidEntryState`. A resolution
/// the backend rejects leaves the entry `Pending`.
pub struct QueueEntry<T: Payload> {
    inner: Arc<EntryInner<T>>,
}

struct EntryInner<T: Payload> {
    item: QueueItem<T>,
    state: EntryStateCell,
    queue: Arc<dyn Queue<T>>,
}

impl<T: Payload> Clone for QueueEntry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> QueueEntry<T> {
    /// `item` is the snapshot taken at delivery time (attempts already bumped).
    pub(crate) fn new(item: QueueItem<T>, queue: Arc<dyn Queue<T>>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                item,
                state: EntryStateCell::default(),
                queue,
            }),
        }
    }

    pub fn id(&self) -> ItemId {
        self.inner.item.id
    }

    pub fn payload(&self) -> &T {
        &self.inner.item.payload
    }

    pub fn item(&self) -> &QueueItem<T> {
        &self.inner.item
    }

    /// Delivery number of this entry, starting at 1.
    pub fn attempts(&self) -> u32 {
        self.inner.item.attempts
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.inner.item.enqueued_at
    }

    pub fn dequeued_at(&self) -> Option<DateTime<Utc>> {
        self.inner.item.last_dequeued_at
    }

    /// Visibility deadline at delivery time (not updated by `renew_lock`).
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.item.deadline
    }

    pub fn queue_name(&self) -> &str {
        self.inner.queue.name()
    }

    pub fn state(&self) -> EntryState {
        self.inner.state.get()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == EntryState::Completed
    }

    pub fn is_abandoned(&self) -> bool {
        self.state() == EntryState::Abandoned
    }

    pub fn is_resolved(&self) -> bool {
        self.state() != EntryState::Pending
    }

    pub async fn complete(&self) -> Result<(), QueueError> {
        self.inner.queue.complete(self).await
    }

    pub async fn abandon(&self) -> Result<(), QueueError> {
        self.inner.queue.abandon(self).await
    }

    pub async fn renew_lock(&self) -> Result<(), QueueError> {
        if self.is_resolved() {
            return Err(QueueError::InvalidEntryState {
                id: self.id(),
                state: self.state(),
            });
        }
        self.inner.queue.renew_lock(self).await
    }

    /// Claim the `Pending -> to` transition, then run the backend operation.
    ///
    /// The claim only sticks when the backend accepts it. Any failure (stale
    /// delivery, disposed queue, unreachable backend) reopens the entry, so the
    /// state flags report what actually happened to the item.
    pub(crate) async fn resolve<R, F>(&self, to: EntryState, op: F) -> Result<R, QueueError>
    where
        F: Future<Output = Result<R, QueueError>>,
    {
        self.inner
            .state
            .resolve(to)
            .map_err(|state| QueueError::InvalidEntryState {
                id: self.id(),
                state,
            })?;

        let result = op.await;
        if result.is_err() {
            self.inner.state.revert(to);
        }
        result
    }
}

impl<T: Payload + fmt::Debug> fmt::Debug for QueueEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("queue", &self.queue_name())
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("state", &self.state())
            .field("payload", self.payload())
            .finish()
    }
}
