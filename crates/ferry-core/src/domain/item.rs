//! Stored item: payload + delivery metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ItemId;

/// Anything that can travel through a queue.
///
/// Remote backends serialize payloads as JSON; the in-memory backend clones them
/// for each delivery.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Payload + delivery metadata.
///
/// - `payload` and `enqueued_at` never change after enqueue.
/// - `attempts` counts deliveries and never exceeds `retries + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: ItemId,
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,

    /// Number of times the item has been delivered.
    pub attempts: u32,

    pub first_dequeued_at: Option<DateTime<Utc>>,
    pub last_dequeued_at: Option<DateTime<Utc>>,

    /// Last lock renewal, if any.
    pub renewed_at: Option<DateTime<Utc>>,

    /// Visibility deadline of the current delivery.
    pub deadline: Option<DateTime<Utc>>,

    pub is_deadlettered: bool,
}

impl<T> QueueItem<T> {
    pub fn new(payload: T) -> Self {
        Self::with_id(ItemId::generate(), payload)
    }

    pub fn with_id(id: ItemId, payload: T) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            first_dequeued_at: None,
            last_dequeued_at: None,
            renewed_at: None,
            deadline: None,
            is_deadlettered: false,
        }
    }

    /// Record a delivery: bump attempts and open a visibility window.
    pub fn start_attempt(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.attempts += 1;
        self.first_dequeued_at.get_or_insert(now);
        self.last_dequeued_at = Some(now);
        self.renewed_at = None;
        self.deadline = Some(deadline_after(now, timeout));
    }

    /// Push the visibility deadline out again.
    pub fn renew(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.renewed_at = Some(now);
        self.deadline = Some(deadline_after(now, timeout));
    }

    /// Back to waiting: the current delivery is over.
    pub fn release(&mut self) {
        self.deadline = None;
    }

    pub fn mark_deadlettered(&mut self) {
        self.deadline = None;
        self.is_deadlettered = true;
    }

    /// `true` once another delivery would exceed `retries + 1` attempts.
    pub fn retries_exhausted(&self, retries: u32) -> bool {
        self.attempts > retries
    }
}

pub(crate) fn deadline_after(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
