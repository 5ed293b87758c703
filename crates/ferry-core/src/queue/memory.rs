//! In-memory queue implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Queue, QueueEntry, RetryDecision, RetryPolicy};
use crate::config::QueueOptions;
use crate::domain::{EntryState, ItemId, ItemState, Payload, QueueItem};
use crate::error::QueueError;
use crate::observability::{QueueCounters, QueueStats, StorageSizes};

/// Item waiting out a retry delay.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps equal times in abandon order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledItem {
    ready_at: Instant,
    seq: u64,
    id: ItemId,
}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.ready_at, other.seq).cmp(&(self.ready_at, self.seq))
    }
}

/// Visibility lock of the current delivery.
#[derive(Debug, Clone, Copy)]
struct Lease {
    attempts: u32,
    deadline: Instant,
}

struct Slot<T> {
    item: QueueItem<T>,
    state: ItemState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbandonOutcome {
    Requeued,
    Scheduled(Duration),
    DeadLettered { evicted: Option<ItemId> },
}

/// Everything mutable, guarded by one lock.
///
/// `slots` is the single source of truth; the queue structures hold ids only.
struct MemoryState<T> {
    slots: HashMap<ItemId, Slot<T>>,
    ready: VecDeque<ItemId>,
    in_flight: HashMap<ItemId, Lease>,
    scheduled: BinaryHeap<ScheduledItem>,
    dead_letter: VecDeque<ItemId>,
    next_seq: u64,
}

impl<T: Payload> MemoryState<T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
            scheduled: BinaryHeap::new(),
            dead_letter: VecDeque::new(),
            next_seq: 0,
        }
    }

    fn push_ready(&mut self, item: QueueItem<T>) {
        let id = item.id;
        self.slots.insert(
            id,
            Slot {
                item,
                state: ItemState::Queued,
            },
        );
        self.ready.push_back(id);
    }

    /// Move retry-delayed items whose time has come to the ready queue.
    fn promote_scheduled(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.scheduled.peek() {
            if entry.ready_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(slot) = self.slots.get_mut(&entry.id)
                && slot.state == ItemState::RetryScheduled
            {
                slot.state = ItemState::Queued;
                self.ready.push_back(entry.id);
                promoted += 1;
            }
        }
        promoted
    }

    /// Deliver the oldest ready item: attempts++, open the visibility window.
    fn take_next(&mut self, timeout: Duration) -> Option<QueueItem<T>> {
        while let Some(id) = self.ready.pop_front() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if !slot.state.is_dequeueable() {
                continue;
            }
            slot.state = ItemState::InFlight;
            slot.item.start_attempt(Utc::now(), timeout);
            self.in_flight.insert(
                id,
                Lease {
                    attempts: slot.item.attempts,
                    deadline: deadline_after(Instant::now(), timeout),
                },
            );
            return Some(slot.item.clone());
        }
        None
    }

    /// End the delivery `(id, attempts)`; fails if it is no longer the live one.
    fn release_lease(&mut self, id: ItemId, attempts: u32) -> Result<(), QueueError> {
        match self.in_flight.get(&id) {
            Some(lease) if lease.attempts == attempts => {
                self.in_flight.remove(&id);
                Ok(())
            }
            _ => Err(QueueError::EntryNotInFlight { id, attempts }),
        }
    }

    fn complete(&mut self, id: ItemId, attempts: u32) -> Result<(), QueueError> {
        self.release_lease(id, attempts)?;
        self.slots.remove(&id);
        Ok(())
    }

    fn abandon(
        &mut self,
        id: ItemId,
        attempts: u32,
        policy: &RetryPolicy,
        dead_letter_max_items: usize,
        now: Instant,
    ) -> Result<AbandonOutcome, QueueError> {
        self.release_lease(id, attempts)?;
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(QueueError::EntryNotInFlight { id, attempts })?;

        match policy.decide(slot.item.attempts) {
            RetryDecision::Requeue { delay: None } => {
                slot.item.release();
                slot.state = ItemState::Queued;
                self.ready.push_back(id);
                Ok(AbandonOutcome::Requeued)
            }
            RetryDecision::Requeue { delay: Some(delay) } => {
                slot.item.release();
                slot.state = ItemState::RetryScheduled;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.scheduled.push(ScheduledItem {
                    ready_at: deadline_after(now, delay),
                    seq,
                    id,
                });
                Ok(AbandonOutcome::Scheduled(delay))
            }
            RetryDecision::DeadLetter => {
                slot.item.mark_deadlettered();
                slot.state = ItemState::DeadLettered;
                self.dead_letter.push_back(id);
                let evicted = if self.dead_letter.len() > dead_letter_max_items {
                    self.dead_letter.pop_front().inspect(|old| {
                        self.slots.remove(old);
                    })
                } else {
                    None
                };
                Ok(AbandonOutcome::DeadLettered { evicted })
            }
        }
    }

    fn renew(&mut self, id: ItemId, attempts: u32, timeout: Duration) -> Result<(), QueueError> {
        match self.in_flight.get_mut(&id) {
            Some(lease) if lease.attempts == attempts => {
                lease.deadline = deadline_after(Instant::now(), timeout);
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.item.renew(Utc::now(), timeout);
                }
                Ok(())
            }
            _ => Err(QueueError::EntryNotInFlight { id, attempts }),
        }
    }

    /// Deliveries whose visibility deadline has passed.
    fn expired(&self, now: Instant) -> Vec<(ItemId, u32)> {
        let mut expired: Vec<_> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, lease)| (*id, lease.attempts, lease.deadline))
            .collect();
        expired.sort_by_key(|(id, _, deadline)| (*deadline, *id));
        expired
            .into_iter()
            .map(|(id, attempts, _)| (id, attempts))
            .collect()
    }

    fn next_retry(&self) -> Option<Instant> {
        self.scheduled.peek().map(|entry| entry.ready_at)
    }

    /// Earliest moment the sweep has something to do.
    fn next_wake(&self) -> Option<Instant> {
        let next_deadline = self.in_flight.values().map(|lease| lease.deadline).min();
        match (next_deadline, self.next_retry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dead_letter_items(&self) -> Vec<QueueItem<T>> {
        self.dead_letter
            .iter()
            .filter_map(|id| self.slots.get(id))
            .map(|slot| slot.item.clone())
            .collect()
    }

    fn drain_dead_letters(&mut self) -> Vec<QueueItem<T>> {
        let ids: Vec<_> = self.dead_letter.drain(..).collect();
        ids.into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .map(|slot| slot.item)
            .collect()
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.ready.clear();
        self.in_flight.clear();
        self.scheduled.clear();
        self.dead_letter.clear();
    }

    fn sizes(&self) -> StorageSizes {
        StorageSizes {
            queued: self.ready.len() as u64,
            working: self.in_flight.len() as u64,
            scheduled: self.scheduled.len() as u64,
            deadletter: self.dead_letter.len() as u64,
        }
    }
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    // far enough to never fire, small enough not to overflow Instant
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

struct Shared<T> {
    options: QueueOptions,
    policy: RetryPolicy,
    state: Mutex<MemoryState<T>>,
    counters: QueueCounters,

    /// Wakes blocked dequeuers.
    notify: Notify,

    /// Wakes the sweep task early (new deadline or retry to watch).
    sweep_wake: Arc<Notify>,

    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Payload> Shared<T> {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed(self.options.name.clone()));
        }
        Ok(())
    }

    fn after_abandon(&self, id: ItemId, attempts: u32, outcome: AbandonOutcome, timed_out: bool) {
        self.counters.record_abandoned();
        if timed_out {
            self.counters.record_timeout();
        }

        match outcome {
            AbandonOutcome::Requeued => {
                debug!(queue = %self.options.name, item_id = %id, attempts, timed_out, "item requeued");
                self.notify.notify_one();
            }
            AbandonOutcome::Scheduled(delay) => {
                debug!(queue = %self.options.name, item_id = %id, attempts, timed_out, ?delay, "item retry scheduled");
                self.sweep_wake.notify_one();
            }
            AbandonOutcome::DeadLettered { evicted } => {
                self.counters.record_deadlettered();
                info!(queue = %self.options.name, item_id = %id, attempts, timed_out, "item moved to dead letter queue");
                if let Some(evicted) = evicted {
                    debug!(queue = %self.options.name, item_id = %evicted, "dead letter queue full, evicted oldest item");
                }
            }
        }
    }

    /// Abandon expired deliveries and promote due retries.
    /// Returns when the sweep should run next.
    async fn sweep(&self) -> Option<Instant> {
        let now = Instant::now();
        let (abandoned, promoted, next_wake) = {
            let mut state = self.state.lock().await;
            let mut abandoned = Vec::new();
            for (id, attempts) in state.expired(now) {
                match state.abandon(
                    id,
                    attempts,
                    &self.policy,
                    self.options.dead_letter_max_items,
                    now,
                ) {
                    Ok(outcome) => abandoned.push((id, attempts, outcome)),
                    Err(err) => warn!(queue = %self.options.name, item_id = %id, error = %err, "timeout abandon failed"),
                }
            }
            let promoted = state.promote_scheduled(now);
            (abandoned, promoted, state.next_wake())
        }; // Lock released here

        for (id, attempts, outcome) in abandoned {
            warn!(queue = %self.options.name, item_id = %id, attempts, "visibility timeout expired");
            self.after_abandon(id, attempts, outcome, true);
        }
        for _ in 0..promoted {
            self.notify.notify_one();
        }
        next_wake
    }
}

/// Sweep loop owned by the queue.
///
/// Holds only a `Weak` between runs, so dropping every queue handle drops the
/// shutdown sender and ends the loop.
async fn run_sweeper<T: Payload>(
    shared: Weak<Shared<T>>,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    loop {
        let next_wake = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.disposed.load(Ordering::Acquire) {
                break;
            }
            shared.sweep().await
        };

        let idle_until = deadline_after(Instant::now(), interval);
        let sleep_until = next_wake.map_or(idle_until, |at| at.min(idle_until));

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = wake.notified() => {}
            _ = tokio::time::sleep_until(sleep_until) => {}
        }
    }
    debug!("timeout sweep stopped");
}

/// In-process queue.
///
/// All state lives behind one async mutex; a sweep task started by `new`
/// abandons deliveries whose visibility timeout expired. Handles are cheap to
/// clone and share the same queue.
pub struct InMemoryQueue<T: Payload> {
    shared: Arc<Shared<T>>,
}

impl<T: Payload> Clone for InMemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Payload> InMemoryQueue<T> {
    /// Create the queue and start its sweep task. Must run inside a Tokio runtime.
    pub fn new(options: QueueOptions) -> Result<Self, QueueError> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| QueueError::Config(format!("in-memory queue needs a tokio runtime: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweep_wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            policy: options.retry_policy(),
            state: Mutex::new(MemoryState::new()),
            counters: QueueCounters::new(),
            notify: Notify::new(),
            sweep_wake: Arc::clone(&sweep_wake),
            disposed: AtomicBool::new(false),
            shutdown_tx,
            options,
        });

        runtime.spawn(run_sweeper(
            Arc::downgrade(&shared),
            sweep_wake,
            shutdown_rx,
            shared.options.maintenance_interval,
        ));

        info!(
            queue = %shared.options.name,
            retries = shared.options.retries,
            work_item_timeout = ?shared.options.work_item_timeout,
            "in-memory queue started"
        );
        Ok(Self { shared })
    }

    /// Queue with default options under `name`.
    pub fn with_name(name: impl Into<String>) -> Result<Self, QueueError> {
        Self::new(QueueOptions::new(name))
    }

    fn shared_handle(&self) -> Arc<dyn Queue<T>> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl<T: Payload> Queue<T> for InMemoryQueue<T> {
    fn name(&self) -> &str {
        &self.shared.options.name
    }

    fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    fn counters(&self) -> &QueueCounters {
        &self.shared.counters
    }

    async fn enqueue(&self, payload: T) -> Result<ItemId, QueueError> {
        self.shared.ensure_open()?;
        let item = QueueItem::new(payload);
        let id = item.id;
        {
            let mut state = self.shared.state.lock().await;
            state.push_ready(item);
        }
        self.shared.counters.record_enqueued();
        debug!(queue = %self.name(), item_id = %id, "item enqueued");

        // Notify waiting workers
        self.shared.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, wait: Option<Duration>) -> Result<Option<QueueEntry<T>>, QueueError> {
        let give_up_at = wait.map(|wait| deadline_after(Instant::now(), wait));
        let timeout = self.shared.options.work_item_timeout;

        loop {
            // Register interest before looking at the state so an enqueue
            // between the check and the wait is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.shared.ensure_open()?;
            let next_retry = {
                let mut state = self.shared.state.lock().await;
                state.promote_scheduled(Instant::now());
                if let Some(item) = state.take_next(timeout) {
                    drop(state);
                    self.shared.counters.record_dequeued();
                    self.shared.sweep_wake.notify_one();
                    debug!(queue = %self.name(), item_id = %item.id, attempts = item.attempts, "item dequeued");
                    return Ok(Some(QueueEntry::new(item, self.shared_handle())));
                }
                state.next_retry()
            };

            if let Some(give_up_at) = give_up_at
                && Instant::now() >= give_up_at
            {
                return Ok(None);
            }

            let wake_at = match (give_up_at, next_retry) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake_at {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn complete(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        entry
            .resolve(EntryState::Completed, async {
                self.shared.ensure_open()?;
                {
                    let mut state = self.shared.state.lock().await;
                    state.complete(entry.id(), entry.attempts())?;
                }
                self.shared.counters.record_completed();
                debug!(queue = %self.name(), item_id = %entry.id(), attempts = entry.attempts(), "item completed");
                Ok(())
            })
            .await
    }

    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        entry
            .resolve(EntryState::Abandoned, async {
                self.shared.ensure_open()?;
                let outcome = {
                    let mut state = self.shared.state.lock().await;
                    state.abandon(
                        entry.id(),
                        entry.attempts(),
                        &self.shared.policy,
                        self.shared.options.dead_letter_max_items,
                        Instant::now(),
                    )?
                };
                self.shared
                    .after_abandon(entry.id(), entry.attempts(), outcome, false);
                Ok(())
            })
            .await
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        self.shared.ensure_open()?;
        let mut state = self.shared.state.lock().await;
        state.renew(
            entry.id(),
            entry.attempts(),
            self.shared.options.work_item_timeout,
        )?;
        debug!(queue = %self.name(), item_id = %entry.id(), "lock renewed");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let sizes = self.shared.state.lock().await.sizes();
        Ok(self.shared.counters.snapshot(sizes))
    }

    async fn dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        Ok(self.shared.state.lock().await.dead_letter_items())
    }

    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        let drained = self.shared.state.lock().await.drain_dead_letters();
        info!(queue = %self.name(), count = drained.len(), "dead letter queue drained");
        Ok(drained)
    }

    async fn delete_queue(&self) -> Result<(), QueueError> {
        self.shared.ensure_open()?;
        self.shared.state.lock().await.clear();
        self.shared.counters.reset();
        info!(queue = %self.name(), "queue deleted");
        Ok(())
    }

    async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // ignore send error: the sweep may already be gone
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.notify.notify_waiters();
        info!(queue = %self.name(), "in-memory queue disposed");
    }

    fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SimpleWorkItem {
        data: String,
        id: u32,
    }

    fn hello() -> SimpleWorkItem {
        SimpleWorkItem {
            data: "Hello".to_string(),
            id: 0,
        }
    }

    fn queue(options: QueueOptions) -> InMemoryQueue<SimpleWorkItem> {
        InMemoryQueue::new(options).unwrap()
    }

    fn fast(retries: u32, timeout_ms: u64) -> QueueOptions {
        QueueOptions::new("test")
            .retries(retries)
            .work_item_timeout(Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete() {
        let queue = queue(QueueOptions::new("test"));
        queue.enqueue(hello()).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().queued, 1);

        let entry = queue
            .dequeue(Some(Duration::ZERO))
            .await
            .unwrap()
            .expect("item ready");
        assert_eq!(entry.payload().data, "Hello");
        assert_eq!(entry.attempts(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.working, 1);
        assert_eq!(stats.dequeued, 1);

        entry.complete().await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.working, 0);
        assert!(entry.is_completed());
    }

    #[tokio::test]
    async fn dequeues_in_enqueue_order() {
        let queue = queue(QueueOptions::new("test"));
        for id in 0..10 {
            queue
                .enqueue(SimpleWorkItem {
                    data: format!("item {id}"),
                    id,
                })
                .await
                .unwrap();
        }

        for expected in 0..10 {
            let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
            assert_eq!(entry.payload().id, expected);
            entry.complete().await.unwrap();
        }
    }

    #[tokio::test]
    async fn zero_wait_on_empty_queue_returns_none() {
        let queue = queue(QueueOptions::new("test"));
        let started = Instant::now();
        assert!(queue.dequeue(Some(Duration::ZERO)).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn positive_wait_gives_up() {
        let queue = queue(QueueOptions::new("test"));
        let started = Instant::now();
        let entry = queue.dequeue(Some(Duration::from_millis(100))).await.unwrap();
        assert!(entry.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn enqueue_wakes_blocked_dequeue() {
        let queue = queue(QueueOptions::new("test"));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue(None).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(hello()).await.unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("woken with an item");
        assert_eq!(entry.payload().data, "Hello");
    }

    #[tokio::test]
    async fn timed_out_item_returns_to_ready() {
        let queue = queue(fast(1, 10));
        queue.enqueue(hello()).await.unwrap();

        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(entry.payload().data, "Hello");
        assert_eq!(queue.stats().await.unwrap().queued, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.working, 0);
    }

    #[tokio::test]
    async fn dead_letters_after_retries_exhausted() {
        let queue = queue(fast(1, 10));
        queue.enqueue(hello()).await.unwrap();

        let first = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(first.attempts(), 1);
        assert_eq!(queue.stats().await.unwrap().dequeued, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.stats().await.unwrap().abandoned, 1);

        let second = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(second.attempts(), 2);
        assert_eq!(queue.stats().await.unwrap().dequeued, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.deadlettered, 1);
        assert_eq!(stats.deadletter, 1);
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.queued, 0);

        assert!(queue.dequeue(Some(Duration::from_millis(50))).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().dequeued, 2);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].is_deadlettered);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn explicit_abandon_requeues_then_dead_letters() {
        let queue = queue(QueueOptions::new("test").retries(1));
        queue.enqueue(hello()).await.unwrap();

        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        entry.abandon().await.unwrap();
        assert!(entry.is_abandoned());
        assert_eq!(queue.stats().await.unwrap().queued, 1);

        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        entry.abandon().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.deadlettered, 1);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.completed + stats.deadlettered, stats.enqueued);
    }

    #[tokio::test]
    async fn resolving_twice_is_rejected_without_touching_counters() {
        let queue = queue(QueueOptions::new("test"));
        queue.enqueue(hello()).await.unwrap();
        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();

        entry.complete().await.unwrap();
        let before = queue.stats().await.unwrap();

        let err = entry.abandon().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidEntryState {
                state: EntryState::Completed,
                ..
            }
        ));
        assert!(matches!(
            queue.complete(&entry).await,
            Err(QueueError::InvalidEntryState { .. })
        ));
        assert_eq!(queue.stats().await.unwrap(), before);
    }

    #[tokio::test]
    async fn late_complete_after_timeout_is_rejected() {
        let queue = queue(fast(3, 40));
        queue.enqueue(hello()).await.unwrap();
        let stale = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let fresh = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(fresh.id(), stale.id());
        assert_eq!(fresh.attempts(), 2);

        let err = stale.complete().await.unwrap_err();
        assert!(matches!(err, QueueError::EntryNotInFlight { attempts: 1, .. }));
        assert!(!stale.is_completed());
        assert_eq!(stale.state(), EntryState::Pending);
        assert!(matches!(
            stale.abandon().await,
            Err(QueueError::EntryNotInFlight { .. })
        ));
        assert!(!stale.is_abandoned());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.abandoned, 1);

        fresh.complete().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn retry_delay_holds_item_back() {
        let queue = queue(
            QueueOptions::new("test")
                .retries(2)
                .retry_delay(Duration::from_millis(150)),
        );
        queue.enqueue(hello()).await.unwrap();
        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        entry.abandon().await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.scheduled, 1);
        assert!(queue.dequeue(Some(Duration::ZERO)).await.unwrap().is_none());

        let started = Instant::now();
        let entry = queue
            .dequeue(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("redelivered after the delay");
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(entry.attempts(), 2);
    }

    #[tokio::test]
    async fn complete_after_dispose_leaves_entry_pending() {
        let queue = queue(QueueOptions::new("test"));
        queue.enqueue(hello()).await.unwrap();
        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();

        queue.dispose().await;
        assert!(matches!(entry.complete().await, Err(QueueError::Disposed(_))));
        assert!(!entry.is_completed());
        assert!(!entry.is_resolved());
        assert_eq!(queue.counters().completed(), 0);
    }

    #[tokio::test]
    async fn retry_delay_also_applies_to_timeouts() {
        let queue = queue(fast(2, 10).retry_delay(Duration::from_millis(200)));
        queue.enqueue(hello()).await.unwrap();
        let started = Instant::now();
        let first = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(first.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.scheduled, 1);
        assert!(queue.dequeue(Some(Duration::ZERO)).await.unwrap().is_none());

        let second = queue
            .dequeue(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("redelivered after the delay");
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(second.attempts(), 2);
        assert_eq!(queue.stats().await.unwrap().scheduled, 0);
    }

    #[tokio::test]
    async fn renew_lock_prevents_timeout() {
        let queue = queue(fast(1, 100));
        queue.enqueue(hello()).await.unwrap();
        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            entry.renew_lock().await.unwrap();
        }
        assert_eq!(queue.stats().await.unwrap().abandoned, 0);
        entry.complete().await.unwrap();
        assert!(entry.renew_lock().await.is_err());
    }

    #[tokio::test]
    async fn dead_letter_queue_is_bounded() {
        let queue = queue(QueueOptions::new("test").retries(0).dead_letter_max_items(2));
        for id in 0..3 {
            queue
                .enqueue(SimpleWorkItem {
                    data: "x".into(),
                    id,
                })
                .await
                .unwrap();
            let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();
            entry.abandon().await.unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.deadlettered, 3);
        assert_eq!(stats.deadletter, 2);
        let ids: Vec<_> = queue
            .dead_letters()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.payload.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let drained = queue.drain_dead_letters().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispose_releases_blocked_dequeue() {
        let queue = queue(QueueOptions::new("test"));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.dispose().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(QueueError::Disposed(_))));
        assert!(queue.is_disposed());
        assert!(matches!(
            queue.enqueue(hello()).await,
            Err(QueueError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn delete_queue_resets_everything() {
        let queue = queue(QueueOptions::new("test"));
        queue.enqueue(hello()).await.unwrap();
        queue.enqueue(hello()).await.unwrap();
        let entry = queue.dequeue(Some(Duration::ZERO)).await.unwrap().unwrap();

        queue.delete_queue().await.unwrap();
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        assert!(matches!(
            entry.complete().await,
            Err(QueueError::EntryNotInFlight { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing() {
        let queue = queue(QueueOptions::new("test"));
        let producers: Vec<_> = (0..50)
            .map(|id| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .enqueue(SimpleWorkItem {
                            data: "Hello".into(),
                            id,
                        })
                        .await
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap().unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.enqueued, 50);
        assert_eq!(stats.queued, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dequeues_never_share_an_item() {
        let queue = queue(QueueOptions::new("test"));
        for id in 0..100 {
            queue
                .enqueue(SimpleWorkItem {
                    data: "x".into(),
                    id,
                })
                .await
                .unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(entry) = queue.dequeue(Some(Duration::ZERO)).await.unwrap() {
                        seen.push(entry.payload().id);
                        entry.complete().await.unwrap();
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
        assert_eq!(queue.stats().await.unwrap().completed, 100);
    }

    #[tokio::test]
    async fn rejects_invalid_options() {
        let result =
            InMemoryQueue::<SimpleWorkItem>::new(QueueOptions::new("t").work_item_timeout(Duration::ZERO));
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
