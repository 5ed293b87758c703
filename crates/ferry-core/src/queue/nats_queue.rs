//! NATS JetStream-backed queue.
//!
//! Items are published to `<subject_prefix>.<queue name>` on a work-queue
//! stream and consumed through one durable pull consumer with explicit acks.
//! The server owns redelivery; this adapter keeps its own in-flight table so
//! timeouts and counters behave like the other backends.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::stream::{Config as StreamConfig, DiscardPolicy, RetentionPolicy};
use async_nats::jetstream::{self, AckKind, Context, Message};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Queue, QueueEntry, RetryDecision, RetryPolicy};
use crate::config::{NatsOptions, QueueOptions};
use crate::domain::{EntryState, ItemId, Payload, QueueItem};
use crate::error::QueueError;
use crate::observability::{QueueCounters, QueueStats, StorageSizes};

/// Longest single pull request while blocking without a deadline.
const MAX_PULL_EXPIRES: Duration = Duration::from_secs(30);

fn backend(err: impl Display) -> QueueError {
    QueueError::BackendUnavailable(err.to_string())
}

/// Stream names may not contain `.`, `*`, `>` or whitespace.
fn stream_name(configured: &str, queue: &str) -> String {
    let raw = if configured.is_empty() {
        queue.to_uppercase()
    } else {
        configured.to_string()
    };
    raw.chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn deadline_in(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

struct InFlight {
    message: Message,
    attempts: u32,
    deadline: Instant,
}

struct Inner {
    options: QueueOptions,
    policy: RetryPolicy,
    subject: String,
    dl_subject: String,
    stream_name: String,
    dl_stream_name: String,
    context: Context,
    consumer: Consumer<ConsumerConfig>,
    in_flight: Mutex<HashMap<ItemId, InFlight>>,
    counters: QueueCounters,
    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed(self.options.name.clone()));
        }
        Ok(())
    }

    /// Take the live delivery `(id, attempts)` out of the in-flight table.
    async fn take_in_flight(&self, id: ItemId, attempts: u32) -> Result<InFlight, QueueError> {
        let mut in_flight = self.in_flight.lock().await;
        match in_flight.get(&id) {
            Some(flight) if flight.attempts == attempts => {
                in_flight.remove(&id).ok_or(QueueError::EntryNotInFlight { id, attempts })
            }
            _ => Err(QueueError::EntryNotInFlight { id, attempts }),
        }
    }

    async fn restore_in_flight(&self, id: ItemId, flight: InFlight) {
        self.in_flight.lock().await.insert(id, flight);
    }

    async fn publish_dead_letter(&self, payload: &[u8], attempts: u32) -> Result<(), QueueError> {
        let mut item: serde_json::Value = serde_json::from_slice(payload)?;
        item["attempts"] = attempts.into();
        item["is_deadlettered"] = true.into();
        let bytes = serde_json::to_vec(&item)?;

        self.context
            .publish(self.dl_subject.clone(), bytes.into())
            .await
            .map_err(backend)?
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// Hand the delivery back to the server: nak for a redelivery, or
    /// dead-letter and terminate once retries are exhausted.
    async fn abandon_delivery(&self, id: ItemId, flight: InFlight, timed_out: bool) -> Result<(), QueueError> {
        let attempts = flight.attempts;
        let result = match self.policy.decide(attempts) {
            RetryDecision::Requeue { delay } => flight
                .message
                .ack_with(AckKind::Nak(delay))
                .await
                .map_err(backend)
                .map(|()| false),
            RetryDecision::DeadLetter => {
                match self.publish_dead_letter(&flight.message.payload, attempts).await {
                    Ok(()) => flight
                        .message
                        .ack_with(AckKind::Term)
                        .await
                        .map_err(backend)
                        .map(|()| true),
                    Err(e) => Err(e),
                }
            }
        };

        let dead_lettered = match result {
            Ok(dead_lettered) => dead_lettered,
            Err(e) => {
                if e.is_transient() {
                    self.restore_in_flight(id, flight).await;
                }
                return Err(e);
            }
        };

        self.counters.record_abandoned();
        if timed_out {
            self.counters.record_timeout();
        }
        if dead_lettered {
            self.counters.record_deadlettered();
            info!(queue = %self.options.name, item_id = %id, attempts, timed_out, "item moved to dead letter queue");
        } else {
            debug!(queue = %self.options.name, item_id = %id, attempts, timed_out, "item returned for redelivery");
        }
        Ok(())
    }

    /// Abandon deliveries whose visibility deadline has passed.
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(ItemId, InFlight)> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<ItemId> = in_flight
                .iter()
                .filter(|(_, flight)| flight.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|flight| (id, flight)))
                .collect()
        }; // Lock released here

        let mut swept = 0;
        for (id, flight) in expired {
            warn!(queue = %self.options.name, item_id = %id, attempts = flight.attempts, "visibility timeout expired");
            match self.abandon_delivery(id, flight, true).await {
                Ok(()) => swept += 1,
                Err(e) => warn!(queue = %self.options.name, item_id = %id, error = %e, "timeout abandon failed"),
            }
        }
        swept
    }

    async fn pull_one(&self, wait: Duration) -> Result<Option<Message>, QueueError> {
        let mut messages = if wait.is_zero() {
            self.consumer
                .fetch()
                .max_messages(1)
                .messages()
                .await
                .map_err(backend)?
        } else {
            self.consumer
                .batch()
                .max_messages(1)
                .expires(wait)
                .messages()
                .await
                .map_err(backend)?
        };

        match messages.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(backend(e)),
            None => Ok(None),
        }
    }

    async fn read_dead_letters<T: Payload>(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        let mut stream = self.context.get_stream(&self.dl_stream_name).await.map_err(backend)?;
        let info = stream.info().await.map_err(backend)?;
        let (first, last) = (info.state.first_sequence, info.state.last_sequence);
        if info.state.messages == 0 {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for sequence in first..=last {
            // purged or evicted sequences leave gaps
            let Ok(message) = stream.get_raw_message(sequence).await else {
                continue;
            };
            match serde_json::from_slice::<QueueItem<T>>(&message.payload) {
                Ok(item) => items.push(item),
                Err(e) => warn!(queue = %self.options.name, sequence, error = %e, "skipping unreadable dead letter"),
            }
        }
        Ok(items)
    }
}

async fn run_sweeper(inner: Weak<Inner>, mut shutdown_rx: watch::Receiver<bool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let swept = inner.sweep().await;
                if swept > 0 {
                    debug!(queue = %inner.options.name, swept, "timeout sweep finished");
                }
            }
        }
    }
    debug!("nats timeout sweep stopped");
}

/// Queue on a NATS JetStream work-queue stream.
pub struct NatsQueue<T: Payload> {
    inner: Arc<Inner>,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T: Payload> Clone for NatsQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _payload: std::marker::PhantomData,
        }
    }
}

impl<T: Payload> NatsQueue<T> {
    /// Connect to `nats_options.url`, create the streams and the durable consumer.
    pub async fn connect(options: QueueOptions, nats_options: NatsOptions) -> Result<Self, QueueError> {
        let client = async_nats::connect(nats_options.url.as_str())
            .await
            .map_err(backend)?;
        Self::with_context(jetstream::new(client), options, nats_options).await
    }

    /// Build on an existing JetStream context.
    pub async fn with_context(
        context: Context,
        options: QueueOptions,
        nats_options: NatsOptions,
    ) -> Result<Self, QueueError> {
        options.validate()?;

        let stream_name = stream_name(&nats_options.stream, &options.name);
        let dl_stream_name = format!("{stream_name}_DEADLETTER");
        let subject = format!("{}.{}", nats_options.subject_prefix, options.name);
        let dl_subject = format!("{subject}.deadletter");

        if nats_options.should_recreate {
            for name in [&stream_name, &dl_stream_name] {
                match context.delete_stream(name).await {
                    Ok(_) => info!(stream = %name, "stream deleted for recreate"),
                    Err(e) => debug!(stream = %name, error = %e, "stream not deleted"),
                }
            }
        }

        let stream = context
            .get_or_create_stream(StreamConfig {
                name: stream_name.clone(),
                subjects: vec![subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(backend)?;

        context
            .get_or_create_stream(StreamConfig {
                name: dl_stream_name.clone(),
                subjects: vec![dl_subject.clone()],
                max_messages: i64::try_from(options.dead_letter_max_items).unwrap_or(i64::MAX),
                discard: DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(backend)?;

        // The server redelivers on its own after ack_wait; the local sweep gets
        // one maintenance interval to act first.
        let ack_wait = options.work_item_timeout.saturating_add(options.maintenance_interval);
        let durable = format!("{stream_name}_WORKERS");
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait,
                    max_deliver: -1,
                    filter_subject: subject.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(backend)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            policy: options.retry_policy(),
            subject,
            dl_subject,
            stream_name,
            dl_stream_name,
            context,
            consumer,
            in_flight: Mutex::new(HashMap::new()),
            counters: QueueCounters::new(),
            disposed: AtomicBool::new(false),
            shutdown_tx,
            options,
        });

        tokio::spawn(run_sweeper(
            Arc::downgrade(&inner),
            shutdown_rx,
            inner.options.maintenance_interval,
        ));

        info!(
            queue = %inner.options.name,
            stream = %inner.stream_name,
            subject = %inner.subject,
            "nats queue started"
        );
        Ok(Self {
            inner,
            _payload: std::marker::PhantomData,
        })
    }

    /// Turn a pulled message into an entry, or route it away if it cannot be one.
    async fn accept(&self, message: Message) -> Result<Option<QueueEntry<T>>, QueueError> {
        let inner = &self.inner;
        let delivered = match message.info() {
            Ok(info) => u32::try_from(info.delivered).unwrap_or(u32::MAX),
            Err(e) => {
                warn!(queue = %inner.options.name, error = %e, "message info unavailable, assuming first delivery");
                1
            }
        };

        let mut item: QueueItem<T> = match serde_json::from_slice(&message.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!(queue = %inner.options.name, error = %e, "unreadable message, terminating");
                message.ack_with(AckKind::Term).await.map_err(backend)?;
                return Err(e.into());
            }
        };

        // Deliveries before this one.
        item.attempts = delivered.saturating_sub(1);

        // Redelivered by the server after a crash elsewhere, past its retry budget.
        if item.retries_exhausted(inner.options.retries) {
            inner.publish_dead_letter(&message.payload, item.attempts).await?;
            message.ack_with(AckKind::Term).await.map_err(backend)?;
            inner.counters.record_deadlettered();
            warn!(queue = %inner.options.name, item_id = %item.id, delivered, "untracked redelivery past retry budget, dead-lettered");
            return Ok(None);
        }

        let timeout = inner.options.work_item_timeout;
        item.start_attempt(Utc::now(), timeout);

        let id = item.id;
        let attempts = item.attempts;
        inner.in_flight.lock().await.insert(
            id,
            InFlight {
                message,
                attempts,
                deadline: deadline_in(timeout),
            },
        );
        inner.counters.record_dequeued();
        debug!(queue = %inner.options.name, item_id = %id, attempts, "item dequeued");
        Ok(Some(QueueEntry::new(item, Arc::new(self.clone()))))
    }
}

#[async_trait]
impl<T: Payload> Queue<T> for NatsQueue<T> {
    fn name(&self) -> &str {
        &self.inner.options.name
    }

    fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    fn counters(&self) -> &QueueCounters {
        &self.inner.counters
    }

    async fn enqueue(&self, payload: T) -> Result<ItemId, QueueError> {
        self.inner.ensure_open()?;
        let item = QueueItem::new(payload);
        let bytes = serde_json::to_vec(&item)?;

        self.inner
            .context
            .publish(self.inner.subject.clone(), bytes.into())
            .await
            .map_err(backend)?
            .await
            .map_err(backend)?;

        self.inner.counters.record_enqueued();
        debug!(queue = %self.name(), item_id = %item.id, "item enqueued");
        Ok(item.id)
    }

    async fn dequeue(&self, wait: Option<Duration>) -> Result<Option<QueueEntry<T>>, QueueError> {
        let give_up_at = wait.and_then(|wait| Instant::now().checked_add(wait));
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        loop {
            self.inner.ensure_open()?;
            let pull_for = match give_up_at {
                Some(at) => at.saturating_duration_since(Instant::now()).min(MAX_PULL_EXPIRES),
                None => MAX_PULL_EXPIRES,
            };

            let pulled = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                pulled = self.inner.pull_one(pull_for) => pulled?,
            };

            if let Some(message) = pulled
                && let Some(entry) = self.accept(message).await?
            {
                return Ok(Some(entry));
            }

            if let Some(at) = give_up_at
                && Instant::now() >= at
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        entry
            .resolve(EntryState::Completed, async {
                self.inner.ensure_open()?;
                let flight = self.inner.take_in_flight(entry.id(), entry.attempts()).await?;
                if let Err(e) = flight.message.ack().await {
                    self.inner.restore_in_flight(entry.id(), flight).await;
                    return Err(backend(e));
                }
                self.inner.counters.record_completed();
                debug!(queue = %self.name(), item_id = %entry.id(), attempts = entry.attempts(), "item completed");
                Ok(())
            })
            .await
    }

    async fn abandon(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        entry
            .resolve(EntryState::Abandoned, async {
                self.inner.ensure_open()?;
                let flight = self.inner.take_in_flight(entry.id(), entry.attempts()).await?;
                self.inner.abandon_delivery(entry.id(), flight, false).await
            })
            .await
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        let not_in_flight = || QueueError::EntryNotInFlight {
            id: entry.id(),
            attempts: entry.attempts(),
        };

        // The progress ack is a server round-trip; keep the table unlocked meanwhile.
        let message = {
            let in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&entry.id()) {
                Some(flight) if flight.attempts == entry.attempts() => flight.message.clone(),
                _ => return Err(not_in_flight()),
            }
        };
        message.ack_with(AckKind::Progress).await.map_err(backend)?;

        let mut in_flight = self.inner.in_flight.lock().await;
        match in_flight.get_mut(&entry.id()) {
            Some(flight) if flight.attempts == entry.attempts() => {
                flight.deadline = deadline_in(self.inner.options.work_item_timeout);
            }
            // resolved or swept while the ack was on the wire
            _ => return Err(not_in_flight()),
        }
        debug!(queue = %self.name(), item_id = %entry.id(), "lock renewed");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut consumer = self.inner.consumer.clone();
        let info = consumer.info().await.map_err(backend)?;
        let (pending, ack_pending) = (info.num_pending, info.num_ack_pending as u64);

        let mut dl_stream = self
            .inner
            .context
            .get_stream(&self.inner.dl_stream_name)
            .await
            .map_err(backend)?;
        let deadletter = dl_stream.info().await.map_err(backend)?.state.messages;

        let working = self.inner.in_flight.lock().await.len() as u64;
        Ok(self.inner.counters.snapshot(StorageSizes {
            // naked deliveries sit in ack-pending until redelivered
            queued: pending + ack_pending.saturating_sub(working),
            working,
            scheduled: 0,
            deadletter,
        }))
    }

    async fn dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        self.inner.read_dead_letters().await
    }

    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        let items = self.inner.read_dead_letters().await?;
        let stream = self
            .inner
            .context
            .get_stream(&self.inner.dl_stream_name)
            .await
            .map_err(backend)?;
        stream.purge().await.map_err(backend)?;
        info!(queue = %self.name(), count = items.len(), "dead letter queue drained");
        Ok(items)
    }

    async fn delete_queue(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        for name in [&self.inner.stream_name, &self.inner.dl_stream_name] {
            let stream = self.inner.context.get_stream(name).await.map_err(backend)?;
            stream.purge().await.map_err(backend)?;
        }
        self.inner.in_flight.lock().await.clear();
        self.inner.counters.reset();
        info!(queue = %self.name(), "queue deleted");
        Ok(())
    }

    async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // ignore send error: the sweep may already be gone
        let _ = self.inner.shutdown_tx.send(true);
        info!(queue = %self.name(), "nats queue disposed");
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}
