//! Redis-backed queue.
//!
//! Layout under `<key_prefix>:<queue name>:`
//! - `items`: hash id -> item JSON as enqueued
//! - `attempts`: hash id -> delivery count (plus `<id>:first`, first delivery ms)
//! - `ready`: list of ids, FIFO
//! - `inflight`: zset id -> visibility deadline (unix ms)
//! - `scheduled`: zset id -> retry time (unix ms)
//! - `deadletter`: list of ids, oldest first
//!
//! Every transition runs as a Lua script, so processes sharing one Redis never
//! deliver the same item twice and in-flight deadlines survive restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use super::{Queue, QueueEntry, RetryDecision, RetryPolicy};
use crate::config::{QueueOptions, RedisOptions};
use crate::domain::{EntryState, ItemId, Payload, QueueItem};
use crate::error::QueueError;
use crate::observability::{QueueCounters, QueueStats, StorageSizes};

const NOT_IN_FLIGHT: i64 = 0;
const REQUEUED: i64 = 1;
const SCHEDULED: i64 = 2;
const DEAD_LETTERED: i64 = 3;

/// `delay_ms` argument of the abandon script meaning "dead-letter".
const DEAD_LETTER_DELAY: i64 = -1;

struct Keys {
    items: String,
    attempts: String,
    ready: String,
    inflight: String,
    scheduled: String,
    deadletter: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{prefix}:{queue}");
        Self {
            items: format!("{base}:items"),
            attempts: format!("{base}:attempts"),
            ready: format!("{base}:ready"),
            inflight: format!("{base}:inflight"),
            scheduled: format!("{base}:scheduled"),
            deadletter: format!("{base}:deadletter"),
        }
    }

    fn all(&self) -> [&str; 6] {
        [
            &self.items,
            &self.attempts,
            &self.ready,
            &self.inflight,
            &self.scheduled,
            &self.deadletter,
        ]
    }
}

struct Scripts {
    dequeue: Script,
    complete: Script,
    abandon: Script,
    renew: Script,
    expired: Script,
    dead_letters: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            dequeue: Script::new(include_str!("./lua/dequeue.lua")),
            complete: Script::new(include_str!("./lua/complete.lua")),
            abandon: Script::new(include_str!("./lua/abandon.lua")),
            renew: Script::new(include_str!("./lua/renew.lua")),
            expired: Script::new(include_str!("./lua/expired.lua")),
            dead_letters: Script::new(include_str!("./lua/dead_letters.lua")),
        }
    }
}

struct Inner {
    options: QueueOptions,
    redis_options: RedisOptions,
    policy: RetryPolicy,
    keys: Keys,
    scripts: Scripts,
    conn: ConnectionManager,
    counters: QueueCounters,

    /// Wakes same-process dequeuers before the next poll.
    notify: Notify,

    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

type Claimed = (String, String, u32, i64);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl Inner {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Disposed(self.options.name.clone()));
        }
        Ok(())
    }

    /// Move the next ready item in flight and count the dequeue.
    ///
    /// Returns `(id, item json, attempts, first dequeue ms)`.
    async fn claim(self: Arc<Self>) -> Result<Option<Claimed>, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Option<Claimed> = self
            .scripts
            .dequeue
            .key(&self.keys.ready)
            .key(&self.keys.scheduled)
            .key(&self.keys.inflight)
            .key(&self.keys.items)
            .key(&self.keys.attempts)
            .arg(now_ms())
            .arg(millis(self.options.work_item_timeout))
            .invoke_async(&mut conn)
            .await?;
        if claimed.is_some() {
            self.counters.record_dequeued();
        }
        Ok(claimed)
    }

    /// `delay_ms` argument for the abandon script.
    fn abandon_delay(&self, attempts: u32) -> i64 {
        match self.policy.decide(attempts) {
            RetryDecision::DeadLetter => DEAD_LETTER_DELAY,
            RetryDecision::Requeue { delay } => delay.map_or(0, |d| millis(d).max(1)),
        }
    }

    /// Run the abandon script; `max_deadline_ms` limits it to expired deliveries.
    async fn abandon_delivery(
        &self,
        id: &str,
        attempts: u32,
        max_deadline_ms: i64,
    ) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .scripts
            .abandon
            .key(&self.keys.inflight)
            .key(&self.keys.ready)
            .key(&self.keys.scheduled)
            .key(&self.keys.deadletter)
            .key(&self.keys.items)
            .key(&self.keys.attempts)
            .arg(id)
            .arg(attempts)
            .arg(self.abandon_delay(attempts))
            .arg(now_ms())
            .arg(self.options.dead_letter_max_items)
            .arg(max_deadline_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(code)
    }

    fn after_abandon(&self, id: &str, attempts: u32, code: i64, timed_out: bool) {
        if code == NOT_IN_FLIGHT {
            return;
        }
        self.counters.record_abandoned();
        if timed_out {
            self.counters.record_timeout();
        }
        match code {
            REQUEUED => {
                debug!(queue = %self.options.name, item_id = id, attempts, timed_out, "item requeued");
                self.notify.notify_one();
            }
            SCHEDULED => {
                debug!(queue = %self.options.name, item_id = id, attempts, timed_out, "item retry scheduled");
            }
            DEAD_LETTERED => {
                self.counters.record_deadlettered();
                info!(queue = %self.options.name, item_id = id, attempts, timed_out, "item moved to dead letter queue");
            }
            other => {
                warn!(queue = %self.options.name, item_id = id, code = other, "unexpected abandon script result");
            }
        }
    }

    /// Abandon every delivery whose deadline has passed.
    async fn sweep(&self) -> Result<usize, QueueError> {
        let now = now_ms();
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .scripts
            .expired
            .key(&self.keys.inflight)
            .key(&self.keys.attempts)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        let mut swept = 0;
        for pair in flat.chunks_exact(2) {
            let (id, attempts) = (&pair[0], pair[1].parse::<u32>().unwrap_or(0));
            let code = self.abandon_delivery(id, attempts, now).await?;
            if code != NOT_IN_FLIGHT {
                warn!(queue = %self.options.name, item_id = %id, attempts, "visibility timeout expired");
                swept += 1;
            }
            self.after_abandon(id, attempts, code, true);
        }
        Ok(swept)
    }

    async fn read_dead_letters<T: Payload>(&self, drain: bool) -> Result<Vec<QueueItem<T>>, QueueError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .scripts
            .dead_letters
            .key(&self.keys.deadletter)
            .key(&self.keys.items)
            .key(&self.keys.attempts)
            .arg(if drain { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        flat.chunks_exact(2)
            .map(|pair| {
                let mut item: QueueItem<T> = serde_json::from_str(&pair[0])?;
                item.attempts = pair[1].parse().unwrap_or(0);
                item.mark_deadlettered();
                Ok(item)
            })
            .collect()
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
                match inner.sweep().await {
                    Ok(0) => {}
                    Ok(swept) => debug!(queue = %inner.options.name, swept, "timeout sweep finished"),
                    Err(e) => warn!(queue = %inner.options.name, error = %e, "timeout sweep failed"),
                }
            }
        }
    }
    debug!("redis timeout sweep stopped");
}

/// Queue stored in Redis. Handles are cheap to clone and share one connection
/// manager and sweep task.
pub struct RedisQueue<T: Payload> {
    inner: Arc<Inner>,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T: Payload> Clone for RedisQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _payload: std::marker::PhantomData,
        }
    }
}

impl<T: Payload> RedisQueue<T> {
    /// Connect to `redis_options.url` and start the timeout sweep.
    pub async fn connect(options: QueueOptions, redis_options: RedisOptions) -> Result<Self, QueueError> {
        let client = Client::open(redis_options.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        // Verify connection
        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Self::with_connection(manager, options, redis_options)
    }

    /// Build on an existing connection manager.
    pub fn with_connection(
        conn: ConnectionManager,
        options: QueueOptions,
        redis_options: RedisOptions,
    ) -> Result<Self, QueueError> {
        options.validate()?;
        if redis_options.poll_interval.is_zero() {
            return Err(QueueError::Config("poll_interval must be positive".into()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            policy: options.retry_policy(),
            keys: Keys::new(&redis_options.key_prefix, &options.name),
            scripts: Scripts::new(),
            conn,
            counters: QueueCounters::new(),
            notify: Notify::new(),
            disposed: AtomicBool::new(false),
            shutdown_tx,
            redis_options,
            options,
        });

        tokio::spawn(run_sweeper(
            Arc::downgrade(&inner),
            shutdown_rx,
            inner.options.maintenance_interval,
        ));

        info!(
            queue = %inner.options.name,
            key_prefix = %inner.redis_options.key_prefix,
            "redis queue started"
        );
        Ok(Self {
            inner,
            _payload: std::marker::PhantomData,
        })
    }

    /// Run one timeout sweep now; returns how many deliveries were abandoned.
    pub async fn sweep_now(&self) -> Result<usize, QueueError> {
        self.inner.ensure_open()?;
        self.inner.sweep().await
    }

    async fn try_dequeue(&self) -> Result<Option<QueueEntry<T>>, QueueError> {
        let inner = &self.inner;
        let timeout = inner.options.work_item_timeout;

        // Claim on a separate task: a caller dropped mid-script (worker shutdown)
        // still gets its dequeue counted, and the sweep times the item out later.
        let claimed = tokio::spawn(Arc::clone(inner).claim())
            .await
            .map_err(|e| QueueError::BackendUnavailable(format!("dequeue task failed: {e}")))??;

        let Some((id, json, attempts, first_ms)) = claimed else {
            return Ok(None);
        };

        let mut item: QueueItem<T> = serde_json::from_str(&json)?;
        item.attempts = attempts.saturating_sub(1);
        item.start_attempt(Utc::now(), timeout);
        item.first_dequeued_at = DateTime::from_timestamp_millis(first_ms).or(item.first_dequeued_at);

        debug!(queue = %inner.options.name, item_id = %id, attempts, "item dequeued");
        Ok(Some(QueueEntry::new(item, Arc::new(self.clone()))))
    }
}

#[async_trait]
impl<T: Payload> Queue<T> for RedisQueue<T> {
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
        let id = item.id;
        let json = serde_json::to_string(&item)?;

        let mut conn = self.inner.conn.clone();
        let id_str = id.to_string();
        redis::pipe()
            .atomic()
            .hset(&self.inner.keys.items, &id_str, json)
            .ignore()
            .rpush(&self.inner.keys.ready, &id_str)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        self.inner.counters.record_enqueued();
        debug!(queue = %self.name(), item_id = %id, "item enqueued");
        self.inner.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, wait: Option<Duration>) -> Result<Option<QueueEntry<T>>, QueueError> {
        let give_up_at = wait.and_then(|wait| tokio::time::Instant::now().checked_add(wait));
        let poll = self.inner.redis_options.poll_interval;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.inner.ensure_open()?;
            if let Some(entry) = self.try_dequeue().await? {
                return Ok(Some(entry));
            }

            let now = tokio::time::Instant::now();
            let mut wake_at = now + poll;
            if let Some(give_up_at) = give_up_at {
                if now >= give_up_at {
                    return Ok(None);
                }
                wake_at = wake_at.min(give_up_at);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        entry
            .resolve(EntryState::Completed, async {
                self.inner.ensure_open()?;
                let mut conn = self.inner.conn.clone();
                let removed: i64 = self
                    .inner
                    .scripts
                    .complete
                    .key(&self.inner.keys.inflight)
                    .key(&self.inner.keys.items)
                    .key(&self.inner.keys.attempts)
                    .arg(entry.id().to_string())
                    .arg(entry.attempts())
                    .invoke_async(&mut conn)
                    .await?;

                if removed == NOT_IN_FLIGHT {
                    return Err(QueueError::EntryNotInFlight {
                        id: entry.id(),
                        attempts: entry.attempts(),
                    });
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
                let id = entry.id().to_string();
                let code = self
                    .inner
                    .abandon_delivery(&id, entry.attempts(), i64::MAX)
                    .await?;
                if code == NOT_IN_FLIGHT {
                    return Err(QueueError::EntryNotInFlight {
                        id: entry.id(),
                        attempts: entry.attempts(),
                    });
                }
                self.inner.after_abandon(&id, entry.attempts(), code, false);
                Ok(())
            })
            .await
    }

    async fn renew_lock(&self, entry: &QueueEntry<T>) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        let deadline = now_ms().saturating_add(millis(self.inner.options.work_item_timeout));
        let mut conn = self.inner.conn.clone();
        let renewed: i64 = self
            .inner
            .scripts
            .renew
            .key(&self.inner.keys.inflight)
            .key(&self.inner.keys.attempts)
            .arg(entry.id().to_string())
            .arg(entry.attempts())
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 0 {
            return Err(QueueError::EntryNotInFlight {
                id: entry.id(),
                attempts: entry.attempts(),
            });
        }
        debug!(queue = %self.name(), item_id = %entry.id(), "lock renewed");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let keys = &self.inner.keys;
        let mut conn = self.inner.conn.clone();
        let (queued, working, scheduled, deadletter): (u64, u64, u64, u64) = redis::pipe()
            .llen(&keys.ready)
            .zcard(&keys.inflight)
            .zcard(&keys.scheduled)
            .llen(&keys.deadletter)
            .query_async(&mut conn)
            .await?;

        Ok(self.inner.counters.snapshot(StorageSizes {
            queued,
            working,
            scheduled,
            deadletter,
        }))
    }

    async fn dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        self.inner.read_dead_letters(false).await
    }

    async fn drain_dead_letters(&self) -> Result<Vec<QueueItem<T>>, QueueError> {
        let drained = self.inner.read_dead_letters(true).await?;
        info!(queue = %self.name(), count = drained.len(), "dead letter queue drained");
        Ok(drained)
    }

    async fn delete_queue(&self) -> Result<(), QueueError> {
        self.inner.ensure_open()?;
        let mut conn = self.inner.conn.clone();
        redis::cmd("DEL")
            .arg(self.inner.keys.all().to_vec())
            .query_async::<()>(&mut conn)
            .await?;
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
        self.inner.notify.notify_waiters();
        info!(queue = %self.name(), "redis queue disposed");
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}
