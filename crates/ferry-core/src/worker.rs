use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerOptions;
use crate::domain::Payload;
use crate::error::{HandlerError, QueueError};
use crate::queue::{Queue, QueueEntry};

/// User code run for every delivered item.
///
/// Returning `Err` (or panicking) counts a worker error and leaves the entry
/// unresolved; the backend's timeout sweep then abandons it.
#[async_trait]
pub trait WorkItemHandler<T: Payload>: Send + Sync {
    async fn handle(&self, entry: QueueEntry<T>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> WorkItemHandler<T> for F
where
    T: Payload,
    F: Fn(QueueEntry<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, entry: QueueEntry<T>) -> Result<(), HandlerError> {
        (self)(entry).await
    }
}

/// Worker group handle.
/// - dropping the group (and so `shutdown_tx`) stops every worker
/// - `shutdown_and_join()` waits for all workers to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers against `queue`.
    pub fn spawn<T: Payload>(
        n: usize,
        queue: Arc<dyn Queue<T>>,
        handler: Arc<dyn WorkItemHandler<T>>,
        auto_complete: bool,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                handler: Arc::clone(&handler),
                auto_complete,
                options: options.clone(),
            };
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(worker.run(rx)));
        }

        info!(queue = %queue.name(), workers = n, auto_complete, "worker group started");
        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// True once every worker loop has exited.
    pub fn is_finished(&self) -> bool {
        self.joins.iter().all(JoinHandle::is_finished)
    }

    /// Request shutdown for all workers.
    /// In-flight handlers are not cancelled; workers just stop dequeuing.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.join().await;
    }

    /// Wait for every worker to exit without requesting shutdown
    /// (they exit on their own once the queue is disposed).
    pub async fn join(mut self) {
        for join in self.joins.drain(..) {
            if let Err(e) = join.await {
                error!(error = %e, "worker task failed");
            }
        }
    }
}

struct Worker<T: Payload> {
    id: usize,
    queue: Arc<dyn Queue<T>>,
    handler: Arc<dyn WorkItemHandler<T>>,
    auto_complete: bool,
    options: WorkerOptions,
}

impl<T: Payload> Worker<T> {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(queue = %self.queue.name(), worker_id = self.id, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // dequeue may block, so race it against shutdown
            let dequeued = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break; // group dropped
                    }
                    continue;
                }
                dequeued = self.queue.dequeue(Some(self.options.dequeue_wait)) => dequeued,
            };

            match dequeued {
                Ok(Some(entry)) => self.process(entry).await,
                Ok(None) => {}
                Err(QueueError::Disposed(_)) => break,
                Err(e) => {
                    let pause = jittered(self.options.error_backoff);
                    warn!(
                        queue = %self.queue.name(),
                        worker_id = self.id,
                        error = %e,
                        ?pause,
                        "dequeue failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
        debug!(queue = %self.queue.name(), worker_id = self.id, "worker stopped");
    }

    async fn process(&self, entry: QueueEntry<T>) {
        let item_id = entry.id();
        let attempts = entry.attempts();

        // Own task, so a panicking handler cannot take the loop down.
        let handler = Arc::clone(&self.handler);
        let task_entry = entry.clone();
        let outcome = tokio::spawn(async move { handler.handle(task_entry).await }).await;

        match outcome {
            Ok(Ok(())) => {
                if self.auto_complete && !entry.is_resolved() {
                    self.auto_complete(&entry).await;
                }
            }
            Ok(Err(e)) => {
                self.queue.counters().record_worker_error();
                warn!(
                    queue = %self.queue.name(),
                    worker_id = self.id,
                    item_id = %item_id,
                    attempts,
                    error = %e,
                    "handler failed, entry left for timeout"
                );
            }
            Err(join_err) => {
                self.queue.counters().record_worker_error();
                error!(
                    queue = %self.queue.name(),
                    worker_id = self.id,
                    item_id = %item_id,
                    attempts,
                    error = %join_err,
                    "handler panicked, entry left for timeout"
                );
            }
        }
    }

    async fn auto_complete(&self, entry: &QueueEntry<T>) {
        match entry.complete().await {
            Ok(()) => {}
            // the handler resolved it concurrently
            Err(QueueError::InvalidEntryState { .. }) => {}
            Err(e @ QueueError::EntryNotInFlight { .. }) => {
                debug!(queue = %self.queue.name(), worker_id = self.id, error = %e, "auto-complete too late");
            }
            Err(e) => {
                warn!(
                    queue = %self.queue.name(),
                    worker_id = self.id,
                    item_id = %entry.id(),
                    error = %e,
                    "auto-complete failed"
                );
            }
        }
    }
}

/// `base` plus up to 50% random jitter.
fn jittered(base: Duration) -> Duration {
    let max_jitter = (base.as_millis() / 2).min(u64::MAX as u128) as u64;
    if max_jitter == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base.saturating_add(Duration::from_millis(jitter))
}
