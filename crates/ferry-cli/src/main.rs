use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

use ferry_core::config::{env_parse, FromEnv};
use ferry_core::{
    BackendConfig, HandlerError, QueueEntry, QueueOptions, WorkItemHandler, WorkerGroup,
    WorkerOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HelloEvent {
    name: String,
    seq: u32,
}

/// Fails (abandons) the first `remaining_failures` deliveries, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl WorkItemHandler<HelloEvent> for HelloHandler {
    async fn handle(&self, entry: QueueEntry<HelloEvent>) -> Result<(), HandlerError> {
        let claimed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if let Ok(left) = claimed {
            warn!(item_id = %entry.id(), attempts = entry.attempts(), left, "intentional failure");
            entry.abandon().await?;
            return Ok(());
        }

        let event = entry.payload();
        info!(item_id = %entry.id(), attempts = entry.attempts(), "Hello, {} #{}!", event.name, event.seq);
        Ok(())
    }
}

/// JSON logs when APP_ENV=production, human-readable otherwise; RUST_LOG overrides the level.
fn init_tracing() {
    let is_production = std::env::var("APP_ENV").is_ok_and(|env| env == "production");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(filter)
            .try_init()
    };

    if result.is_err() {
        debug!("tracing already initialized");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // (A) Configuration from FERRY_* variables
    let options = QueueOptions::from_env()?;
    let backend = BackendConfig::from_env()?;
    let worker_options = WorkerOptions::from_env()?;
    let items: u32 = env_parse("FERRY_DEMO_ITEMS", 10)?;
    let workers: usize = env_parse("FERRY_DEMO_WORKERS", 3)?;
    let failures: u32 = env_parse("FERRY_DEMO_FAILURES", 2)?;

    // (B) Queue on the selected backend
    let queue = ferry_core::connect::<HelloEvent>(options, &backend).await?;
    info!(queue = %queue.name(), backend = backend.kind(), "demo starting");

    // (C) Workers
    let group = WorkerGroup::spawn(
        workers,
        Arc::clone(&queue),
        Arc::new(HelloHandler::new(failures)),
        true,
        worker_options,
    );

    // (D) Producers
    for seq in 0..items {
        let id = queue
            .enqueue(HelloEvent {
                name: "ferry".to_string(),
                seq,
            })
            .await?;
        debug!(item_id = %id, seq, "enqueued");
    }

    // (E) Wait until every item is completed or dead-lettered (or Ctrl-C)
    let drained = async {
        loop {
            let counters = queue.counters();
            if counters.completed() + counters.deadlettered() >= u64::from(items) {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::select! {
        _ = drained => info!("all items processed"),
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
    }

    // (F) Graceful shutdown and final report
    group.shutdown_and_join().await;
    let stats = queue.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    queue.dispose().await;
    Ok(())
}
