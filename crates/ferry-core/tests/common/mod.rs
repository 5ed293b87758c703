//! Scenarios every backend must pass.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{Queue, QueueOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleWorkItem {
    pub data: String,
    pub id: u32,
}

pub fn hello(id: u32) -> SimpleWorkItem {
    SimpleWorkItem {
        data: "Hello".to_string(),
        id,
    }
}

/// Unique queue name so parallel test runs against one server don't collide.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", ulid::Ulid::new().to_string().to_lowercase())
}

/// Fast sweep and short visibility timeout.
pub fn fast_options(name: &str, retries: u32, timeout: Duration) -> QueueOptions {
    QueueOptions::new(name)
        .retries(retries)
        .work_item_timeout(timeout)
        .maintenance_interval(Duration::from_millis(20))
}

pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn enqueue_dequeue_complete(queue: Arc<dyn Queue<SimpleWorkItem>>) {
    queue.enqueue(hello(1)).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().enqueued, 1);

    let entry = queue
        .dequeue(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("item delivered");
    assert_eq!(entry.payload(), &hello(1));
    assert_eq!(entry.attempts(), 1);
    assert_eq!(queue.counters().dequeued(), 1);

    entry.complete().await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.working, 0);
    assert!(entry.abandon().await.is_err());
}

pub async fn timeout_then_dead_letter(queue: Arc<dyn Queue<SimpleWorkItem>>) {
    queue.enqueue(hello(2)).await.unwrap();

    let first = queue
        .dequeue(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("first delivery");
    assert_eq!(first.attempts(), 1);
    wait_for("first timeout", || queue.counters().abandoned() == 1).await;

    let second = queue
        .dequeue(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("redelivery");
    assert_eq!(second.id(), first.id());
    assert_eq!(second.attempts(), 2);
    wait_for("dead letter", || queue.counters().deadlettered() == 1).await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.abandoned, 2);
    assert_eq!(stats.timeouts, 2);
    assert!(first.complete().await.is_err());

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, hello(2));
    assert!(dead[0].is_deadlettered);

    let drained = queue.drain_dead_letters().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

pub async fn abandon_requeues(queue: Arc<dyn Queue<SimpleWorkItem>>) {
    queue.enqueue(hello(3)).await.unwrap();
    let entry = queue
        .dequeue(Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("item delivered");
    entry.abandon().await.unwrap();
    assert!(entry.is_abandoned());

    let again = queue
        .dequeue(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("redelivered after abandon");
    assert_eq!(again.attempts(), 2);
    again.complete().await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.timeouts, 0);
}
