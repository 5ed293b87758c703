//! NATS JetStream backend against a live server.
//!
//! Run with `NATS_URL=nats://127.0.0.1:4222 cargo test --features nats -- --ignored`.

#![cfg(feature = "nats")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{SimpleWorkItem, fast_options, unique_name};
use ferry_core::config::NatsOptions;
use ferry_core::{NatsQueue, Queue, QueueOptions};

fn nats_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string())
}

async fn open(options: QueueOptions) -> NatsQueue<SimpleWorkItem> {
    let nats_options = NatsOptions::new(nats_url())
        .subject_prefix("ferry-test")
        .should_recreate(true);
    NatsQueue::connect(options, nats_options)
        .await
        .expect("nats reachable")
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream"]
async fn nats_enqueue_dequeue_complete() {
    let queue = open(QueueOptions::new(unique_name("basic"))).await;
    common::enqueue_dequeue_complete(Arc::new(queue.clone())).await;
    queue.dispose().await;
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream"]
async fn nats_timeout_then_dead_letter() {
    let queue = open(fast_options(&unique_name("timeout"), 1, Duration::from_millis(200))).await;
    common::timeout_then_dead_letter(Arc::new(queue.clone())).await;
    queue.dispose().await;
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream"]
async fn nats_abandon_requeues() {
    let queue = open(QueueOptions::new(unique_name("abandon"))).await;
    common::abandon_requeues(Arc::new(queue.clone())).await;
    queue.dispose().await;
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream"]
async fn nats_delete_queue_purges_everything() {
    let queue = open(QueueOptions::new(unique_name("delete"))).await;
    for id in 0..5 {
        queue.enqueue(common::hello(id)).await.unwrap();
    }
    queue.delete_queue().await.unwrap();

    assert!(queue.dequeue(Some(Duration::from_millis(200))).await.unwrap().is_none());
    assert_eq!(queue.counters().enqueued(), 0);
    queue.dispose().await;
}

#[tokio::test]
#[ignore = "requires a NATS server with JetStream"]
async fn nats_renew_lock_does_not_block_other_deliveries() {
    let queue = open(fast_options(&unique_name("renew"), 1, Duration::from_millis(400))).await;
    queue.enqueue(common::hello(1)).await.unwrap();
    queue.enqueue(common::hello(2)).await.unwrap();
    let held = queue.dequeue(Some(Duration::from_secs(2))).await.unwrap().unwrap();
    let other = queue.dequeue(Some(Duration::from_secs(2))).await.unwrap().unwrap();

    let renewing = tokio::spawn({
        let held = held.clone();
        async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                held.renew_lock().await.unwrap();
            }
        }
    });
    other.complete().await.unwrap();
    renewing.await.unwrap();

    assert_eq!(queue.counters().abandoned(), 0);
    held.complete().await.unwrap();
    assert!(matches!(
        held.renew_lock().await,
        Err(ferry_core::QueueError::InvalidEntryState { .. })
    ));
    assert_eq!(queue.counters().completed(), 2);
    queue.dispose().await;
}
