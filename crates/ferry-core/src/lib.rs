//! ferry-core
//!
//! Reliable work queues with at-least-once delivery.
//!
//! # Modules
//! - **domain**: item ids, stored items, entry/item state machines
//! - **queue**: the `Queue` trait, `QueueEntry` handle, retry policy and the
//!   in-memory, Redis (`redis` feature) and NATS JetStream (`nats` feature) backends
//! - **worker**: worker loops that feed delivered entries to a handler
//! - **observability**: per-queue counters and stats snapshots
//! - **config**: options structs and environment loading
//! - **backend**: `connect()` picks a backend from `BackendConfig`
//! - **error**: `QueueError`, `HandlerError`

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod queue;
pub mod worker;

pub use backend::connect;
pub use config::{BackendConfig, ConfigError, FromEnv, QueueOptions, WorkerOptions};
pub use domain::{EntryState, ItemId, Payload, QueueItem};
pub use error::{HandlerError, QueueError};
pub use observability::{QueueCounters, QueueStats};
pub use queue::{InMemoryQueue, Queue, QueueEntry, RetryPolicy};
pub use worker::{WorkItemHandler, WorkerGroup};

#[cfg(feature = "nats")]
pub use queue::NatsQueue;
#[cfg(feature = "redis")]
pub use queue::RedisQueue;
