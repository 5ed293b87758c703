//! Backend selection.

use std::sync::Arc;

use tracing::info;

use crate::config::{BackendConfig, QueueOptions};
use crate::domain::Payload;
use crate::error::QueueError;
use crate::queue::{InMemoryQueue, Queue};

/// Open the queue described by `options` on the chosen backend.
///
/// Backends compiled out by cargo features fail with `QueueError::Config`.
pub async fn connect<T: Payload>(
    options: QueueOptions,
    backend: &BackendConfig,
) -> Result<Arc<dyn Queue<T>>, QueueError> {
    info!(queue = %options.name, backend = backend.kind(), "opening queue");
    match backend {
        BackendConfig::Memory => Ok(Arc::new(InMemoryQueue::<T>::new(options)?)),

        #[cfg(feature = "redis")]
        BackendConfig::Redis(redis_options) => Ok(Arc::new(
            crate::queue::RedisQueue::<T>::connect(options, redis_options.clone()).await?,
        )),
        #[cfg(not(feature = "redis"))]
        BackendConfig::Redis(_) => Err(QueueError::Config(
            "redis backend not compiled in (enable the `redis` feature)".into(),
        )),

        #[cfg(feature = "nats")]
        BackendConfig::Nats(nats_options) => Ok(Arc::new(
            crate::queue::NatsQueue::<T>::connect(options, nats_options.clone()).await?,
        )),
        #[cfg(not(feature = "nats"))]
        BackendConfig::Nats(_) => Err(QueueError::Config(
            "nats backend not compiled in (enable the `nats` feature)".into(),
        )),
    }
}
