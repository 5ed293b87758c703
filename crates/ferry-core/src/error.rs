use thiserror::Error;

use crate::domain::{EntryState, ItemId};

#[derive(Debug, Error)]
pub enum QueueError {
    /// Complete/Abandon on an entry that already reached a terminal state.
    #[error("entry {id} is already {state}")]
    InvalidEntryState { id: ItemId, state: EntryState },

    /// The delivery behind this entry is no longer in flight
    /// (its visibility timeout fired, or the queue was deleted).
    #[error("entry {id} (attempt {attempts}) is no longer in flight")]
    EntryNotInFlight { id: ItemId, attempts: u32 },

    #[error("queue backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue {0} has been disposed")]
    Disposed(String),

    #[error("invalid queue configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Transient errors are worth retrying by the caller; everything else is a bug
    /// or a terminal condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::BackendUnavailable(err.to_string())
    }
}

/// Failure reported by a work item handler.
///
/// The worker loop only counts and logs it; the entry stays in flight until the
/// timeout sweep abandons it.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        Self(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_errors_are_transient() {
        assert!(QueueError::BackendUnavailable("down".into()).is_transient());
        assert!(!QueueError::Disposed("q".into()).is_transient());
        assert!(!QueueError::Config("bad".into()).is_transient());
    }

    #[test]
    fn invalid_state_message_names_the_state() {
        let err = QueueError::InvalidEntryState {
            id: ItemId::generate(),
            state: EntryState::Completed,
        };
        assert!(err.to_string().contains("completed"));
    }
}
