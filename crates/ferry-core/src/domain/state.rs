//! Item and entry state machines.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Where a stored item currently lives.
///
/// State transitions:
/// - Queued -> InFlight -> (removed on complete)
/// - Queued -> InFlight -> Queued (abandon / timeout, retries left, no delay)
/// - Queued -> InFlight -> RetryScheduled -> Queued (abandon / timeout with retry delay)
/// - Queued -> InFlight -> DeadLettered (retries exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Ready for the next dequeue.
    Queued,

    /// Delivered, waiting for complete/abandon or the visibility timeout.
    InFlight,

    /// Abandoned with retries left, parked until its retry delay passes.
    RetryScheduled,

    /// Retry budget exhausted. Terminal.
    DeadLettered,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::DeadLettered)
    }

    pub fn is_dequeueable(self) -> bool {
        matches!(self, ItemState::Queued)
    }
}

/// Consumer-side resolution of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Completed,
    Abandoned,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryState::Completed,
            2 => EntryState::Abandoned,
            _ => EntryState::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EntryState::Pending => 0,
            EntryState::Completed => 1,
            EntryState::Abandoned => 2,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryState::Pending => "pending",
            EntryState::Completed => "completed",
            EntryState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Lock-free `Pending -> Completed | Abandoned` cell shared by every clone of an entry.
#[derive(Debug, Default)]
pub struct EntryStateCell(AtomicU8);

impl EntryStateCell {
    pub fn get(&self) -> EntryState {
        EntryState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move out of `Pending`. Returns the state that blocked the transition on failure.
    pub fn resolve(&self, to: EntryState) -> Result<(), EntryState> {
        self.0
            .compare_exchange(
                EntryState::Pending.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(EntryState::from_u8)
    }

    /// Undo a resolution whose backend call failed, so the caller can try again.
    pub fn revert(&self, from: EntryState) {
        let _ = self.0.compare_exchange(
            from.as_u8(),
            EntryState::Pending.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dead_letter_is_terminal() {
        assert!(ItemState::DeadLettered.is_terminal());
        assert!(!ItemState::InFlight.is_terminal());
        assert!(ItemState::Queued.is_dequeueable());
        assert!(!ItemState::RetryScheduled.is_dequeueable());
    }

    #[test]
    fn entry_resolves_once() {
        let cell = EntryStateCell::default();
        assert_eq!(cell.get(), EntryState::Pending);

        cell.resolve(EntryState::Completed).unwrap();
        assert_eq!(cell.resolve(EntryState::Abandoned), Err(EntryState::Completed));
        assert_eq!(cell.resolve(EntryState::Completed), Err(EntryState::Completed));
        assert_eq!(cell.get(), EntryState::Completed);
    }

    #[test]
    fn revert_reopens_a_failed_resolution() {
        let cell = EntryStateCell::default();
        cell.resolve(EntryState::Abandoned).unwrap();
        cell.revert(EntryState::Abandoned);
        assert_eq!(cell.get(), EntryState::Pending);

        // revert from the wrong state is a no-op
        cell.resolve(EntryState::Completed).unwrap();
        cell.revert(EntryState::Abandoned);
        assert_eq!(cell.get(), EntryState::Completed);
    }
}
