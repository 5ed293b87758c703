//! Domain model: identifiers, stored items, state machines.

pub mod ids;
pub mod item;
pub mod state;

pub use ids::ItemId;
pub use item::{Payload, QueueItem};
pub use state::{EntryState, EntryStateCell, ItemState};
