//! Backup engine
//!
//! Lists the remote mailbox, backs up new messages with bounded parallelism
//! and optionally removes local copies of remotely deleted messages.

mod engine;
mod events;

pub use engine::{CancelHandle, SyncEngine, SyncOptions, SyncPhase};
pub use events::{Event, EventSink, NullSink, RecordingSink};
