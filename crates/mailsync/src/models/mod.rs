//! Domain models for backup runs

mod message;
mod sync_state;

pub use message::{BackupFile, MessageId, MessageRef};
pub use sync_state::{BackupSummary, SyncState};
