//! Run-scoped bookkeeping for a backup run

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::MessageId;

/// Tracks what happened to every message during one backup run
///
/// Created at run start and dropped at run end; nothing here is persisted.
/// The engine keeps it behind a mutex shared by the listing producer and
/// the backup workers.
#[derive(Debug, Default)]
pub struct SyncState {
    /// Every distinct id returned by the remote listing
    seen: HashSet<MessageId>,
    completed: HashSet<MessageId>,
    skipped: HashSet<MessageId>,
    /// Failed ids with the number of retries spent on them
    failed: HashMap<MessageId, u32>,
    deletes_performed: usize,
    delete_failures: usize,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an id produced by the listing
    ///
    /// Returns `false` if the id was already seen during this run.
    pub fn discover(&mut self, id: &MessageId) -> bool {
        self.seen.insert(id.clone())
    }

    /// Number of distinct messages discovered so far
    pub fn discovered(&self) -> usize {
        self.seen.len()
    }

    /// Record a message that already exists locally
    pub fn mark_skipped(&mut self, id: MessageId) {
        self.skipped.insert(id);
    }

    /// Record a successfully backed up message
    ///
    /// Returns `(completed, discovered)` progress counters, or `None` if the
    /// id had already been completed.
    pub fn mark_completed(&mut self, id: MessageId) -> Option<(usize, usize)> {
        if !self.completed.insert(id) {
            return None;
        }
        Some((self.completed.len(), self.seen.len()))
    }

    /// Record a message that could not be backed up
    pub fn mark_failed(&mut self, id: MessageId, retries: u32) {
        self.failed.insert(id, retries);
    }

    pub fn record_delete(&mut self) {
        self.deletes_performed += 1;
    }

    pub fn record_delete_failure(&mut self) {
        self.delete_failures += 1;
    }

    pub fn seen(&self) -> &HashSet<MessageId> {
        &self.seen
    }

    pub fn failed(&self) -> &HashMap<MessageId, u32> {
        &self.failed
    }

    /// Produce the final summary for this run
    pub fn summary(&self, sync_deletes: bool, elapsed: Duration) -> BackupSummary {
        BackupSummary {
            discovered: self.seen.len(),
            backed_up: self.completed.len(),
            skipped: self.skipped.len(),
            failed: self.failed.len(),
            deleted: self.deletes_performed,
            delete_failures: self.delete_failures,
            sync_deletes,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Totals reported at the end of a backup run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    /// Number of distinct messages returned by the listing
    pub discovered: usize,
    /// Number of messages downloaded and written
    pub backed_up: usize,
    /// Number of messages that already existed locally
    pub skipped: usize,
    /// Number of messages that could not be backed up
    pub failed: usize,
    /// Number of local files removed by delete reconciliation
    pub deleted: usize,
    /// Number of local files that could not be removed
    pub delete_failures: usize,
    /// Whether delete reconciliation was enabled for the run
    pub sync_deletes: bool,
    /// Duration of the run
    pub duration_ms: u64,
}
