//! Notifications emitted during a backup run

use log::Level;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::models::{BackupFile, BackupSummary, MessageId};

/// Receives progress notifications from a [`super::SyncEngine`]
///
/// Methods are called synchronously from the listing thread and from the
/// worker threads, so implementations must be cheap and thread-safe. Every
/// method defaults to doing nothing.
pub trait EventSink: Send + Sync {
    /// A listed message is about to be backed up, or skipped when it
    /// already exists at `path`
    fn on_before_backup(&self, _id: &MessageId, _path: &Path, _will_skip: bool) {}

    /// A message was written. `progress` counts completed messages and
    /// `total` the messages discovered so far.
    fn on_after_backup(&self, _file: &BackupFile, _progress: usize, _total: usize) {}

    fn on_log(&self, _level: Level, _message: &str) {}

    /// An attempt to back up or delete a message failed
    fn on_message_error(&self, _id: &MessageId, _code: &str, _message: &str, _will_retry: bool) {}

    /// A local copy is being removed because the message is gone remotely
    fn on_message_delete(&self, _id: &MessageId, _path: &Path) {}

    fn on_end_backup(&self, _summary: &BackupSummary) {}
}

/// Sink that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

/// A notification captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BeforeBackup {
        id: MessageId,
        will_skip: bool,
    },
    AfterBackup {
        id: MessageId,
        progress: usize,
        total: usize,
    },
    Log {
        level: Level,
        message: String,
    },
    MessageError {
        id: MessageId,
        code: String,
        will_retry: bool,
    },
    MessageDelete {
        id: MessageId,
        path: PathBuf,
    },
    EndBackup(BackupSummary),
}

/// Sink that keeps every notification in order, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Errors reported for one message, as `(code, will_retry)` pairs
    pub fn errors_for(&self, id: &MessageId) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::MessageError {
                    id: err_id,
                    code,
                    will_retry,
                } if &err_id == id => Some((code, will_retry)),
                _ => None,
            })
            .collect()
    }

    /// Progress values passed to `on_after_backup`, in call order
    pub fn progress(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::AfterBackup { progress, .. } => Some(progress),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl EventSink for RecordingSink {
    fn on_before_backup(&self, id: &MessageId, _path: &Path, will_skip: bool) {
        self.push(Event::BeforeBackup {
            id: id.clone(),
            will_skip,
        });
    }

    fn on_after_backup(&self, file: &BackupFile, progress: usize, total: usize) {
        self.push(Event::AfterBackup {
            id: file.message_id.clone(),
            progress,
            total,
        });
    }

    fn on_log(&self, level: Level, message: &str) {
        self.push(Event::Log {
            level,
            message: message.to_string(),
        });
    }

    fn on_message_error(&self, id: &MessageId, code: &str, _message: &str, will_retry: bool) {
        self.push(Event::MessageError {
            id: id.clone(),
            code: code.to_string(),
            will_retry,
        });
    }

    fn on_message_delete(&self, id: &MessageId, path: &Path) {
        self.push(Event::MessageDelete {
            id: id.clone(),
            path: path.to_path_buf(),
        });
    }

    fn on_end_backup(&self, summary: &BackupSummary) {
        self.push(Event::EndBackup(summary.clone()));
    }
}
