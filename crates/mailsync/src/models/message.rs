//! Message identity models shared by the remote and storage layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a message, as assigned by the remote mailbox
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as it appears in a remote listing
///
/// Produced by the lister and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: MessageId,
    /// Folder (Office 365) or thread (Gmail) the message belongs to
    pub parent_folder_id: Option<String>,
    /// Last modification time reported by the listing, when available
    pub last_modified: Option<DateTime<Utc>>,
}

impl MessageRef {
    /// Create a reference carrying only an identifier
    pub fn new(id: impl Into<MessageId>) -> Self {
        Self {
            id: id.into(),
            parent_folder_id: None,
            last_modified: None,
        }
    }

    pub fn with_parent_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.parent_folder_id = Some(folder_id.into());
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }
}

/// A message that has been written to local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub local_path: PathBuf,
    pub message_id: MessageId,
}
