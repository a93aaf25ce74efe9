//! Storage trait definitions

use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::StorageError;
use crate::models::{BackupFile, MessageId};

/// Trait for local message storage
///
/// Each message is stored as one opaque blob (its raw RFC 822 content)
/// addressed by id. Implementations must be safe to call from many workers
/// at once.
pub trait LocalStore: Send + Sync {
    /// Check if a message has already been backed up
    fn exists(&self, id: &MessageId) -> Result<bool, StorageError>;

    /// Store message content, replacing any previous copy
    ///
    /// Either the full content becomes visible under [`LocalStore::path_for`]
    /// or nothing does.
    fn write(&self, id: &MessageId, content: &[u8]) -> Result<BackupFile, StorageError>;

    /// Ids of every message currently stored
    fn list_local_ids(&self) -> Result<HashSet<MessageId>, StorageError>;

    /// Remove a message. Returns `false` if it was not stored.
    fn delete(&self, id: &MessageId) -> Result<bool, StorageError>;

    /// Location a message is (or would be) stored at
    fn path_for(&self, id: &MessageId) -> PathBuf;
}
