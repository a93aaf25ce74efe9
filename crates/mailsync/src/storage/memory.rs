//! In-memory storage implementation
//!
//! Used for testing and dry runs.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use super::LocalStore;
use super::file::file_name;
use crate::error::StorageError;
use crate::models::{BackupFile, MessageId};

/// In-memory implementation of LocalStore
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, Vec<u8>>>,
    /// Ids whose writes fail with an I/O error
    failing_writes: RwLock<HashSet<MessageId>>,
    /// Ids whose deletes fail with an I/O error
    failing_deletes: RwLock<HashSet<MessageId>>,
    writes: AtomicUsize,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            failing_writes: RwLock::new(HashSet::new()),
            failing_deletes: RwLock::new(HashSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Store content directly, without counting it as a write
    pub fn insert(&self, id: impl Into<MessageId>, content: impl Into<Vec<u8>>) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), content.into());
    }

    pub fn get(&self, id: &MessageId) -> Option<Vec<u8>> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes_for(&self, id: impl Into<MessageId>) {
        self.failing_writes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    pub fn fail_deletes_for(&self, id: impl Into<MessageId>) {
        self.failing_deletes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into());
    }

    fn scripted_failure(&self, set: &RwLock<HashSet<MessageId>>, id: &MessageId) -> Result<(), StorageError> {
        if set.read().unwrap_or_else(PoisonError::into_inner).contains(id) {
            return Err(StorageError::io(
                self.path_for(id),
                io::Error::new(io::ErrorKind::PermissionDenied, "scripted failure"),
            ));
        }
        Ok(())
    }
}

impl LocalStore for InMemoryMessageStore {
    fn exists(&self, id: &MessageId) -> Result<bool, StorageError> {
        Ok(self
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id))
    }

    fn write(&self, id: &MessageId, content: &[u8]) -> Result<BackupFile, StorageError> {
        self.scripted_failure(&self.failing_writes, id)?;

        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), content.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(BackupFile {
            local_path: self.path_for(id),
            message_id: id.clone(),
        })
    }

    fn list_local_ids(&self) -> Result<HashSet<MessageId>, StorageError> {
        Ok(self
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    fn delete(&self, id: &MessageId) -> Result<bool, StorageError> {
        self.scripted_failure(&self.failing_deletes, id)?;
        Ok(self
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some())
    }

    fn path_for(&self, id: &MessageId) -> PathBuf {
        PathBuf::from("memory").join(file_name(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_counts() {
        let store = InMemoryMessageStore::new();
        store.insert("seeded", "x");
        store.write(&MessageId::new("m1"), b"y").unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.list_local_ids().unwrap().len(), 2);
        assert_eq!(store.get(&MessageId::new("m1")).unwrap(), b"y");
    }

    #[test]
    fn test_scripted_failures() {
        let store = InMemoryMessageStore::new();
        store.insert("m2", "x");
        store.fail_writes_for("m1");
        store.fail_deletes_for("m2");

        assert!(store.write(&MessageId::new("m1"), b"x").is_err());
        assert!(!store.exists(&MessageId::new("m1")).unwrap());
        assert!(store.delete(&MessageId::new("m2")).is_err());
        assert!(store.exists(&MessageId::new("m2")).unwrap());
    }

    #[test]
    fn test_delete_missing() {
        let store = InMemoryMessageStore::new();
        assert!(!store.delete(&MessageId::new("nope")).unwrap());
    }
}
