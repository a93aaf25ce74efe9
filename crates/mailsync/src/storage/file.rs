//! File-based message storage

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, warn};

use super::LocalStore;
use crate::error::StorageError;
use crate::models::{BackupFile, MessageId};

const EXTENSION: &str = "eml";
const TEMP_PREFIX: &str = ".partial-";

/// One `.eml` file per message in a flat directory
///
/// Directory structure:
/// ```text
/// backup/
///   QUFNa0FHSTJOR1ky.eml       # base64url("AAMkAGI2NGY2")
///   QUFNa0FHSTJOR1kz.eml
///   .partial-x7Yq2a.tmp        # interrupted write, ignored
/// ```
///
/// The file name is the unpadded URL-safe base64 encoding of the message id,
/// so it is filesystem-safe for any id and decodes back to the id.
///
/// Names are only distinct on a case-sensitive filesystem. On a
/// case-insensitive one (the APFS and NTFS defaults) two ids whose encodings
/// differ only in case share a file; opening such a root logs a warning.
pub struct FileMessageStore {
    root: PathBuf,
}

impl FileMessageStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(StorageError::InvalidRoot(root));
        }
        fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;

        match is_case_insensitive(&root) {
            Ok(true) => warn!(
                "{} is on a case-insensitive filesystem; ids differing only in case may overwrite each other",
                root.display()
            ),
            Ok(false) => {}
            Err(e) => debug!("Could not check case sensitivity of {}: {}", root.display(), e),
        }
        Ok(Self { root })
    }
}

/// Whether `dir` resolves names that differ only in case to the same file
fn is_case_insensitive(dir: &Path) -> std::io::Result<bool> {
    let marker = tempfile::Builder::new()
        .prefix(".case-check-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    let name = marker.path().file_name().unwrap_or_default().to_string_lossy();
    let swapped: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect();
    dir.join(swapped).try_exists()
}

/// File name for a message id
pub(crate) fn file_name(id: &MessageId) -> String {
    format!("{}.{}", URL_SAFE_NO_PAD.encode(id.as_str()), EXTENSION)
}

/// Message id for a file name, `None` for anything that is not a stored message
pub(crate) fn id_from_file_name(name: &str) -> Option<MessageId> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(EXTENSION)?.strip_suffix('.')?;
    let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
    String::from_utf8(bytes).ok().map(MessageId)
}

impl LocalStore for FileMessageStore {
    fn exists(&self, id: &MessageId) -> Result<bool, StorageError> {
        let path = self.path_for(id);
        path.try_exists().map_err(|e| StorageError::io(path, e))
    }

    fn write(&self, id: &MessageId, content: &[u8]) -> Result<BackupFile, StorageError> {
        let path = self.path_for(id);

        // Write atomically (write to temp in the same directory, then rename)
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.root)
            .map_err(|e| StorageError::io(&self.root, e))?;
        temp.write_all(content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| StorageError::io(temp.path(), e))?;
        temp.persist(&path)
            .map_err(|e| StorageError::io(&path, e.error))?;

        debug!("Wrote {} bytes for {} to {}", content.len(), id, path.display());
        Ok(BackupFile {
            local_path: path,
            message_id: id.clone(),
        })
    }

    fn list_local_ids(&self) -> Result<HashSet<MessageId>, StorageError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StorageError::io(&self.root, e))?;

        let mut ids = HashSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.root, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(id_from_file_name) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    fn delete(&self, id: &MessageId) -> Result<bool, StorageError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn path_for(&self, id: &MessageId) -> PathBuf {
        self.root.join(file_name(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(s: &str) -> MessageId {
        MessageId::new(s)
    }

    #[test]
    fn test_write_and_exists() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path().join("backup")).unwrap();

        assert!(!store.exists(&id("m1")).unwrap());
        let file = store.write(&id("m1"), b"Subject: hello\r\n\r\nbody").unwrap();

        assert!(store.exists(&id("m1")).unwrap());
        assert_eq!(file.message_id, id("m1"));
        assert_eq!(fs::read(&file.local_path).unwrap(), b"Subject: hello\r\n\r\nbody");
    }

    #[test]
    fn test_write_overwrites() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        store.write(&id("m1"), b"first").unwrap();
        let file = store.write(&id("m1"), b"second").unwrap();

        assert_eq!(fs::read(file.local_path).unwrap(), b"second");
        assert_eq!(store.list_local_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_path_is_deterministic_and_safe() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();

        let graph_id = id("AAMkAGI2TG93AAA=/+x");
        let path = store.path_for(&graph_id);
        assert_eq!(path, store.path_for(&graph_id));
        assert_eq!(path.parent(), Some(dir.path()));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/') && !name.contains('+') && !name.contains('='));
        assert_eq!(id_from_file_name(name), Some(graph_id));
    }

    #[test]
    fn test_distinct_ids_get_distinct_paths() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        assert_ne!(store.path_for(&id("a/b")), store.path_for(&id("a_b")));
        assert_ne!(store.path_for(&id("ab")), store.path_for(&id("AB")));
    }

    #[test]
    fn test_list_local_ids_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        for name in ["m1", "18c4f2a9e3b7d001", "AAMkAD/x+y=="] {
            store.write(&id(name), b"x").unwrap();
        }

        let ids = store.list_local_ids().unwrap();
        let expected: HashSet<MessageId> =
            ["m1", "18c4f2a9e3b7d001", "AAMkAD/x+y=="].into_iter().map(id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_list_ignores_foreign_and_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        store.write(&id("m1"), b"x").unwrap();

        fs::write(dir.path().join(".partial-abc123.tmp"), b"half").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("!!!.eml"), b"x").unwrap();
        fs::create_dir(dir.path().join("bXkx.eml")).unwrap();

        let ids = store.list_local_ids().unwrap();
        assert_eq!(ids, HashSet::from([id("m1")]));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        store.write(&id("m1"), b"x").unwrap();

        assert!(store.delete(&id("m1")).unwrap());
        assert!(!store.exists(&id("m1")).unwrap());
        // Deleting again is not an error
        assert!(!store.delete(&id("m1")).unwrap());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::new(dir.path()).unwrap();
        store.write(&id("m1"), b"x").unwrap();
        store.write(&id("m2"), b"y").unwrap();

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detects_case_sensitive_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_case_insensitive(dir.path()).unwrap());
        // The check leaves nothing behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_root_must_be_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            FileMessageStore::new(&file),
            Err(StorageError::InvalidRoot(_))
        ));
    }
}
