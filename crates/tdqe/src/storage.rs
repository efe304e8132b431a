// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Matter Labs

//! Persistent storage for the sealed attestation key blob
//!
//! Storage is best effort: the quoting context keeps the authoritative copy in
//! memory and only warns when a write fails.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};
use tracing::trace;

/// A labelled byte store
pub trait PersistentStorage: Send + Sync {
    /// Replace the contents stored under `label`.
    fn write(&self, label: &str, data: &[u8]) -> io::Result<()>;
    /// Contents stored under `label`.
    fn read(&self, label: &str) -> io::Result<Vec<u8>>;
}

/// One file per label inside a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, label: &str) -> io::Result<PathBuf> {
        if label.is_empty()
            || label.starts_with('.')
            || label.contains(['/', '\\'])
            || Path::new(label).components().count() != 1
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage label {label:?}"),
            ));
        }
        Ok(self.dir.join(label))
    }
}

impl PersistentStorage for FileStorage {
    fn write(&self, label: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path(label)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        trace!(path = %path.display(), len = data.len(), "stored");
        Ok(())
    }

    fn read(&self, label: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(label)?)
    }
}

/// In-memory storage with write fault injection
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Make every following write fail, or succeed again
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn entries(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| io::Error::other("storage lock poisoned"))
    }
}

impl PersistentStorage for MemoryStorage {
    fn write(&self, label: &str, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is read-only",
            ));
        }
        self.entries()?.insert(label.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, label: &str) -> io::Result<Vec<u8>> {
        self.entries()?
            .get(label)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_replaces_contents() {
        let dir = std::env::temp_dir().join(format!("tdqe-storage-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let storage = FileStorage::new(&dir);

        storage.write("blob", b"one").unwrap();
        storage.write("blob", b"two").unwrap();
        assert_eq!(storage.read("blob").unwrap(), b"two");
        assert!(!dir.join("blob.tmp").exists());

        assert_eq!(
            storage.read("missing").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_storage_rejects_paths() {
        let storage = FileStorage::new(std::env::temp_dir());
        for label in ["", "../blob", "a/b", ".hidden"] {
            assert_eq!(
                storage.write(label, b"x").unwrap_err().kind(),
                io::ErrorKind::InvalidInput
            );
        }
    }

    #[test]
    fn memory_storage_fault_injection() {
        let storage = MemoryStorage::default();
        storage.write("blob", b"one").unwrap();
        storage.fail_writes(true);
        assert!(storage.write("blob", b"two").is_err());
        assert_eq!(storage.read("blob").unwrap(), b"one");
    }
}
