#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable local key-value slots backing zone and count state.
//!
//! The engine persists its two documents (zone list, count snapshot) as
//! whole JSON payloads under versioned string keys. [`KeyValueStore`]
//! abstracts the slot so that processes sharing a data directory observe
//! each other's writes ([`FileStore`]) while tests and ephemeral embedders
//! stay in memory ([`MemoryStore`]).
//!
//! Writes are all-or-nothing: `FileStore` stages each write in its own
//! uniquely named temp file and renames it into place, so a reader never
//! observes a partially written payload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Per-process sequence for temp file names. Concurrent writers of one
/// slot must each stage into their own file; a shared staging path lets
/// one writer's payload slip into another's rename.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors raised by a storage slot.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// A durable local key-value slot store.
///
/// Keys are short identifiers (e.g. `flowtrack_zones_v2`); values are
/// complete serialized documents. Every `set` replaces the previous value
/// atomically — partial writes must never be observable.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the slot exists but cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Atomically replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the value cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes the value stored under `key`; absent keys are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the slot exists but cannot be removed.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// File-backed store: one JSON file per slot inside a data directory.
///
/// This is the durable transport between processes that share a data
/// directory — the sync fallback polls these files for changes.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) the data directory at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the directory cannot be created.
    pub fn open(root: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|e| StorageError::Io {
            path: root.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of the file backing `key`.
    #[must_use]
    pub fn slot_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.slot_path(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.slot_path(key);
        let tmp = self.root.join(format!(
            "{key}.json.{pid}.{seq}.tmp",
            pid = std::process::id(),
            seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed),
        ));

        std::fs::write(&tmp, value).map_err(|e| StorageError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;

        // Atomic replace: readers see the old payload or the new one,
        // never a torn write.
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.slot_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// In-memory store for tests and single-process embedders.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let slots = self.slots.lock().expect("memory store mutex poisoned");
        Ok(slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().expect("memory store mutex poisoned");
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut slots = self.slots.lock().expect("memory store mutex poisoned");
        slots.remove(key);
        Ok(())
    }
}
