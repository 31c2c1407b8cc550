use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::StorageError;

/// A string key/value store that outlives the process.
pub trait DurableStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process storage with a switchable outage and an optional byte quota
/// over all stored keys and values.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    quota: Mutex<Option<usize>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        let storage = Self::default();
        storage.set_quota(Some(bytes));
        storage
    }

    pub fn set_quota(&self, bytes: Option<usize>) {
        *self.quota.lock() = bytes;
    }

    /// Simulates storage being disabled (private browsing, revoked access).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Bytes currently counted against the quota.
    pub fn used_bytes(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    /// Successful `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage disabled".into()));
        }
        Ok(())
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        if let Some(limit) = *self.quota.lock() {
            let others: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > limit {
                return Err(StorageError::QuotaExceeded { needed, limit });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One file per key under a data directory. Writes go to a temporary file
/// that is renamed over the target, so a crash mid-write never leaves a
/// truncated snapshot behind.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, quota: None })
    }

    /// `~/.logscope/data`.
    pub fn default_location() -> Result<Self, StorageError> {
        let mut dir = dirs::home_dir()
            .ok_or_else(|| StorageError::Unavailable("no home directory".into()))?;
        dir.push(".logscope");
        dir.push("data");
        Self::new(dir)
    }

    /// Rejects any single value larger than `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl DurableStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                Err(StorageError::Corrupted(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(limit) = self.quota {
            if value.len() > limit {
                return Err(StorageError::QuotaExceeded {
                    needed: value.len(),
                    limit,
                });
            }
        }

        let target = self.path_for(key);
        let staging = target.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&staging, &target)?;
        debug!(path = %target.display(), bytes = value.len(), "durable write");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
