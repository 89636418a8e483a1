// src/store/mod.rs

//! Shared key-value store holding session records.
//!
//! The orchestration layer only needs string keys, string values, delete and
//! an optional per-key TTL. Expiry is lazy: an expired key reads as absent
//! and is removed on that read.
//!
//! - [`MemoryStore`]: in-process map (default; lost on restart).
//! - [`FileStore`]: one JSON envelope per key under a directory.

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::StoreSection;
use crate::errors::{RelayError, Result};
use crate::types::StoreMode;

/// Abstract storage for session records and the worker index.
pub trait KvStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// Build the store selected by `[store]`.
pub fn open_store(cfg: &StoreSection) -> Result<Arc<dyn KvStore>> {
    match cfg.mode {
        StoreMode::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreMode::File => Ok(Arc::new(FileStore::open(cfg.path.clone())?)),
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// Stores records in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryEntry>>> {
        self.map
            .lock()
            .map_err(|_| RelayError::Store("memory store lock poisoned".to_string()))
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> Result<usize> {
        let now = Instant::now();
        let map = self.lock()?;
        Ok(map
            .values()
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.lock()?;
        match map.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|t| t <= Instant::now()) => {
                map.remove(key);
                debug!(key, "expired key removed (memory)");
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = MemoryEntry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.lock()?.insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

/// On-disk envelope; `expires_at_ms` is unix epoch milliseconds.
#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

/// Stores each key as `<root>/<encoded key>.json`.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    // Serialises read-merge-write sequences within this process.
    guard: Mutex<()>,
}

impl FileStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            guard: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.guard
            .lock()
            .map_err(|_| RelayError::Store("file store lock poisoned".to_string()))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock()?;
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let entry: FileEntry = serde_json::from_str(&contents)?;
        if entry.expires_at_ms.is_some_and(|t| t <= now_ms()) {
            fs::remove_file(&path)?;
            debug!(key, "expired key removed (file)");
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let _guard = self.lock()?;
        let entry = FileEntry {
            value: value.to_string(),
            expires_at_ms: ttl.map(|d| now_ms() + d.as_millis() as u64),
        };
        let path = self.path_for(key);
        // Write-then-rename so readers never observe a torn record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so keys map to
/// distinct, portable file names.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_get_set_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("session:1").unwrap(), None);
        store.set("session:1", "{}", None).unwrap();
        assert_eq!(store.get("session:1").unwrap().as_deref(), Some("{}"));
        assert!(store.delete("session:1").unwrap());
        assert!(!store.delete("session:1").unwrap());
    }

    #[test]
    fn memory_store_expires_lazily() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::ZERO)).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store
            .set("worker-session-index:w1", "abc", None)
            .unwrap();
        assert_eq!(
            store.get("worker-session-index:w1").unwrap().as_deref(),
            Some("abc")
        );
        assert!(dir.path().join("worker-session-index%3Aw1.json").exists());
        assert!(store.delete("worker-session-index:w1").unwrap());
        assert_eq!(store.get("worker-session-index:w1").unwrap(), None);
    }

    #[test]
    fn file_store_expired_entry_reads_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        store.set("k", "v", Some(Duration::ZERO)).unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn key_encoding_is_distinct() {
        assert_eq!(encode_key("session:a"), "session%3Aa");
        assert_ne!(encode_key("a:b"), encode_key("a_b"));
    }
}
