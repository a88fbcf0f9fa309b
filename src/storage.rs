//! Durable local storage collaborator.
//!
//! A plain string key-value store with no transactional guarantees, used for
//! cache persistence, preference keys, and restart-detection timestamps.
//! Every caller treats operations as best-effort: a failure degrades to
//! in-memory-only behavior, it is never fatal.
//!
//! Key prefix conventions:
//! - `cache:` per-namespace cache mirrors
//! - `pref:` UI/navigation preference keys
//! - `lifecycle:` hidden-at timestamp and the manual-reload flag

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

/// Storage key prefix for cache namespace mirrors
pub const CACHE_PREFIX: &str = "cache:";

/// Storage key prefix for app preference keys
pub const PREF_PREFIX: &str = "pref:";

/// Storage key prefix for lifecycle bookkeeping
pub const LIFECYCLE_PREFIX: &str = "lifecycle:";

/// String key-value store with best-effort semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// All keys currently present, in no particular order
    fn keys(&self) -> Result<Vec<String>>;
}

/// File-backed store: one JSON-string file per key under a directory.
///
/// Keys are sanitized into file names (prefix colons become underscores) so
/// `cache:spots` lands at `cache_spots.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn key_for(path: &std::path::Path) -> Option<String> {
        path.file_stem().map(|s| s.to_string_lossy().into_owned())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read storage key: {}", key))?;
        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        std::fs::write(&path, value)
            .with_context(|| format!("Failed to write storage key: {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove storage key: {}", key))?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir).context("Failed to list storage directory")? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(key) = Self::key_for(&entry.path()) {
                    // Undo the colon sanitization for the leading prefix only
                    let key = if let Some(rest) = key.strip_prefix("cache_") {
                        format!("{}{}", CACHE_PREFIX, rest)
                    } else if let Some(rest) = key.strip_prefix("pref_") {
                        format!("{}{}", PREF_PREFIX, rest)
                    } else if let Some(rest) = key.strip_prefix("lifecycle_") {
                        format!("{}{}", LIFECYCLE_PREFIX, rest)
                    } else {
                        key
                    };
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

/// In-memory store for tests and hosts without durable storage.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.keys().cloned().collect())
    }
}
