//! In-memory mapping cache with optional disk persistence.
//!
//! ## Design
//!
//! - Uses DashMap so importers without a dependency relationship can write
//!   concurrently
//! - Persists to a single bincode file on `persist()`, which the engine calls
//!   every few pages; a clean cache is not rewritten
//! - The file carries a format version; a mismatch is refused rather than
//!   silently treated as an empty cache

use super::{CacheBackend, CacheError, StoredEntry};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct MemoryCacheBackend {
    entries: DashMap<String, StoredEntry>,

    /// Where `persist()` writes; `None` keeps everything in memory only
    path: Option<PathBuf>,

    /// Set by every write since the last successful save
    dirty: AtomicBool,
}

/// Serializable format for disk storage
///
/// DashMap is converted to a HashMap since it doesn't implement Serialize
/// directly
#[derive(Serialize, Deserialize)]
struct StoredMappings {
    version: u32,
    entries: HashMap<String, StoredEntry>,
}

impl MemoryCacheBackend {
    /// Current file format version
    const CACHE_VERSION: u32 = 1;

    /// Create a cache that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open a disk-backed cache, loading `path` if it exists.
    ///
    /// ## Errors
    ///
    /// Returns `CacheError::VersionMismatch` if the file was written by an
    /// incompatible version, `CacheError::DeserializeError` if it is corrupt.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();

        if !path.exists() {
            log::info!("mapping cache {} not found, starting empty", path.display());
            return Ok(Self {
                entries: DashMap::new(),
                path: Some(path),
                dirty: AtomicBool::new(false),
            });
        }

        let entries = Self::load_from_disk(&path)?;
        Ok(Self {
            entries,
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    fn load_from_disk(path: &Path) -> Result<DashMap<String, StoredEntry>, CacheError> {
        let serialized_data =
            std::fs::read(path).map_err(|e| CacheError::IoError(e.to_string()))?;

        let stored: StoredMappings = bincode::deserialize(&serialized_data)
            .map_err(|e| CacheError::DeserializeError(e.to_string()))?;

        if stored.version != Self::CACHE_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: Self::CACHE_VERSION,
                found: stored.version,
            });
        }

        let entries = DashMap::with_capacity(stored.entries.len());
        for (key, entry) in stored.entries {
            entries.insert(key, entry);
        }

        log::info!(
            "loaded mapping cache from {}: {} entries",
            path.display(),
            entries.len()
        );

        Ok(entries)
    }

    fn save_to_disk(&self, path: &Path) -> Result<(), CacheError> {
        let now = Utc::now();
        let stored = StoredMappings {
            version: Self::CACHE_VERSION,
            entries: self
                .entries
                .iter()
                .filter(|entry| !entry.value().is_expired(now))
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::IoError(e.to_string()))?;
            }
        }

        let serialized_data =
            bincode::serialize(&stored).map_err(|e| CacheError::SerializeError(e.to_string()))?;

        // Write next to the target and rename so a crash never leaves a
        // truncated cache behind
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &serialized_data)
            .map_err(|e| CacheError::IoError(e.to_string()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| CacheError::IoError(e.to_string()))?;

        log::debug!(
            "saved mapping cache: {} entries ({} bytes)",
            stored.entries.len(),
            serialized_data.len()
        );

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: String, entry: StoredEntry) -> Result<(), CacheError> {
        self.entries.insert(key, entry);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn forget_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        let removed = keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    async fn flush_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.tag.as_deref() != Some(tag));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }

    async fn count_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let now = Utc::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .count())
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.save_to_disk(path).inspect_err(|_| {
            self.dirty.store(true, Ordering::Release);
        })
    }
}
