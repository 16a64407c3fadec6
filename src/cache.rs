//! Two-tier storage for document indexes.
//!
//! The memory tier is a reader-writer-locked map for fast repeated access
//! within a session; the disk tier is one pretty-printed JSON file per
//! document (`<doc_id>.index.json`) that survives restarts. [`Cache::hydrate`]
//! repopulates the memory tier from disk at startup.
//!
//! Disk records are version-stamped; a record whose version differs from
//! [`CACHE_VERSION`] is rejected with [`CacheError::VersionMismatch`] so the
//! caller can re-parse instead of reading an incompatible shape.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::models::{Index, CACHE_VERSION};

/// Errors from cache operations. `NotFound` and `VersionMismatch` are
/// ordinary control-flow signals; `Io` and `Corrupt` are real failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("index not found")]
    NotFound,

    #[error("cache version mismatch (delete the cache directory and reindex)")]
    VersionMismatch,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse cache file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl CacheError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// How indexes are stored and retrieved. A trait so tests can inject
/// in-memory fakes.
pub trait Cache: Send + Sync {
    /// Retrieve an index from memory (fast path).
    fn get(&self, doc_id: &str) -> Result<Arc<Index>, CacheError>;

    /// Store an index in memory.
    fn set(&self, doc_id: &str, index: Arc<Index>);

    /// Retrieve an index from the disk tier.
    fn load_from_disk(&self, doc_id: &str) -> Result<Arc<Index>, CacheError>;

    /// Persist an index to the disk tier (whole-file replace).
    fn save_to_disk(&self, index: &Index) -> Result<(), CacheError>;

    /// Write raw markdown for a URL-sourced document and return the
    /// absolute path, so excerpt source links open in editors.
    fn save_markdown(&self, doc_id: &str, content: &str) -> Result<String, CacheError>;

    /// Path where markdown for `doc_id` is stored.
    fn markdown_path(&self, doc_id: &str) -> PathBuf;

    /// All DocIDs currently in the memory tier.
    fn list(&self) -> Vec<String>;

    /// Populate the memory tier by scanning the disk tier. Corrupted or
    /// version-mismatched files are skipped, not fatal.
    fn hydrate(&self) -> Result<(), CacheError>;

    /// Root directory of the cache.
    fn dir(&self) -> &Path;
}

/// Production [`Cache`] backed by JSON files on disk.
pub struct FileCache {
    cache_dir: PathBuf,
    mem: RwLock<HashMap<String, Arc<Index>>>,
}

impl FileCache {
    /// Create a cache rooted at `cache_dir`, creating the directory if
    /// needed.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)
            .map_err(|e| CacheError::io(format!("create cache dir {}", cache_dir.display()), e))?;
        Ok(Self {
            cache_dir,
            mem: RwLock::new(HashMap::new()),
        })
    }

    fn index_path(&self, doc_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.index.json", doc_id))
    }

    /// Whole-file replace via write-then-rename, so readers never observe
    /// a partially written blob.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .map_err(|e| CacheError::io(format!("write cache file {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| CacheError::io(format!("replace cache file {}", path.display()), e))
    }
}

impl Cache for FileCache {
    fn get(&self, doc_id: &str) -> Result<Arc<Index>, CacheError> {
        let mem = self.mem.read().expect("cache lock poisoned");
        mem.get(doc_id).cloned().ok_or(CacheError::NotFound)
    }

    fn set(&self, doc_id: &str, index: Arc<Index>) {
        let mut mem = self.mem.write().expect("cache lock poisoned");
        mem.insert(doc_id.to_string(), index);
    }

    fn load_from_disk(&self, doc_id: &str) -> Result<Arc<Index>, CacheError> {
        let path = self.index_path(doc_id);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound)
            }
            Err(e) => return Err(CacheError::io(format!("read cache file {}", path.display()), e)),
        };

        let index: Index = serde_json::from_slice(&data)?;

        if index.version != CACHE_VERSION {
            return Err(CacheError::VersionMismatch);
        }

        Ok(Arc::new(index))
    }

    fn save_to_disk(&self, index: &Index) -> Result<(), CacheError> {
        let path = self.index_path(&index.doc_id);
        let data = serde_json::to_vec_pretty(index)?;
        self.write_atomic(&path, &data)
    }

    fn save_markdown(&self, doc_id: &str, content: &str) -> Result<String, CacheError> {
        let path = self.markdown_path(doc_id);
        fs::write(&path, content)
            .map_err(|e| CacheError::io(format!("write markdown file {}", path.display()), e))?;

        // Absolute path so source links are openable from anywhere.
        let abs = path.canonicalize().unwrap_or(path);
        Ok(abs.to_string_lossy().into_owned())
    }

    fn markdown_path(&self, doc_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.md", doc_id))
    }

    fn list(&self) -> Vec<String> {
        let mem = self.mem.read().expect("cache lock poisoned");
        mem.keys().cloned().collect()
    }

    fn hydrate(&self) -> Result<(), CacheError> {
        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            CacheError::io(format!("read cache dir {}", self.cache_dir.display()), e)
        })?;

        let mut count = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(doc_id) = name.strip_suffix(".index.json") else {
                continue;
            };

            match self.load_from_disk(doc_id) {
                Ok(index) => {
                    self.set(doc_id, index);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(doc_id, error = %e, "skipping unreadable cache file");
                }
            }
        }

        tracing::debug!(count, "hydrated cache from disk");
        Ok(())
    }

    fn dir(&self) -> &Path {
        &self.cache_dir
    }
}
