// Persistent upload cache
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs;

/// File name of the cache inside the cache directory
pub const CACHE_FILE_NAME: &str = "upload-cache.json";

/// Version tag written into the cache file
pub const CACHE_VERSION: &str = "1.0";

/// Last known remote location of a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub url: String,
    /// Hex content hash of the bytes that were uploaded
    pub hash: String,
    pub upload_time: DateTime<Utc>,
}

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    #[serde(default)]
    items: BTreeMap<String, CacheEntry>,
}

/// Entries by local path, plus a content index from hash to one of the
/// paths holding it.
#[derive(Debug, Default)]
struct Entries {
    by_path: HashMap<PathBuf, CacheEntry>,
    by_hash: HashMap<String, PathBuf>,
}

impl Entries {
    fn insert(&mut self, entry: CacheEntry) {
        let path = entry.local_path.clone();
        let hash = entry.hash.clone();
        if let Some(old) = self.by_path.insert(path.clone(), entry) {
            if old.hash != hash {
                self.unindex(&old.hash, &path);
            }
        }
        self.by_hash.entry(hash).or_insert(path);
    }

    fn remove(&mut self, local_path: &Path) -> Option<CacheEntry> {
        let removed = self.by_path.remove(local_path)?;
        self.unindex(&removed.hash, local_path);
        Some(removed)
    }

    fn find_by_hash(&self, hash: &str) -> Option<&CacheEntry> {
        self.by_hash.get(hash).and_then(|path| self.by_path.get(path))
    }

    /// Drop `hash -> path` from the index, pointing it at another holder if any
    fn unindex(&mut self, hash: &str, path: &Path) {
        if self.by_hash.get(hash).map(PathBuf::as_path) != Some(path) {
            return;
        }
        match self.by_path.values().find(|entry| entry.hash == hash) {
            Some(other) => {
                let other = other.local_path.clone();
                self.by_hash.insert(hash.to_string(), other);
            }
            None => {
                self.by_hash.remove(hash);
            }
        }
    }
}

impl FromIterator<CacheEntry> for Entries {
    fn from_iter<I: IntoIterator<Item = CacheEntry>>(iter: I) -> Self {
        let mut entries = Entries::default();
        for entry in iter {
            entries.insert(entry);
        }
        entries
    }
}

/// Mapping from local file path to its uploaded copy, persisted as JSON.
///
/// Reads and writes go through a single read/write lock, so the cache can be
/// shared between the scanner, the workers and the aggregator.
#[derive(Debug)]
pub struct ContentCache {
    dir: PathBuf,
    items: RwLock<Entries>,
}

impl ContentCache {
    /// Empty cache stored under `dir`. Nothing is read until [`load`](Self::load).
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            items: RwLock::new(Entries::default()),
        }
    }

    /// Open the cache in `dir`, starting empty if it can't be loaded
    pub async fn open<P: AsRef<Path>>(dir: P) -> Self {
        let cache = Self::new(dir);
        if let Err(e) = cache.load().await {
            tracing::warn!("Failed to load upload cache, starting empty: {}", e);
            *cache.write() = Entries::default();
        }
        cache
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE_NAME)
    }

    /// Read the cache file.
    ///
    /// A missing file creates an empty cache on disk; a corrupt file is
    /// treated as empty.
    pub async fn load(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.file_path();
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.write() = Entries::default();
                return self.save().await;
            }
            Err(source) => return Err(CacheError::Read { path, source }),
        };

        let items: Entries = match serde_json::from_slice::<CacheFile>(&data) {
            Ok(file) => {
                if file.version != CACHE_VERSION {
                    tracing::debug!(
                        "Cache version {} differs from {}, reading anyway",
                        file.version,
                        CACHE_VERSION
                    );
                }
                file.items.into_values().collect()
            }
            Err(e) => {
                tracing::warn!("Cache file {} is corrupt, starting fresh: {}", path.display(), e);
                Entries::default()
            }
        };

        tracing::debug!("Loaded {} cache entries from {}", items.by_path.len(), path.display());
        *self.write() = items;
        Ok(())
    }

    /// Persist the cache. Written to a temp file and renamed into place.
    pub async fn save(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let data = {
            let items = self.read();
            let file = CacheFile {
                version: CACHE_VERSION.to_string(),
                items: items
                    .by_path
                    .values()
                    .map(|entry| (entry.local_path.to_string_lossy().into_owned(), entry.clone()))
                    .collect(),
            };
            serde_json::to_vec_pretty(&file)?
        };

        let path = self.file_path();
        let tmp = self.dir.join(format!("{}.tmp", CACHE_FILE_NAME));
        fs::write(&tmp, data)
            .await
            .map_err(|source| CacheError::Write {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| CacheError::Write { path, source })?;

        Ok(())
    }

    pub fn get(&self, local_path: &Path) -> Option<CacheEntry> {
        self.read().by_path.get(local_path).cloned()
    }

    /// Record an upload, replacing any previous entry for the path
    pub fn insert(&self, local_path: &Path, remote_path: &str, url: &str, hash: &str) {
        let entry = CacheEntry {
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            url: url.to_string(),
            hash: hash.to_string(),
            upload_time: Utc::now(),
        };
        self.write().insert(entry);
    }

    /// Any entry whose uploaded bytes had this hash
    pub fn find_by_hash(&self, hash: &str) -> Option<CacheEntry> {
        self.read().find_by_hash(hash).cloned()
    }

    pub fn remove(&self, local_path: &Path) -> Option<CacheEntry> {
        self.write().remove(local_path)
    }

    pub fn len(&self) -> usize {
        self.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().by_path.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}
