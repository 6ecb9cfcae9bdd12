// In-process storage provider
use super::{custom_domain_url, object_key, Metadata, StorageProvider, META_HASH};
use crate::config::ProviderConfig;
use crate::error::StorageError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: Metadata,
}

/// Storage provider that keeps objects in memory.
///
/// Counts upload and existence calls and can be told to fail uploads, which
/// makes it the test double for pipeline runs.
#[derive(Debug)]
pub struct MemoryProvider {
    bucket: String,
    prefix: String,
    custom_domain: Option<String>,
    objects: Mutex<HashMap<String, StoredObject>>,
    failing: Mutex<Vec<String>>,
    upload_calls: AtomicUsize,
    exists_calls: AtomicUsize,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            bucket: "images".to_string(),
            prefix: String::new(),
            custom_domain: None,
            objects: Mutex::new(HashMap::new()),
            failing: Mutex::new(Vec::new()),
            upload_calls: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
        }
    }

    /// Serve public URLs from `domain`
    pub fn with_custom_domain(mut self, domain: impl Into<String>) -> Self {
        self.custom_domain = Some(domain.into());
        self
    }

    /// Seed an object, optionally with a stored hash
    pub fn insert_object(&self, remote_path: &str, data: &[u8], hash: Option<&str>) {
        let mut metadata = Metadata::new();
        if let Some(hash) = hash {
            metadata.insert(META_HASH.to_string(), hash.to_string());
        }
        self.objects().insert(
            self.key(remote_path),
            StoredObject {
                data: data.to_vec(),
                metadata,
            },
        );
    }

    /// Make every upload whose remote path contains `pattern` fail
    pub fn fail_uploads_matching(&self, pattern: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pattern.into());
    }

    pub fn upload_count(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn exists_count(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    /// Sorted keys of all stored objects
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object_data(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.objects()
            .get(&self.key(remote_path))
            .map(|object| object.data.clone())
    }

    fn key(&self, remote_path: &str) -> String {
        object_key(&self.prefix, remote_path)
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn configure(&mut self, config: &ProviderConfig) -> Result<(), StorageError> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConfig {
                message: "bucket must not be empty".to_string(),
            });
        }
        self.bucket = config.bucket.clone();
        self.prefix = config.prefix.clone();
        self.custom_domain = config.custom_domain.clone();
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        metadata: &Metadata,
    ) -> Result<String, StorageError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|pattern| remote_path.contains(pattern.as_str()));
        if should_fail {
            return Err(StorageError::Network {
                message: format!("simulated upload failure for {}", remote_path),
            });
        }

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::io(local_path.display().to_string(), &e))?;

        self.objects().insert(
            self.key(remote_path),
            StoredObject {
                data,
                metadata: metadata.clone(),
            },
        );

        Ok(self.public_url(remote_path))
    }

    fn public_url(&self, remote_path: &str) -> String {
        let key = self.key(remote_path);
        custom_domain_url(self.custom_domain.as_deref(), &key)
            .unwrap_or_else(|| format!("memory://{}/{}", self.bucket, key))
    }

    async fn object_exists(&self, remote_path: &str) -> Result<bool, StorageError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects().contains_key(&self.key(remote_path)))
    }

    async fn compare_hash(&self, remote_path: &str, local_hash: &str) -> Result<bool, StorageError> {
        let objects = self.objects();
        let object = objects
            .get(&self.key(remote_path))
            .ok_or_else(|| StorageError::NotFound {
                key: self.key(remote_path),
            })?;

        Ok(match object.metadata.get(META_HASH) {
            Some(stored) => stored == local_hash,
            None => ContentHash::from_bytes(&object.data).to_hex() == local_hash,
        })
    }

    async fn set_object_metadata(
        &self,
        remote_path: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError> {
        let key = self.key(remote_path);
        let mut objects = self.objects();
        let object = objects
            .get_mut(&key)
            .ok_or(StorageError::NotFound { key: key.clone() })?;
        object.metadata = metadata.clone();
        Ok(())
    }

    async fn get_object_metadata(&self, remote_path: &str) -> Result<Metadata, StorageError> {
        let key = self.key(remote_path);
        self.objects()
            .get(&key)
            .map(|object| object.metadata.clone())
            .ok_or(StorageError::NotFound { key })
    }
}
