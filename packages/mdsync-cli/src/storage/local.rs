// Local filesystem storage provider
use super::{custom_domain_url, object_key, Metadata, StorageProvider, META_HASH};
use crate::config::ProviderConfig;
use crate::error::StorageError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Directory inside the bucket holding metadata sidecars
const META_DIR: &str = ".mdsync-meta";

/// Stores objects as plain files:
/// `{root}/{bucket}/{prefix}/{remote_path}`
///
/// Metadata lives in a JSON sidecar under `{root}/{bucket}/.mdsync-meta/`.
/// Useful for publishing into a directory served by a static web server.
#[derive(Debug, Default)]
pub struct LocalProvider {
    root: PathBuf,
    bucket: String,
    prefix: String,
    custom_domain: Option<String>,
}

impl LocalProvider {
    /// Unconfigured provider; call `configure` before use
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider rooted at `root` with a bucket named `bucket`
    pub fn with_root<P: AsRef<Path>>(root: P, bucket: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            bucket: bucket.to_string(),
            prefix: String::new(),
            custom_domain: None,
        }
    }

    /// Directory objects are written into
    pub fn bucket_path(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    fn key(&self, remote_path: &str) -> String {
        object_key(&self.prefix, remote_path)
    }

    /// Map a remote key onto the filesystem, refusing keys that escape the bucket
    fn object_path(&self, remote_path: &str) -> Result<PathBuf, StorageError> {
        if remote_path.trim_matches('/').is_empty() {
            return Err(StorageError::InvalidConfig {
                message: "remote path must not be empty".to_string(),
            });
        }

        let key = self.key(remote_path);
        let relative = Path::new(&key);

        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes || key.starts_with(META_DIR) {
            return Err(StorageError::InvalidConfig {
                message: format!("invalid remote path: {}", remote_path),
            });
        }

        Ok(self.bucket_path().join(relative))
    }

    fn metadata_path(&self, remote_path: &str) -> Result<PathBuf, StorageError> {
        // Validate first so metadata can't escape either
        self.object_path(remote_path)?;
        Ok(self
            .bucket_path()
            .join(META_DIR)
            .join(format!("{}.json", self.key(remote_path))))
    }

    async fn write_metadata(&self, remote_path: &str, metadata: &Metadata) -> Result<(), StorageError> {
        let path = self.metadata_path(remote_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), &e))?;
        }

        let data = serde_json::to_vec_pretty(metadata).map_err(|e| StorageError::Other {
            message: format!("failed to encode metadata: {}", e),
        })?;

        fs::write(&path, data)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), &e))
    }

    async fn ensure_exists(&self, remote_path: &str) -> Result<PathBuf, StorageError> {
        let path = self.object_path(remote_path)?;
        if !self.object_exists(remote_path).await? {
            return Err(StorageError::NotFound {
                key: self.key(remote_path),
            });
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn configure(&mut self, config: &ProviderConfig) -> Result<(), StorageError> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConfig {
                message: "bucket must not be empty".to_string(),
            });
        }

        self.root = match &config.root {
            Some(root) => root.clone(),
            None => dirs::data_dir()
                .map(|dir| dir.join("mdsync").join("storage"))
                .ok_or_else(|| StorageError::InvalidConfig {
                    message: "no storage root configured and no data directory available"
                        .to_string(),
                })?,
        };
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
        if self.root.as_os_str().is_empty() {
            return Err(StorageError::NotConfigured("local".to_string()));
        }

        let path = self.object_path(remote_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent.display().to_string(), &e))?;
        }

        fs::copy(local_path, &path)
            .await
            .map_err(|e| StorageError::io(local_path.display().to_string(), &e))?;

        self.write_metadata(remote_path, metadata).await?;

        tracing::debug!("Stored object: {} -> {}", local_path.display(), path.display());

        Ok(self.public_url(remote_path))
    }

    fn public_url(&self, remote_path: &str) -> String {
        let key = self.key(remote_path);
        custom_domain_url(self.custom_domain.as_deref(), &key).unwrap_or_else(|| {
            format!("file://{}", self.bucket_path().join(&key).display())
        })
    }

    async fn object_exists(&self, remote_path: &str) -> Result<bool, StorageError> {
        let path = self.object_path(remote_path)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), &e))
    }

    async fn compare_hash(&self, remote_path: &str, local_hash: &str) -> Result<bool, StorageError> {
        let path = self.ensure_exists(remote_path).await?;

        let metadata = self.get_object_metadata(remote_path).await?;
        if let Some(stored) = metadata.get(META_HASH) {
            return Ok(stored == local_hash);
        }

        // No sidecar: hash the stored object itself
        let hash = ContentHash::from_file_async(&path)
            .await
            .map_err(|e| StorageError::Other {
                message: format!("{:#}", e),
            })?;
        Ok(hash.matches(local_hash))
    }

    async fn set_object_metadata(
        &self,
        remote_path: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError> {
        self.ensure_exists(remote_path).await?;
        self.write_metadata(remote_path, metadata).await
    }

    async fn get_object_metadata(&self, remote_path: &str) -> Result<Metadata, StorageError> {
        self.ensure_exists(remote_path).await?;

        let path = self.metadata_path(remote_path)?;
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| StorageError::Other {
                message: format!("corrupt metadata for {}: {}", remote_path, e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(StorageError::io(path.display().to_string(), &e)),
        }
    }
}
