// Storage provider trait and registry
pub mod local;
pub mod memory;

use crate::config::ProviderConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

pub use local::LocalProvider;
pub use memory::MemoryProvider;

/// Object metadata as stored alongside an upload
pub type Metadata = HashMap<String, String>;

/// Metadata key holding the content hash of the uploaded bytes
pub const META_HASH: &str = "hash";
/// Metadata key holding the original local file name
pub const META_ORIGINAL: &str = "original";
/// Metadata key holding the RFC 3339 upload timestamp
pub const META_UPLOAD_TIME: &str = "upload_time";

/// Object storage backend used by the upload workers.
///
/// The pipeline never depends on a concrete backend; anything that can
/// store a file under a key and answer existence and hash questions works.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Apply provider settings. Called once before the provider is shared.
    fn configure(&mut self, config: &ProviderConfig) -> Result<(), StorageError>;

    /// Store a local file under `remote_path` and return its public URL
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        metadata: &Metadata,
    ) -> Result<String, StorageError>;

    /// URL an object at `remote_path` is (or would be) served from
    fn public_url(&self, remote_path: &str) -> String;

    async fn object_exists(&self, remote_path: &str) -> Result<bool, StorageError>;

    /// Whether the object's stored hash equals `local_hash`
    async fn compare_hash(&self, remote_path: &str, local_hash: &str) -> Result<bool, StorageError>;

    async fn set_object_metadata(
        &self,
        remote_path: &str,
        metadata: &Metadata,
    ) -> Result<(), StorageError>;

    async fn get_object_metadata(&self, remote_path: &str) -> Result<Metadata, StorageError>;
}

/// Build and configure the provider named in `config` (case-insensitive).
///
/// Only providers that persist objects are registered. `MemoryProvider` is
/// handed to `Pipeline::with_provider` directly.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn StorageProvider>, StorageError> {
    let mut provider: Box<dyn StorageProvider> = match config.provider.to_ascii_lowercase().as_str() {
        "local" => Box::new(LocalProvider::new()),
        other => return Err(StorageError::UnknownProvider(other.to_string())),
    };

    provider.configure(config)?;
    tracing::debug!("Configured storage provider: {}", config.provider);
    Ok(provider)
}

/// Join the configured prefix onto a remote path unless it is already there
pub(crate) fn object_key(prefix: &str, remote_path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let remote_path = remote_path.trim_start_matches('/');

    if prefix.is_empty() || remote_path.starts_with(&format!("{}/", prefix)) {
        remote_path.to_string()
    } else {
        format!("{}/{}", prefix, remote_path)
    }
}

/// Public URL under a custom domain, if one is configured
pub(crate) fn custom_domain_url(custom_domain: Option<&str>, key: &str) -> Option<String> {
    let domain = custom_domain?.trim().trim_end_matches('/');
    if domain.is_empty() {
        return None;
    }
    if domain.starts_with("http://") || domain.starts_with("https://") {
        Some(format!("{}/{}", domain, key))
    } else {
        Some(format!("https://{}/{}", domain, key))
    }
}
