// Run and provider configuration
use crate::conflict::ConflictPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Worker count used when none (or zero) is configured
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MDSYNC_CONFIG";

/// Settings handed opaquely to the storage provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registered provider name, e.g. "local"
    pub provider: String,

    /// Bucket (or top-level namespace) objects are written into
    pub bucket: String,

    /// Filesystem root for providers that store objects locally
    pub root: Option<PathBuf>,

    /// Key prefix prepended to every remote path
    pub prefix: String,

    /// Domain used to build public URLs, e.g. "cdn.example.com"
    pub custom_domain: Option<String>,

    /// Provider specific options
    pub options: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            bucket: "images".to_string(),
            root: None,
            prefix: String::new(),
            custom_domain: None,
            options: BTreeMap::new(),
        }
    }
}

/// Configuration of a single sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Number of upload workers
    pub concurrency: usize,

    /// Ignore the cache and remote hash matches; always upload
    pub force: bool,

    /// Compute everything but never upload or write documents
    pub dry_run: bool,

    /// How to name an upload whose remote path is taken by different content
    pub conflict: ConflictPolicy,

    /// Directory holding `upload-cache.json`
    pub cache_dir: PathBuf,

    /// Document extensions picked up in directory mode
    pub extensions: Vec<String>,

    pub provider: ProviderConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            force: false,
            dry_run: false,
            conflict: ConflictPolicy::default(),
            cache_dir: default_cache_dir(),
            extensions: vec!["md".to_string(), "markdown".to_string()],
            provider: ProviderConfig::default(),
        }
    }
}

/// `~/.cache/mdsync`, or a temp directory when no cache home is known
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("mdsync"))
        .unwrap_or_else(|| std::env::temp_dir().join("mdsync-cache"))
}

impl SyncConfig {
    /// Load configuration with the following priority:
    /// 1. File named by the MDSYNC_CONFIG environment variable
    /// 2. ~/.config/mdsync/config.toml
    /// 3. Defaults
    pub async fn load() -> Result<Self> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&env_path)).await;
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::load_from(&config_path).await;
            }
        }

        Ok(Self::default())
    }

    /// Read and parse a TOML config file
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config.normalized())
    }

    /// ~/.config/mdsync/config.toml
    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mdsync").join("config.toml"))
    }

    /// Save configuration to the default config file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path().context("Failed to determine config directory")?;
        self.save_to(&config_path).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Replace out-of-range values with their defaults
    pub fn normalized(mut self) -> Self {
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        self.extensions = self
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.extensions.is_empty() {
            self.extensions = Self::default().extensions;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.conflict, ConflictPolicy::Rename);
        assert!(!config.force);
        assert!(!config.dry_run);
        assert!(config.cache_dir.to_string_lossy().contains("mdsync"));
        assert_eq!(config.provider.provider, "local");
    }

    #[test]
    fn test_normalized_fixes_zero_concurrency_and_extensions() {
        let config = SyncConfig {
            concurrency: 0,
            extensions: vec![".MD".to_string(), " mdx ".to_string(), "".to_string()],
            ..SyncConfig::default()
        }
        .normalized();

        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.extensions, vec!["md", "mdx"]);
    }

    #[tokio::test]
    async fn test_load_from_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
concurrency = 8
conflict = "Version"

[provider]
provider = "LOCAL"
custom_domain = "cdn.example.com"
"#,
        )
        .unwrap();

        let config = SyncConfig::load_from(&path).await.unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.conflict, ConflictPolicy::Version);
        assert_eq!(config.provider.provider, "LOCAL");
        assert_eq!(config.provider.custom_domain.as_deref(), Some("cdn.example.com"));
        assert_eq!(config.provider.bucket, "images");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_policy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "conflict = \"shuffle\"\n").unwrap();

        assert!(SyncConfig::load_from(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let config = SyncConfig {
            concurrency: 3,
            dry_run: true,
            conflict: ConflictPolicy::Overwrite,
            cache_dir: temp.path().join("cache"),
            ..SyncConfig::default()
        };
        config.save_to(&path).await.unwrap();

        let reloaded = SyncConfig::load_from(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_load_from_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("env.toml");
        std::fs::write(&path, "concurrency = 2\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let config = SyncConfig::load().await.unwrap();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(config.concurrency, 2);
    }
}
