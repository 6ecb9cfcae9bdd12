// Naming conflict resolution against the remote namespace
use crate::error::StorageError;
use crate::storage::StorageProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Upper bound on `_vN` probes before giving up
pub const MAX_VERSION_PROBES: u32 = 10_000;

/// Rule for naming an upload whose computed remote path already holds
/// different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictPolicy {
    /// Append a unique timestamp suffix to the file name
    #[default]
    Rename,
    /// Use the first free `_v1`, `_v2`, ... suffix
    Version,
    /// Replace the existing object
    Overwrite,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Rename => "rename",
            ConflictPolicy::Version => "version",
            ConflictPolicy::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "rename" => Ok(ConflictPolicy::Rename),
            "version" => Ok(ConflictPolicy::Version),
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            other => Err(format!(
                "invalid conflict policy: {} (must be rename, version, or overwrite)",
                other
            )),
        }
    }
}

impl TryFrom<String> for ConflictPolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConflictPolicy> for String {
    fn from(policy: ConflictPolicy) -> Self {
        policy.as_str().to_string()
    }
}

/// Pick the remote path to upload to, given that `remote_path` exists with
/// different content.
pub async fn resolve(
    policy: ConflictPolicy,
    provider: &dyn StorageProvider,
    remote_path: &str,
) -> Result<String, StorageError> {
    match policy {
        ConflictPolicy::Rename => Ok(with_suffix(remote_path, &format!("_{}", next_rename_stamp()))),
        ConflictPolicy::Version => {
            for version in 1..=MAX_VERSION_PROBES {
                let candidate = with_suffix(remote_path, &format!("_v{}", version));
                if !provider.object_exists(&candidate).await? {
                    return Ok(candidate);
                }
            }
            Err(StorageError::Other {
                message: format!(
                    "no free version of {} after {} probes",
                    remote_path, MAX_VERSION_PROBES
                ),
            })
        }
        ConflictPolicy::Overwrite => Ok(remote_path.to_string()),
    }
}

/// Insert `suffix` between the file stem and extension of the last path segment
pub fn with_suffix(remote_path: &str, suffix: &str) -> String {
    let name_start = remote_path.rfind('/').map_or(0, |i| i + 1);
    match remote_path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let split = name_start + dot;
            format!("{}{}{}", &remote_path[..split], suffix, &remote_path[split..])
        }
        _ => format!("{}{}", remote_path, suffix),
    }
}

static LAST_RENAME_STAMP: AtomicU64 = AtomicU64::new(0);

/// Nanosecond timestamp, bumped so that no two calls in this process return
/// the same value.
fn next_rename_stamp() -> u64 {
    let now = chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or(0);

    let mut last = LAST_RENAME_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_RENAME_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Async mutex per key. Serializes exists-check, conflict resolution and
/// upload for tasks that target the same remote path.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryProvider;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("RENAME".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Rename);
        assert_eq!(" Version ".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Version);
        assert_eq!("overwrite".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Overwrite);
        assert_eq!("".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Rename);
        assert!("shuffle".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix("images/logo_ab12cd34.png", "_v1"), "images/logo_ab12cd34_v1.png");
        assert_eq!(with_suffix("images/README", "_v2"), "images/README_v2");
        assert_eq!(with_suffix("dir.d/file", "_1"), "dir.d/file_1");
        assert_eq!(with_suffix("images/.hidden", "_1"), "images/.hidden_1");
    }

    #[test]
    fn test_rename_stamps_are_distinct() {
        let stamps: HashSet<u64> = (0..1000).map(|_| next_rename_stamp()).collect();
        assert_eq!(stamps.len(), 1000);
    }

    #[tokio::test]
    async fn test_rename_changes_path() {
        let provider = MemoryProvider::new();
        let resolved = resolve(ConflictPolicy::Rename, &provider, "images/a_12345678.png")
            .await
            .unwrap();

        assert_ne!(resolved, "images/a_12345678.png");
        assert!(resolved.starts_with("images/a_12345678_"));
        assert!(resolved.ends_with(".png"));
        assert_eq!(provider.exists_count(), 0);
    }

    #[tokio::test]
    async fn test_version_picks_first_free() {
        let provider = MemoryProvider::new();
        provider.insert_object("images/a.png", b"base", None);
        provider.insert_object("images/a_v1.png", b"one", None);
        provider.insert_object("images/a_v2.png", b"two", None);

        let resolved = resolve(ConflictPolicy::Version, &provider, "images/a.png")
            .await
            .unwrap();
        assert_eq!(resolved, "images/a_v3.png");
    }

    #[tokio::test]
    async fn test_overwrite_keeps_path() {
        let provider = MemoryProvider::new();
        let resolved = resolve(ConflictPolicy::Overwrite, &provider, "images/a.png")
            .await
            .unwrap();
        assert_eq!(resolved, "images/a.png");
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("images/a.png").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("images/a.png").await;
            })
        };

        // Different key is not blocked
        let _other = locks.lock("images/b.png").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
