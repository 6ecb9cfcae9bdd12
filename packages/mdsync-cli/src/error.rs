// Error taxonomy for the sync pipeline
use std::path::PathBuf;
use thiserror::Error;

/// Failures enumerating or reading source documents.
///
/// These are the only errors that propagate to the caller of a run.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Source does not exist: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk directory {}: {message}", path.display())]
    Walk { path: PathBuf, message: String },
}

/// Failures loading or persisting the upload cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to create cache directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read cache file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write cache file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors reported by a storage provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider is not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid provider configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("{message}")]
    Other { message: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Per-task failure. Absorbed by the aggregator and reflected in statistics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("failed to calculate hash: {0}")]
    Hash(String),

    #[error("failed to check remote object: {0}")]
    RemoteCheck(#[source] StorageError),

    #[error("failed to upload file: {0}")]
    Upload(#[source] StorageError),

    #[error("cancelled before upload")]
    Cancelled,
}

/// Failure persisting a rewritten document. Logged; other documents continue.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("Failed to read {} for update: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write updated file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that abort a whole run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Pipeline task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_messages() {
        let err = TaskError::Upload(StorageError::Network {
            message: "connection reset".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "failed to upload file: Network error: connection reset"
        );
        assert_eq!(TaskError::Cancelled.to_string(), "cancelled before upload");
    }

    #[test]
    fn test_scan_error_wraps_into_pipeline_error() {
        let err: PipelineError = ScanError::NotFound {
            path: PathBuf::from("/missing/docs"),
        }
        .into();
        assert!(err.to_string().contains("/missing/docs"));
    }
}
