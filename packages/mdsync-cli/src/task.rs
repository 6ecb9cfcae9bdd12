// Messages passed between scanner, workers and aggregator
use crate::error::TaskError;
use std::path::PathBuf;

/// A local image to upload. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local_path: PathBuf,
    /// Computed remote path, before any conflict resolution
    pub remote_path: String,
    /// Original file name, recorded in object metadata
    pub filename: String,
    /// Hex content hash taken while scanning
    pub hash: String,
}

/// Why an image resolved without being uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Cache entry for the same path and content
    Cache,
    /// Cache entry for identical content at another path
    ContentIndex,
    /// Remote object already holds identical content
    RemoteMatch,
    /// Dry run: prospective URL only
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Uploaded {
        url: String,
        /// Path actually written, after conflict resolution
        remote_path: String,
        hash: String,
    },
    Skipped {
        url: String,
        remote_path: String,
        hash: Option<String>,
        reason: SkipReason,
    },
    Failed(TaskError),
}

impl Outcome {
    /// URL the document link should point at, if the image resolved
    pub fn url(&self) -> Option<&str> {
        match self {
            Outcome::Uploaded { url, .. } | Outcome::Skipped { url, .. } => Some(url),
            Outcome::Failed(_) => None,
        }
    }
}

/// Produced once per task, consumed once by the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub task: UploadTask,
    pub outcome: Outcome,
}

/// Deferred link substitution in one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReplacement {
    pub local_path: PathBuf,
    /// Exact link text as found, e.g. `![logo](./img/logo.png)`
    pub old_link: String,
    pub alt_text: String,
    /// Text following the path, written back unchanged
    pub title: String,
    pub remote_path: String,
}

impl PendingReplacement {
    /// Link text pointing at `url`
    pub fn new_link(&self, url: &str) -> String {
        format!("![{}]({}{})", self.alt_text, url, self.title)
    }
}

/// Every substitution a scanned document is waiting on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPlan {
    pub path: PathBuf,
    pub replacements: Vec<PendingReplacement>,
}

/// Input of the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A document finished scanning
    Document(DocumentPlan),
    /// An image resolved, by a worker or straight from the cache
    Resolved(UploadResult),
}
