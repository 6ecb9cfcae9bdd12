// Markdown scanning: documents -> image references -> upload tasks
use crate::cache::ContentCache;
use crate::cancel::CancelToken;
use crate::error::{ScanError, TaskError};
use crate::hash::ContentHash;
use crate::task::{DocumentPlan, Event, Outcome, PendingReplacement, SkipReason, UploadResult, UploadTask};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Remote directory all images are uploaded into
pub const REMOTE_IMAGE_DIR: &str = "images";

const MAX_CLEAN_NAME_LEN: usize = 50;

/// What a run was pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Directory(PathBuf),
}

/// A local image link found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub alt_text: String,
    /// Link exactly as written, e.g. `![a](./img/one.png)`
    pub original_link: String,
    /// Link target as written
    pub raw_path: String,
    /// Text after the path inside the parentheses, e.g. ` "Figure 1"`
    pub title: String,
    pub resolved_path: PathBuf,
    pub document: PathBuf,
}

fn image_link_regex() -> &'static Regex {
    static IMAGE_LINK: OnceLock<Regex> = OnceLock::new();
    IMAGE_LINK.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("image link pattern is valid"))
}

/// Targets that already point somewhere remote
pub fn is_remote(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("//")
        || target.starts_with("data:")
}

/// Split a link target into its file path and the text after it.
///
/// `<...>` wrapping is removed from the path. The remainder, usually a
/// quoted title, keeps its leading whitespace so it can be written back as is.
fn split_target(target: &str) -> (&str, &str) {
    let target = target.trim();
    if let Some(inner) = target.strip_prefix('<') {
        return match inner.find('>') {
            Some(end) => (&inner[..end], &inner[end + 1..]),
            None => (inner, ""),
        };
    }
    match target.find(char::is_whitespace) {
        Some(end) => (&target[..end], &target[end..]),
        None => (target, ""),
    }
}

/// Resolve `target` against the directory of `document`
pub fn resolve_target(document: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return normalize_path(target);
    }
    let base = document.parent().unwrap_or_else(|| Path::new(""));
    normalize_path(&base.join(target))
}

/// Lexically drop `.` and fold `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                } else {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// All local image references in `content`, in document order.
/// Remote targets are left out.
pub fn find_local_references(document: &Path, content: &str) -> Vec<ImageReference> {
    image_link_regex()
        .captures_iter(content)
        .filter_map(|caps| {
            let raw = caps.get(2)?.as_str();
            let (path, title) = split_target(raw);
            if path.is_empty() || is_remote(path) {
                return None;
            }
            Some(ImageReference {
                alt_text: caps[1].to_string(),
                original_link: caps[0].to_string(),
                raw_path: raw.to_string(),
                title: title.to_string(),
                resolved_path: resolve_target(document, path),
                document: document.to_path_buf(),
            })
        })
        .collect()
}

/// Replace characters outside `[A-Za-z0-9_-]` with `_`, collapse runs,
/// trim and cap the length
pub fn clean_file_name(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' };
        if c == '_' && cleaned.ends_with('_') {
            continue;
        }
        cleaned.push(c);
    }
    cleaned.trim_matches('_').chars().take(MAX_CLEAN_NAME_LEN).collect()
}

/// `images/<clean-stem>_<hash8><.ext>`
pub fn remote_path_for(local_path: &Path, hash: &ContentHash) -> String {
    let stem = local_path
        .file_stem()
        .map(|s| clean_file_name(&s.to_string_lossy()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());
    let ext = local_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    format!("{}/{}_{}{}", REMOTE_IMAGE_DIR, stem, hash.short(), ext)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| extensions.iter().any(|wanted| *wanted == ext))
}

/// Documents to process, as absolute paths in a stable order.
///
/// A missing or unreadable root is an error; unreadable entries below a
/// directory root are logged and skipped.
pub fn collect_documents(source: &Source, extensions: &[String]) -> Result<Vec<PathBuf>, ScanError> {
    let root = match source {
        Source::File(path) | Source::Directory(path) => path,
    };
    let root = std::fs::canonicalize(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ScanError::NotFound { path: root.clone() },
        _ => ScanError::Read {
            path: root.clone(),
            source: e,
        },
    })?;

    match source {
        Source::File(_) => Ok(vec![root]),
        Source::Directory(_) => {
            tracing::info!("Processing directory: {}", root.display());
            let mut documents = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) if e.depth() == 0 => {
                        return Err(ScanError::Walk {
                            path: root.clone(),
                            message: e.to_string(),
                        })
                    }
                    Err(e) => {
                        tracing::warn!("Skipping unreadable entry: {}", e);
                        continue;
                    }
                };
                if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                    documents.push(entry.into_path());
                }
            }
            Ok(documents)
        }
    }
}

/// Turns documents into upload tasks and document plans.
///
/// Each distinct local image is hashed and queued at most once per run;
/// images with a valid cache entry resolve immediately without a task.
pub struct Scanner {
    cache: Arc<ContentCache>,
    force: bool,
    cancel: CancelToken,
    /// Local image -> remote path, for images already queued or resolved
    seen: HashMap<PathBuf, String>,
}

impl Scanner {
    pub fn new(cache: Arc<ContentCache>, force: bool, cancel: CancelToken) -> Self {
        Self {
            cache,
            force,
            cancel,
            seen: HashMap::new(),
        }
    }

    /// Scan `documents` in order. With `strict`, the first unreadable
    /// document aborts the scan; otherwise it is logged and skipped.
    ///
    /// Returns the number of documents scanned.
    pub async fn run(
        &mut self,
        documents: &[PathBuf],
        strict: bool,
        tasks: mpsc::Sender<UploadTask>,
        events: mpsc::Sender<Event>,
    ) -> Result<usize, ScanError> {
        let mut scanned = 0;
        for document in documents {
            if self.cancel.is_cancelled() {
                tracing::warn!("Scan cancelled after {} of {} documents", scanned, documents.len());
                break;
            }

            match self.scan_document(document, &tasks, &events).await {
                Ok(()) => scanned += 1,
                Err(e) if strict => return Err(e),
                Err(e) => tracing::error!("{}", e),
            }
        }
        Ok(scanned)
    }

    async fn scan_document(
        &mut self,
        path: &Path,
        tasks: &mpsc::Sender<UploadTask>,
        events: &mpsc::Sender<Event>,
    ) -> Result<(), ScanError> {
        tracing::info!("Processing file: {}", path.display());

        let content = fs::read_to_string(path).await.map_err(|source| ScanError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let references = find_local_references(path, &content);
        if references.is_empty() {
            tracing::debug!("No local images found in {}", path.display());
        } else {
            tracing::debug!("Found {} local images in {}", references.len(), path.display());
        }

        let mut replacements = Vec::with_capacity(references.len());
        for reference in references {
            if !fs::try_exists(&reference.resolved_path).await.unwrap_or(false) {
                tracing::warn!("Image does not exist: {}", reference.resolved_path.display());
                continue;
            }

            let remote_path = match self.seen.get(&reference.resolved_path) {
                Some(remote_path) => remote_path.clone(),
                None => self.plan_image(&reference, tasks, events).await,
            };

            replacements.push(PendingReplacement {
                local_path: reference.resolved_path,
                old_link: reference.original_link,
                alt_text: reference.alt_text,
                title: reference.title,
                remote_path,
            });
        }

        let plan = DocumentPlan {
            path: path.to_path_buf(),
            replacements,
        };
        if events.send(Event::Document(plan)).await.is_err() {
            tracing::warn!("Result channel closed while scanning {}", path.display());
        }
        Ok(())
    }

    /// Resolve a first-seen image from the cache or queue it for upload.
    ///
    /// An image that can't be hashed resolves as a failed task; documents
    /// referencing it keep the original link.
    async fn plan_image(
        &mut self,
        reference: &ImageReference,
        tasks: &mpsc::Sender<UploadTask>,
        events: &mpsc::Sender<Event>,
    ) -> String {
        let local_path = &reference.resolved_path;
        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let hash = match ContentHash::from_file_async(local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                let result = UploadResult {
                    task: UploadTask {
                        local_path: local_path.clone(),
                        remote_path: String::new(),
                        filename,
                        hash: String::new(),
                    },
                    outcome: Outcome::Failed(TaskError::Hash(format!("{:#}", e))),
                };
                self.seen.insert(local_path.clone(), String::new());
                if events.send(Event::Resolved(result)).await.is_err() {
                    tracing::warn!("Result channel closed");
                }
                return String::new();
            }
        };

        let task = UploadTask {
            local_path: local_path.clone(),
            remote_path: remote_path_for(local_path, &hash),
            filename,
            hash: hash.to_hex(),
        };

        if !self.force {
            match self.cache.get(local_path) {
                Some(entry) if hash.matches(&entry.hash) => {
                    tracing::debug!("Using cached URL for {}: {}", local_path.display(), entry.url);
                    self.seen.insert(local_path.clone(), entry.remote_path.clone());
                    let result = UploadResult {
                        task,
                        outcome: Outcome::Skipped {
                            url: entry.url,
                            remote_path: entry.remote_path.clone(),
                            hash: Some(hash.to_hex()),
                            reason: SkipReason::Cache,
                        },
                    };
                    if events.send(Event::Resolved(result)).await.is_err() {
                        tracing::warn!("Result channel closed");
                    }
                    return entry.remote_path;
                }
                Some(_) => {
                    tracing::debug!("Cache entry for {} is stale", local_path.display());
                }
                None => {}
            }
        }

        let remote_path = task.remote_path.clone();
        self.seen.insert(local_path.clone(), remote_path.clone());
        if tasks.send(task).await.is_err() {
            tracing::warn!("Task channel closed");
        }
        remote_path
    }
}
