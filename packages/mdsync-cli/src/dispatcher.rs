// Upload worker pool
use crate::cache::ContentCache;
use crate::cancel::CancelToken;
use crate::conflict::{self, ConflictPolicy, KeyedLocks};
use crate::error::TaskError;
use crate::storage::{Metadata, StorageProvider, META_HASH, META_ORIGINAL, META_UPLOAD_TIME};
use crate::task::{Event, Outcome, SkipReason, UploadResult, UploadTask};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Switches that change how a task is processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub force: bool,
    pub dry_run: bool,
    pub conflict: ConflictPolicy,
}

/// Decides, per task, whether to skip, rename or upload, and talks to the
/// storage provider. Shared by all workers of a run.
pub struct Dispatcher {
    provider: Arc<dyn StorageProvider>,
    cache: Arc<ContentCache>,
    options: DispatchOptions,
    locks: KeyedLocks,
    cancel: CancelToken,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        cache: Arc<ContentCache>,
        options: DispatchOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            cache,
            options,
            locks: KeyedLocks::new(),
            cancel,
        }
    }

    /// Start `workers` tasks draining `tasks` until it is closed.
    ///
    /// Every task yields exactly one `Event::Resolved` on `events`.
    pub fn spawn(
        self: &Arc<Self>,
        workers: usize,
        tasks: mpsc::Receiver<UploadTask>,
        events: mpsc::Sender<Event>,
    ) -> Vec<JoinHandle<()>> {
        let tasks = Arc::new(Mutex::new(tasks));
        (0..workers.max(1))
            .map(|id| {
                let dispatcher = Arc::clone(self);
                let tasks = Arc::clone(&tasks);
                let events = events.clone();
                tokio::spawn(async move { dispatcher.worker(id, tasks, events).await })
            })
            .collect()
    }

    async fn worker(
        &self,
        id: usize,
        tasks: Arc<Mutex<mpsc::Receiver<UploadTask>>>,
        events: mpsc::Sender<Event>,
    ) {
        let mut handled = 0usize;
        loop {
            // Hold the receiver only long enough to take one task
            let task = {
                let mut rx = tasks.lock().await;
                rx.recv().await
            };
            let Some(task) = task else {
                break;
            };

            let outcome = self.process(&task).await;
            handled += 1;
            if events.send(Event::Resolved(UploadResult { task, outcome })).await.is_err() {
                tracing::warn!("Worker {}: result channel closed", id);
                break;
            }
        }
        tracing::debug!("Worker {} finished after {} tasks", id, handled);
    }

    /// Run one task to its outcome. Never fails the pool.
    pub async fn process(&self, task: &UploadTask) -> Outcome {
        if self.cancel.is_cancelled() {
            return Outcome::Failed(TaskError::Cancelled);
        }

        let hash = task.hash.clone();

        if self.options.dry_run {
            return Outcome::Skipped {
                url: self.provider.public_url(&task.remote_path),
                remote_path: task.remote_path.clone(),
                hash: Some(hash),
                reason: SkipReason::DryRun,
            };
        }

        if !self.options.force {
            if let Some(entry) = self.cache.find_by_hash(&hash) {
                tracing::debug!(
                    "{} has the same content as {}, reusing {}",
                    task.local_path.display(),
                    entry.local_path.display(),
                    entry.url
                );
                return Outcome::Skipped {
                    url: entry.url,
                    remote_path: entry.remote_path,
                    hash: Some(hash),
                    reason: SkipReason::ContentIndex,
                };
            }
        }

        // Serialize everything touching this remote name
        let _guard = self.locks.lock(&task.remote_path).await;

        let exists = match self.provider.object_exists(&task.remote_path).await {
            Ok(exists) => exists,
            Err(e) => return Outcome::Failed(TaskError::RemoteCheck(e)),
        };

        let mut remote_path = task.remote_path.clone();
        if exists && !self.options.force {
            match self.provider.compare_hash(&remote_path, &hash).await {
                Ok(true) => {
                    return Outcome::Skipped {
                        url: self.provider.public_url(&remote_path),
                        remote_path,
                        hash: Some(hash),
                        reason: SkipReason::RemoteMatch,
                    };
                }
                Ok(false) => {}
                Err(e) => return Outcome::Failed(TaskError::RemoteCheck(e)),
            }

            let resolved =
                conflict::resolve(self.options.conflict, self.provider.as_ref(), &remote_path).await;
            remote_path = match resolved {
                Ok(resolved) => resolved,
                Err(e) => return Outcome::Failed(TaskError::RemoteCheck(e)),
            };
            tracing::debug!(
                "Conflict on {} resolved by {} to {}",
                task.remote_path,
                self.options.conflict,
                remote_path
            );
        }

        let metadata = upload_metadata(&hash, &task.filename);
        match self.provider.upload(&task.local_path, &remote_path, &metadata).await {
            Ok(url) => Outcome::Uploaded {
                url,
                remote_path,
                hash,
            },
            Err(e) => Outcome::Failed(TaskError::Upload(e)),
        }
    }
}

fn upload_metadata(hash: &str, filename: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(META_HASH.to_string(), hash.to_string());
    metadata.insert(META_ORIGINAL.to_string(), filename.to_string());
    metadata.insert(META_UPLOAD_TIME.to_string(), chrono::Utc::now().to_rfc3339());
    metadata
}
