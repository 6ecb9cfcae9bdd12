// Run orchestration: scanner -> workers -> aggregator
use crate::aggregator::Aggregator;
use crate::cache::ContentCache;
use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::PipelineError;
use crate::scanner::{self, Scanner, Source};
use crate::stats::RunStatistics;
use crate::storage::{self, StorageProvider};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One configured synchronizer. A pipeline can run several sources in turn;
/// the cache is shared between runs and saved after each.
pub struct Pipeline {
    config: SyncConfig,
    provider: Arc<dyn StorageProvider>,
    cache: Arc<ContentCache>,
    cancel: CancelToken,
}

impl Pipeline {
    /// Build the provider named in `config` and open the cache
    pub async fn new(config: SyncConfig) -> Result<Self, PipelineError> {
        let provider = storage::create_provider(&config.provider)?;
        Ok(Self::with_provider(config, Arc::from(provider)).await)
    }

    /// Use an already configured provider
    pub async fn with_provider(config: SyncConfig, provider: Arc<dyn StorageProvider>) -> Self {
        let config = config.normalized();
        let cache = Arc::new(ContentCache::open(&config.cache_dir).await);
        tracing::debug!(
            "Pipeline ready: concurrency={}, conflict={}, cache={}",
            config.concurrency,
            config.conflict,
            cache.file_path().display()
        );
        Self {
            config,
            provider,
            cache,
            cancel: CancelToken::new(),
        }
    }

    /// Token that stops the scanner and makes queued tasks resolve as cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Process every document under `source`.
    ///
    /// Returns once all tasks are resolved, all documents are rewritten and
    /// the cache is saved. Only a scan failure on the source root is an error;
    /// per-image and per-document failures are counted and logged.
    pub async fn run(&self, source: &Source) -> Result<RunStatistics, PipelineError> {
        let documents = scanner::collect_documents(source, &self.config.extensions)?;
        tracing::info!("Found {} documents", documents.len());
        if self.config.dry_run {
            tracing::info!("Dry run: no uploads or file changes will be made");
        }

        let capacity = self.config.concurrency * 2;
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let aggregator = Aggregator::new(Arc::clone(&self.cache), self.config.dry_run, documents.len());
        let aggregator = tokio::spawn(aggregator.run(event_rx));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.cache),
            DispatchOptions {
                force: self.config.force,
                dry_run: self.config.dry_run,
                conflict: self.config.conflict,
            },
            self.cancel.clone(),
        ));
        let workers = dispatcher.spawn(self.config.concurrency, task_rx, event_tx.clone());

        let mut scanner = Scanner::new(Arc::clone(&self.cache), self.config.force, self.cancel.clone());
        let strict = matches!(source, Source::File(_));
        // Consumes both senders; the task channel closes when the scan ends
        let scanned = scanner.run(&documents, strict, task_tx, event_tx).await;

        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                tracing::error!("Upload worker failed: {}", e);
            }
        }
        let stats = aggregator.await?;

        if !self.config.dry_run {
            if let Err(e) = self.cache.save().await {
                tracing::warn!("Failed to save upload cache: {}", e);
            }
        }

        scanned?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryProvider;
    use tempfile::TempDir;

    async fn pipeline(temp: &TempDir, provider: Arc<MemoryProvider>) -> Pipeline {
        let config = SyncConfig {
            cache_dir: temp.path().join("cache"),
            concurrency: 2,
            ..SyncConfig::default()
        };
        Pipeline::with_provider(config, provider).await
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let temp = TempDir::new().unwrap();
        let pipeline = pipeline(&temp, Arc::new(MemoryProvider::new())).await;

        let err = pipeline
            .run(&Source::Directory(temp.path().join("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Scan(_)));
    }

    #[tokio::test]
    async fn test_empty_directory_yields_zero_stats() {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        let pipeline = pipeline(&temp, Arc::new(MemoryProvider::new())).await;

        let stats = pipeline.run(&Source::Directory(docs)).await.unwrap();
        assert_eq!(stats, RunStatistics::default());
    }

    #[tokio::test]
    async fn test_run_saves_cache() {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(docs.join("img")).unwrap();
        std::fs::write(docs.join("img/pic.png"), b"png bytes").unwrap();
        std::fs::write(docs.join("post.md"), "![pic](img/pic.png)").unwrap();

        let provider = Arc::new(MemoryProvider::new());
        let pipeline = pipeline(&temp, Arc::clone(&provider)).await;
        let stats = pipeline.run(&Source::Directory(docs.clone())).await.unwrap();

        assert_eq!(stats.uploaded, 1);
        assert_eq!(provider.upload_count(), 1);

        let reopened = ContentCache::open(temp.path().join("cache")).await;
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_uploads_nothing() {
        let temp = TempDir::new().unwrap();
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("pic.png"), b"png").unwrap();
        std::fs::write(docs.join("post.md"), "![pic](pic.png)").unwrap();

        let provider = Arc::new(MemoryProvider::new());
        let pipeline = pipeline(&temp, Arc::clone(&provider)).await;
        pipeline.cancel_token().cancel();

        let stats = pipeline.run(&Source::Directory(docs.clone())).await.unwrap();
        assert_eq!(provider.upload_count(), 0);
        assert_eq!(stats.uploaded, 0);
        assert_eq!(std::fs::read_to_string(docs.join("post.md")).unwrap(), "![pic](pic.png)");
    }
}
