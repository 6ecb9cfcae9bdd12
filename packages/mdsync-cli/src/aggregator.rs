// Result aggregation and document rewriting
use crate::cache::ContentCache;
use crate::error::RewriteError;
use crate::stats::RunStatistics;
use crate::task::{DocumentPlan, Event, Outcome, PendingReplacement, SkipReason, UploadResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;

/// Apply every replacement whose image resolved to a URL.
///
/// Each replacement substitutes one occurrence of its link text, so
/// identical links appearing twice are each handled by their own entry.
/// Returns the new content and the number of links changed.
pub fn apply_replacements<'a, F>(content: &str, replacements: &[PendingReplacement], url_for: F) -> (String, usize)
where
    F: Fn(&Path) -> Option<&'a str>,
{
    let mut updated = content.to_string();
    let mut changed = 0;

    for replacement in replacements {
        let Some(url) = url_for(&replacement.local_path) else {
            continue;
        };
        let new_link = replacement.new_link(url);
        if new_link == replacement.old_link || !updated.contains(&replacement.old_link) {
            continue;
        }
        updated = updated.replacen(&replacement.old_link, &new_link, 1);
        changed += 1;
        tracing::debug!("Updated link: {} -> {}", replacement.old_link, new_link);
    }

    (updated, changed)
}

/// Rewrite one document in place. Returns whether any link changed.
///
/// The file is only written when something changed, and never in dry-run mode.
pub async fn rewrite_document<'a, F>(
    path: &Path,
    replacements: &[PendingReplacement],
    url_for: F,
    dry_run: bool,
) -> Result<bool, RewriteError>
where
    F: Fn(&Path) -> Option<&'a str>,
{
    let content = fs::read_to_string(path).await.map_err(|source| RewriteError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let (updated, changed) = apply_replacements(&content, replacements, url_for);
    if changed == 0 {
        return Ok(false);
    }

    if dry_run {
        tracing::info!("Would update {} links in {}", changed, path.display());
    } else {
        fs::write(path, updated).await.map_err(|source| RewriteError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Updated {} links in {}", changed, path.display());
    }
    Ok(true)
}

struct PendingDocument {
    replacements: Vec<PendingReplacement>,
    /// Images this document still waits on
    outstanding: HashSet<PathBuf>,
}

/// Single consumer of scanner and worker events.
///
/// Owns the statistics, records uploads in the cache and rewrites each
/// document as soon as the last image it references has resolved.
pub struct Aggregator {
    cache: Arc<ContentCache>,
    dry_run: bool,
    stats: RunStatistics,
    /// Local image -> URL, `None` when the image failed
    resolved: HashMap<PathBuf, Option<String>>,
    documents: HashMap<PathBuf, PendingDocument>,
    /// Local image -> documents waiting on it
    waiting: HashMap<PathBuf, Vec<PathBuf>>,
}

impl Aggregator {
    pub fn new(cache: Arc<ContentCache>, dry_run: bool, files_total: usize) -> Self {
        Self {
            cache,
            dry_run,
            stats: RunStatistics {
                files_total,
                ..RunStatistics::default()
            },
            resolved: HashMap::new(),
            documents: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Drain `events` until every sender is gone and return the statistics
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> RunStatistics {
        while let Some(event) = events.recv().await {
            match event {
                Event::Document(plan) => self.on_document(plan).await,
                Event::Resolved(result) => self.on_result(result).await,
            }
        }

        for (path, document) in self.documents.drain() {
            tracing::warn!(
                "Leaving {} unchanged: {} images never resolved",
                path.display(),
                document.outstanding.len()
            );
        }
        self.stats
    }

    async fn on_document(&mut self, plan: DocumentPlan) {
        self.stats.files_processed += 1;
        if plan.replacements.is_empty() {
            return;
        }

        let outstanding: HashSet<PathBuf> = plan
            .replacements
            .iter()
            .map(|r| r.local_path.clone())
            .filter(|local| !self.resolved.contains_key(local))
            .collect();

        if outstanding.is_empty() {
            self.rewrite(&plan.path, &plan.replacements).await;
            return;
        }

        for local in &outstanding {
            self.waiting.entry(local.clone()).or_default().push(plan.path.clone());
        }
        self.documents.insert(
            plan.path,
            PendingDocument {
                replacements: plan.replacements,
                outstanding,
            },
        );
    }

    async fn on_result(&mut self, result: UploadResult) {
        let UploadResult { task, outcome } = result;
        let local = task.local_path;

        let url = match outcome {
            Outcome::Failed(e) => {
                tracing::error!("Error uploading {}: {}", local.display(), e);
                self.stats.failed += 1;
                None
            }
            Outcome::Uploaded { url, remote_path, hash } => {
                tracing::info!("Uploaded image: {} → {}", local.display(), url);
                self.stats.uploaded += 1;
                self.cache.insert(&local, &remote_path, &url, &hash);
                Some(url)
            }
            Outcome::Skipped {
                url,
                remote_path,
                hash,
                reason,
            } => {
                tracing::info!("Skipped upload ({:?}): {} → {}", reason, local.display(), url);
                self.stats.skipped += 1;
                let record = matches!(reason, SkipReason::RemoteMatch | SkipReason::ContentIndex);
                if let (true, Some(hash)) = (record, hash) {
                    self.cache.insert(&local, &remote_path, &url, &hash);
                }
                Some(url)
            }
        };
        self.resolved.insert(local.clone(), url);

        let Some(waiters) = self.waiting.remove(&local) else {
            return;
        };
        for path in waiters {
            let ready = match self.documents.get_mut(&path) {
                Some(document) => {
                    document.outstanding.remove(&local);
                    document.outstanding.is_empty()
                }
                None => false,
            };
            if ready {
                if let Some(document) = self.documents.remove(&path) {
                    self.rewrite(&path, &document.replacements).await;
                }
            }
        }
    }

    async fn rewrite(&mut self, path: &Path, replacements: &[PendingReplacement]) {
        let resolved = &self.resolved;
        let url_for = |local: &Path| resolved.get(local).and_then(|url| url.as_deref());

        match rewrite_document(path, replacements, url_for, self.dry_run).await {
            Ok(true) => self.stats.files_changed += 1,
            Ok(false) => {}
            Err(e) => tracing::error!("{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::UploadTask;
    use tempfile::TempDir;

    fn replacement(local: &str, old_link: &str, alt: &str) -> PendingReplacement {
        PendingReplacement {
            local_path: PathBuf::from(local),
            old_link: old_link.to_string(),
            alt_text: alt.to_string(),
            title: String::new(),
            remote_path: String::new(),
        }
    }

    fn result(local: &Path, outcome: Outcome) -> Event {
        Event::Resolved(UploadResult {
            task: UploadTask {
                local_path: local.to_path_buf(),
                remote_path: String::new(),
                filename: String::new(),
                hash: String::new(),
            },
            outcome,
        })
    }

    fn uploaded(url: &str) -> Outcome {
        Outcome::Uploaded {
            url: url.to_string(),
            remote_path: format!("images/{}", url),
            hash: format!("hash-{}", url),
        }
    }

    #[test]
    fn test_apply_replacements_handles_duplicates_independently() {
        let content = "![a](x.png) and again ![a](x.png) and ![b](y.png)";
        let replacements = vec![
            replacement("/x.png", "![a](x.png)", "a"),
            replacement("/x.png", "![a](x.png)", "a"),
            replacement("/y.png", "![b](y.png)", "b"),
        ];
        let urls: HashMap<PathBuf, String> = [(PathBuf::from("/x.png"), "U1".to_string())].into();

        let (updated, changed) =
            apply_replacements(content, &replacements, |p| urls.get(p).map(String::as_str));

        assert_eq!(updated, "![a](U1) and again ![a](U1) and ![b](y.png)");
        assert_eq!(changed, 2);
    }

    #[test]
    fn test_apply_replacements_keeps_title() {
        let mut titled = replacement("/x.png", "![a](x.png \"Figure 1\")", "a");
        titled.title = " \"Figure 1\"".to_string();

        let (updated, changed) =
            apply_replacements("see ![a](x.png \"Figure 1\")", &[titled], |_| Some("U1"));

        assert_eq!(updated, "see ![a](U1 \"Figure 1\")");
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_apply_replacements_ignores_identical_link() {
        let replacements = vec![replacement("/x.png", "![a](U1)", "a")];
        let (updated, changed) = apply_replacements("![a](U1)", &replacements, |_| Some("U1"));
        assert_eq!(updated, "![a](U1)");
        assert_eq!(changed, 0);
    }

    struct Fixture {
        temp: TempDir,
        cache: Arc<ContentCache>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let cache = Arc::new(ContentCache::new(temp.path().join("cache")));
            Self { temp, cache }
        }

        fn doc(&self, name: &str, content: &str) -> PathBuf {
            let path = self.temp.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        async fn run(&self, events: Vec<Event>, dry_run: bool) -> RunStatistics {
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.send(event).await.unwrap();
            }
            drop(tx);
            Aggregator::new(Arc::clone(&self.cache), dry_run, 0).run(rx).await
        }
    }

    #[tokio::test]
    async fn test_partial_failure_rewrites_only_successes() {
        let fx = Fixture::new();
        let doc = fx.doc("post.md", "![a](img/one.png)\n![b](img/two.png)\n");
        let one = PathBuf::from("/img/one.png");
        let two = PathBuf::from("/img/two.png");

        let plan = DocumentPlan {
            path: doc.clone(),
            replacements: vec![
                replacement("/img/one.png", "![a](img/one.png)", "a"),
                replacement("/img/two.png", "![b](img/two.png)", "b"),
            ],
        };
        let stats = fx
            .run(
                vec![
                    Event::Document(plan),
                    result(&one, uploaded("U1")),
                    result(
                        &two,
                        Outcome::Failed(TaskError::Hash("boom".to_string())),
                    ),
                ],
                false,
            )
            .await;

        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "![a](U1)\n![b](img/two.png)\n");
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.files_changed, 1);
        assert_eq!(fx.cache.get(&one).unwrap().url, "U1");
        assert!(fx.cache.get(&two).is_none());
    }

    #[tokio::test]
    async fn test_document_waits_for_every_image() {
        let fx = Fixture::new();
        let doc = fx.doc("post.md", "![a](one.png) ![b](two.png)");
        let one = PathBuf::from("/one.png");
        let plan = DocumentPlan {
            path: doc.clone(),
            replacements: vec![
                replacement("/one.png", "![a](one.png)", "a"),
                replacement("/two.png", "![b](two.png)", "b"),
            ],
        };

        // The second image never resolves, so the document stays untouched
        let stats = fx
            .run(vec![result(&one, uploaded("U1")), Event::Document(plan)], false)
            .await;

        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "![a](one.png) ![b](two.png)");
        assert_eq!(stats.files_changed, 0);
        assert_eq!(stats.files_processed, 1);
    }

    #[tokio::test]
    async fn test_result_before_registration_still_applies() {
        let fx = Fixture::new();
        let doc = fx.doc("post.md", "![a](one.png)");
        let one = PathBuf::from("/one.png");
        let plan = DocumentPlan {
            path: doc.clone(),
            replacements: vec![replacement("/one.png", "![a](one.png)", "a")],
        };

        let stats = fx
            .run(vec![result(&one, uploaded("U1")), Event::Document(plan)], false)
            .await;

        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "![a](U1)");
        assert_eq!(stats.files_changed, 1);
    }

    #[tokio::test]
    async fn test_dry_run_counts_but_does_not_write() {
        let fx = Fixture::new();
        let doc = fx.doc("post.md", "![a](one.png)");
        let one = PathBuf::from("/one.png");
        let plan = DocumentPlan {
            path: doc.clone(),
            replacements: vec![replacement("/one.png", "![a](one.png)", "a")],
        };
        let preview = Outcome::Skipped {
            url: "U1".to_string(),
            remote_path: "images/one.png".to_string(),
            hash: Some("h".to_string()),
            reason: SkipReason::DryRun,
        };

        let stats = fx
            .run(vec![Event::Document(plan), result(&one, preview)], true)
            .await;

        assert_eq!(std::fs::read_to_string(&doc).unwrap(), "![a](one.png)");
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files_changed, 1);
        assert!(fx.cache.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_document_does_not_stop_others() {
        let fx = Fixture::new();
        let good = fx.doc("good.md", "![a](one.png)");
        let missing = fx.temp.path().join("missing.md");
        let one = PathBuf::from("/one.png");

        let events = vec![
            Event::Document(DocumentPlan {
                path: missing,
                replacements: vec![replacement("/one.png", "![a](one.png)", "a")],
            }),
            Event::Document(DocumentPlan {
                path: good.clone(),
                replacements: vec![replacement("/one.png", "![a](one.png)", "a")],
            }),
            result(&one, uploaded("U1")),
        ];
        let stats = fx.run(events, false).await;

        assert_eq!(std::fs::read_to_string(&good).unwrap(), "![a](U1)");
        assert_eq!(stats.files_changed, 1);
        assert_eq!(stats.files_processed, 2);
    }
}
