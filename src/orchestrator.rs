//! One archive run: list, extract, filter against the manifest, download, persist.
//!
//! ```text
//! Init → Listing → Extracting → Filtering → Downloading → Finalizing
//! ```
//!
//! "Source not found" on the first page aborts the run before anything is
//! enqueued; on a later page it ends the listing. Per-item failures never abort
//! the run. The manifest is saved at Finalizing whether or not every item
//! succeeded, and also when the run was interrupted.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::ArchiveClient;
use crate::config::{ArchiveConfig, ConfigError};
use crate::dedup::DedupIndex;
use crate::download::{DownloadManager, DownloadResult, DownloadSettings, DownloadTask};
use crate::fetch::FetchClient;
use crate::manifest::{ManifestError, ManifestStats, ManifestStore, Post};
use crate::queue::{QueueError, TaskHandler, TaskReport, WorkQueue, WorkerPool, WorkerStats};
use crate::source::{MediaExtractor, RawPost, SourceError, SourceLister};

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Listing,
    Extracting,
    Filtering,
    Downloading,
    Finalizing,
}

impl RunPhase {
    /// Lowercase label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Listing => "listing",
            Self::Extracting => "extracting",
            Self::Filtering => "filtering",
            Self::Downloading => "downloading",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures that abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Rejected before any work started.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The source does not exist.
    #[error("source not found: {0}")]
    SourceNotFound(#[source] SourceError),

    /// Listing failed for a reason other than "not found".
    #[error("failed to list page {page}: {source}")]
    Listing {
        /// Page being listed.
        page: usize,
        /// Lister error.
        #[source]
        source: SourceError,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Persisted state could not be read or written.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The worker pool could not run.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Receives progress notifications. Every method defaults to doing nothing.
pub trait ProgressObserver: Send + Sync {
    /// A new phase started.
    fn on_phase(&self, _phase: RunPhase) {}

    /// `total` tasks were enqueued.
    fn on_queued(&self, _total: usize) {}

    /// One task finished.
    fn on_item(&self, _result: &DownloadResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Manifest source name.
    pub source_name: String,
    /// Posts returned by the lister.
    pub posts_listed: usize,
    /// Reblogs left out.
    pub reblogs_skipped: usize,
    /// Media items found in the archived posts.
    pub media_found: usize,
    /// Items dropped before enqueue because they are already stored.
    pub already_stored: usize,
    /// Items enqueued (or, in a dry run, that would have been).
    pub queued: usize,
    /// Worker counters.
    pub stats: WorkerStats,
    /// Manifest totals after the run.
    pub manifest: ManifestStats,
    /// Wall-clock time.
    pub duration: Duration,
    /// Nothing was written.
    pub dry_run: bool,
    /// An interrupt stopped the run early.
    pub interrupted: bool,
}

impl RunSummary {
    /// Items skipped in total: filtered before enqueue plus verified by workers.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.already_stored + self.stats.skipped
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            writeln!(f, "Dry run for {}", self.source_name)?;
            writeln!(
                f,
                "  posts: {}  media: {}  already stored: {}  would fetch: {}",
                self.posts_listed, self.media_found, self.already_stored, self.queued
            )?;
            return Ok(());
        }

        let status = if self.interrupted {
            "interrupted"
        } else {
            "complete"
        };
        writeln!(f, "Archive of {} {status}", self.source_name)?;
        writeln!(
            f,
            "  downloaded: {}  archived: {}  skipped: {}  missing: {}  failed: {}",
            self.stats.downloaded,
            self.stats.archived,
            self.skipped(),
            self.stats.missing,
            self.stats.failed
        )?;
        if self.stats.deduplicated > 0 {
            writeln!(f, "  deduplicated: {}", self.stats.deduplicated)?;
        }
        if self.stats.abandoned > 0 {
            writeln!(f, "  not attempted: {}", self.stats.abandoned)?;
        }
        writeln!(
            f,
            "  fetched: {}  in {:.1}s",
            format_bytes(self.stats.bytes),
            self.duration.as_secs_f64()
        )?;
        write!(
            f,
            "  manifest: {} posts, {} media ({} stored, {})",
            self.manifest.posts,
            self.manifest.media,
            self.manifest.downloaded + self.manifest.archived,
            format_bytes(self.manifest.bytes)
        )
    }
}

/// Human-readable byte count.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Worker-side handler: resolve, record, report.
struct RecordingHandler {
    manager: DownloadManager,
    manifest: Arc<ManifestStore>,
    progress: Arc<dyn ProgressObserver>,
    interrupted: Arc<AtomicBool>,
    fatal: Mutex<Option<ManifestError>>,
}

#[async_trait]
impl TaskHandler<DownloadTask> for RecordingHandler {
    async fn handle(&self, task: DownloadTask) -> TaskReport {
        let result = self.manager.resolve(&task).await;
        if let Err(e) = self.manifest.update_media(result.item.clone()).await {
            error!(url = %task.url(), error = %e, "failed to record result, stopping run");
            self.interrupted.store(true, Ordering::SeqCst);
            if let Ok(mut slot) = self.fatal.lock() {
                slot.get_or_insert(e);
            }
        }
        self.progress.on_item(&result);
        TaskReport::from(&result)
    }
}

/// Runs archives for one source.
pub struct Archiver {
    config: ArchiveConfig,
    lister: Arc<dyn SourceLister>,
    extractor: Arc<dyn MediaExtractor>,
    interrupted: Arc<AtomicBool>,
    progress: Arc<dyn ProgressObserver>,
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("config", &self.config)
            .field("source", &self.lister.source_name())
            .finish_non_exhaustive()
    }
}

impl Archiver {
    /// Creates an archiver.
    #[must_use]
    pub fn new(
        config: ArchiveConfig,
        lister: Arc<dyn SourceLister>,
        extractor: Arc<dyn MediaExtractor>,
    ) -> Self {
        Self {
            config,
            lister,
            extractor,
            interrupted: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(NoProgress),
        }
    }

    /// Shares an interrupt flag, typically set from a Ctrl-C handler.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Installs a progress observer.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn enter(&self, phase: RunPhase) {
        debug!(%phase, "entering phase");
        self.progress.on_phase(phase);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Runs the whole pipeline once.
    ///
    /// # Errors
    ///
    /// [`RunError`] for invalid configuration, a missing source, listing failures,
    /// and manifest IO failures. Per-item failures are reported in the summary.
    #[instrument(skip(self), fields(source = %self.config.source_name))]
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let config = &self.config;

        self.enter(RunPhase::Init);
        config.validate()?;
        let manifest = Arc::new(
            ManifestStore::load(config.manifest_path(), &config.source_name, &config.source_url)
                .await?
                .with_autosave(config.autosave_every),
        );

        self.enter(RunPhase::Listing);
        let listed = self.list_all().await?;
        let posts_listed = listed.len();
        let (posts, reblogs_skipped): (Vec<RawPost>, Vec<RawPost>) = listed
            .into_iter()
            .partition(|p| config.include_reblogs || !p.is_reblog);
        info!(
            posts = posts_listed,
            reblogs_skipped = reblogs_skipped.len(),
            "listing complete"
        );

        self.enter(RunPhase::Extracting);
        let tasks = self.extract_all(&posts, &manifest, config.dry_run)?;
        let media_found = tasks.len();

        self.enter(RunPhase::Filtering);
        let (tasks, already_stored) = if config.resume && !config.verify_on_resume {
            let before = tasks.len();
            let remaining: Vec<DownloadTask> = tasks
                .into_iter()
                .filter(|t| !manifest.is_downloaded(t.url()))
                .collect();
            let filtered = before - remaining.len();
            (remaining, filtered)
        } else {
            (tasks, 0)
        };
        info!(media_found, already_stored, to_fetch = tasks.len(), "filtering complete");

        let mut summary = RunSummary {
            source_name: config.source_name.clone(),
            posts_listed,
            reblogs_skipped: reblogs_skipped.len(),
            media_found,
            already_stored,
            queued: tasks.len(),
            stats: WorkerStats::default(),
            manifest: manifest.stats(),
            duration: Duration::ZERO,
            dry_run: config.dry_run,
            interrupted: false,
        };

        if config.dry_run {
            for task in &tasks {
                info!(post_id = %task.source.post_id, url = %task.url(), "would fetch");
            }
            summary.duration = started.elapsed();
            return Ok(summary);
        }

        self.enter(RunPhase::Downloading);
        let download = self.download_all(tasks, &manifest).await;

        self.enter(RunPhase::Finalizing);
        let saved = manifest.save().await;
        let (stats, dedup) = download?;
        dedup.persist_best_effort().await;
        saved?;

        summary.stats = stats;
        summary.manifest = manifest.stats();
        summary.interrupted = self.is_interrupted();
        summary.duration = started.elapsed();
        info!(
            downloaded = stats.downloaded,
            archived = stats.archived,
            skipped = summary.skipped(),
            missing = stats.missing,
            failed = stats.failed,
            bytes = stats.bytes,
            interrupted = summary.interrupted,
            "run complete"
        );
        Ok(summary)
    }

    /// Pages through the lister until it is exhausted.
    async fn list_all(&self) -> Result<Vec<RawPost>, RunError> {
        let mut posts = Vec::new();
        let mut seen = HashSet::new();
        for page in 0.. {
            if self.is_interrupted() {
                warn!(page, "interrupted while listing");
                break;
            }
            match self.lister.list_page(page).await {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => {
                    debug!(page, count = batch.len(), "listed page");
                    posts.extend(batch.into_iter().filter(|p| seen.insert(p.post_id.clone())));
                }
                Err(e) if e.is_not_found() && page == 0 => {
                    return Err(RunError::SourceNotFound(e));
                }
                Err(e) if e.is_not_found() => {
                    debug!(page, "listing ended with not found");
                    break;
                }
                Err(source) => return Err(RunError::Listing { page, source }),
            }
        }
        Ok(posts)
    }

    /// Turns posts into tasks, recording post metadata unless this is a dry run.
    fn extract_all(
        &self,
        posts: &[RawPost],
        manifest: &ManifestStore,
        dry_run: bool,
    ) -> Result<Vec<DownloadTask>, RunError> {
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();
        for post in posts {
            if !dry_run {
                manifest.add_post(Post::new(
                    post.post_id.clone(),
                    post.post_url.clone(),
                    post.timestamp.clone(),
                    post.is_reblog,
                ))?;
            }
            for descriptor in self.extractor.extract(&post.content) {
                if seen.insert((post.post_id.clone(), descriptor.original_url.clone())) {
                    tasks.push(DownloadTask::new(post, descriptor));
                }
            }
        }
        Ok(tasks)
    }

    /// Builds the download stack, enqueues every task and drains the queue.
    async fn download_all(
        &self,
        tasks: Vec<DownloadTask>,
        manifest: &Arc<ManifestStore>,
    ) -> Result<(WorkerStats, Arc<DedupIndex>), RunError> {
        let config = &self.config;

        let dedup = Arc::new(match config.dedup_path() {
            Some(path) => DedupIndex::open(path).await,
            None => DedupIndex::new(),
        });
        dedup.seed_from_manifest(&manifest.snapshot());

        let fetch = FetchClient::from_settings(&config.fetch_settings()).map_err(RunError::Client)?;
        let archive = config
            .archive_fallback
            .then(|| ArchiveClient::new(fetch.clone(), config.archive_settings()));
        let manager = DownloadManager::new(
            fetch,
            archive,
            Arc::clone(&dedup),
            Arc::clone(manifest),
            Arc::clone(&self.extractor),
            DownloadSettings {
                media_dir: config.media_dir(),
                resume: config.resume,
                archive_fallback: config.archive_fallback,
                strict_verification: config.strict_verification,
            },
        );

        let queue = Arc::new(WorkQueue::new());
        let total = tasks.len();
        for task in tasks {
            queue.put(task)?;
        }
        self.progress.on_queued(total);

        let handler = Arc::new(RecordingHandler {
            manager,
            manifest: Arc::clone(manifest),
            progress: Arc::clone(&self.progress),
            interrupted: Arc::clone(&self.interrupted),
            fatal: Mutex::new(None),
        });

        let stats = WorkerPool::new(config.concurrency)?
            .with_interrupt(Arc::clone(&self.interrupted))
            .run(queue, Arc::clone(&handler))
            .await?;

        let fatal = handler.fatal.lock().ok().and_then(|mut slot| slot.take());
        if let Some(e) = fatal {
            return Err(RunError::Manifest(e));
        }
        Ok((stats, dedup))
    }
}
