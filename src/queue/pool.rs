//! Fixed-size worker pool draining a [`WorkQueue`].
//!
//! The producer enqueues every task, then [`WorkerPool::run`] spawns the workers,
//! sends one shutdown sentinel per worker and waits on the queue's completion
//! barrier. Workers acknowledge every message they take, including tasks that
//! panic and tasks skipped after an interrupt, so the barrier always returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::error::QueueError;
use super::work_queue::{QueueMessage, WorkQueue};
use crate::download::{DownloadResult, Outcome};

/// Minimum allowed worker count.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
pub const MAX_WORKERS: usize = 64;

/// Default worker count.
pub const DEFAULT_WORKERS: usize = 4;

/// What a handler reports back for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReport {
    /// How the task ended.
    pub outcome: Outcome,
    /// Bytes received from the network.
    pub bytes: u64,
    /// Whether the content was already stored.
    pub deduplicated: bool,
}

impl From<&DownloadResult> for TaskReport {
    fn from(result: &DownloadResult) -> Self {
        Self {
            outcome: result.outcome,
            bytes: result.bytes_fetched,
            deduplicated: result.deduplicated,
        }
    }
}

/// Processes one task. Implementations contain their own failures.
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + Sync {
    /// Handles `task` and reports how it ended.
    async fn handle(&self, task: T) -> TaskReport;
}

/// Counters kept by one worker, merged after all workers stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Stored from the primary source.
    pub downloaded: usize,
    /// Stored from an archive capture.
    pub archived: usize,
    /// Already stored and verified.
    pub skipped: usize,
    /// Gone and never captured.
    pub missing: usize,
    /// Failed, including handler panics.
    pub failed: usize,
    /// Stored items whose bytes matched an existing file.
    pub deduplicated: usize,
    /// Dequeued after an interrupt and left unprocessed.
    pub abandoned: usize,
    /// Bytes received from the network.
    pub bytes: u64,
}

impl WorkerStats {
    /// Counts one report.
    pub fn record(&mut self, report: TaskReport) {
        match report.outcome {
            Outcome::Downloaded => self.downloaded += 1,
            Outcome::Archived => self.archived += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Missing => self.missing += 1,
            Outcome::Failed => self.failed += 1,
        }
        if report.deduplicated {
            self.deduplicated += 1;
        }
        self.bytes += report.bytes;
    }

    /// Adds another worker's counters.
    pub fn merge(&mut self, other: &Self) {
        self.downloaded += other.downloaded;
        self.archived += other.archived;
        self.skipped += other.skipped;
        self.missing += other.missing;
        self.failed += other.failed;
        self.deduplicated += other.deduplicated;
        self.abandoned += other.abandoned;
        self.bytes += other.bytes;
    }

    /// Tasks that reached a terminal outcome.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.downloaded + self.archived + self.skipped + self.missing + self.failed
    }
}

/// Acknowledges a dequeued message when dropped, whatever happened to it.
struct AckGuard<'a, T> {
    queue: &'a WorkQueue<T>,
}

impl<T> Drop for AckGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

/// N workers sharing one queue.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    interrupted: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Creates a pool of `workers` workers.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConcurrency`] outside `1..=64`.
    pub fn new(workers: usize) -> Result<Self, QueueError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(QueueError::InvalidConcurrency { value: workers });
        }
        Ok(Self {
            workers,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shares an interrupt flag. Once set, workers acknowledge remaining tasks
    /// without processing them.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    /// Worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drains `queue` with `handler` and returns the merged counters.
    ///
    /// Tasks must already be enqueued; this sends the sentinels and waits for the
    /// completion barrier before joining the workers.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the sentinels cannot be enqueued.
    #[instrument(skip_all, fields(workers = self.workers, queued = queue.pending()))]
    pub async fn run<T, H>(
        &self,
        queue: Arc<WorkQueue<T>>,
        handler: Arc<H>,
    ) -> Result<WorkerStats, QueueError>
    where
        T: Send + 'static,
        H: TaskHandler<T> + ?Sized + 'static,
    {
        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let interrupted = Arc::clone(&self.interrupted);
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, &queue, handler.as_ref(), &interrupted).await
            }));
        }

        for _ in 0..self.workers {
            queue.put_shutdown()?;
        }

        debug!("waiting for queue to drain");
        queue.join().await;

        let mut stats = WorkerStats::default();
        for handle in handles {
            match handle.await {
                Ok(worker_stats) => stats.merge(&worker_stats),
                Err(e) => warn!(error = %e, "worker task ended abnormally"),
            }
        }

        info!(
            processed = stats.processed(),
            downloaded = stats.downloaded,
            archived = stats.archived,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "worker pool finished"
        );
        Ok(stats)
    }
}

async fn worker_loop<T, H>(
    worker_id: usize,
    queue: &WorkQueue<T>,
    handler: &H,
    interrupted: &AtomicBool,
) -> WorkerStats
where
    T: Send + 'static,
    H: TaskHandler<T> + ?Sized,
{
    let mut stats = WorkerStats::default();
    loop {
        let Some(message) = queue.get().await else {
            debug!(worker_id, "queue closed");
            break;
        };
        let _ack = AckGuard { queue };

        let task = match message {
            QueueMessage::Shutdown => {
                debug!(worker_id, "received shutdown sentinel");
                break;
            }
            QueueMessage::Task(task) => task,
        };

        if interrupted.load(Ordering::SeqCst) {
            stats.abandoned += 1;
            continue;
        }

        match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
            Ok(report) => stats.record(report),
            Err(_) => {
                warn!(worker_id, "task handler panicked");
                stats.failed += 1;
            }
        }
    }
    stats
}
