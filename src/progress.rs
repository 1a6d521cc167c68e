//! Progress UI (spinner) for archive runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use archiver_core::download::{DownloadResult, Outcome};
use archiver_core::orchestrator::{ProgressObserver, RunPhase};
use indicatif::{ProgressBar, ProgressStyle};

/// Whether a spinner should be drawn.
pub fn should_use_spinner(stderr_is_terminal: bool, quiet: bool, dumb_terminal: bool) -> bool {
    stderr_is_terminal && !quiet && !dumb_terminal
}

/// Whether `TERM=dumb`.
pub fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}

/// `[done/total]` spinner driven by orchestrator callbacks.
pub struct SpinnerProgress {
    spinner: ProgressBar,
    total: AtomicUsize,
    done: AtomicUsize,
    failed: AtomicUsize,
}

impl SpinnerProgress {
    /// Creates a spinner; a hidden one when `enabled` is false.
    pub fn new(enabled: bool) -> Self {
        let spinner = if enabled {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        } else {
            ProgressBar::hidden()
        };
        Self {
            spinner,
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Removes the spinner from the terminal.
    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn refresh(&self) {
        let done = self.done.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let suffix = if failed > 0 {
            format!(" ({failed} failed)")
        } else {
            String::new()
        };
        self.spinner
            .set_message(format!("[{}/{}] Archiving media...{suffix}", done.min(total), total));
    }
}

impl ProgressObserver for SpinnerProgress {
    fn on_phase(&self, phase: RunPhase) {
        match phase {
            RunPhase::Listing => self.spinner.set_message("Listing posts..."),
            RunPhase::Extracting => self.spinner.set_message("Finding media..."),
            RunPhase::Finalizing => self.spinner.set_message("Saving manifest..."),
            _ => {}
        }
    }

    fn on_queued(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.refresh();
    }

    fn on_item(&self, result: &DownloadResult) {
        self.done.fetch_add(1, Ordering::SeqCst);
        if result.outcome == Outcome::Failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.refresh();
    }
}
