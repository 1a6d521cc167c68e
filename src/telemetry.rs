//! Tracing subscriber setup and teardown for the binary.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{Subscriber, debug};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Installed observability stack. Created once in `main`, shut down before exit.
pub struct Telemetry {
    log_file: Option<(PathBuf, Arc<File>)>,
}

impl Telemetry {
    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` wins over `default_level`. With `log_file`, a second
    /// non-ANSI layer writes the same events to that file.
    pub fn init(default_level: &str, no_color: bool, log_file: Option<&Path>) -> Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(!no_color);

        let file = match log_file {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("Failed to create log file '{}'", path.display()))?;
                Some((path.to_path_buf(), Arc::new(file)))
            }
            None => None,
        };

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file.as_ref().map(|(_, file)| file_layer(file)))
            .try_init();

        Ok(Self { log_file: file })
    }

    /// Flushes buffered output.
    pub fn shutdown(self) {
        if let Some((path, file)) = &self.log_file {
            debug!(path = %path.display(), "closing log file");
            let _ = file.sync_all();
        }
        let _ = io::stderr().flush();
    }
}

/// Plain-text layer appending every event to `file`.
fn file_layer<S>(file: &Arc<File>) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(Arc::clone(file))
        .with_ansi(false)
        .with_target(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use tracing::info;

    use super::*;

    #[test]
    fn test_file_layer_writes_events_without_ansi() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        let file = Arc::new(File::create(&path).unwrap());

        let subscriber = tracing_subscriber::registry().with(file_layer(&file));
        tracing::subscriber::with_default(subscriber, || {
            info!(post_id = "1001", "stored media");
        });
        file.sync_all().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("stored media"));
        assert!(written.contains("post_id=\"1001\""));
        assert!(written.contains("telemetry::tests"));
        assert!(!written.contains('\u{1b}'));
    }
}
