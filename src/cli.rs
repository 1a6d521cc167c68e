//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::time::Duration;

use archiver_core::ArchiveConfig;
use clap::Parser;

/// Archive a source's media locally, recovering lost items from a web archive.
///
/// Posts are read from a JSON export of the source. Progress is kept in
/// `<output-dir>/manifest.json`, so re-running the same command resumes.
#[derive(Parser, Debug)]
#[command(name = "media-archiver")]
#[command(author, version, about)]
pub struct Args {
    /// Source identifier, recorded in the manifest
    pub source: String,

    /// JSON export of the source's posts (default: <SOURCE>.json)
    #[arg(short = 'i', long)]
    pub export: Option<PathBuf>,

    /// Source base URL (default: https://<SOURCE>)
    #[arg(long)]
    pub source_url: Option<String>,

    /// Output directory for the manifest and media
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Number of download workers (1-64)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub concurrency: Option<u8>,

    /// Requests per second shared by all workers
    #[arg(long = "rps")]
    pub requests_per_second: Option<f64>,

    /// Retries for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Whole-request timeout in seconds
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Re-download everything instead of resuming
    #[arg(long)]
    pub no_resume: bool,

    /// Leave out reblogged posts
    #[arg(long)]
    pub no_reblogs: bool,

    /// List and filter only; write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Re-hash stored files when resuming
    #[arg(long)]
    pub verify: bool,

    /// Fail items whose size or content type does not match
    #[arg(long)]
    pub strict: bool,

    /// Never consult the web archive
    #[arg(long)]
    pub no_archive: bool,

    /// Stop calling a failing host for a while after repeated failures
    #[arg(long)]
    pub circuit_breaker: bool,

    /// Capture index endpoint
    #[arg(long, hide = true)]
    pub cdx_endpoint: Option<String>,

    /// Archive replay host
    #[arg(long, hide = true)]
    pub replay_base: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/media-archiver/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write full logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Base URL recorded for the source.
    pub fn source_url(&self) -> String {
        self.source_url.clone().unwrap_or_else(|| {
            if self.source.starts_with("http://") || self.source.starts_with("https://") {
                self.source.clone()
            } else {
                format!("https://{}", self.source)
            }
        })
    }

    /// Export file to list posts from.
    pub fn export_path(&self) -> PathBuf {
        self.export
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.json", self.source)))
    }

    /// Default log level from `-q` / `-v`.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Applies every flag given on the command line over `config`.
    pub fn apply_to(&self, config: &mut ArchiveConfig) {
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = usize::from(concurrency);
        }
        if let Some(rps) = self.requests_per_second {
            config.requests_per_second = rps;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = u32::from(retries);
        }
        if let Some(secs) = self.timeout {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(endpoint) = &self.cdx_endpoint {
            config.cdx_endpoint.clone_from(endpoint);
        }
        if let Some(base) = &self.replay_base {
            config.replay_base.clone_from(base);
        }
        config.resume &= !self.no_resume;
        config.include_reblogs &= !self.no_reblogs;
        config.archive_fallback &= !self.no_archive;
        config.dry_run |= self.dry_run;
        config.verify_on_resume |= self.verify;
        config.strict_verification |= self.strict;
        config.circuit_breaker |= self.circuit_breaker;
    }
}
