//! Media Archiver Core Library
//!
//! Archives a content source's media to local storage. Fetches go through a
//! shared rate limiter with retry/backoff, items the source no longer serves are
//! recovered from a web archive, identical content is stored once, and progress
//! lives in a manifest that is saved atomically so an interrupted run can resume.
//!
//! # Architecture
//!
//! - [`fetch`] - rate-limited, retrying HTTP fetches with an optional circuit breaker
//! - [`archive`] - capture index client and snapshot selection
//! - [`dedup`] - checksum to stored-file index
//! - [`download`] - resolves one media item to a stored file
//! - [`queue`] - work queue and worker pool
//! - [`manifest`] - manifest model and store
//! - [`source`] - source lister and media extractor collaborators
//! - [`config`] - run configuration
//! - [`orchestrator`] - one end-to-end run

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod config;
pub mod dedup;
pub mod download;
pub mod fetch;
pub mod manifest;
pub mod orchestrator;
pub mod queue;
pub mod source;

// Re-export commonly used types
pub use config::{ArchiveConfig, ConfigError, FileConfig};
pub use dedup::DedupIndex;
pub use download::{DownloadManager, DownloadResult, DownloadTask, Outcome};
pub use fetch::{FetchClient, FetchError, RateLimiter, RetryPolicy};
pub use manifest::{Manifest, ManifestError, ManifestStore, MediaItem, Status};
pub use orchestrator::{Archiver, ProgressObserver, RunError, RunPhase, RunSummary};
pub use queue::{WorkQueue, WorkerPool, WorkerStats};
pub use source::{JsonExportLister, MediaExtractor, PatternMediaExtractor, SourceLister};
