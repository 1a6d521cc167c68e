//! Media download manager: streams assets to disk, verifies and deduplicates them,
//! and falls back to archive captures when the source has lost them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use archiver_core::dedup::DedupIndex;
//! use archiver_core::download::{DownloadManager, DownloadSettings, DownloadTask};
//! use archiver_core::fetch::{FetchClient, FetchSettings};
//! use archiver_core::manifest::ManifestStore;
//! use archiver_core::source::PatternMediaExtractor;
//!
//! # async fn example(task: DownloadTask) -> Result<(), Box<dyn std::error::Error>> {
//! let fetch = FetchClient::from_settings(&FetchSettings::default())?;
//! let manifest = Arc::new(ManifestStore::load("out/manifest.json", "blog", "https://blog.example.com").await?);
//! let manager = DownloadManager::new(
//!     fetch,
//!     None,
//!     Arc::new(DedupIndex::new()),
//!     Arc::clone(&manifest),
//!     Arc::new(PatternMediaExtractor::new()),
//!     DownloadSettings {
//!         media_dir: "out/media".into(),
//!         resume: true,
//!         archive_fallback: false,
//!         strict_verification: false,
//!     },
//! );
//! let result = manager.resolve(&task).await;
//! manifest.update_media(result.item).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod filename;
mod manager;

pub use error::DownloadError;
pub use filename::{content_type_matches, extension_from_content_type, media_filename};
pub use manager::{
    DownloadManager, DownloadResult, DownloadSettings, DownloadTask, Outcome, file_checksum,
    status_for,
};
