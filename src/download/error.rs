//! Error types for the download manager.
//!
//! These are per-item errors: the manager turns them into `status = error`
//! manifest entries and the run continues.

use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::fetch::FetchError;
use crate::manifest::MediaType;

/// Errors that can occur while resolving one media item.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request for the media failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The body stream broke off mid-download.
    #[error("stream error downloading {url}: {source}")]
    Stream {
        /// The URL being streamed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// File system error during download (create file, write, rename, etc.)
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Downloaded size does not match the expected size (strict mode).
    #[error("integrity check failed for {url}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Integrity {
        /// The URL that was downloaded.
        url: String,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Response content type does not fit the declared media type (strict mode).
    #[error("unexpected content type {content_type} for {media_type} at {url}")]
    ContentType {
        /// The URL that was downloaded.
        url: String,
        /// Declared media type.
        media_type: MediaType,
        /// Content type the server sent.
        content_type: String,
    },

    /// The archive fallback failed for a reason other than "no capture".
    #[error("archive fallback failed: {0}")]
    Archive(#[from] ArchiveError),
}

impl DownloadError {
    /// Creates a stream error.
    pub fn stream(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Stream {
            url: url.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Whether this failure means the source no longer has the asset (404/410).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.is_not_found())
    }
}
