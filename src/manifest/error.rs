//! Manifest persistence errors.
//!
//! Every variant here is fatal to a run: if the persisted state cannot be
//! trusted, the archiver stops rather than risk silently losing progress.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading, mutating or saving a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading, writing, syncing or renaming the manifest file failed.
    #[error("manifest IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest file exists but is not a valid manifest document.
    #[error("manifest at {path} is corrupt: {source}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The in-memory manifest could not be serialized.
    #[error("failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A checksum string is not 64 lowercase hex characters.
    #[error("invalid checksum {0:?}: expected 64 lowercase hex characters")]
    InvalidChecksum(String),

    /// A media item belongs to a different post than the one it was added under.
    #[error("media item {url} has postId {media_post_id}, expected {post_id}")]
    PostIdMismatch {
        /// The owning post.
        post_id: String,
        /// The media item's declared post.
        media_post_id: String,
        /// The media item's URL.
        url: String,
    },

    /// A media item's status and fields disagree.
    #[error("media item {url} is inconsistent: {reason}")]
    Invariant {
        /// The media item's URL.
        url: String,
        /// Which rule was broken.
        reason: &'static str,
    },
}

impl ManifestError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a parse error.
    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    /// Creates an invariant violation.
    pub fn invariant(url: impl Into<String>, reason: &'static str) -> Self {
        Self::Invariant {
            url: url.into(),
            reason,
        }
    }
}
