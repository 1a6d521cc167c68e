//! Errors for the archive fallback client.
//!
//! "No capture exists" is not an error: lookups return `Ok(None)` for that.

use thiserror::Error;

use crate::fetch::FetchError;

/// Failures talking to the capture index or replaying a capture.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The capture index could not be queried.
    #[error("capture index query failed: {0}")]
    Index(#[source] FetchError),

    /// The capture index answered with something other than CDX JSON.
    #[error("unreadable capture index response for {query}: {source}")]
    Parse {
        /// The query that was sent.
        query: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An archived page could not be replayed.
    #[error("failed to replay archived page: {0}")]
    Replay(#[source] FetchError),
}

impl ArchiveError {
    /// Creates a parse error.
    pub fn parse(query: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            query: query.into(),
            source,
        }
    }
}
