//! Error types for the work queue and worker pool.

use thiserror::Error;

use super::pool::{MAX_WORKERS, MIN_WORKERS};

/// Errors from queue and pool setup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Invalid worker count provided.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The queue's receiving side is gone.
    #[error("work queue is closed")]
    Closed,
}
