//! Rate-limited, retrying HTTP fetch layer.
//!
//! Every outbound request the archiver makes (listing pages, media downloads,
//! archive index queries, archived page replays) goes through one [`FetchClient`].
//!
//! # Features
//!
//! - Shared token bucket ([`RateLimiter`]) with burst capacity
//! - Jittered exponential backoff for retryable failures ([`RetryPolicy`])
//! - `Retry-After` support that pauses every worker, not just the one that saw it
//! - Optional [`CircuitBreaker`] that fails fast while the upstream is down
//!
//! # Example
//!
//! ```no_run
//! use archiver_core::fetch::{FetchClient, FetchOptions, FetchSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FetchClient::from_settings(&FetchSettings::default())?;
//! let page = client
//!     .fetch_text("https://example.com/post/1", &FetchOptions::default())
//!     .await?;
//! println!("{} bytes", page.len());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
mod client;
pub mod constants;
mod error;
pub mod rate_limiter;
mod retry;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitState, DEFAULT_COOL_DOWN, DEFAULT_FAILURE_THRESHOLD,
};
pub use client::{BreakerSettings, DEFAULT_USER_AGENT, FetchClient, FetchOptions, FetchSettings};
pub use error::FetchError;
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};
