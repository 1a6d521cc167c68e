//! Retry logic with exponential backoff for transient fetch failures.
//!
//! When a fetch fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - connection errors, timeouts, 500/502/503/504
//! - [`FailureType::RateLimited`] - HTTP 429
//! - [`FailureType::Permanent`] - everything else (400/401/403/404, invalid URLs, open circuit)
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type and
//! attempt count, computing a capped exponential delay scaled by random jitter.
//!
//! # Example
//!
//! ```
//! use archiver_core::fetch::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://example.com/a.jpg", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Default maximum retry attempts after the initial request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (60 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Lower bound of the jitter factor (inclusive).
const JITTER_MIN: f64 = 0.5;

/// Upper bound of the jitter factor (exclusive).
const JITTER_MAX: f64 = 1.5;

/// Classification of fetch failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,

    /// Server rate limiting (HTTP 429).
    RateLimited,

    /// Failure that won't succeed regardless of retries.
    Permanent,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * 2^(attempt - 1), max_delay) * jitter,  jitter in [0.5, 1.5)
/// ```
///
/// `attempt` is the 1-indexed attempt that just failed, so the first retry waits
/// roughly `base_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap, applied before jitter.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// `max_attempts` counts the initial attempt and is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Creates a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns a copy of this policy with a different attempt limit.
    #[must_use]
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.base_delay, self.max_delay)
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Capped exponential delay before jitter is applied.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * f64::from(2u32).powi(exponent as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        self.capped_delay(attempt).mul_f64(jitter_factor())
    }
}

/// Random jitter factor in `[0.5, 1.5)`.
///
/// Spreads retries out so workers that failed together don't retry together.
fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX)
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Network, Timeout | Transient |
/// | HTTP 429 | RateLimited |
/// | HTTP 500/502/503/504 | Transient |
/// | any other HTTP status | Permanent |
/// | InvalidUrl, CircuitOpen | Permanent |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Network { .. } | FetchError::Timeout { .. } => FailureType::Transient,
        FetchError::InvalidUrl { .. } | FetchError::CircuitOpen { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        429 => FailureType::RateLimited,
        500 | 502 | 503 | 504 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_with_max_retries_counts_initial_attempt() {
        assert_eq!(RetryPolicy::with_max_retries(0).max_attempts(), 1);
        assert_eq!(RetryPolicy::with_max_retries(5).max_attempts(), 6);
    }

    #[test]
    fn test_new_clamps_max_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_capped_delay_doubles() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.capped_delay(1), Duration::from_secs(1));
        assert_eq!(policy.capped_delay(2), Duration::from_secs(2));
        assert_eq!(policy.capped_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_capped_delay_respects_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.capped_delay(6), Duration::from_secs(5));
        assert_eq!(policy.capped_delay(30), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_secs(2), Duration::from_secs(60));
        for _ in 0..200 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1), "{delay:?} below 0.5x");
            assert!(delay < Duration::from_secs(3), "{delay:?} not below 1.5x");
        }
    }

    #[test]
    fn test_jitter_factor_bounds() {
        for _ in 0..500 {
            let factor = jitter_factor();
            assert!((JITTER_MIN..JITTER_MAX).contains(&factor));
        }
    }

    #[test]
    fn test_classify_retryable_statuses() {
        for status in [500, 502, 503, 504] {
            let error = FetchError::http_status("http://example.com", status);
            assert_eq!(classify_error(&error), FailureType::Transient, "{status}");
        }
        let error = FetchError::http_status("http://example.com", 429);
        assert_eq!(classify_error(&error), FailureType::RateLimited);
    }

    #[test]
    fn test_classify_terminal_statuses() {
        for status in [400, 401, 403, 404, 410, 501] {
            let error = FetchError::http_status("http://example.com", status);
            assert_eq!(classify_error(&error), FailureType::Permanent, "{status}");
        }
    }

    #[test]
    fn test_classify_timeout_transient() {
        let error = FetchError::timeout("http://example.com");
        assert_eq!(classify_error(&error), FailureType::Transient);
    }

    #[test]
    fn test_classify_invalid_url_and_open_circuit_permanent() {
        assert_eq!(
            classify_error(&FetchError::invalid_url("nope")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::circuit_open("http://example.com")),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let decision = RetryPolicy::default().should_retry(FailureType::Permanent, 1);
        let RetryDecision::DoNotRetry { reason } = decision else {
            panic!("expected DoNotRetry");
        };
        assert!(reason.contains("permanent"));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_retries(2);

        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));

        let RetryDecision::DoNotRetry { reason } = policy.should_retry(FailureType::Transient, 3)
        else {
            panic!("expected DoNotRetry");
        };
        assert!(reason.contains("exhausted"));
    }
}
