//! Token-bucket rate limiting shared by every request the archiver makes.
//!
//! The bucket holds at most `burst` tokens and refills at `requests_per_second`.
//! Each [`RateLimiter::acquire`] reserves one token. When the bucket is empty the
//! reservation goes into debt and the caller sleeps until its token would have
//! been refilled, so concurrent callers queue up behind each other instead of
//! waking together and re-checking.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use archiver_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! // Two requests per second, no burst.
//! let limiter = Arc::new(RateLimiter::new(2.0, 1));
//!
//! limiter.acquire().await; // immediate
//! limiter.acquire().await; // waits ~500ms
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{LONG_PAUSE_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Token-bucket rate limiter.
///
/// `RateLimiter` is `Send + Sync`; wrap it in `Arc` and share it across every
/// worker. The token state sits behind a short, non-async critical section that
/// is never held across an `.await`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bucket capacity (maximum burst).
    capacity: f64,

    /// Tokens added per second.
    refill_per_sec: f64,

    /// Whether rate limiting is disabled (`--rps 0`).
    disabled: bool,

    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Available tokens. Negative values are outstanding reservations.
    tokens: f64,

    last_refill: Instant,

    /// Server-mandated pause (from Retry-After) that applies to every caller.
    paused_until: Option<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `requests_per_second` sustained with bursts of `burst`.
    ///
    /// A non-positive rate produces a disabled limiter. `burst` is clamped to at least 1.
    /// The bucket starts full.
    #[must_use]
    #[instrument(level = "debug")]
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        if requests_per_second <= 0.0 || !requests_per_second.is_finite() {
            return Self::disabled();
        }
        let capacity = f64::from(burst.max(1));
        debug!(capacity, requests_per_second, "creating rate limiter");
        Self {
            capacity,
            refill_per_sec: requests_per_second,
            disabled: false,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                paused_until: None,
            }),
        }
    }

    /// Creates a disabled rate limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            capacity: 0.0,
            refill_per_sec: 0.0,
            disabled: true,
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
                paused_until: None,
            }),
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the sustained rate in requests per second (0 when disabled).
    #[must_use]
    pub fn requests_per_second(&self) -> f64 {
        self.refill_per_sec
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until a token is available, then consumes it.
    ///
    /// Never busy-waits: the caller sleeps exactly as long as its reservation needs.
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        loop {
            let wait = {
                let mut state = self.lock_state();
                let now = Instant::now();

                match state.paused_until {
                    Some(until) if until > now => Err(until - now),
                    _ => {
                        state.paused_until = None;
                        state.refill(now, self.capacity, self.refill_per_sec);
                        state.tokens -= 1.0;
                        if state.tokens >= 0.0 {
                            Ok(Duration::ZERO)
                        } else {
                            Ok(Duration::from_secs_f64(-state.tokens / self.refill_per_sec))
                        }
                    }
                }
            };

            match wait {
                Ok(delay) => {
                    if !delay.is_zero() {
                        debug!(delay_ms = delay.as_millis(), "rate limit delay");
                        tokio::time::sleep(delay).await;
                    }
                    return;
                }
                Err(pause) => {
                    debug!(pause_ms = pause.as_millis(), "waiting out server pause");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Records a server-mandated delay (from a Retry-After header).
    ///
    /// Every subsequent `acquire` waits until the pause has elapsed. Overlapping
    /// pauses keep the later deadline.
    #[instrument(level = "debug", skip(self))]
    pub fn pause_for(&self, delay: Duration) {
        if self.disabled || delay.is_zero() {
            return;
        }
        if delay >= LONG_PAUSE_WARNING_THRESHOLD {
            warn!(
                delay_secs = delay.as_secs(),
                "server requested a long pause - source may be under heavy load"
            );
        }
        let mut state = self.lock_state();
        let until = Instant::now() + delay;
        state.paused_until = Some(state.paused_until.map_or(until, |existing| existing.max(until)));
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use archiver_core::fetch::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        // A date in the past means "retry now".
        let duration = datetime.duration_since(now).unwrap_or(Duration::ZERO);
        Some(duration.min(MAX_RETRY_AFTER))
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_with_zero_rate_is_disabled() {
        assert!(RateLimiter::new(0.0, 1).is_disabled());
        assert!(RateLimiter::new(-1.0, 1).is_disabled());
        assert!(!RateLimiter::new(1.0, 1).is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_waits() {
        let limiter = RateLimiter::disabled();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_acquisitions_respect_rate() {
        let limiter = RateLimiter::new(4.0, 1);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // (N - 1) / R = 4 / 4 = 1s
        assert!(
            start.elapsed() >= Duration::from_secs(1),
            "elapsed {:?}",
            start.elapsed()
        );
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::new(1.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquisitions_are_spaced() {
        let limiter = std::sync::Arc::new(RateLimiter::new(10.0, 1));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..11 {
            let limiter = std::sync::Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_for_delays_next_acquire() {
        let limiter = RateLimiter::new(100.0, 5);
        limiter.pause_for(Duration::from_secs(3));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_later_deadline() {
        let limiter = RateLimiter::new(100.0, 5);
        limiter.pause_for(Duration::from_secs(5));
        limiter.pause_for(Duration::from_secs(1));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  7  "), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        let past_date = "Wed, 01 Jan 2020 00:00:00 GMT";
        assert_eq!(parse_retry_after(past_date), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }
}
