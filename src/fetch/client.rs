//! Rate-limited, retrying HTTP fetches over one pooled transport.
//!
//! [`FetchClient`] is created once per run and cloned into every worker; the
//! underlying `reqwest::Client` connection pool, the token bucket and the
//! optional circuit breaker are shared by all clones.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response};
use tracing::{debug, info, instrument};
use url::Url;

use super::circuit_breaker::{CircuitBreaker, DEFAULT_COOL_DOWN, DEFAULT_FAILURE_THRESHOLD};
use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BURST, DEFAULT_REQUESTS_PER_SECOND, READ_TIMEOUT_SECS,
};
use super::error::FetchError;
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// User-Agent sent with every request unless overridden per call.
pub const DEFAULT_USER_AGENT: &str = concat!("media-archiver/", env!("CARGO_PKG_VERSION"));

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive retryable failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub cool_down: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cool_down: DEFAULT_COOL_DOWN,
        }
    }
}

/// Everything needed to build a [`FetchClient`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout, including streaming the body.
    pub read_timeout: Duration,
    /// Default User-Agent header.
    pub user_agent: String,
    /// Sustained request rate (0 disables limiting).
    pub requests_per_second: f64,
    /// Token bucket capacity.
    pub burst: u32,
    /// Retry policy for retryable failures.
    pub retry_policy: RetryPolicy,
    /// Circuit breaker, when enabled.
    pub circuit_breaker: Option<BreakerSettings>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            retry_policy: RetryPolicy::default(),
            circuit_breaker: None,
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Overrides the client's whole-request timeout.
    pub timeout: Option<Duration>,
    /// Overrides the retry policy's attempt limit.
    pub max_attempts: Option<u32>,
    /// Overrides the default User-Agent.
    pub user_agent: Option<String>,
}

impl FetchOptions {
    /// Options that make a single attempt with no retries.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }
}

/// HTTP fetcher with token-bucket rate limiting, retry/backoff and an optional
/// circuit breaker.
///
/// # Example
///
/// ```no_run
/// use archiver_core::fetch::{FetchClient, FetchOptions, FetchSettings};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = FetchClient::from_settings(&FetchSettings::default())?;
/// let response = client
///     .fetch("https://example.com/a.jpg", &FetchOptions::default())
///     .await?;
/// println!("status: {}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl FetchClient {
    /// Builds a client and its shared rate limiter / breaker from settings.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the TLS backend or connection pool cannot
    /// be initialised.
    #[instrument(level = "debug", skip(settings))]
    pub fn from_settings(settings: &FetchSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.read_timeout)
            .gzip(true)
            .user_agent(settings.user_agent.clone())
            .build()?;

        let rate_limiter = Arc::new(RateLimiter::new(
            settings.requests_per_second,
            settings.burst,
        ));
        let breaker = settings
            .circuit_breaker
            .map(|b| Arc::new(CircuitBreaker::new(b.failure_threshold, b.cool_down)));

        debug!(
            rps = settings.requests_per_second,
            burst = settings.burst,
            max_attempts = settings.retry_policy.max_attempts(),
            breaker = breaker.is_some(),
            "created fetch client"
        );

        Ok(Self::new(
            client,
            rate_limiter,
            settings.retry_policy.clone(),
            breaker,
        ))
    }

    /// Assembles a client from already-built parts.
    #[must_use]
    pub fn new(
        client: Client,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            client,
            rate_limiter,
            retry_policy,
            breaker,
        }
    }

    /// Returns the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the circuit breaker, if enabled.
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Fetches `url`, returning the response once it has a 2xx status.
    ///
    /// Retryable failures (connection errors, timeouts, 429/500/502/503/504) are
    /// retried with jittered exponential backoff. A `Retry-After` header overrides
    /// the computed delay and pauses the shared rate limiter for every worker.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once the failure is terminal or attempts
    /// are exhausted. [`FetchError::CircuitOpen`] is returned immediately while the
    /// breaker is open.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<Response, FetchError> {
        validate_url(url)?;

        let policy = match options.max_attempts {
            Some(max_attempts) => self.retry_policy.with_max_attempts(max_attempts),
            None => self.retry_policy.clone(),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "attempting fetch");

            let error = match self.attempt(url, options).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            let retry_after = retry_after_hint(&error);
            if let Some(pause) = retry_after {
                self.rate_limiter.pause_for(pause);
            }

            match policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = retry_after.unwrap_or(backoff_delay);
                    info!(
                        attempt = next_attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        error = %error,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, error = %error, "giving up on fetch");
                    return Err(error);
                }
            }
        }
    }

    /// Fetches `url` and reads the whole body as text.
    ///
    /// Only for small documents (index rows, archived pages); media bodies are streamed.
    ///
    /// # Errors
    ///
    /// Same as [`fetch`](Self::fetch), plus [`FetchError::Network`] if the body
    /// cannot be read.
    pub async fn fetch_text(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError> {
        let response = self.fetch(url, options).await?;
        response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })
    }

    /// One rate-limited, breaker-guarded request.
    async fn attempt(&self, url: &str, options: &FetchOptions) -> Result<Response, FetchError> {
        let permit = match &self.breaker {
            Some(breaker) => Some(
                breaker
                    .try_acquire()
                    .ok_or_else(|| FetchError::circuit_open(url))?,
            ),
            None => None,
        };

        self.rate_limiter.acquire().await;
        let result = self.send(url, options).await;

        if let Some(permit) = permit {
            match &result {
                Err(error) if error.is_retryable() => permit.failure(),
                _ => permit.success(),
            }
        }
        result
    }

    async fn send(&self, url: &str, options: &FetchOptions) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        if let Some(user_agent) = options.user_agent.as_deref() {
            request = request.header(USER_AGENT, user_agent);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(FetchError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

fn validate_url(url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;
    if matches!(parsed.scheme(), "http" | "https") {
        Ok(())
    } else {
        Err(FetchError::invalid_url(url))
    }
}

/// Parsed `Retry-After` delay carried by a status error, if any.
fn retry_after_hint(error: &FetchError) -> Option<Duration> {
    match error {
        FetchError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    fn fast_client(max_retries: u32) -> FetchClient {
        let settings = FetchSettings {
            requests_per_second: 0.0,
            retry_policy: RetryPolicy::new(
                max_retries + 1,
                Duration::from_millis(5),
                Duration::from_millis(20),
            ),
            ..FetchSettings::default()
        };
        FetchClient::from_settings(&settings).unwrap()
    }

    struct FailThenSucceed {
        calls: Arc<AtomicUsize>,
        failures: usize,
        status: u16,
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ResponseTemplate::new(self.status)
            } else {
                ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec())
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
            .mount(&server)
            .await;

        let client = fast_client(0);
        let body = client
            .fetch_text(&format!("{}/a.jpg", server.uri()), &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(body, "jpeg");
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(FailThenSucceed {
                calls: Arc::clone(&calls),
                failures: 2,
                status: 503,
            })
            .mount(&server)
            .await;

        let client = fast_client(3);
        let result = client
            .fetch(&format!("{}/flaky", server.uri()), &FetchOptions::default())
            .await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = fast_client(2);
        let error = client
            .fetch(&format!("{}/down", server.uri()), &FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.status(), Some(500));
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let error = client
            .fetch(&format!("{}/gone", server.uri()), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn test_single_attempt_option_overrides_policy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(5);
        let result = client
            .fetch(
                &format!("{}/once", server.uri()),
                &FetchOptions::single_attempt(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_retry_after_header_is_captured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .mount(&server)
            .await;

        let client = fast_client(0);
        let error = client
            .fetch(&format!("{}/busy", server.uri()), &FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(retry_after_hint(&error), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_retry_after_replaces_computed_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = FetchClient::from_settings(&FetchSettings {
            requests_per_second: 0.0,
            retry_policy: RetryPolicy::new(2, Duration::from_secs(20), Duration::from_secs(60)),
            ..FetchSettings::default()
        })
        .unwrap();

        let started = std::time::Instant::now();
        let body = tokio::time::timeout(
            Duration::from_secs(5),
            client.fetch_text(&format!("{}/busy", server.uri()), &FetchOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(body, "ok");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_without_request() {
        let client = fast_client(3);
        let error = client
            .fetch("ftp://example.com/a.jpg", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let settings = FetchSettings {
            requests_per_second: 0.0,
            retry_policy: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
            circuit_breaker: Some(BreakerSettings {
                failure_threshold: 2,
                cool_down: Duration::from_secs(600),
            }),
            ..FetchSettings::default()
        };
        let client = FetchClient::from_settings(&settings).unwrap();
        let url = format!("{}/down", server.uri());

        for _ in 0..2 {
            let error = client.fetch(&url, &FetchOptions::default()).await.unwrap_err();
            assert_eq!(error.status(), Some(503));
        }
        let error = client.fetch(&url, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(error, FetchError::CircuitOpen { .. }));
    }
}
