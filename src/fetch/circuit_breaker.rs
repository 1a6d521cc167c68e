//! Optional circuit breaker in front of the HTTP transport.
//!
//! ```text
//! CLOSED --(N consecutive failures)--> OPEN --(cool-down elapsed)--> HALF_OPEN
//!    ^                                   ^                               |
//!    +----------(probe succeeds)---------+-------(probe fails)-----------+
//! ```
//!
//! While OPEN every call is refused without touching the network. HALF_OPEN lets
//! exactly one probe through; everyone else is refused until the probe settles.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the breaker stays open before allowing a probe.
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(30);

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the cool-down elapses.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-isolation state machine shared by all fetches.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

/// Permission to make one call. Settle it with [`success`](Self::success) or
/// [`failure`](Self::failure).
///
/// Dropping an unsettled probe permit (for example when the request future is
/// cancelled) frees the half-open slot so another caller can probe.
#[derive(Debug)]
#[must_use = "a permit must be settled with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cool_down,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, accounting for an elapsed cool-down.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.cool_down_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn cool_down_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.cool_down)
    }

    /// Asks for permission to make a call. `None` means the call must fail fast.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !self.cool_down_elapsed(&inner) {
                    return None;
                }
                info!("circuit half-open, sending probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return None;
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Some(BreakerPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if probe {
            info!("probe succeeded, circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            warn!("probe failed, circuit re-opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            return;
        }
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = inner.consecutive_failures,
                cool_down_secs = self.cool_down.as_secs(),
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn on_abandoned_probe(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOL_DOWN)
    }
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records that the call reached a healthy upstream.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    /// Records a failure that counts against the upstream.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandoned_probe();
        }
    }
}
