//! Constants for the fetch layer (timeouts, rate limiting).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large videos).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default sustained request rate shared by all workers.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 2.0;

/// Default token bucket capacity.
pub const DEFAULT_BURST: u32 = 1;

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Warning threshold for a single server-mandated pause.
pub const LONG_PAUSE_WARNING_THRESHOLD: Duration = Duration::from_secs(30);
