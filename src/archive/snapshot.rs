//! Historical captures and best-capture selection.
//!
//! Selection is a pure function over the rows returned by the capture index.
//! Unusable captures (non-2xx, revisit records, unknown MIME) are dropped, the
//! rest are scored and the highest score wins:
//!
//! | Signal | Points |
//! |--------|--------|
//! | HTTP 200 | 100 |
//! | other 2xx | 80 |
//! | resolution from URL, else capture length (log-scaled) | up to 20 |
//! | capture year within the recency window (linear) | up to 10 |
//! | `image/*` or `video/*` MIME | 5 |
//! | `application/octet-stream` | 2 |
//!
//! Ties go to the capture that appears first.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::matching::resolution_hint;

/// First year of the default recency window.
pub const DEFAULT_RECENCY_START_YEAR: i32 = 2007;

const STATUS_OK_POINTS: f64 = 100.0;
const STATUS_2XX_POINTS: f64 = 80.0;
const SIZE_MAX_POINTS: f64 = 20.0;
const RECENCY_MAX_POINTS: f64 = 10.0;
const MEDIA_MIME_POINTS: f64 = 5.0;
const BINARY_MIME_POINTS: f64 = 2.0;

/// Resolution that earns the full size bonus.
const FULL_SIZE_RESOLUTION: f64 = 4096.0;

/// Capture length that earns the full size bonus (50 MB).
const FULL_SIZE_BYTES: f64 = 50.0 * 1024.0 * 1024.0;

/// MIME values the index uses for records that carry no content.
const PLACEHOLDER_MIME_TYPES: &[&str] = &["warc/revisit", "unk", "-", ""];

/// One historical capture of a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// 14-digit capture timestamp (`YYYYMMDDhhmmss`).
    pub timestamp: String,
    /// Archived HTTP status, if the index recorded one.
    pub http_status: Option<u16>,
    /// Archived MIME type.
    pub mime_type: String,
    /// URL as it was captured.
    pub original_url: String,
    /// Compressed capture length reported by the index.
    pub byte_length: u64,
    /// Address that replays the capture's original bytes.
    pub replay_url: String,
}

impl Snapshot {
    /// Builds a snapshot whose replay URL points at `replay_base`.
    #[must_use]
    pub fn new(
        timestamp: impl Into<String>,
        http_status: Option<u16>,
        mime_type: impl Into<String>,
        original_url: impl Into<String>,
        byte_length: u64,
        replay_base: &str,
    ) -> Self {
        let timestamp = timestamp.into();
        let original_url = original_url.into();
        let replay_url = replay_url(replay_base, &timestamp, &original_url);
        Self {
            timestamp,
            http_status,
            mime_type: mime_type.into(),
            original_url,
            byte_length,
            replay_url,
        }
    }

    /// Capture year, if the timestamp starts with one.
    #[must_use]
    pub fn year(&self) -> Option<i32> {
        self.timestamp.get(..4)?.parse().ok()
    }

    /// Whether the selector may pick this capture at all.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let is_2xx = self.http_status.is_some_and(|s| (200..300).contains(&s));
        let mime = self.mime_type.trim().to_ascii_lowercase();
        is_2xx && !PLACEHOLDER_MIME_TYPES.contains(&mime.as_str())
    }
}

/// Raw replay address: `{base}/web/{timestamp}id_/{original}`.
///
/// The `id_` flag asks the archive for the original bytes without its toolbar or
/// link rewriting.
#[must_use]
pub fn replay_url(replay_base: &str, timestamp: &str, original_url: &str) -> String {
    format!(
        "{}/web/{timestamp}id_/{original_url}",
        replay_base.trim_end_matches('/')
    )
}

/// Tunables for capture scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Captures from this year or earlier get no recency bonus.
    pub recency_start_year: i32,
    /// Captures from this year or later get the full recency bonus.
    pub recency_end_year: i32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            recency_start_year: DEFAULT_RECENCY_START_YEAR,
            recency_end_year: Utc::now().year(),
        }
    }
}

/// Scores a usable capture. `None` means the capture is filtered out.
#[must_use]
pub fn score(snapshot: &Snapshot, config: &SelectorConfig) -> Option<f64> {
    if !snapshot.is_usable() {
        return None;
    }

    let status_points = match snapshot.http_status {
        Some(200) => STATUS_OK_POINTS,
        _ => STATUS_2XX_POINTS,
    };

    Some(
        status_points
            + size_points(snapshot)
            + recency_points(snapshot, config)
            + mime_points(&snapshot.mime_type),
    )
}

fn size_points(snapshot: &Snapshot) -> f64 {
    let ratio = match resolution_hint(&snapshot.original_url) {
        Some(resolution) => (1.0 + f64::from(resolution)).ln() / (1.0 + FULL_SIZE_RESOLUTION).ln(),
        #[allow(clippy::cast_precision_loss)]
        None => (1.0 + snapshot.byte_length as f64).ln() / (1.0 + FULL_SIZE_BYTES).ln(),
    };
    (SIZE_MAX_POINTS * ratio).clamp(0.0, SIZE_MAX_POINTS)
}

fn recency_points(snapshot: &Snapshot, config: &SelectorConfig) -> f64 {
    let Some(year) = snapshot.year() else {
        return 0.0;
    };
    let start = config.recency_start_year;
    let end = config.recency_end_year;
    if end <= start {
        return if year >= end { RECENCY_MAX_POINTS } else { 0.0 };
    }
    let fraction = f64::from(year - start) / f64::from(end - start);
    (RECENCY_MAX_POINTS * fraction).clamp(0.0, RECENCY_MAX_POINTS)
}

fn mime_points(mime_type: &str) -> f64 {
    let mime = mime_type.trim().to_ascii_lowercase();
    if mime.starts_with("image/") || mime.starts_with("video/") {
        MEDIA_MIME_POINTS
    } else if mime == "application/octet-stream" {
        BINARY_MIME_POINTS
    } else {
        0.0
    }
}

/// Picks the highest-scoring usable capture. Ties keep the earlier capture.
///
/// Returns `None` for empty input or when every capture is filtered out.
///
/// ```
/// use archiver_core::archive::{SelectorConfig, Snapshot, select_best};
///
/// let base = "https://web.archive.org";
/// let captures = vec![
///     Snapshot::new("20150101000000", Some(200), "image/jpeg", "https://m.example.com/a_500.jpg", 500, base),
///     Snapshot::new("20150101000000", Some(200), "image/jpeg", "https://m.example.com/a_1280.jpg", 20_000, base),
///     Snapshot::new("20150101000000", Some(404), "-", "https://m.example.com/a_1280.jpg", 0, base),
/// ];
/// let best = select_best(&captures, &SelectorConfig::default()).unwrap();
/// assert!(best.original_url.ends_with("_1280.jpg"));
/// assert_eq!(best.http_status, Some(200));
/// ```
#[must_use]
pub fn select_best<'a>(snapshots: &'a [Snapshot], config: &SelectorConfig) -> Option<&'a Snapshot> {
    let mut best: Option<(&Snapshot, f64)> = None;

    for snapshot in snapshots {
        let Some(points) = score(snapshot, config) else {
            trace!(timestamp = %snapshot.timestamp, status = ?snapshot.http_status, mime = %snapshot.mime_type, "capture filtered");
            continue;
        };
        trace!(timestamp = %snapshot.timestamp, points, "capture scored");
        if best.is_none_or(|(_, top)| points > top) {
            best = Some((snapshot, points));
        }
    }

    debug!(
        candidates = snapshots.len(),
        selected = best.map(|(s, _)| s.timestamp.as_str()),
        "snapshot selection finished"
    );
    best.map(|(snapshot, _)| snapshot)
}
