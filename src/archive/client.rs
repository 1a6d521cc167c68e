//! Historical-capture index client.
//!
//! Queries a CDX-style index for every capture of a URL, picks the best one with
//! [`select_best`], and replays it through the shared [`FetchClient`].

use reqwest::Response;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::error::ArchiveError;
use super::matching::{MatchKind, ranked_matches, unwrap_replay_url};
use super::snapshot::{SelectorConfig, Snapshot, select_best};
use crate::fetch::{FetchClient, FetchError, FetchOptions};
use crate::source::MediaExtractor;

/// Default capture index endpoint.
pub const DEFAULT_CDX_ENDPOINT: &str = "https://web.archive.org/cdx/search/cdx";

/// Default replay host.
pub const DEFAULT_REPLAY_BASE: &str = "https://web.archive.org";

/// Fields requested from the index, in order.
const CDX_FIELDS: &str = "timestamp,statuscode,mimetype,original,length";

/// Upper bound on page-derived candidates looked up per item.
const MAX_PAGE_MATCH_LOOKUPS: usize = 3;

/// Archive endpoints and selection tunables.
#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Capture index endpoint.
    pub cdx_endpoint: String,
    /// Replay host used to build snapshot URLs.
    pub replay_base: String,
    /// Only captures at or after this timestamp prefix (`YYYY[MM[DD...]]`).
    pub from: Option<String>,
    /// Only captures at or before this timestamp prefix.
    pub to: Option<String>,
    /// Scoring tunables.
    pub selector: SelectorConfig,
    /// Whether to fall back to the archived post page when the media URL has no capture.
    pub page_fallback: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            replay_base: DEFAULT_REPLAY_BASE.to_string(),
            from: None,
            to: None,
            selector: SelectorConfig::default(),
            page_fallback: true,
        }
    }
}

/// Client for the historical-capture index.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    fetch: FetchClient,
    settings: ArchiveSettings,
}

impl ArchiveClient {
    /// Creates a client that sends every request through `fetch`.
    #[must_use]
    pub fn new(fetch: FetchClient, settings: ArchiveSettings) -> Self {
        Self { fetch, settings }
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    /// Lists every capture of exactly `url`.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Index`] if the index cannot be reached, [`ArchiveError::Parse`]
    /// if its response is not CDX JSON.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn captures(&self, url: &str) -> Result<Vec<Snapshot>, ArchiveError> {
        let query = self.query_url(url)?;
        let body = self
            .fetch
            .fetch_text(&query, &FetchOptions::default())
            .await
            .map_err(ArchiveError::Index)?;
        let snapshots = parse_cdx(&body, &self.settings.replay_base)
            .map_err(|e| ArchiveError::parse(&query, e))?;
        debug!(captures = snapshots.len(), "capture index answered");
        Ok(snapshots)
    }

    fn query_url(&self, url: &str) -> Result<String, ArchiveError> {
        let mut query = url::Url::parse(&self.settings.cdx_endpoint)
            .map_err(|_| ArchiveError::Index(FetchError::invalid_url(&self.settings.cdx_endpoint)))?;
        {
            let mut pairs = query.query_pairs_mut();
            pairs
                .append_pair("url", url)
                .append_pair("output", "json")
                .append_pair("fl", CDX_FIELDS);
            if let Some(from) = &self.settings.from {
                pairs.append_pair("from", from);
            }
            if let Some(to) = &self.settings.to {
                pairs.append_pair("to", to);
            }
        }
        Ok(query.into())
    }

    /// Best capture of exactly `url`. `Ok(None)` means the archive has nothing usable.
    ///
    /// # Errors
    ///
    /// Same as [`captures`](Self::captures).
    pub async fn find_best(&self, url: &str) -> Result<Option<Snapshot>, ArchiveError> {
        let snapshots = self.captures(url).await?;
        Ok(select_best(&snapshots, &self.settings.selector).cloned())
    }

    /// Best capture for a media item, trying the media URL first and then the
    /// archived copy of the page that contained it.
    ///
    /// The page fallback replays the best page capture, re-extracts media URLs
    /// with `extractor`, and looks up the matching URLs (by path, then by
    /// resolution-stripped filename).
    ///
    /// # Errors
    ///
    /// Index or parse failures, or a failure fetching the archived page other than
    /// "not found".
    #[instrument(skip(self, extractor), fields(url = %url, post_url = %post_url))]
    pub async fn find_best_for_item(
        &self,
        url: &str,
        post_url: &str,
        extractor: &dyn MediaExtractor,
    ) -> Result<Option<Snapshot>, ArchiveError> {
        if let Some(snapshot) = self.find_best(url).await? {
            return Ok(Some(snapshot));
        }
        if !self.settings.page_fallback || post_url.is_empty() {
            return Ok(None);
        }

        let Some(page) = self.find_best(post_url).await? else {
            debug!("no capture of the containing page");
            return Ok(None);
        };

        let body = match self
            .fetch
            .fetch_text(&page.replay_url, &FetchOptions::default())
            .await
        {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                warn!(replay_url = %page.replay_url, "archived page capture is gone");
                return Ok(None);
            }
            Err(e) => return Err(ArchiveError::Replay(e)),
        };

        let page_urls: Vec<String> = extractor
            .extract(&body)
            .iter()
            .flat_map(|d| d.all_urls().map(unwrap_replay_url).collect::<Vec<_>>())
            .collect();

        let lookups = ranked_matches(url, &page_urls)
            .into_iter()
            .filter(|(_, kind)| *kind != MatchKind::Exact)
            .take(MAX_PAGE_MATCH_LOOKUPS);

        for (candidate, kind) in lookups {
            debug!(candidate, ?kind, "looking up page-derived candidate");
            if let Some(snapshot) = self.find_best(candidate).await? {
                info!(candidate, timestamp = %snapshot.timestamp, "found capture via archived page");
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    /// Replays a capture's original bytes.
    ///
    /// # Errors
    ///
    /// Any [`FetchError`] from the replay request.
    pub async fn download(&self, snapshot: &Snapshot) -> Result<Response, FetchError> {
        self.fetch
            .fetch(&snapshot.replay_url, &FetchOptions::default())
            .await
    }
}

/// Parses CDX JSON output: an array of rows whose first row names the columns.
///
/// An empty body or empty array means no captures. `-` marks a missing value.
fn parse_cdx(body: &str, replay_base: &str) -> Result<Vec<Snapshot>, serde_json::Error> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)?;
    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };

    let header: Vec<String> = header.iter().map(cell_text).collect();
    let column = |name: &str, fallback: usize| {
        header.iter().position(|h| h == name).unwrap_or(fallback)
    };
    let ts_col = column("timestamp", 0);
    let status_col = column("statuscode", 1);
    let mime_col = column("mimetype", 2);
    let original_col = column("original", 3);
    let length_col = column("length", 4);

    Ok(rows
        .filter_map(|row| {
            let cell = |i: usize| row.get(i).map(cell_text).unwrap_or_default();
            let timestamp = cell(ts_col);
            let original = cell(original_col);
            if timestamp.is_empty() || original.is_empty() {
                return None;
            }
            Some(Snapshot::new(
                timestamp,
                cell(status_col).parse().ok(),
                cell(mime_col),
                original,
                cell(length_col).parse().unwrap_or(0),
                replay_base,
            ))
        })
        .collect())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) if s == "-" => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cdx_rows() {
        let body = r#"[
            ["timestamp","statuscode","mimetype","original","length"],
            ["20240101120000","200","image/jpeg","https://m.example.com/a.jpg","1234"],
            ["20230101000000","-","warc/revisit","https://m.example.com/a.jpg","-"]
        ]"#;
        let rows = parse_cdx(body, "https://web.archive.org").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].http_status, Some(200));
        assert_eq!(rows[0].byte_length, 1234);
        assert_eq!(rows[1].http_status, None);
        assert_eq!(rows[1].mime_type, "warc/revisit");
        assert_eq!(rows[1].byte_length, 0);
        assert!(rows[0].replay_url.contains("/web/20240101120000id_/"));
    }

    #[test]
    fn test_parse_cdx_reordered_columns() {
        let body = r#"[["original","timestamp","length","mimetype","statuscode"],
                       ["https://m/a.png","20200101000000","9","image/png","200"]]"#;
        let rows = parse_cdx(body, "https://w").unwrap();
        assert_eq!(rows[0].original_url, "https://m/a.png");
        assert_eq!(rows[0].timestamp, "20200101000000");
        assert_eq!(rows[0].byte_length, 9);
    }

    #[test]
    fn test_parse_cdx_empty_responses() {
        assert!(parse_cdx("", "https://w").unwrap().is_empty());
        assert!(parse_cdx("[]", "https://w").unwrap().is_empty());
        assert!(parse_cdx("[[\"timestamp\"]]", "https://w").unwrap().is_empty());
    }

    #[test]
    fn test_parse_cdx_rejects_html() {
        assert!(parse_cdx("<html>busy</html>", "https://w").is_err());
    }

    #[test]
    fn test_query_url_encodes_target_and_range() {
        let fetch = FetchClient::from_settings(&crate::fetch::FetchSettings::default()).unwrap();
        let client = ArchiveClient::new(
            fetch,
            ArchiveSettings {
                from: Some("2015".into()),
                ..ArchiveSettings::default()
            },
        );
        let query = client.query_url("https://m.example.com/a b.jpg?x=1").unwrap();
        assert!(query.starts_with(DEFAULT_CDX_ENDPOINT));
        assert!(query.contains("url=https%3A%2F%2Fm.example.com%2Fa+b.jpg%3Fx%3D1"));
        assert!(query.contains("output=json"));
        assert!(query.contains("from=2015"));
        assert!(!query.contains("to="));
    }
}
