//! Shared fixtures for integration tests: mock origin, JSON exports, configs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use archiver_core::{ArchiveConfig, Archiver, JsonExportLister, PatternMediaExtractor};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Working directory with an export file and an output directory.
pub struct Workspace {
    pub dir: TempDir,
    pub export: PathBuf,
    pub output: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let export = dir.path().join("export.json");
        let output = dir.path().join("out");
        Self {
            dir,
            export,
            output,
        }
    }

    /// Writes `(post_id, is_reblog, [media urls])` as a JSON export.
    pub fn write_export(&self, server: &MockServer, posts: &[(&str, bool, Vec<String>)]) {
        let posts: Vec<_> = posts
            .iter()
            .map(|(id, reblog, urls)| {
                let body: String = urls
                    .iter()
                    .map(|u| format!(r#"<figure><img src="{u}"></figure>"#))
                    .collect();
                json!({
                    "id": id,
                    "url": format!("{}/post/{id}", server.uri()),
                    "timestamp": "2016-03-01 12:00:00 GMT",
                    "isReblog": reblog,
                    "body": body,
                })
            })
            .collect();
        std::fs::write(&self.export, serde_json::to_vec(&json!({ "posts": posts })).unwrap())
            .unwrap();
    }

    /// Config pointed at `server` for both the archive index and replay.
    pub fn config(&self, server: &MockServer) -> ArchiveConfig {
        ArchiveConfig {
            output_dir: self.output.clone(),
            requests_per_second: 100.0,
            burst: 10,
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            cdx_endpoint: format!("{}/cdx", server.uri()),
            replay_base: server.uri(),
            ..ArchiveConfig::for_source("testblog", server.uri())
        }
    }

    pub fn archiver(&self, config: ArchiveConfig) -> Archiver {
        let lister = Arc::new(JsonExportLister::new(
            &self.export,
            config.source_name.clone(),
            config.source_url.clone(),
            config.page_size,
        ));
        Archiver::new(config, lister, Arc::new(PatternMediaExtractor::new()))
    }

    pub fn media_dir(&self) -> PathBuf {
        self.output.join("media")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output.join("manifest.json")
    }
}

/// Files in `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Serves `body` at `media_path`, expecting exactly `times` requests.
pub async fn serve_media(server: &MockServer, media_path: &str, body: &[u8], times: u64) {
    Mock::given(method("GET"))
        .and(path(media_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(body.to_vec()),
        )
        .expect(times)
        .mount(server)
        .await;
}

/// Answers `status` at `media_path`.
pub async fn serve_status(server: &MockServer, media_path: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(media_path))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Capture index answering one capture for `original` and nothing otherwise.
pub async fn serve_single_capture(
    server: &MockServer,
    original: &str,
    timestamp: &str,
    body: &[u8],
) {
    serve_capture(server, original, timestamp, "image/jpeg", body).await;
    serve_no_captures(server).await;
}

/// Archived copy of a post page whose HTML holds `page_html`.
pub async fn serve_page_capture(
    server: &MockServer,
    post_url: &str,
    timestamp: &str,
    page_html: &str,
) {
    serve_capture(server, post_url, timestamp, "text/html", page_html.as_bytes()).await;
    serve_no_captures(server).await;
}

async fn serve_capture(
    server: &MockServer,
    original: &str,
    timestamp: &str,
    mime_type: &str,
    body: &[u8],
) {
    let rows = json!([
        ["timestamp", "statuscode", "mimetype", "original", "length"],
        [timestamp, "200", mime_type, original, body.len().to_string()],
    ]);
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .and(query_param("url", original))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(format!("^/web/{timestamp}id_/")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", mime_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

/// Capture index with no captures for anything.
pub async fn serve_no_captures(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .with_priority(10)
        .mount(server)
        .await;
}
