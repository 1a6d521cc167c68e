//! Collaborators that feed the pipeline: a paginated post lister and a media
//! extractor.
//!
//! The archiver only depends on the traits. [`JsonExportLister`] and
//! [`PatternMediaExtractor`] are the built-in implementations used by the
//! command-line tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, trace};

use crate::archive::matching::{filename_of, resolution_hint, variant_key};
use crate::manifest::MediaType;

/// Errors raised by a [`SourceLister`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source does not exist (or has no page with this number).
    #[error("source not found: {source_id}")]
    NotFound {
        /// Identifier of the missing source.
        source_id: String,
    },

    /// Reading a local export failed.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A local export is not valid JSON of the expected shape.
    #[error("invalid export {path}: {source}")]
    Parse {
        /// File involved.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Any other lister failure.
    #[error("listing failed: {0}")]
    Other(String),
}

impl SourceError {
    /// Creates a not-found error.
    pub fn not_found(source_id: impl Into<String>) -> Self {
        Self::NotFound {
            source_id: source_id.into(),
        }
    }

    /// Whether this is the "source not found" signal.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One post as produced by the lister, before media extraction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPost {
    /// Unique post identifier.
    #[serde(alias = "id")]
    pub post_id: String,
    /// Post permalink.
    #[serde(alias = "url")]
    pub post_url: String,
    /// Timestamp as reported by the source.
    #[serde(default)]
    pub timestamp: String,
    /// Whether this post re-shares another.
    #[serde(default)]
    pub is_reblog: bool,
    /// Raw body handed to the media extractor.
    #[serde(default, alias = "body")]
    pub content: String,
}

/// One media asset found in a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    /// Preferred URL.
    pub original_url: String,
    /// Alternatives for the same asset, best first.
    pub candidate_urls: Vec<String>,
    /// Declared media type.
    pub media_type: MediaType,
    /// Expected size, when the source declares one.
    pub byte_size_hint: Option<u64>,
    /// Expected content type, when the source declares one.
    pub content_type_hint: Option<String>,
}

impl MediaDescriptor {
    /// Creates a descriptor with no alternates or hints.
    #[must_use]
    pub fn new(original_url: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            original_url: original_url.into(),
            candidate_urls: Vec::new(),
            media_type,
            byte_size_hint: None,
            content_type_hint: None,
        }
    }

    /// Every URL for this asset, preferred first.
    pub fn all_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.original_url.as_str()).chain(self.candidate_urls.iter().map(String::as_str))
    }
}

/// Paginates a remote source.
///
/// Page numbers start at 0. An empty page means the listing is exhausted.
#[async_trait]
pub trait SourceLister: Send + Sync {
    /// Human-readable source identifier.
    fn source_name(&self) -> &str;

    /// Source base URL, recorded in the manifest.
    fn source_url(&self) -> &str;

    /// Fetches one page of posts.
    ///
    /// # Errors
    ///
    /// [`SourceError::NotFound`] when the source (or page) does not exist; any other
    /// variant for transport or format failures.
    async fn list_page(&self, page: usize) -> Result<Vec<RawPost>, SourceError>;
}

/// Finds media in a post's raw content.
pub trait MediaExtractor: Send + Sync {
    /// Returns one descriptor per distinct asset.
    fn extract(&self, content: &str) -> Vec<MediaDescriptor>;
}

/// Top-level shape of a JSON export: a bare array or an object with a `posts` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportDocument {
    Posts(Vec<RawPost>),
    Wrapped { posts: Vec<RawPost> },
}

/// Lists posts from a local JSON export, `page_size` at a time.
#[derive(Debug)]
pub struct JsonExportLister {
    path: PathBuf,
    source_name: String,
    source_url: String,
    page_size: usize,
    posts: OnceCell<Vec<RawPost>>,
}

impl JsonExportLister {
    /// Creates a lister over the export at `path`. The file is read on first use.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        source_name: impl Into<String>,
        source_url: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            path: path.into(),
            source_name: source_name.into(),
            source_url: source_url.into(),
            page_size: page_size.max(1),
            posts: OnceCell::new(),
        }
    }

    /// Export file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<&Vec<RawPost>, SourceError> {
        self.posts
            .get_or_try_init(|| async {
                let bytes = match tokio::fs::read(&self.path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(SourceError::not_found(self.path.display().to_string()));
                    }
                    Err(e) => {
                        return Err(SourceError::Io {
                            path: self.path.clone(),
                            source: e,
                        });
                    }
                };
                let document: ExportDocument =
                    serde_json::from_slice(&bytes).map_err(|e| SourceError::Parse {
                        path: self.path.clone(),
                        source: e,
                    })?;
                let posts = match document {
                    ExportDocument::Posts(posts) | ExportDocument::Wrapped { posts } => posts,
                };
                debug!(posts = posts.len(), "loaded JSON export");
                Ok(posts)
            })
            .await
    }
}

#[async_trait]
impl SourceLister for JsonExportLister {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn source_url(&self) -> &str {
        &self.source_url
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn list_page(&self, page: usize) -> Result<Vec<RawPost>, SourceError> {
        let posts = self.load().await?;
        let start = page.saturating_mul(self.page_size);
        Ok(posts
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect())
    }
}

/// Media URLs with a known file extension.
#[allow(clippy::expect_used)]
static MEDIA_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:https?:)?//[^\s<>"'()\[\]]+?\.(?:jpe?g|png|gif|webp|bmp|mp4|webm|mov|m4v)(?:\?[^\s<>"'()\[\]]*)?(?:$|[\s<>"'()\[\],])"#,
    )
    .expect("media URL regex is valid")
});

/// Regex-based extractor that finds image and video URLs in HTML or text.
///
/// Resolution variants of one asset (`x_500.jpg`, `x_1280.jpg`) collapse into a
/// single descriptor whose preferred URL is the largest variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternMediaExtractor;

impl PatternMediaExtractor {
    /// Creates the extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MediaExtractor for PatternMediaExtractor {
    #[instrument(level = "debug", skip_all, fields(content_len = content.len()))]
    fn extract(&self, content: &str) -> Vec<MediaDescriptor> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();

        for found in MEDIA_URL_PATTERN.find_iter(content) {
            let url = normalize_found_url(found.as_str());
            trace!(url = %url, "found media URL");
            let key = variant_key(&url);
            let variants = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            if !variants.contains(&url) {
                variants.push(url);
            }
        }

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .filter_map(|mut variants| {
                // Stable: equal resolutions keep document order.
                variants.sort_by_key(|u| std::cmp::Reverse(resolution_hint(u).unwrap_or(0)));
                let mut urls = variants.into_iter();
                let original_url = urls.next()?;
                let media_type = media_type_for(&original_url);
                Some(MediaDescriptor {
                    candidate_urls: urls.collect(),
                    media_type,
                    byte_size_hint: None,
                    content_type_hint: None,
                    original_url,
                })
            })
            .collect()
    }
}

/// Trims the trailing delimiter the pattern consumes, decodes `&amp;`, and gives
/// protocol-relative URLs a scheme.
fn normalize_found_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(|c: char| {
        c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\'' | '(' | ')' | '[' | ']' | ',')
    });
    let decoded = trimmed.replace("&amp;", "&");
    if decoded.starts_with("//") {
        format!("https:{decoded}")
    } else {
        decoded
    }
}

/// Media type implied by a URL's file extension.
#[must_use]
pub fn media_type_for(url: &str) -> MediaType {
    let ext = filename_of(url)
        .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
        .unwrap_or_default();
    match ext.as_str() {
        "gif" => MediaType::Gif,
        "mp4" | "webm" | "mov" | "m4v" => MediaType::Video,
        _ => MediaType::Image,
    }
}
