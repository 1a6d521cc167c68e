//! Manifest data model: posts, media items and their terminal outcomes.
//!
//! Field names serialize in camelCase so the manifest file reads the same as
//! every earlier archive produced for the same source.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::ManifestError;

/// SHA-256 content checksum: exactly 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    /// Finishes an incremental hash.
    #[must_use]
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Hashes an in-memory buffer.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Checksum {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value))
        } else {
            Err(ManifestError::InvalidChecksum(value))
        }
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl FromStr for Checksum {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of media asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Still image.
    Image,
    /// Animated GIF.
    Gif,
    /// Video file.
    Video,
}

impl MediaType {
    /// Returns the manifest string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Gif => "gif",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "gif" => Ok(Self::Gif),
            "video" => Ok(Self::Video),
            _ => Err(format!("invalid media type: {s}")),
        }
    }
}

/// Where the stored bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievedFrom {
    /// The source itself.
    Primary,
    /// A historical web-archive capture.
    Archive,
}

impl RetrievedFrom {
    /// Returns the manifest string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Archive => "archive",
        }
    }
}

impl fmt::Display for RetrievedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal status of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Stored from the primary source.
    Downloaded,
    /// Stored from an archive capture.
    Archived,
    /// Gone from the source and absent from the archive.
    Missing,
    /// Failed for any other reason.
    Error,
}

impl Status {
    /// Returns the manifest string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Archived => "archived",
            Self::Missing => "missing",
            Self::Error => "error",
        }
    }

    /// Whether the item's bytes are stored locally.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Archived)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloaded" => Ok(Self::Downloaded),
            "archived" => Ok(Self::Archived),
            "missing" => Ok(Self::Missing),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid media status: {s}")),
        }
    }
}

/// Identity of one media asset, independent of how its download ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    /// Owning post.
    pub post_id: String,
    /// Owning post's URL (also the page used for archive fallback).
    pub post_url: String,
    /// Owning post's timestamp as reported by the source.
    pub timestamp: String,
    /// Declared media type.
    pub media_type: MediaType,
    /// Preferred URL; also the manifest key for this item.
    pub original_url: String,
    /// Alternative URLs for the same asset, best first.
    pub candidate_urls: Vec<String>,
}

/// One archivable asset and its terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    /// Owning post.
    pub post_id: String,
    /// Owning post's URL.
    pub post_url: String,
    /// Owning post's timestamp.
    pub timestamp: String,
    /// Declared media type.
    pub media_type: MediaType,
    /// Stored file path, relative to the media directory.
    pub filename: String,
    /// Stored size in bytes, once downloaded.
    #[serde(default)]
    pub byte_size: Option<u64>,
    /// Content checksum, once downloaded.
    #[serde(default)]
    pub checksum: Option<Checksum>,
    /// Preferred URL and manifest key.
    pub original_url: String,
    /// Alternative URLs.
    #[serde(default)]
    pub candidate_urls: Vec<String>,
    /// Where the stored bytes came from.
    pub retrieved_from: RetrievedFrom,
    /// Replay URL of the archive capture, iff `retrieved_from` is archive.
    #[serde(default)]
    pub archive_snapshot_url: Option<String>,
    /// Terminal status.
    pub status: Status,
    /// Free-form detail (error message, verification warnings).
    #[serde(default)]
    pub notes: Option<String>,
}

impl MediaItem {
    fn from_source(source: MediaSource, filename: String, status: Status) -> Self {
        Self {
            post_id: source.post_id,
            post_url: source.post_url,
            timestamp: source.timestamp,
            media_type: source.media_type,
            filename,
            byte_size: None,
            checksum: None,
            original_url: source.original_url,
            candidate_urls: source.candidate_urls,
            retrieved_from: RetrievedFrom::Primary,
            archive_snapshot_url: None,
            status,
            notes: None,
        }
    }

    /// Item stored from the primary source.
    #[must_use]
    pub fn downloaded(
        source: MediaSource,
        filename: String,
        byte_size: u64,
        checksum: Checksum,
    ) -> Self {
        let mut item = Self::from_source(source, filename, Status::Downloaded);
        item.byte_size = Some(byte_size);
        item.checksum = Some(checksum);
        item
    }

    /// Item stored from an archive capture.
    #[must_use]
    pub fn archived(
        source: MediaSource,
        filename: String,
        byte_size: u64,
        checksum: Checksum,
        snapshot_url: String,
    ) -> Self {
        let mut item = Self::from_source(source, filename, Status::Archived);
        item.byte_size = Some(byte_size);
        item.checksum = Some(checksum);
        item.retrieved_from = RetrievedFrom::Archive;
        item.archive_snapshot_url = Some(snapshot_url);
        item
    }

    /// Item absent from both the source and the archive.
    #[must_use]
    pub fn missing(source: MediaSource, filename: String, notes: impl Into<String>) -> Self {
        let mut item = Self::from_source(source, filename, Status::Missing);
        item.notes = Some(notes.into());
        item
    }

    /// Item that failed for any other reason.
    #[must_use]
    pub fn failed(source: MediaSource, filename: String, notes: impl Into<String>) -> Self {
        let mut item = Self::from_source(source, filename, Status::Error);
        item.notes = Some(notes.into());
        item
    }

    /// Attaches a note, appending to any existing one.
    #[must_use]
    pub fn with_note(mut self, note: impl AsRef<str>) -> Self {
        let note = note.as_ref();
        self.notes = Some(match self.notes.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note.to_string(),
        });
        self
    }

    /// The identity this item was produced from.
    #[must_use]
    pub fn source(&self) -> MediaSource {
        MediaSource {
            post_id: self.post_id.clone(),
            post_url: self.post_url.clone(),
            timestamp: self.timestamp.clone(),
            media_type: self.media_type,
            original_url: self.original_url.clone(),
            candidate_urls: self.candidate_urls.clone(),
        }
    }

    /// Checks the status/field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invariant`] naming the first violated rule.
    pub fn check_invariants(&self) -> Result<(), ManifestError> {
        let violation = match self.status {
            Status::Downloaded | Status::Archived
                if self.checksum.is_none() || self.byte_size.is_none() =>
            {
                Some("stored item without checksum or size")
            }
            Status::Missing | Status::Error if self.checksum.is_some() => {
                Some("unstored item with a checksum")
            }
            _ => None,
        };
        let violation = violation.or_else(|| {
            let is_archive = self.retrieved_from == RetrievedFrom::Archive;
            (is_archive != self.archive_snapshot_url.is_some())
                .then_some("archiveSnapshotUrl must be set iff retrievedFrom is archive")
        });

        match violation {
            Some(reason) => Err(ManifestError::invariant(&self.original_url, reason)),
            None => Ok(()),
        }
    }
}

/// One post from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Unique post identifier.
    pub post_id: String,
    /// Post permalink.
    pub post_url: String,
    /// Timestamp as reported by the source.
    pub timestamp: String,
    /// Whether this post re-shares another post.
    #[serde(default)]
    pub is_reblog: bool,
    /// Media items at a terminal status.
    #[serde(default)]
    pub media_items: Vec<MediaItem>,
}

impl Post {
    /// Creates a post with no media yet.
    #[must_use]
    pub fn new(
        post_id: impl Into<String>,
        post_url: impl Into<String>,
        timestamp: impl Into<String>,
        is_reblog: bool,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            post_url: post_url.into(),
            timestamp: timestamp.into(),
            is_reblog,
            media_items: Vec::new(),
        }
    }
}

/// Persisted record of everything attempted for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Human-readable source identifier.
    pub source_name: String,
    /// Source base URL.
    pub source_url: String,
    /// When this manifest was first created.
    pub created_at: DateTime<Utc>,
    /// When this manifest was last mutated.
    pub last_updated: DateTime<Utc>,
    /// Derived post count.
    #[serde(default)]
    pub total_posts: u64,
    /// Derived media count.
    #[serde(default)]
    pub total_media: u64,
    /// Posts, unique by `post_id`.
    #[serde(default)]
    pub posts: Vec<Post>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(source_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source_name: source_name.into(),
            source_url: source_url.into(),
            created_at: now,
            last_updated: now,
            total_posts: 0,
            total_media: 0,
            posts: Vec::new(),
        }
    }

    /// Recomputes the derived totals.
    pub fn recompute_totals(&mut self) {
        self.total_posts = self.posts.len() as u64;
        self.total_media = self.posts.iter().map(|p| p.media_items.len() as u64).sum();
    }

    /// Iterates every media item across all posts.
    pub fn media_items(&self) -> impl Iterator<Item = &MediaItem> {
        self.posts.iter().flat_map(|p| p.media_items.iter())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn source() -> MediaSource {
        MediaSource {
            post_id: "101".to_string(),
            post_url: "https://blog.example.com/post/101".to_string(),
            timestamp: "2015-03-01T12:00:00Z".to_string(),
            media_type: MediaType::Image,
            original_url: "https://media.example.com/abc_1280.jpg".to_string(),
            candidate_urls: vec!["https://media.example.com/abc_500.jpg".to_string()],
        }
    }

    #[test]
    fn test_checksum_validation() {
        let good = "a".repeat(64);
        assert!(Checksum::try_from(good).is_ok());
        assert!(Checksum::try_from("A".repeat(64)).is_err());
        assert!(Checksum::try_from("a".repeat(63)).is_err());
        assert!(Checksum::try_from("g".repeat(64)).is_err());
    }

    #[test]
    fn test_checksum_of_known_bytes() {
        assert_eq!(
            Checksum::of_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksum_deserialize_rejects_uppercase() {
        let json = format!("\"{}\"", "F".repeat(64));
        assert!(serde_json::from_str::<Checksum>(&json).is_err());
    }

    #[test]
    fn test_enum_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Archived).unwrap(), "\"archived\"");
        assert_eq!(serde_json::to_string(&MediaType::Gif).unwrap(), "\"gif\"");
        assert_eq!(
            serde_json::to_string(&RetrievedFrom::Primary).unwrap(),
            "\"primary\""
        );
        assert_eq!("video".parse::<MediaType>().unwrap(), MediaType::Video);
        assert!("pending".parse::<Status>().is_err());
    }

    #[test]
    fn test_terminal_constructors_satisfy_invariants() {
        let checksum = Checksum::of_bytes(b"x");
        let items = [
            MediaItem::downloaded(source(), "101_abc.jpg".into(), 1, checksum.clone()),
            MediaItem::archived(
                source(),
                "101_abc.jpg".into(),
                1,
                checksum,
                "https://web.archive.org/web/20240101120000id_/x".into(),
            ),
            MediaItem::missing(source(), "101_abc.jpg".into(), "no captures"),
            MediaItem::failed(source(), "101_abc.jpg".into(), "HTTP 403"),
        ];
        for item in &items {
            item.check_invariants().unwrap();
        }
        assert!(items[0].status.is_satisfied());
        assert!(!items[2].status.is_satisfied());
    }

    #[test]
    fn test_invariant_violations_detected() {
        let mut item = MediaItem::missing(source(), "f".into(), "gone");
        item.checksum = Some(Checksum::of_bytes(b"x"));
        assert!(item.check_invariants().is_err());

        let mut item = MediaItem::downloaded(source(), "f".into(), 1, Checksum::of_bytes(b"x"));
        item.retrieved_from = RetrievedFrom::Archive;
        assert!(item.check_invariants().is_err());
    }

    #[test]
    fn test_media_item_json_field_names() {
        let item = MediaItem::downloaded(source(), "101_abc.jpg".into(), 3, Checksum::of_bytes(b"abc"));
        let value = serde_json::to_value(&item).unwrap();
        for key in [
            "postId",
            "postUrl",
            "mediaType",
            "byteSize",
            "originalUrl",
            "candidateUrls",
            "retrievedFrom",
            "archiveSnapshotUrl",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["status"], "downloaded");
    }

    #[test]
    fn test_with_note_appends() {
        let item = MediaItem::failed(source(), "f".into(), "first").with_note("second");
        assert_eq!(item.notes.as_deref(), Some("first; second"));
    }

    #[test]
    fn test_recompute_totals() {
        let mut manifest = Manifest::new("blog", "https://blog.example.com");
        let mut post = Post::new("101", "u", "t", false);
        post.media_items
            .push(MediaItem::missing(source(), "f".into(), "gone"));
        manifest.posts.push(post);
        manifest.posts.push(Post::new("102", "u2", "t2", true));
        manifest.recompute_totals();
        assert_eq!(manifest.total_posts, 2);
        assert_eq!(manifest.total_media, 1);
    }
}
