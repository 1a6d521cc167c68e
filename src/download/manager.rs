//! Resolves one media task to a stored file and a terminal manifest entry.
//!
//! Resolution order:
//! 1. With resume on, an item already stored whose file still hashes to the
//!    recorded checksum is `Skipped` without touching the network.
//! 2. Each candidate URL is streamed to a temporary file while its SHA-256 is
//!    computed. The temp file is removed on every failure path, including
//!    cancellation.
//! 3. If every candidate answered 404/410, the archive fallback is consulted:
//!    a capture gives `Archived`, no capture gives `Missing`.
//! 4. Before the temp file is moved into place its checksum is claimed in the
//!    dedup index; a checksum that is already stored keeps the existing file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::filename::{candidate_name, content_type_matches, media_filename};
use crate::archive::{ArchiveClient, Snapshot};
use crate::dedup::{Claim, DedupIndex};
use crate::fetch::{FetchClient, FetchOptions};
use crate::manifest::{Checksum, ManifestStore, MediaItem, MediaSource, Status};
use crate::source::{MediaDescriptor, MediaExtractor, RawPost};

/// Read buffer for re-hashing stored files.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// One unit of work for the pool: a media asset of one post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Asset identity.
    pub source: MediaSource,
    /// Expected size, if declared.
    pub byte_size_hint: Option<u64>,
    /// Expected content type, if declared.
    pub content_type_hint: Option<String>,
}

impl DownloadTask {
    /// Builds a task from a listed post and one of its extracted descriptors.
    #[must_use]
    pub fn new(post: &RawPost, descriptor: MediaDescriptor) -> Self {
        Self {
            source: MediaSource {
                post_id: post.post_id.clone(),
                post_url: post.post_url.clone(),
                timestamp: post.timestamp.clone(),
                media_type: descriptor.media_type,
                original_url: descriptor.original_url,
                candidate_urls: descriptor.candidate_urls,
            },
            byte_size_hint: descriptor.byte_size_hint,
            content_type_hint: descriptor.content_type_hint,
        }
    }

    /// Manifest key.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.source.original_url
    }

    fn default_filename(&self) -> String {
        media_filename(
            &self.source.post_id,
            &self.source.original_url,
            self.source.media_type,
            self.content_type_hint.as_deref(),
        )
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stored from the primary source.
    Downloaded,
    /// Stored from an archive capture.
    Archived,
    /// Already stored and verified; nothing fetched.
    Skipped,
    /// Gone from the source and never captured.
    Missing,
    /// Any other failure.
    Failed,
}

/// Result of [`DownloadManager::resolve`].
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// How the task ended.
    pub outcome: Outcome,
    /// Manifest entry to record.
    pub item: MediaItem,
    /// Bytes received from the network for this task.
    pub bytes_fetched: u64,
    /// Whether the bytes matched an already-stored file.
    pub deduplicated: bool,
    /// The capture used, for archived items.
    pub snapshot: Option<Snapshot>,
}

impl DownloadResult {
    fn without_transfer(outcome: Outcome, item: MediaItem) -> Self {
        Self {
            outcome,
            item,
            bytes_fetched: 0,
            deduplicated: false,
            snapshot: None,
        }
    }
}

/// Download manager knobs.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Directory media files are stored in.
    pub media_dir: PathBuf,
    /// Whether already-stored items may be skipped.
    pub resume: bool,
    /// Whether to consult the archive when the source says "not found".
    pub archive_fallback: bool,
    /// Whether size and content-type mismatches fail the item.
    pub strict_verification: bool,
}

/// A file written into the media directory.
#[derive(Debug)]
struct Stored {
    filename: String,
    byte_size: u64,
    checksum: Checksum,
    deduplicated: bool,
    notes: Vec<String>,
}

/// Deletes a temporary download unless it was moved into place.
#[derive(Debug)]
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove partial download");
                }
            }
        }
    }
}

/// Holds a final path in the media directory until the file is moved there.
///
/// Every rename into the media directory happens under a reservation, so a
/// name seen free while reserved stays free until released.
struct NameReservation<'a> {
    names: &'a DashMap<PathBuf, ()>,
    path: PathBuf,
}

impl<'a> NameReservation<'a> {
    fn try_acquire(names: &'a DashMap<PathBuf, ()>, path: PathBuf) -> Option<Self> {
        match names.entry(path.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self { names, path })
            }
        }
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names.remove(&self.path);
    }
}

/// Turns download tasks into stored files and manifest entries.
pub struct DownloadManager {
    fetch: FetchClient,
    archive: Option<ArchiveClient>,
    dedup: Arc<DedupIndex>,
    manifest: Arc<ManifestStore>,
    extractor: Arc<dyn MediaExtractor>,
    settings: DownloadSettings,
    /// Final paths some in-flight store is about to write.
    reserved: DashMap<PathBuf, ()>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("settings", &self.settings)
            .field("archive", &self.archive.is_some())
            .field("dedup_entries", &self.dedup.len())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager. `archive` is only used when fallback is enabled.
    #[must_use]
    pub fn new(
        fetch: FetchClient,
        archive: Option<ArchiveClient>,
        dedup: Arc<DedupIndex>,
        manifest: Arc<ManifestStore>,
        extractor: Arc<dyn MediaExtractor>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            fetch,
            archive,
            dedup,
            manifest,
            extractor,
            settings,
            reserved: DashMap::new(),
        }
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// Resolves one task. Never fails: errors become a `Failed` result carrying an
    /// `error` manifest entry.
    #[instrument(skip(self, task), fields(post_id = %task.source.post_id, url = %task.url()))]
    pub async fn resolve(&self, task: &DownloadTask) -> DownloadResult {
        if self.settings.resume {
            if let Some(result) = self.verify_existing(task).await {
                return result;
            }
        }

        match self.fetch_primary(task).await {
            Ok((stored, bytes_fetched)) => {
                info!(filename = %stored.filename, bytes = stored.byte_size, deduplicated = stored.deduplicated, "downloaded");
                let deduplicated = stored.deduplicated;
                let item = with_notes(
                    MediaItem::downloaded(
                        task.source.clone(),
                        stored.filename,
                        stored.byte_size,
                        stored.checksum,
                    ),
                    &stored.notes,
                );
                DownloadResult {
                    outcome: Outcome::Downloaded,
                    item,
                    bytes_fetched,
                    deduplicated,
                    snapshot: None,
                }
            }
            Err(e) if e.is_not_found() => self.fallback(task, &e).await,
            Err(e) => {
                warn!(error = %e, "download failed");
                DownloadResult::without_transfer(
                    Outcome::Failed,
                    MediaItem::failed(task.source.clone(), task.default_filename(), e.to_string()),
                )
            }
        }
    }

    /// Step 1: an already-stored item whose file still matches is skipped.
    async fn verify_existing(&self, task: &DownloadTask) -> Option<DownloadResult> {
        let existing = self
            .manifest
            .get_media(&task.source.post_id, task.url())
            .filter(|m| m.status.is_satisfied())
            .or_else(|| self.manifest.find_satisfied(task.url()))?;
        let expected = existing.checksum.clone()?;
        let path = self.settings.media_dir.join(&existing.filename);

        match file_checksum(&path).await {
            Ok((actual, _)) if actual == expected => {
                debug!(filename = %existing.filename, "stored file verified, skipping");
                let mut item = existing;
                item.post_id.clone_from(&task.source.post_id);
                item.post_url.clone_from(&task.source.post_url);
                item.timestamp.clone_from(&task.source.timestamp);
                Some(DownloadResult::without_transfer(Outcome::Skipped, item))
            }
            Ok(_) => {
                warn!(path = %path.display(), "stored file checksum changed, re-downloading");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stored file unreadable, re-downloading");
                None
            }
        }
    }

    /// Step 2: tries every candidate URL in order.
    ///
    /// Returns a not-found error only if every candidate was not found.
    async fn fetch_primary(&self, task: &DownloadTask) -> Result<(Stored, u64), DownloadError> {
        let mut other_error: Option<DownloadError> = None;
        let mut not_found: Option<DownloadError> = None;

        let urls: Vec<String> = std::iter::once(task.source.original_url.clone())
            .chain(task.source.candidate_urls.iter().cloned())
            .collect();

        for url in &urls {
            let attempt = match self.fetch.fetch(url, &FetchOptions::default()).await {
                Ok(response) => self.store(task, url, response).await,
                Err(e) => Err(DownloadError::from(e)),
            };
            match attempt {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_not_found() => {
                    debug!(candidate = %url, "candidate not found");
                    not_found = Some(e);
                }
                Err(e) => {
                    debug!(candidate = %url, error = %e, "candidate failed");
                    if other_error.is_none() {
                        other_error = Some(e);
                    }
                }
            }
        }

        match (other_error, not_found) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Err(DownloadError::from(crate::fetch::FetchError::invalid_url(
                task.url(),
            ))),
        }
    }

    /// Step 3: the source no longer has the asset.
    async fn fallback(&self, task: &DownloadTask, primary: &DownloadError) -> DownloadResult {
        let filename = task.default_filename();
        let archive = match &self.archive {
            Some(archive) if self.settings.archive_fallback => archive,
            _ => {
                return DownloadResult::without_transfer(
                    Outcome::Missing,
                    MediaItem::missing(
                        task.source.clone(),
                        filename,
                        format!("{primary}; archive fallback disabled"),
                    ),
                );
            }
        };

        let lookup = archive
            .find_best_for_item(task.url(), &task.source.post_url, self.extractor.as_ref())
            .await;
        let snapshot = match lookup {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("not found at source and no archive capture");
                return DownloadResult::without_transfer(
                    Outcome::Missing,
                    MediaItem::missing(
                        task.source.clone(),
                        filename,
                        format!("{primary}; no archive capture"),
                    ),
                );
            }
            Err(e) => {
                warn!(error = %e, "archive lookup failed");
                return DownloadResult::without_transfer(
                    Outcome::Failed,
                    MediaItem::failed(task.source.clone(), filename, e.to_string()),
                );
            }
        };

        let stored = match archive.download(&snapshot).await {
            Ok(response) => self.store(task, &snapshot.replay_url, response).await,
            Err(e) => Err(DownloadError::from(e)),
        };

        match stored {
            Ok((stored, bytes_fetched)) => {
                info!(timestamp = %snapshot.timestamp, filename = %stored.filename, "recovered from archive");
                let deduplicated = stored.deduplicated;
                let item = with_notes(
                    MediaItem::archived(
                        task.source.clone(),
                        stored.filename,
                        stored.byte_size,
                        stored.checksum,
                        snapshot.replay_url.clone(),
                    ),
                    &stored.notes,
                );
                DownloadResult {
                    outcome: Outcome::Archived,
                    item,
                    bytes_fetched,
                    deduplicated,
                    snapshot: Some(snapshot),
                }
            }
            Err(e) if e.is_not_found() => DownloadResult::without_transfer(
                Outcome::Missing,
                MediaItem::missing(
                    task.source.clone(),
                    filename,
                    format!("archive capture {} unavailable: {e}", snapshot.timestamp),
                ),
            ),
            Err(e) => {
                warn!(error = %e, "archive download failed");
                DownloadResult::without_transfer(
                    Outcome::Failed,
                    MediaItem::failed(task.source.clone(), filename, e.to_string()),
                )
            }
        }
    }

    /// Streams `response` into the media directory, verifying and deduplicating it.
    ///
    /// Returns the stored file and the number of bytes received.
    async fn store(
        &self,
        task: &DownloadTask,
        url: &str,
        response: Response,
    ) -> Result<(Stored, u64), DownloadError> {
        let media_dir = &self.settings.media_dir;
        let mut notes = Vec::new();

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expected_size = task.byte_size_hint.or_else(|| response.content_length());

        if let Some(content_type) = &content_type {
            if !content_type_matches(task.source.media_type, content_type) {
                if self.settings.strict_verification {
                    return Err(DownloadError::ContentType {
                        url: url.to_string(),
                        media_type: task.source.media_type,
                        content_type: content_type.clone(),
                    });
                }
                warn!(%content_type, media_type = %task.source.media_type, "content type mismatch");
                notes.push(format!("unexpected content type {content_type}"));
            }
        }

        let filename = media_filename(
            &task.source.post_id,
            &task.source.original_url,
            task.source.media_type,
            content_type.as_deref().or(task.content_type_hint.as_deref()),
        );

        tokio::fs::create_dir_all(media_dir)
            .await
            .map_err(|e| DownloadError::io(media_dir, e))?;

        let temp_path = media_dir.join(format!("{filename}.part-{:08x}", rand::random::<u32>()));
        let mut guard = TempFileGuard::new(temp_path.clone());
        let (checksum, byte_size) = stream_to_file(response, url, &temp_path).await?;

        if let Some(expected) = expected_size {
            if expected != byte_size {
                if self.settings.strict_verification {
                    return Err(DownloadError::integrity(url, expected, byte_size));
                }
                warn!(expected, actual = byte_size, "size mismatch");
                notes.push(format!("expected {expected} bytes, got {byte_size}"));
            }
        }

        let target = self.reserve_target(task, &filename).await;
        let target_name = target
            .path
            .strip_prefix(media_dir)
            .map_or_else(|_| PathBuf::from(&filename), Path::to_path_buf);

        match self.dedup.claim(checksum.clone(), target_name.clone()) {
            Claim::Existing(existing) if existing == target_name => {
                // Re-download of this item's own file: replace it in place.
                move_into_place(&temp_path, &target.path).await?;
                guard.disarm();
                Ok((
                    Stored {
                        filename: target_name.to_string_lossy().into_owned(),
                        byte_size,
                        checksum,
                        deduplicated: false,
                        notes,
                    },
                    byte_size,
                ))
            }
            Claim::Existing(existing) => {
                let existing_path = media_dir.join(&existing);
                if tokio::fs::try_exists(&existing_path).await.unwrap_or(false) {
                    debug!(existing = %existing.display(), "identical content already stored");
                    drop(guard);
                    return Ok((
                        Stored {
                            filename: existing.to_string_lossy().into_owned(),
                            byte_size,
                            checksum,
                            deduplicated: true,
                            notes,
                        },
                        byte_size,
                    ));
                }

                // The claimed file vanished. Restore it unless another store owns the name now.
                let mut restored = false;
                if let Some(slot) = NameReservation::try_acquire(&self.reserved, existing_path) {
                    if !tokio::fs::try_exists(&slot.path).await.unwrap_or(true) {
                        warn!(existing = %existing.display(), "deduplicated file vanished, restoring it");
                        move_into_place(&temp_path, &slot.path).await?;
                        restored = true;
                    }
                }
                let filename = if restored {
                    existing
                } else {
                    warn!(existing = %existing.display(), "deduplicated path taken, storing a separate copy");
                    move_into_place(&temp_path, &target.path).await?;
                    target_name
                };
                guard.disarm();
                Ok((
                    Stored {
                        filename: filename.to_string_lossy().into_owned(),
                        byte_size,
                        checksum,
                        deduplicated: false,
                        notes,
                    },
                    byte_size,
                ))
            }
            Claim::New => {
                move_into_place(&temp_path, &target.path).await?;
                guard.disarm();
                self.dedup.persist_best_effort().await;
                Ok((
                    Stored {
                        filename: target_name.to_string_lossy().into_owned(),
                        byte_size,
                        checksum,
                        deduplicated: false,
                        notes,
                    },
                    byte_size,
                ))
            }
        }
    }

    /// Reserves the final path for new content.
    ///
    /// The planned name is kept when it is free or already holds this item's own
    /// file. A name held by an unrelated file, or reserved by another in-flight
    /// store, pushes the content to a numbered variant.
    async fn reserve_target(&self, task: &DownloadTask, filename: &str) -> NameReservation<'_> {
        let media_dir = &self.settings.media_dir;
        let ours = self
            .manifest
            .get_media(&task.source.post_id, task.url())
            .is_some_and(|m| m.filename == filename);

        let mut attempt = 0u32;
        loop {
            let name = candidate_name(filename, attempt);
            attempt = attempt.saturating_add(1);
            let Some(slot) = NameReservation::try_acquire(&self.reserved, media_dir.join(&name))
            else {
                continue;
            };
            if ours && name == filename {
                return slot;
            }
            if !tokio::fs::try_exists(&slot.path).await.unwrap_or(false) {
                return slot;
            }
        }
    }
}

fn with_notes(item: MediaItem, notes: &[String]) -> MediaItem {
    if notes.is_empty() {
        item
    } else {
        item.with_note(notes.join("; "))
    }
}

/// Streams a response body to `path`, hashing as it goes. Never buffers the whole body.
async fn stream_to_file(
    response: Response,
    url: &str,
    path: &Path,
) -> Result<(Checksum, u64), DownloadError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::stream(url, e))?;
        hasher.update(&chunk);
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| DownloadError::io(path, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(path, e))?;

    Ok((Checksum::from_hasher(hasher), bytes_written))
}

async fn move_into_place(temp: &Path, target: &Path) -> Result<(), DownloadError> {
    tokio::fs::rename(temp, target)
        .await
        .map_err(|e| DownloadError::io(target, e))
}

/// SHA-256 and size of a stored file, read in chunks.
///
/// # Errors
///
/// Any IO error opening or reading the file.
pub async fn file_checksum(path: &Path) -> std::io::Result<(Checksum, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((Checksum::from_hasher(hasher), total))
}

/// Terminal manifest status for an outcome. `Skipped` keeps the stored item's status.
#[must_use]
pub fn status_for(outcome: Outcome, item: &MediaItem) -> Status {
    match outcome {
        Outcome::Downloaded => Status::Downloaded,
        Outcome::Archived => Status::Archived,
        Outcome::Missing => Status::Missing,
        Outcome::Failed => Status::Error,
        Outcome::Skipped => item.status,
    }
}
