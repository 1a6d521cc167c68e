//! Checksum-to-path deduplication index.
//!
//! Identical bytes are stored once. The first download of a checksum claims it;
//! every later download with the same checksum is pointed at the claimed path and
//! its own copy is discarded.
//!
//! The index lives in memory for the whole run and can be mirrored to a JSON side
//! file (`.dedup.json` in the output directory, next to the manifest) so it
//! survives across runs. It is also seeded from the manifest on startup, which
//! makes the side file a cache rather than a source of truth.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::manifest::{Checksum, Manifest};

/// Side file name inside the output directory.
pub const DEDUP_FILE_NAME: &str = ".dedup.json";

/// Errors persisting the dedup side file.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Reading or writing the side file failed.
    #[error("dedup index IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The index could not be serialized.
    #[error("failed to serialize dedup index: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl DedupError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result of trying to claim a checksum for a newly written file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The checksum was new and now maps to the offered path.
    New,
    /// The checksum already maps to this path.
    Existing(PathBuf),
}

/// Concurrent checksum → stored path map.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: DashMap<Checksum, PathBuf>,
    side_file: Option<PathBuf>,
    /// Serialises side-file rewrites.
    persist_lock: tokio::sync::Mutex<()>,
}

impl DedupIndex {
    /// Creates an empty in-memory index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an index mirrored to `side_file`, loading any existing entries.
    ///
    /// A missing side file starts empty. An unreadable or corrupt one is logged and
    /// ignored; the manifest seeds the same information.
    #[instrument(skip_all, fields(path = %side_file.as_ref().display()))]
    pub async fn open(side_file: impl AsRef<Path>) -> Self {
        let side_file = side_file.as_ref().to_path_buf();
        let index = Self {
            side_file: Some(side_file.clone()),
            ..Self::default()
        };

        match tokio::fs::read(&side_file).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<Checksum, PathBuf>>(&bytes) {
                Ok(stored) => {
                    debug!(entries = stored.len(), "loaded dedup side file");
                    for (checksum, path) in stored {
                        index.entries.insert(checksum, path);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring corrupt dedup side file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not read dedup side file"),
        }
        index
    }

    /// Adds every stored item in `manifest` without overriding existing entries.
    pub fn seed_from_manifest(&self, manifest: &Manifest) {
        let mut seeded = 0usize;
        for item in manifest.media_items().filter(|m| m.status.is_satisfied()) {
            if let Some(checksum) = &item.checksum {
                self.entries
                    .entry(checksum.clone())
                    .or_insert_with(|| {
                        seeded += 1;
                        PathBuf::from(&item.filename)
                    });
            }
        }
        debug!(seeded, total = self.entries.len(), "seeded dedup index from manifest");
    }

    /// Whether this checksum is already stored.
    #[must_use]
    pub fn is_duplicate(&self, checksum: &Checksum) -> bool {
        self.entries.contains_key(checksum)
    }

    /// Stored path for this checksum.
    #[must_use]
    pub fn path_for(&self, checksum: &Checksum) -> Option<PathBuf> {
        self.entries.get(checksum).map(|p| p.value().clone())
    }

    /// Records `checksum → path` if the checksum is not already present.
    pub async fn record(&self, checksum: Checksum, path: PathBuf) {
        if matches!(self.claim(checksum, path), Claim::New) {
            self.persist_best_effort().await;
        }
    }

    /// Atomically claims `checksum` for `path`, or reports the path that already owns it.
    ///
    /// Two workers finishing identical downloads at the same moment see exactly one
    /// `Claim::New`. The caller persists with [`persist`](Self::persist) afterwards.
    pub fn claim(&self, checksum: Checksum, path: PathBuf) -> Claim {
        match self.entries.entry(checksum) {
            Entry::Occupied(existing) => Claim::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(path);
                Claim::New
            }
        }
    }

    /// Number of distinct checksums.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites the side file, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError`] if the snapshot cannot be serialized or written.
    pub async fn persist(&self) -> Result<(), DedupError> {
        let Some(side_file) = &self.side_file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;

        let snapshot: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|e| (e.key().to_string(), e.value().to_string_lossy().into_owned()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(DedupError::Serialize)?;

        if let Some(parent) = side_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DedupError::io(parent, e))?;
        }
        let temp = crate::manifest::temp_path(side_file);
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| DedupError::io(&temp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| DedupError::io(&temp, e))?;
        file.sync_all().await.map_err(|e| DedupError::io(&temp, e))?;
        drop(file);
        tokio::fs::rename(&temp, side_file)
            .await
            .map_err(|e| DedupError::io(side_file, e))?;
        Ok(())
    }

    /// Persists, logging instead of failing. A stale side file only costs a re-seed.
    pub async fn persist_best_effort(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to update dedup side file");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::manifest::{MediaItem, MediaSource, MediaType, Post};

    fn sum(s: &str) -> Checksum {
        Checksum::of_bytes(s.as_bytes())
    }

    #[test]
    fn test_claim_first_wins() {
        let index = DedupIndex::new();
        assert_eq!(index.claim(sum("a"), PathBuf::from("1_a.jpg")), Claim::New);
        assert_eq!(
            index.claim(sum("a"), PathBuf::from("2_a.jpg")),
            Claim::Existing(PathBuf::from("1_a.jpg"))
        );
        assert!(index.is_duplicate(&sum("a")));
        assert!(!index.is_duplicate(&sum("b")));
        assert_eq!(index.path_for(&sum("a")), Some(PathBuf::from("1_a.jpg")));
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_new() {
        let index = Arc::new(DedupIndex::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let index = Arc::clone(&index);
            handles.push(tokio::spawn(async move {
                index.claim(sum("same"), PathBuf::from(format!("{i}.jpg")))
            }));
        }
        let mut new_claims = 0;
        for handle in handles {
            if handle.await.unwrap() == Claim::New {
                new_claims += 1;
            }
        }
        assert_eq!(new_claims, 1);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_side_file_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join(DEDUP_FILE_NAME);

        let index = DedupIndex::open(&side).await;
        index.record(sum("a"), PathBuf::from("1_a.jpg")).await;
        assert!(side.exists());

        let reopened = DedupIndex::open(&side).await;
        assert_eq!(reopened.path_for(&sum("a")), Some(PathBuf::from("1_a.jpg")));
    }

    #[tokio::test]
    async fn test_corrupt_side_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let side = dir.path().join(DEDUP_FILE_NAME);
        std::fs::write(&side, b"[1, 2").unwrap();
        assert!(DedupIndex::open(&side).await.is_empty());
    }

    #[test]
    fn test_seed_from_manifest_uses_stored_items_only() {
        let source = |url: &str| MediaSource {
            post_id: "1".into(),
            post_url: "u".into(),
            timestamp: "t".into(),
            media_type: MediaType::Image,
            original_url: url.into(),
            candidate_urls: Vec::new(),
        };
        let mut manifest = Manifest::new("blog", "u");
        let mut post = Post::new("1", "u", "t", false);
        post.media_items.push(MediaItem::downloaded(
            source("https://m/a.jpg"),
            "1_a.jpg".into(),
            1,
            sum("a"),
        ));
        post.media_items
            .push(MediaItem::missing(source("https://m/b.jpg"), "1_b.jpg".into(), "gone"));
        manifest.posts.push(post);

        let index = DedupIndex::new();
        index.seed_from_manifest(&manifest);
        assert_eq!(index.len(), 1);
        assert_eq!(index.path_for(&sum("a")), Some(PathBuf::from("1_a.jpg")));
    }
}
