//! Single-writer manifest store with atomic persistence.
//!
//! All mutation goes through [`ManifestStore`]. Each save writes a full snapshot
//! to `manifest.json.tmp`, syncs it, then renames it over `manifest.json`, so a
//! crash at any point leaves the previous file intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::error::ManifestError;
use super::model::{Manifest, MediaItem, Post, Status};

/// Manifest file name inside the output directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Default number of media updates between automatic saves.
pub const DEFAULT_AUTOSAVE_EVERY: usize = 25;

/// Aggregate counts over the whole manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestStats {
    /// Number of posts.
    pub posts: u64,
    /// Number of media items.
    pub media: u64,
    /// Items stored from the primary source.
    pub downloaded: u64,
    /// Items stored from the archive.
    pub archived: u64,
    /// Items absent everywhere.
    pub missing: u64,
    /// Items that failed.
    pub errors: u64,
    /// Sum of stored item sizes.
    pub bytes: u64,
}

#[derive(Debug)]
struct StoreState {
    manifest: Manifest,
    /// `post_id` -> index into `manifest.posts`.
    post_index: HashMap<String, usize>,
    /// `original_url` -> number of satisfied items with that URL.
    satisfied: HashMap<String, usize>,
}

impl StoreState {
    fn new(manifest: Manifest) -> Self {
        let mut state = Self {
            manifest,
            post_index: HashMap::new(),
            satisfied: HashMap::new(),
        };
        state.rebuild_indexes();
        state
    }

    fn rebuild_indexes(&mut self) {
        self.post_index.clear();
        self.satisfied.clear();
        for (index, post) in self.manifest.posts.iter().enumerate() {
            self.post_index.insert(post.post_id.clone(), index);
            for item in &post.media_items {
                if item.status.is_satisfied() {
                    *self.satisfied.entry(item.original_url.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    fn touch(&mut self) {
        self.manifest.recompute_totals();
        self.manifest.last_updated = Utc::now();
    }

    fn post_slot(&mut self, post_id: &str, make: impl FnOnce() -> Post) -> usize {
        if let Some(&index) = self.post_index.get(post_id) {
            return index;
        }
        let index = self.manifest.posts.len();
        self.manifest.posts.push(make());
        self.post_index.insert(post_id.to_string(), index);
        index
    }

    /// Inserts or replaces `item` inside post `index`, keeping the satisfied index in step.
    fn upsert_media(&mut self, index: usize, item: MediaItem) {
        let now_satisfied = item.status.is_satisfied();
        let url = item.original_url.clone();
        let items = &mut self.manifest.posts[index].media_items;

        let was_satisfied = match items.iter_mut().find(|m| m.original_url == url) {
            Some(existing) => {
                let was = existing.status.is_satisfied();
                *existing = item;
                was
            }
            None => {
                items.push(item);
                false
            }
        };

        match (was_satisfied, now_satisfied) {
            (false, true) => *self.satisfied.entry(url).or_insert(0) += 1,
            (true, false) => {
                if let Some(count) = self.satisfied.get_mut(&url) {
                    *count -= 1;
                    if *count == 0 {
                        self.satisfied.remove(&url);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Owner of one source's manifest.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    /// Serialises saves so an older snapshot never lands after a newer one.
    save_lock: tokio::sync::Mutex<()>,
    autosave_every: usize,
    updates_since_save: AtomicUsize,
}

impl ManifestStore {
    /// Loads the manifest at `path`, or starts a new one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if the file exists but cannot be read, is not a
    /// valid manifest, or contains an item whose status and fields disagree.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(
        path: impl AsRef<Path>,
        source_name: &str,
        source_url: &str,
    ) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();

        let temp = temp_path(&path);
        if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
            warn!(temp = %temp.display(), "discarding incomplete manifest write from a previous run");
            tokio::fs::remove_file(&temp)
                .await
                .map_err(|e| ManifestError::io(&temp, e))?;
        }

        let manifest = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut manifest: Manifest = serde_json::from_slice(&bytes)
                    .map_err(|e| ManifestError::parse(&path, e))?;
                for item in manifest.media_items() {
                    item.check_invariants()?;
                }
                if manifest.source_name != source_name {
                    warn!(
                        stored = %manifest.source_name,
                        requested = source_name,
                        "manifest belongs to a different source name"
                    );
                }
                manifest.recompute_totals();
                info!(
                    posts = manifest.total_posts,
                    media = manifest.total_media,
                    "loaded existing manifest"
                );
                manifest
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no manifest on disk, starting fresh");
                Manifest::new(source_name, source_url)
            }
            Err(e) => return Err(ManifestError::io(&path, e)),
        };

        Ok(Self {
            path,
            state: Mutex::new(StoreState::new(manifest)),
            save_lock: tokio::sync::Mutex::new(()),
            autosave_every: 0,
            updates_since_save: AtomicUsize::new(0),
        })
    }

    /// Saves automatically after every `every` media updates (0 disables).
    #[must_use]
    pub fn with_autosave(mut self, every: usize) -> Self {
        self.autosave_every = every;
        self
    }

    /// Path of the manifest file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically writes the current manifest to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] if serialization or any filesystem step fails.
    /// The previous manifest file is untouched on failure.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn save(&self) -> Result<(), ManifestError> {
        let _guard = self.save_lock.lock().await;

        let bytes = {
            let state = self.lock();
            serde_json::to_vec_pretty(&state.manifest).map_err(ManifestError::Serialize)?
        };
        self.updates_since_save.store(0, Ordering::SeqCst);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ManifestError::io(parent, e))?;
        }

        let temp = temp_path(&self.path);
        write_synced(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| ManifestError::io(&self.path, e))?;

        debug!(bytes = bytes.len(), "manifest saved");
        Ok(())
    }

    /// Records a post's metadata and any media it already carries.
    ///
    /// An existing post with the same id has its metadata refreshed and its media
    /// merged by `original_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::PostIdMismatch`] if a media item belongs to another
    /// post, or [`ManifestError::Invariant`] if an item is inconsistent. Nothing is
    /// changed on error.
    pub fn add_post(&self, post: Post) -> Result<(), ManifestError> {
        for item in &post.media_items {
            if item.post_id != post.post_id {
                return Err(ManifestError::PostIdMismatch {
                    post_id: post.post_id.clone(),
                    media_post_id: item.post_id.clone(),
                    url: item.original_url.clone(),
                });
            }
            item.check_invariants()?;
        }

        let mut state = self.lock();
        let Post {
            post_id,
            post_url,
            timestamp,
            is_reblog,
            media_items,
        } = post;

        let index = state.post_slot(&post_id, || {
            Post::new(post_id.clone(), post_url.clone(), timestamp.clone(), is_reblog)
        });
        {
            let existing = &mut state.manifest.posts[index];
            existing.post_url = post_url;
            existing.timestamp = timestamp;
            existing.is_reblog = is_reblog;
        }
        for item in media_items {
            state.upsert_media(index, item);
        }
        state.touch();
        Ok(())
    }

    /// Inserts or replaces one media item at a terminal status.
    ///
    /// Creates the owning post from the item's fields if it has not been added yet.
    /// Triggers an autosave when the configured number of updates is reached.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Invariant`] for an inconsistent item, or any save error.
    pub async fn update_media(&self, item: MediaItem) -> Result<(), ManifestError> {
        item.check_invariants()?;

        {
            let mut state = self.lock();
            let index = state.post_slot(&item.post_id, || {
                Post::new(
                    item.post_id.clone(),
                    item.post_url.clone(),
                    item.timestamp.clone(),
                    false,
                )
            });
            state.upsert_media(index, item);
            state.touch();
        }

        let updates = self.updates_since_save.fetch_add(1, Ordering::SeqCst) + 1;
        if self.autosave_every > 0 && updates >= self.autosave_every {
            debug!(updates, "autosaving manifest");
            self.save().await?;
        }
        Ok(())
    }

    /// Whether any item with this URL is stored locally. O(1).
    #[must_use]
    pub fn is_downloaded(&self, url: &str) -> bool {
        self.lock().satisfied.contains_key(url)
    }

    /// Looks up one post's media item by URL.
    #[must_use]
    pub fn get_media(&self, post_id: &str, url: &str) -> Option<MediaItem> {
        let state = self.lock();
        let index = *state.post_index.get(post_id)?;
        state.manifest.posts[index]
            .media_items
            .iter()
            .find(|m| m.original_url == url)
            .cloned()
    }

    /// Any stored item with this URL, regardless of post.
    #[must_use]
    pub fn find_satisfied(&self, url: &str) -> Option<MediaItem> {
        let state = self.lock();
        if !state.satisfied.contains_key(url) {
            return None;
        }
        state
            .manifest
            .media_items()
            .find(|m| m.original_url == url && m.status.is_satisfied())
            .cloned()
    }

    /// Aggregate counts over the whole manifest.
    #[must_use]
    pub fn stats(&self) -> ManifestStats {
        let state = self.lock();
        let manifest = &state.manifest;
        let mut stats = ManifestStats {
            posts: manifest.total_posts,
            media: manifest.total_media,
            ..ManifestStats::default()
        };
        for item in manifest.media_items() {
            match item.status {
                Status::Downloaded => stats.downloaded += 1,
                Status::Archived => stats.archived += 1,
                Status::Missing => stats.missing += 1,
                Status::Error => stats.errors += 1,
            }
            if item.status.is_satisfied() {
                stats.bytes += item.byte_size.unwrap_or(0);
            }
        }
        stats
    }

    /// Clone of the current in-memory manifest.
    #[must_use]
    pub fn snapshot(&self) -> Manifest {
        self.lock().manifest.clone()
    }
}

/// Sibling temporary path used while saving.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ManifestError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| ManifestError::io(path, e))?;
    file.flush().await.map_err(|e| ManifestError::io(path, e))?;
    file.sync_all().await.map_err(|e| ManifestError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::manifest::model::{Checksum, MediaSource, MediaType};

    fn source(post_id: &str, url: &str) -> MediaSource {
        MediaSource {
            post_id: post_id.to_string(),
            post_url: format!("https://blog.example.com/post/{post_id}"),
            timestamp: "2016-01-01T00:00:00Z".to_string(),
            media_type: MediaType::Image,
            original_url: url.to_string(),
            candidate_urls: Vec::new(),
        }
    }

    fn downloaded(post_id: &str, url: &str) -> MediaItem {
        MediaItem::downloaded(
            source(post_id, url),
            format!("{post_id}_a.jpg"),
            3,
            Checksum::of_bytes(url.as_bytes()),
        )
    }

    async fn store(dir: &TempDir) -> ManifestStore {
        ManifestStore::load(dir.path().join(MANIFEST_FILE_NAME), "blog", "https://blog.example.com")
            .await
            .unwrap()
    }

    #[test]
    fn test_temp_path_is_sibling() {
        assert_eq!(
            temp_path(Path::new("/out/manifest.json")),
            PathBuf::from("/out/manifest.json.tmp")
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert_eq!(store.stats(), ManifestStats::default());
        assert_eq!(store.snapshot().source_name, "blog");
    }

    #[tokio::test]
    async fn test_update_media_maintains_satisfied_index() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let url = "https://media.example.com/a.jpg";

        assert!(!store.is_downloaded(url));
        store.update_media(downloaded("1", url)).await.unwrap();
        assert!(store.is_downloaded(url));

        store
            .update_media(MediaItem::failed(source("1", url), "1_a.jpg".into(), "HTTP 500"))
            .await
            .unwrap();
        assert!(!store.is_downloaded(url));
        assert_eq!(store.stats().media, 1);
        assert_eq!(store.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_same_url_in_two_posts_counts_separately() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let url = "https://media.example.com/shared.jpg";
        store.update_media(downloaded("1", url)).await.unwrap();
        store.update_media(downloaded("2", url)).await.unwrap();
        store
            .update_media(MediaItem::missing(source("2", url), "2_a.jpg".into(), "gone"))
            .await
            .unwrap();
        assert!(store.is_downloaded(url));
        assert_eq!(store.stats().posts, 2);
    }

    #[tokio::test]
    async fn test_add_post_rejects_foreign_media() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let mut post = Post::new("1", "https://blog.example.com/post/1", "t", false);
        post.media_items.push(downloaded("2", "https://media.example.com/a.jpg"));
        assert!(matches!(
            store.add_post(post),
            Err(ManifestError::PostIdMismatch { .. })
        ));
        assert_eq!(store.stats().posts, 0);
    }

    #[tokio::test]
    async fn test_add_post_twice_keeps_one_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.add_post(Post::new("1", "u", "t", false)).unwrap();
        store.add_post(Post::new("1", "u", "t2", true)).unwrap();
        let manifest = store.snapshot();
        assert_eq!(manifest.total_posts, 1);
        assert!(manifest.posts[0].is_reblog);
        assert_eq!(manifest.posts[0].timestamp, "t2");
    }

    #[tokio::test]
    async fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.add_post(Post::new("1", "u1", "t1", false)).unwrap();
        store
            .update_media(downloaded("1", "https://media.example.com/a.jpg"))
            .await
            .unwrap();
        store
            .update_media(MediaItem::missing(
                source("1", "https://media.example.com/b.jpg"),
                "1_b.jpg".into(),
                "no captures",
            ))
            .await
            .unwrap();
        store.save().await.unwrap();

        let reloaded = ManifestStore::load(store.path(), "blog", "https://blog.example.com")
            .await
            .unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert!(reloaded.is_downloaded("https://media.example.com/a.jpg"));
        assert!(!reloaded.is_downloaded("https://media.example.com/b.jpg"));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&path, b"{ not json").unwrap();
        let result = ManifestStore::load(&path, "blog", "u").await;
        assert!(matches!(result, Err(ManifestError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_autosave_writes_after_threshold() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await.with_autosave(2);
        store
            .update_media(downloaded("1", "https://media.example.com/a.jpg"))
            .await
            .unwrap();
        assert!(!store.path().exists());
        store
            .update_media(downloaded("1", "https://media.example.com/b.jpg"))
            .await
            .unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_stale_temp_file_removed_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(temp_path(&path), b"partial").unwrap();
        let _store = ManifestStore::load(&path, "blog", "u").await.unwrap();
        assert!(!temp_path(&path).exists());
    }
}
