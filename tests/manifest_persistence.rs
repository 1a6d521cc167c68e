//! Manifest durability across process restarts.

#![allow(clippy::unwrap_used)]

use archiver_core::manifest::{
    Checksum, MANIFEST_FILE_NAME, ManifestStore, MediaItem, MediaSource, MediaType, Post, Status,
    temp_path,
};
use tempfile::TempDir;

fn source(post_id: &str, url: &str) -> MediaSource {
    MediaSource {
        post_id: post_id.to_string(),
        post_url: format!("https://blog.example.com/post/{post_id}"),
        timestamp: "2016-03-01 12:00:00 GMT".to_string(),
        media_type: MediaType::Image,
        original_url: url.to_string(),
        candidate_urls: Vec::new(),
    }
}

async fn populated_store(dir: &TempDir) -> ManifestStore {
    let path = dir.path().join(MANIFEST_FILE_NAME);
    let store = ManifestStore::load(&path, "blog", "https://blog.example.com")
        .await
        .unwrap();
    store
        .add_post(Post::new("1", "https://blog.example.com/post/1", "2016", false))
        .unwrap();
    store
        .update_media(MediaItem::downloaded(
            source("1", "https://m.example.com/a.jpg"),
            "1_a.jpg".to_string(),
            3,
            Checksum::of_bytes(b"abc"),
        ))
        .await
        .unwrap();
    store
        .update_media(MediaItem::missing(
            source("1", "https://m.example.com/b.jpg"),
            "1_b.jpg".to_string(),
            "not found and no archive capture",
        ))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_saved_manifest_reloads_identically() {
    let dir = TempDir::new().unwrap();
    let store = populated_store(&dir).await;
    store.save().await.unwrap();
    let saved = store.snapshot();

    let reloaded = ManifestStore::load(store.path(), "blog", "https://blog.example.com")
        .await
        .unwrap();
    assert_eq!(reloaded.snapshot(), saved);
    assert!(reloaded.is_downloaded("https://m.example.com/a.jpg"));
    assert!(!reloaded.is_downloaded("https://m.example.com/b.jpg"));

    let stats = reloaded.stats();
    assert_eq!(stats.media, 2);
    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.missing, 1);
}

#[tokio::test]
async fn test_interrupted_save_leaves_previous_manifest_intact() {
    let dir = TempDir::new().unwrap();
    let store = populated_store(&dir).await;
    store.save().await.unwrap();
    let path = store.path().to_path_buf();
    let before = std::fs::read(&path).unwrap();

    // A crash mid-save leaves only a partial temp file behind.
    let temp = temp_path(&path);
    std::fs::write(&temp, b"{\"sourceName\": \"blo").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);

    let reloaded = ManifestStore::load(&path, "blog", "https://blog.example.com")
        .await
        .unwrap();
    assert!(!temp.exists());
    assert_eq!(reloaded.snapshot().total_media, 2);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_manifest_json_uses_documented_field_names() {
    let dir = TempDir::new().unwrap();
    let store = populated_store(&dir).await;
    store.save().await.unwrap();

    let value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
    assert_eq!(value["sourceName"], "blog");
    assert_eq!(value["totalPosts"], 1);
    assert_eq!(value["totalMedia"], 2);
    let item = &value["posts"][0]["mediaItems"][0];
    assert_eq!(item["status"], Status::Downloaded.as_str());
    assert_eq!(item["retrievedFrom"], "primary");
    assert_eq!(
        item["checksum"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[tokio::test]
async fn test_corrupt_manifest_is_reported_not_replaced() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(MANIFEST_FILE_NAME);
    std::fs::write(&path, b"not json").unwrap();

    let result = ManifestStore::load(&path, "blog", "https://blog.example.com").await;
    assert!(result.is_err());
    assert_eq!(std::fs::read(&path).unwrap(), b"not json");
}
