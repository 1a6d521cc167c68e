//! URL matching helpers shared by the archive fallback and the media extractor.
//!
//! Media hosts commonly serve one asset at several resolutions, encoded either
//! as a filename suffix (`abc_1280.jpg`, `abc_500.jpg`) or as a size path
//! segment (`/s1280x1920/abc.jpg`). These helpers normalise those variants so an
//! archived page can be matched back to the asset we were looking for.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// `_1280.jpg` style resolution suffix on the last path segment.
#[allow(clippy::expect_used)]
static SUFFIX_RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_(\d{2,4})(\.[A-Za-z0-9]+)?$").expect("suffix resolution regex is valid")
});

/// `s1280x1920` style size segment anywhere in the path.
#[allow(clippy::expect_used)]
static SEGMENT_RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|/)s(\d{2,5})x(\d{2,5})(?:/|$)").expect("segment resolution regex is valid")
});

/// Archive replay wrapper: `.../web/20200101000000im_/https://host/path`.
#[allow(clippy::expect_used)]
static REPLAY_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/web/\d{1,14}[a-z_]*/((?:https?:)?//.+)$").expect("replay wrapper regex is valid")
});

/// Last path segment of a URL, without query or fragment.
#[must_use]
pub fn filename_of(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    };
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map_or_else(|_| s.to_string(), |d| d.into_owned()))
}

/// Path component of a URL (`/a/b.jpg`), if it parses.
#[must_use]
pub fn path_of(url: &str) -> Option<String> {
    Url::parse(url).ok().map(|u| u.path().to_string())
}

/// Pixel resolution encoded in the URL, if any. For `WxH` segments the larger side wins.
///
/// ```
/// use archiver_core::archive::matching::resolution_hint;
///
/// assert_eq!(resolution_hint("https://m.example.com/abc_1280.jpg"), Some(1280));
/// assert_eq!(resolution_hint("https://m.example.com/s640x960/abc.jpg"), Some(960));
/// assert_eq!(resolution_hint("https://m.example.com/abc.jpg"), None);
/// ```
#[must_use]
pub fn resolution_hint(url: &str) -> Option<u32> {
    let path = path_of(url).unwrap_or_else(|| url.to_string());

    if let Some(caps) = SEGMENT_RESOLUTION.captures(&path) {
        let w: u32 = caps[1].parse().ok()?;
        let h: u32 = caps[2].parse().ok()?;
        return Some(w.max(h));
    }

    let name = filename_of(url)?;
    SUFFIX_RESOLUTION
        .captures(&name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Filename with any resolution suffix removed: `abc_1280.jpg` → `abc.jpg`.
#[must_use]
pub fn strip_resolution(filename: &str) -> String {
    SUFFIX_RESOLUTION.replace(filename, "$2").into_owned()
}

/// Key that is equal for every resolution variant of one asset.
///
/// Host, size segments and resolution suffix are dropped; the directory and base
/// filename are kept.
#[must_use]
pub fn variant_key(url: &str) -> String {
    let path = path_of(url).unwrap_or_else(|| url.to_string());
    let without_segment = SEGMENT_RESOLUTION.replace_all(&path, "/");
    let (dir, name) = without_segment
        .rsplit_once('/')
        .unwrap_or(("", without_segment.as_ref()));
    format!("{dir}/{}", strip_resolution(name)).to_ascii_lowercase()
}

/// Removes an archive replay wrapper, returning the original URL.
///
/// Protocol-relative originals get `https:`. URLs that are not wrapped are returned unchanged.
#[must_use]
pub fn unwrap_replay_url(url: &str) -> String {
    match REPLAY_WRAPPER.captures(url) {
        Some(caps) => {
            let inner = &caps[1];
            if inner.starts_with("//") {
                format!("https:{inner}")
            } else {
                inner.to_string()
            }
        }
        None => url.to_string(),
    }
}

/// How a candidate matched the target URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    /// Identical URL.
    Exact,
    /// Same path on any host.
    Path,
    /// Same filename once resolution suffixes are removed.
    Filename,
}

/// Finds the candidate that best matches `target`: exact URL, then path, then
/// resolution-stripped filename. Within a tier the first candidate wins.
#[must_use]
pub fn best_match<'a>(target: &str, candidates: &'a [String]) -> Option<(&'a str, MatchKind)> {
    ranked_matches(target, candidates).into_iter().next()
}

/// Every matching candidate, best tier first, without duplicates.
#[must_use]
pub fn ranked_matches<'a>(target: &str, candidates: &'a [String]) -> Vec<(&'a str, MatchKind)> {
    let target_path = path_of(target);
    let target_name = filename_of(target).map(|n| strip_resolution(&n));

    let mut matches: Vec<(&str, MatchKind)> = Vec::new();
    for candidate in candidates {
        if matches.iter().any(|(seen, _)| *seen == candidate.as_str()) {
            continue;
        }
        let kind = if candidate == target {
            Some(MatchKind::Exact)
        } else if target_path.is_some() && path_of(candidate) == target_path {
            Some(MatchKind::Path)
        } else if target_name.is_some()
            && filename_of(candidate).map(|n| strip_resolution(&n)) == target_name
        {
            Some(MatchKind::Filename)
        } else {
            None
        };
        if let Some(kind) = kind {
            matches.push((candidate.as_str(), kind));
        }
    }
    matches.sort_by_key(|(_, kind)| *kind);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_of_strips_query() {
        assert_eq!(
            filename_of("https://m.example.com/a/b/c_500.jpg?x=1").as_deref(),
            Some("c_500.jpg")
        );
        assert_eq!(filename_of("https://m.example.com/"), None);
        assert_eq!(
            filename_of("https://m.example.com/my%20pic.png").as_deref(),
            Some("my pic.png")
        );
    }

    #[test]
    fn test_strip_resolution() {
        assert_eq!(strip_resolution("tumblr_abc_1280.jpg"), "tumblr_abc.jpg");
        assert_eq!(strip_resolution("tumblr_abc_500.jpg"), "tumblr_abc.jpg");
        assert_eq!(strip_resolution("plain.jpg"), "plain.jpg");
        assert_eq!(strip_resolution("photo_2.jpg"), "photo_2.jpg");
    }

    #[test]
    fn test_variant_key_groups_resolutions() {
        let a = variant_key("https://64.media.example.com/abc/tumblr_x_1280.jpg");
        let b = variant_key("https://66.media.example.com/abc/tumblr_x_500.jpg");
        assert_eq!(a, b);
        let c = variant_key("https://m.example.com/abc/s1280x1920/pic.jpg");
        let d = variant_key("https://m.example.com/abc/s640x960/pic.jpg");
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn test_unwrap_replay_url() {
        assert_eq!(
            unwrap_replay_url(
                "https://web.archive.org/web/20150101000000im_/https://m.example.com/a.jpg"
            ),
            "https://m.example.com/a.jpg"
        );
        assert_eq!(
            unwrap_replay_url("/web/2015/http://m.example.com/a.jpg"),
            "http://m.example.com/a.jpg"
        );
        assert_eq!(
            unwrap_replay_url("https://web.archive.org/web/20150101000000id_///m.example.com/a.jpg"),
            "https://m.example.com/a.jpg"
        );
        assert_eq!(unwrap_replay_url("https://m.example.com/a.jpg"), "https://m.example.com/a.jpg");
    }

    #[test]
    fn test_best_match_prefers_exact_then_path_then_filename() {
        let target = "https://64.media.example.com/abc/tumblr_x_1280.jpg";
        let candidates = vec![
            "https://66.media.example.com/zzz/tumblr_x_500.jpg".to_string(),
            "https://65.media.example.com/abc/tumblr_x_1280.jpg".to_string(),
            target.to_string(),
        ];
        assert_eq!(best_match(target, &candidates), Some((target, MatchKind::Exact)));
        assert_eq!(
            best_match(target, &candidates[..2]).map(|(_, k)| k),
            Some(MatchKind::Path)
        );
        assert_eq!(
            best_match(target, &candidates[..1]).map(|(_, k)| k),
            Some(MatchKind::Filename)
        );
        assert_eq!(best_match(target, &["https://x/other.jpg".to_string()]), None);
    }

    #[test]
    fn test_ranked_matches_orders_tiers_and_dedupes() {
        let target = "https://a.example.com/p/x_1280.jpg";
        let candidates = vec![
            "https://b.example.com/q/x_250.jpg".to_string(),
            "https://b.example.com/p/x_1280.jpg".to_string(),
            "https://b.example.com/q/x_250.jpg".to_string(),
            "https://b.example.com/q/unrelated.jpg".to_string(),
        ];
        let ranked = ranked_matches(target, &candidates);
        assert_eq!(
            ranked,
            vec![
                ("https://b.example.com/p/x_1280.jpg", MatchKind::Path),
                ("https://b.example.com/q/x_250.jpg", MatchKind::Filename),
            ]
        );
    }
}
