//! Stored filename derivation and sanitisation.

use std::path::{Component, Path};

use url::Url;

use crate::manifest::MediaType;

/// Longest stem kept from a URL segment, in characters.
const MAX_STEM_CHARS: usize = 120;

/// Filename a media item is stored under: `{postId}_{last URL segment}`.
///
/// The extension comes from the URL, else the response content type, else the
/// declared media type.
///
/// ```
/// use archiver_core::download::media_filename;
/// use archiver_core::manifest::MediaType;
///
/// assert_eq!(
///     media_filename("101", "https://m.example.com/a/tumblr_x_1280.jpg?v=2", MediaType::Image, None),
///     "101_tumblr_x_1280.jpg"
/// );
/// assert_eq!(
///     media_filename("7", "https://m.example.com/watch", MediaType::Video, Some("video/webm")),
///     "7_watch.webm"
/// );
/// ```
#[must_use]
pub fn media_filename(
    post_id: &str,
    url: &str,
    media_type: MediaType,
    content_type: Option<&str>,
) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(&s).map_or(s.clone(), |d| d.into_owned()))
        .unwrap_or_else(|| "media".to_string());

    let (stem, ext) = match segment.rfind('.') {
        Some(pos) if pos > 0 && segment.len() - pos <= 6 => {
            (segment[..pos].to_string(), segment[pos..].to_ascii_lowercase())
        }
        _ => {
            let ext = content_type
                .and_then(extension_from_content_type)
                .unwrap_or_else(|| default_extension(media_type));
            (segment.clone(), ext.to_string())
        }
    };

    let stem: String = sanitize_filename_component(&stem)
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let stem = if stem.is_empty() { "media".to_string() } else { stem };
    let post_id = sanitize_filename_component(post_id);

    sanitize_filename(&format!("{post_id}_{stem}{ext}"))
}

fn default_extension(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Image => ".jpg",
        MediaType::Gif => ".gif",
        MediaType::Video => ".mp4",
    }
}

/// Guess file extension from a Content-Type header. `None` for unknown types.
#[must_use]
pub fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    let ext = match mime.as_str() {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/bmp" => ".bmp",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        _ => return None,
    };
    Some(ext)
}

/// Whether a content type is acceptable for a declared media type.
///
/// `application/octet-stream` is accepted for everything; archives and CDNs use it freely.
#[must_use]
pub fn content_type_matches(media_type: MediaType, content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if mime == "application/octet-stream" {
        return true;
    }
    match media_type {
        MediaType::Image => mime.starts_with("image/"),
        MediaType::Gif => mime == "image/gif" || mime.starts_with("video/"),
        MediaType::Video => mime.starts_with("video/"),
    }
}

/// Collapses anything but alphanumerics, `-`, `_` and `.` into single underscores.
pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// Replaces characters that are invalid on common filesystems and neutralises
/// `.`/`..` segments.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Name to try for `filename` on the given attempt: `name.jpg` first, then
/// `name_2.jpg` up to `name_999.jpg`, then random suffixes.
pub(crate) fn candidate_name(filename: &str, attempt: u32) -> String {
    if attempt == 0 {
        return filename.to_string();
    }
    let (stem, ext) = match filename.rfind('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename, ""),
    };
    if attempt < 999 {
        format!("{stem}_{}{ext}", attempt + 1)
    } else {
        let nonce: u32 = rand::random();
        format!("{stem}_{nonce:08x}{ext}")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
