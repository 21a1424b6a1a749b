//! Destination file names derived from URLs.

use std::collections::HashSet;

use url::Url;

const FALLBACK_NAME: &str = "download";

/// Last non-empty path segment of `url`, percent-decoded and made safe.
///
/// Falls back to `download` when the URL has no usable segment.
#[must_use]
pub fn file_name_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
                .map(str::to_string)
        })
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(std::borrow::Cow::into_owned)
                .unwrap_or(segment)
        })
        .map(|decoded| sanitize_file_name(&decoded))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.chars().all(|c| c == '.') {
        return String::new();
    }
    trimmed.to_string()
}

/// Hands out names unique within one run.
///
/// A repeated name gets `-1`, `-2`, ... inserted before its extension.
#[derive(Debug, Default)]
pub struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    /// Name for `url`, suffixed if an earlier URL already claimed it.
    pub fn allocate(&mut self, url: &str) -> String {
        let base = file_name_from_url(url);
        if self.used.insert(base.clone()) {
            return base;
        }
        let (stem, extension) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (base.as_str(), None),
        };
        let mut counter = 1usize;
        loop {
            let candidate = match extension {
                Some(ext) => format!("{stem}-{counter}.{ext}"),
                None => format!("{stem}-{counter}"),
            };
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}
