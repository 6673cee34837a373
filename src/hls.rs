//! Media playlist handling: segment URIs, base URL resolution and the
//! muted-segment naming convention.
//!
//! Segments whose audio was muted for copyright reasons are listed as
//! `N-unmuted.ts`, but only `N-muted.ts` is actually served.

use std::borrow::Cow;

const UNMUTED: &str = "-unmuted";
const MUTED: &str = "-muted";

/// Directory of a playlist URL, including the trailing slash.
pub fn base_url(playlist_url: &str) -> &str {
    let end = playlist_url
        .find(['?', '#'])
        .unwrap_or(playlist_url.len());
    let path = &playlist_url[..end];
    match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "",
    }
}

fn is_uri(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('#')
}

fn resolve(base: &str, uri: &str) -> String {
    // A base that is not a URL (a local playlist) leaves URIs as written.
    match reqwest::Url::parse(base).and_then(|base| base.join(uri)) {
        Ok(url) => url.to_string(),
        Err(_) if base.is_empty() => uri.to_string(),
        Err(_) => format!("{}{}", base, uri.trim_start_matches('/')),
    }
}

/// Rewrites `N-unmuted.ts` to `N-muted.ts`.
pub fn rewrite_muted(uri: &str) -> Cow<'_, str> {
    match uri.rfind(UNMUTED) {
        Some(i) => Cow::Owned(format!("{}{}{}", &uri[..i], MUTED, &uri[i + UNMUTED.len()..])),
        None => Cow::Borrowed(uri),
    }
}

pub fn has_muted(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .any(|l| is_uri(l) && l.contains(UNMUTED))
}

/// Absolute segment URLs in playlist order, muted segments rewritten.
pub fn segment_urls(content: &str, base: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| is_uri(l))
        .map(|l| resolve(base, &rewrite_muted(l)))
        .collect()
}

/// The playlist with every segment made absolute and muted segments
/// rewritten. Tags are kept as they are.
pub fn unmute(content: &str, base: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .map(|l| {
            if is_uri(l) {
                resolve(base, &rewrite_muted(l))
            } else {
                l.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
