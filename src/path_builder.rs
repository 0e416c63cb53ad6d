//! Deterministic archive paths for captured exchanges.
//!
//! A path is `<host>/<path segments>`, with every segment reduced to a
//! filesystem-safe alphabet. Query strings and fragments add a short token
//! before the extension so that variants of one resource land in distinct
//! files. Construction never fails: an unparsable URL falls back to a
//! timestamped name.

use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

use crate::classify::{ContentTypeTag, classify, mime_subtype};

const NO_QUERY_TOKEN: &str = "noquery";
const NO_HOST_SEGMENT: &str = "no-host";
const QUERY_TOKEN_LEN: usize = 8;

/// Builds the archive path for `url`, using the current time for the
/// fallback name when the URL cannot be parsed.
pub fn build_path(url: &str, content_type: ContentTypeTag, mime_type: Option<&str>) -> String {
    build_path_with_fallback(url, content_type, mime_type, unix_timestamp_ms())
}

/// Like [`build_path`], but an unparsable URL yields `unknown_<fallback_stamp>`.
pub fn build_path_with_fallback(
    url: &str,
    content_type: ContentTypeTag,
    mime_type: Option<&str>,
    fallback_stamp: i64,
) -> String {
    match try_build_path(url, content_type, mime_type) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!(url, "using fallback archive path: {err}");
            format!("unknown_{fallback_stamp}")
        }
    }
}

fn try_build_path(
    url: &str,
    content_type: ContentTypeTag,
    mime_type: Option<&str>,
) -> Result<String, url::ParseError> {
    let parsed = Url::parse(url)?;

    let mut path = parsed
        .host_str()
        .map(sanitize_host)
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| NO_HOST_SEGMENT.to_owned());

    let mut url_path = parsed.path().to_owned();
    if !url_path.starts_with('/') {
        url_path.insert(0, '/');
    }
    if url_path.ends_with('/') {
        url_path.push_str("index");
        url_path.push_str(index_extension(content_type));
    }

    for segment in url_path.split('/').filter(|segment| !segment.is_empty()) {
        path.push('/');
        path.push_str(&sanitize_segment(segment));
    }

    if let Some(token) = query_token(&parsed) {
        path = splice_before_extension(&path, &format!("_{token}"));
    }

    if !has_extension(&path) {
        if let Some(extension) = mime_type.and_then(mime_extension) {
            path.push('.');
            path.push_str(&extension);
        }
    }

    Ok(path.trim_start_matches('/').to_owned())
}

fn index_extension(content_type: ContentTypeTag) -> &'static str {
    match content_type {
        ContentTypeTag::Css => ".css",
        ContentTypeTag::Javascript => ".js",
        ContentTypeTag::Json => ".json",
        _ => ".html",
    }
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn sanitize_segment(segment: &str) -> String {
    let sanitized: String = segment
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == "." || sanitized == ".." {
        "_".repeat(sanitized.len())
    } else {
        sanitized
    }
}

fn query_token(url: &Url) -> Option<String> {
    let query = url.query().unwrap_or_default();
    let fragment = url.fragment().unwrap_or_default();
    if query.is_empty() && fragment.is_empty() {
        return None;
    }

    let token: String = query
        .chars()
        .chain(fragment.chars())
        .filter(char::is_ascii_alphanumeric)
        .take(QUERY_TOKEN_LEN)
        .collect();
    if token.is_empty() {
        Some(NO_QUERY_TOKEN.to_owned())
    } else {
        Some(token)
    }
}

fn last_segment(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    }
}

/// Inserts `suffix` before the extension of the final segment, or appends it
/// when that segment has no extension.
pub(crate) fn splice_before_extension(path: &str, suffix: &str) -> String {
    let (dir, file) = last_segment(path);
    match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{dir}{}{suffix}{}", &file[..dot], &file[dot..]),
        _ => format!("{path}{suffix}"),
    }
}

fn has_extension(path: &str) -> bool {
    let (_, file) = last_segment(path);
    file.rsplit_once('.').is_some_and(|(_, extension)| {
        !extension.is_empty() && extension.chars().all(|ch| ch.is_ascii_alphanumeric())
    })
}

fn mime_extension(mime_type: &str) -> Option<String> {
    match classify(mime_type) {
        ContentTypeTag::Image => {
            let extension: String = mime_subtype(mime_type)
                .unwrap_or_default()
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect();
            if extension.is_empty() {
                Some("img".to_owned())
            } else {
                Some(extension)
            }
        }
        ContentTypeTag::Font => Some("font".to_owned()),
        _ => None,
    }
}

fn unix_timestamp_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}
