//! Writes selected captured bodies to disk as individual files, outside of
//! any archive, and records each write in the store.
//!
//! Existing files are never replaced: a name that is already taken, by an
//! earlier run or by another record of the same run, gets a `_2`, `_3`, ...
//! suffix before its extension.

use std::{
    fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, bail};
use chrono::{SecondsFormat, Utc};
use url::Url;

use crate::{
    classify::{ContentTypeTag, classify, mime_subtype},
    path_builder::splice_before_extension,
    storage::{CapturedExchange, SavedFile, Storage},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub saved: usize,
    pub skipped: usize,
    pub files: Vec<PathBuf>,
}

/// `<host>` and `<path>` for a saved body. `index` is appended to directory
/// paths, an extension taken from the MIME type is added when the last
/// segment has none, and anything outside `[A-Za-z0-9-_./]` becomes `_`.
pub fn legacy_file_name(url: &str, mime_type: &str) -> anyhow::Result<(String, String)> {
    let parsed = Url::parse(url).with_context(|| format!("parse url `{url}`"))?;
    let Some(domain) = parsed.host_str().filter(|host| !host.is_empty()) else {
        bail!("url `{url}` has no host");
    };

    let mut filename = parsed.path().to_owned();
    if filename.ends_with('/') {
        filename.push_str("index");
    }
    let last_segment = filename.rsplit('/').next().unwrap_or_default();
    if !last_segment.contains('.') {
        if let Some(extension) = legacy_extension(mime_type) {
            filename.push('.');
            filename.push_str(&extension);
        }
    }

    let filename: String = filename
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    Ok((domain.to_owned(), filename))
}

fn legacy_extension(mime_type: &str) -> Option<String> {
    match classify(mime_type) {
        ContentTypeTag::Html => Some("html".to_owned()),
        ContentTypeTag::Css => Some("css".to_owned()),
        ContentTypeTag::Javascript => Some("js".to_owned()),
        ContentTypeTag::Json => Some("json".to_owned()),
        ContentTypeTag::Image => mime_subtype(mime_type).filter(|subtype| !subtype.is_empty()),
        _ => None,
    }
}

/// Joins `domain` and `filename` under `out_dir`, refusing anything that
/// would escape it.
fn target_path(out_dir: &Path, domain: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let relative = PathBuf::from(domain).join(filename.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        bail!("refusing to save outside the output dir: `{}`", relative.display());
    }
    Ok(out_dir.join(relative))
}

struct PendingWrite {
    exchange_id: String,
    domain: String,
    filename: String,
    bytes: Vec<u8>,
}

/// Saves every body of `session_id` whose content type is in `content_types`.
/// Each file is recorded in the store as soon as it is on disk.
pub async fn save_session_files(
    storage: &Storage,
    session_id: &str,
    out_dir: &Path,
    content_types: &[ContentTypeTag],
) -> anyhow::Result<SaveSummary> {
    let exchanges = storage.get_exchanges_by_session(session_id).await?;
    let mut summary = SaveSummary::default();
    let mut pending = Vec::new();

    for exchange in &exchanges {
        if !content_types.contains(&exchange.content_type) {
            summary.skipped += 1;
            continue;
        }
        match prepare_write(exchange, out_dir) {
            Ok(Some(write)) => pending.push(write),
            Ok(None) => summary.skipped += 1,
            Err(err) => {
                tracing::warn!(
                    session = %session_id,
                    exchange = %exchange.exchange_id,
                    "skipping file save: {err:#}"
                );
                summary.skipped += 1;
            }
        }
    }

    for write in pending {
        let task_dir = out_dir.to_path_buf();
        let PendingWrite {
            exchange_id,
            domain,
            filename,
            bytes,
        } = write;
        let task_domain = domain.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_unclaimed(&task_dir, &task_domain, &filename, &bytes)
        })
        .await
        .context("join save file task")?;

        let (filename, path) = match written {
            Ok(written) => written,
            Err(err) => {
                tracing::warn!(
                    session = %session_id,
                    exchange = %exchange_id,
                    "skipping file save: {err:#}"
                );
                summary.skipped += 1;
                continue;
            }
        };

        let saved_file = SavedFile {
            file_id: format!("{session_id}:{exchange_id}"),
            session_id: session_id.to_owned(),
            exchange_id,
            domain,
            filename,
            saved_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        storage
            .record_saved_file(saved_file)
            .await
            .with_context(|| format!("record saved file {}", path.display()))?;
        tracing::debug!(session = %session_id, path = %path.display(), "saved file");
        summary.saved += 1;
        summary.files.push(path);
    }

    Ok(summary)
}

fn prepare_write(
    exchange: &CapturedExchange,
    out_dir: &Path,
) -> anyhow::Result<Option<PendingWrite>> {
    let Some(bytes) = exchange.body_bytes()? else {
        return Ok(None);
    };
    let (domain, filename) =
        legacy_file_name(&exchange.url, exchange.mime_type.as_deref().unwrap_or_default())?;
    target_path(out_dir, &domain, &filename)?;
    Ok(Some(PendingWrite {
        exchange_id: exchange.exchange_id.clone(),
        domain,
        filename,
        bytes,
    }))
}

/// Creates `filename` under `out_dir/domain`, or the first free suffixed
/// variant of it. Returns the name actually used and its full path.
fn write_unclaimed(
    out_dir: &Path,
    domain: &str,
    filename: &str,
    bytes: &[u8],
) -> anyhow::Result<(String, PathBuf)> {
    let mut candidate = filename.to_owned();
    let mut counter = 1;
    loop {
        let path = target_path(out_dir, domain, &candidate)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create save dir {}", parent.display()))?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(bytes)
                    .with_context(|| format!("write saved file {}", path.display()))?;
                return Ok((candidate, path));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                counter += 1;
                candidate = splice_before_extension(filename, &format!("_{counter}"));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create saved file {}", path.display()));
            }
        }
    }
}
