use std::{
    collections::HashSet,
    fs,
    io::{Cursor, Seek, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::Instrument as _;
use zip::{CompressionMethod, ZipWriter, result::ZipResult, write::FileOptions};

use crate::{
    classify::ContentTypeTag,
    config::ExportConfig,
    logging,
    path_builder::{build_path_with_fallback, splice_before_extension},
    session,
    storage::{CapturedExchange, ExchangeStore},
};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
pub const DEFAULT_WARN_THRESHOLD_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub compression_level: u32,
    /// Estimated payload size above which a warning is logged. Never blocks.
    pub warn_threshold_bytes: u64,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            warn_threshold_bytes: DEFAULT_WARN_THRESHOLD_BYTES,
        }
    }
}

impl ExportOptions {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            compression_level: config.compression_level,
            warn_threshold_bytes: config.warn_threshold_mib.saturating_mul(1024 * 1024),
        }
    }
}

#[derive(Debug)]
pub enum ExportError {
    Empty(String),
    InvalidRequest(String),
    Store(String),
    Internal(String),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty(session) => {
                write!(f, "session `{session}` has no captured exchanges to export")
            }
            Self::InvalidRequest(message) | Self::Store(message) | Self::Internal(message) => {
                f.write_str(message)
            }
        }
    }
}

impl std::error::Error for ExportError {}

/// A finished archive, ready to hand to whatever writes or downloads it.
#[derive(Debug, Clone)]
pub struct ExportArchive {
    pub bytes: Vec<u8>,
    pub processed: usize,
    pub skipped: usize,
    pub total_requests: usize,
    /// Sum of the encoded body sizes reported during capture.
    pub estimated_bytes: u64,
    pub archive_size: u64,
    pub suggested_filename: String,
}

#[derive(Debug, Clone)]
pub struct JsonExport {
    pub bytes: Vec<u8>,
    pub total_requests: usize,
    pub suggested_filename: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveManifest {
    generated_at: String,
    session_id: String,
    total_requests: usize,
    processed_files: usize,
    skipped_files: usize,
    items: Vec<ArchiveManifestEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveManifestEntry {
    url: String,
    status: Option<u16>,
    method: String,
    size: u64,
    #[serde(rename = "type")]
    content_type: ContentTypeTag,
    mime_type: Option<String>,
    saved_as: String,
    timestamp: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonDocument<'a> {
    timestamp: String,
    session_id: &'a str,
    total_requests: usize,
    requests: &'a [CapturedExchange],
}

/// Packages every captured body of `session_id` into a ZIP archive with a
/// `manifest.json` at its root.
pub async fn export_session(
    store: &dyn ExchangeStore,
    session_id: &str,
    options: &ExportOptions,
) -> Result<ExportArchive, ExportError> {
    package_session(store, session_id, options)
        .instrument(logging::export_span(session_id))
        .await
}

async fn package_session(
    store: &dyn ExchangeStore,
    session_id: &str,
    options: &ExportOptions,
) -> Result<ExportArchive, ExportError> {
    let records = load_records(store, session_id).await?;
    if records.is_empty() {
        return Err(ExportError::Empty(session_id.to_owned()));
    }

    let total_requests = records.len();
    let estimated_bytes: u64 = records
        .iter()
        .map(|record| record.encoded_body_size.unwrap_or(0))
        .sum();
    if estimated_bytes > options.warn_threshold_bytes {
        tracing::warn!(
            estimated_bytes,
            threshold = options.warn_threshold_bytes,
            "export is larger than the warning threshold"
        );
    }

    let generated_at = Utc::now();
    let session_for_task = session_id.to_owned();
    let compression_level = options.compression_level;
    let span = tracing::Span::current();
    let built = tokio::task::spawn_blocking(move || {
        span.in_scope(|| {
            build_archive(
                Cursor::new(Vec::new()),
                &session_for_task,
                records,
                compression_level,
                generated_at,
            )
        })
    })
    .await
    .map_err(|err| ExportError::Internal(format!("join archive build task failed: {err}")))??;

    let bytes = built.sink.into_inner();
    let archive_size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    tracing::info!(
        processed = built.processed,
        skipped = built.skipped,
        archive_size,
        "built export archive"
    );

    Ok(ExportArchive {
        bytes,
        processed: built.processed,
        skipped: built.skipped,
        total_requests,
        estimated_bytes,
        archive_size,
        suggested_filename: session::archive_file_name(session_id, generated_at.date_naive()),
    })
}

/// Plain JSON dump of every record of `session_id`, bodies included.
pub async fn export_json(
    store: &dyn ExchangeStore,
    session_id: &str,
) -> Result<JsonExport, ExportError> {
    let records = load_records(store, session_id).await?;
    let generated_at = Utc::now();
    let document = JsonDocument {
        timestamp: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        session_id,
        total_requests: records.len(),
        requests: &records,
    };
    let bytes = serde_json::to_vec_pretty(&document).map_err(|err| {
        ExportError::Internal(format!(
            "serialize json export for session `{session_id}`: {err}"
        ))
    })?;

    Ok(JsonExport {
        bytes,
        total_requests: records.len(),
        suggested_filename: session::json_file_name(session_id, generated_at.date_naive()),
    })
}

/// Writes the archive under `dir` using its suggested file name.
pub fn write_archive(dir: &Path, archive: &ExportArchive) -> anyhow::Result<PathBuf> {
    write_new_file(dir, &archive.suggested_filename, &archive.bytes)
}

pub fn write_json(dir: &Path, export: &JsonExport) -> anyhow::Result<PathBuf> {
    write_new_file(dir, &export.suggested_filename, &export.bytes)
}

fn write_new_file(dir: &Path, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create export dir {}", dir.display()))?;
    let path = dir.join(file_name);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("create export file {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("write export file {}", path.display()))?;
    Ok(path)
}

async fn load_records(
    store: &dyn ExchangeStore,
    session_id: &str,
) -> Result<Vec<CapturedExchange>, ExportError> {
    session::validate_session_id(session_id)
        .map_err(|err| ExportError::InvalidRequest(err.to_string()))?;

    let mut records = store.get_all_by_session(session_id).await.map_err(|err| {
        ExportError::Store(format!(
            "load exchanges for session `{session_id}`: {err:#}"
        ))
    })?;
    records.sort_by(|left, right| {
        left.observed_at
            .total_cmp(&right.observed_at)
            .then_with(|| left.exchange_id.cmp(&right.exchange_id))
    });
    Ok(records)
}

#[derive(Debug)]
struct BuiltArchive<W> {
    sink: W,
    processed: usize,
    skipped: usize,
}

/// Writes one entry per record with a decodable body, then the manifest.
/// A record whose entry cannot be written is skipped; only the manifest and
/// the final directory are fatal.
fn build_archive<W: Write + Seek>(
    sink: W,
    session_id: &str,
    records: Vec<CapturedExchange>,
    compression_level: u32,
    generated_at: DateTime<Utc>,
) -> Result<BuiltArchive<W>, ExportError> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(i32::try_from(compression_level).unwrap_or(9)));
    let mut writer = ZipWriter::new(sink);
    let mut assigned = HashSet::from([MANIFEST_FILE_NAME.to_owned()]);
    let mut items = Vec::new();
    let mut skipped = 0;
    let total_requests = records.len();

    for record in &records {
        let bytes = match record.body_bytes() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                skipped += 1;
                continue;
            }
            Err(err) => {
                tracing::warn!(
                    exchange = %record.exchange_id,
                    "skipping exchange in export: {err:#}"
                );
                skipped += 1;
                continue;
            }
        };

        let path = unique_path(
            &mut assigned,
            build_path_with_fallback(
                &record.url,
                record.content_type,
                record.mime_type.as_deref(),
                record.observed_at_ms(),
            ),
        );

        if let Err(err) = append_entry(&mut writer, &path, &bytes, options) {
            tracing::warn!(
                exchange = %record.exchange_id,
                path = %path,
                "skipping exchange in export, archive entry failed: {err}"
            );
            skipped += 1;
            continue;
        }

        let size = match record.encoded_body_size {
            Some(size) if size > 0 => size,
            _ => u64::try_from(bytes.len()).unwrap_or(u64::MAX),
        };
        items.push(ArchiveManifestEntry {
            url: record.url.clone(),
            status: record.response_status,
            method: record.method.clone(),
            size,
            content_type: record.content_type,
            mime_type: record.mime_type.clone(),
            saved_as: path,
            timestamp: record.observed_at,
        });
    }

    let manifest = ArchiveManifest {
        generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        session_id: session_id.to_owned(),
        total_requests,
        processed_files: items.len(),
        skipped_files: skipped,
        items,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest).map_err(|err| {
        ExportError::Internal(format!(
            "serialize export manifest for session `{session_id}`: {err}"
        ))
    })?;
    append_entry(&mut writer, MANIFEST_FILE_NAME, &manifest_bytes, options)
        .map_err(|err| ExportError::Internal(format!("write archive manifest: {err}")))?;
    let sink = writer
        .finish()
        .map_err(|err| ExportError::Internal(format!("finish archive: {err}")))?;

    Ok(BuiltArchive {
        sink,
        processed: manifest.processed_files,
        skipped,
    })
}

fn append_entry<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    path: &str,
    bytes: &[u8],
    options: FileOptions,
) -> ZipResult<()> {
    writer.start_file(path, options)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn unique_path(assigned: &mut HashSet<String>, path: String) -> String {
    if assigned.insert(path.clone()) {
        return path;
    }
    let mut counter = 2;
    loop {
        let candidate = splice_before_extension(&path, &format!("_{counter}"));
        if assigned.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}
