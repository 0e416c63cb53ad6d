use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};

use crate::{classify::ContentTypeTag, config::Config};

const SCHEMA_VERSION: i32 = 1;

pub type Headers = BTreeMap<String, String>;

/// Normalized record of one request/response pair observed in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    pub exchange_id: String,
    pub session_id: String,
    pub resource_type: String,
    pub method: String,
    pub url: String,
    pub request_headers: Headers,
    pub request_body: Option<String>,
    /// `false` while the request fields are placeholders for a missed start.
    pub request_observed: bool,
    pub response_status: Option<u16>,
    pub response_status_text: Option<String>,
    pub response_headers: Option<Headers>,
    pub mime_type: Option<String>,
    pub content_type: ContentTypeTag,
    pub encoded_body_size: Option<u64>,
    pub body: Option<String>,
    pub body_is_binary: Option<bool>,
    pub observed_at: f64,
}

impl CapturedExchange {
    /// Raw bytes of the captured body, base64-decoded when it was captured as
    /// binary. `Ok(None)` when no body was retrieved.
    pub fn body_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(body) = self.body.as_deref() else {
            return Ok(None);
        };
        if self.body_is_binary.unwrap_or(false) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(body)
                .with_context(|| format!("decode base64 body of exchange `{}`", self.exchange_id))?;
            Ok(Some(bytes))
        } else {
            Ok(Some(body.as_bytes().to_vec()))
        }
    }

    /// Milliseconds form of `observed_at`, used where an integer stamp is needed.
    pub fn observed_at_ms(&self) -> i64 {
        (self.observed_at * 1000.0).round() as i64
    }
}

/// Record of a body written to disk outside of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    pub file_id: String,
    pub session_id: String,
    pub exchange_id: String,
    pub domain: String,
    pub filename: String,
    pub saved_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub exchange_count: usize,
}

/// Keyed exchange collection the capture and export paths are written against.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Inserts the record or replaces the one with the same session and id.
    async fn upsert(&self, exchange: &CapturedExchange) -> anyhow::Result<()>;

    async fn get_all_by_session(&self, session_id: &str) -> anyhow::Result<Vec<CapturedExchange>>;

    /// Removes every record of the session and returns how many were removed.
    async fn delete_all_by_session(&self, session_id: &str) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

impl Storage {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(config.database_path())
    }

    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn upsert_exchange(&self, exchange: CapturedExchange) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || upsert_exchange_blocking(&db_path, &exchange))
            .await
            .context("join upsert_exchange task")?
    }

    pub async fn get_exchanges_by_session(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<CapturedExchange>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_owned();
        tokio::task::spawn_blocking(move || get_exchanges_by_session_blocking(&db_path, &session_id))
            .await
            .context("join get_exchanges_by_session task")?
    }

    pub async fn delete_session(&self, session_id: &str) -> anyhow::Result<usize> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_owned();
        tokio::task::spawn_blocking(move || delete_session_blocking(&db_path, &session_id))
            .await
            .context("join delete_session task")?
    }

    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || list_sessions_blocking(&db_path))
            .await
            .context("join list_sessions task")?
    }

    pub async fn record_saved_file(&self, saved_file: SavedFile) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || record_saved_file_blocking(&db_path, &saved_file))
            .await
            .context("join record_saved_file task")?
    }

    pub async fn list_saved_files(&self, session_id: &str) -> anyhow::Result<Vec<SavedFile>> {
        let db_path = self.db_path.clone();
        let session_id = session_id.to_owned();
        tokio::task::spawn_blocking(move || list_saved_files_blocking(&db_path, &session_id))
            .await
            .context("join list_saved_files task")?
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeStore for Storage {
    async fn upsert(&self, exchange: &CapturedExchange) -> anyhow::Result<()> {
        self.upsert_exchange(exchange.clone()).await
    }

    async fn get_all_by_session(&self, session_id: &str) -> anyhow::Result<Vec<CapturedExchange>> {
        self.get_exchanges_by_session(session_id).await
    }

    async fn delete_all_by_session(&self, session_id: &str) -> anyhow::Result<usize> {
        self.delete_session(session_id).await
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS exchanges (
                  session_id TEXT NOT NULL,
                  exchange_id TEXT NOT NULL,
                  resource_type TEXT NOT NULL,
                  method TEXT NOT NULL,
                  url TEXT NOT NULL,
                  request_headers_json TEXT NOT NULL,
                  request_body TEXT,
                  request_observed INTEGER NOT NULL,
                  response_status INTEGER,
                  response_status_text TEXT,
                  response_headers_json TEXT,
                  mime_type TEXT,
                  content_type TEXT NOT NULL,
                  encoded_body_size INTEGER,
                  body TEXT,
                  body_is_binary INTEGER,
                  observed_at REAL NOT NULL,
                  PRIMARY KEY (session_id, exchange_id)
                );

                CREATE INDEX IF NOT EXISTS exchanges_session_observed_idx
                  ON exchanges(session_id, observed_at);
                CREATE INDEX IF NOT EXISTS exchanges_content_type_idx
                  ON exchanges(content_type);

                CREATE TABLE IF NOT EXISTS saved_files (
                  file_id TEXT PRIMARY KEY,
                  session_id TEXT NOT NULL,
                  exchange_id TEXT NOT NULL,
                  domain TEXT NOT NULL,
                  filename TEXT NOT NULL,
                  saved_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS saved_files_exchange_idx
                  ON saved_files(session_id, exchange_id);
                CREATE INDEX IF NOT EXISTS saved_files_domain_idx ON saved_files(domain);
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported capture database schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn upsert_exchange_blocking(path: &Path, exchange: &CapturedExchange) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    let request_headers_json =
        serde_json::to_string(&exchange.request_headers).context("serialize request headers")?;
    let response_headers_json = exchange
        .response_headers
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("serialize response headers")?;
    let encoded_body_size = exchange
        .encoded_body_size
        .map(i64::try_from)
        .transpose()
        .context("encoded body size exceeds sqlite range")?;

    conn.execute(
        r#"
        INSERT INTO exchanges (
          session_id,
          exchange_id,
          resource_type,
          method,
          url,
          request_headers_json,
          request_body,
          request_observed,
          response_status,
          response_status_text,
          response_headers_json,
          mime_type,
          content_type,
          encoded_body_size,
          body,
          body_is_binary,
          observed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(session_id, exchange_id) DO UPDATE SET
          resource_type = excluded.resource_type,
          method = excluded.method,
          url = excluded.url,
          request_headers_json = excluded.request_headers_json,
          request_body = excluded.request_body,
          request_observed = excluded.request_observed,
          response_status = excluded.response_status,
          response_status_text = excluded.response_status_text,
          response_headers_json = excluded.response_headers_json,
          mime_type = excluded.mime_type,
          content_type = excluded.content_type,
          encoded_body_size = excluded.encoded_body_size,
          body = excluded.body,
          body_is_binary = excluded.body_is_binary,
          observed_at = excluded.observed_at
        "#,
        params![
            exchange.session_id,
            exchange.exchange_id,
            exchange.resource_type,
            exchange.method,
            exchange.url,
            request_headers_json,
            exchange.request_body,
            exchange.request_observed,
            exchange.response_status.map(i64::from),
            exchange.response_status_text,
            response_headers_json,
            exchange.mime_type,
            exchange.content_type.as_str(),
            encoded_body_size,
            exchange.body,
            exchange.body_is_binary,
            exchange.observed_at,
        ],
    )
    .with_context(|| format!("upsert exchange `{}`", exchange.exchange_id))?;

    Ok(())
}

fn deserialize_exchange(row: &rusqlite::Row<'_>) -> anyhow::Result<CapturedExchange> {
    let session_id = row.get::<_, String>(0).context("deserialize session_id")?;
    let exchange_id = row.get::<_, String>(1).context("deserialize exchange_id")?;
    let resource_type = row
        .get::<_, String>(2)
        .context("deserialize resource_type")?;
    let method = row.get::<_, String>(3).context("deserialize method")?;
    let url = row.get::<_, String>(4).context("deserialize url")?;
    let request_headers_json = row
        .get::<_, String>(5)
        .context("deserialize request_headers_json")?;
    let request_body = row
        .get::<_, Option<String>>(6)
        .context("deserialize request_body")?;
    let request_observed = row
        .get::<_, bool>(7)
        .context("deserialize request_observed")?;
    let response_status = row
        .get::<_, Option<i64>>(8)
        .context("deserialize response_status")?;
    let response_status_text = row
        .get::<_, Option<String>>(9)
        .context("deserialize response_status_text")?;
    let response_headers_json = row
        .get::<_, Option<String>>(10)
        .context("deserialize response_headers_json")?;
    let mime_type = row
        .get::<_, Option<String>>(11)
        .context("deserialize mime_type")?;
    let content_type = row
        .get::<_, String>(12)
        .context("deserialize content_type")?;
    let encoded_body_size = row
        .get::<_, Option<i64>>(13)
        .context("deserialize encoded_body_size")?;
    let body = row.get::<_, Option<String>>(14).context("deserialize body")?;
    let body_is_binary = row
        .get::<_, Option<bool>>(15)
        .context("deserialize body_is_binary")?;
    let observed_at = row.get::<_, f64>(16).context("deserialize observed_at")?;

    let request_headers: Headers =
        serde_json::from_str(&request_headers_json).context("deserialize request headers")?;
    let response_headers = response_headers_json
        .as_deref()
        .map(|json| serde_json::from_str::<Headers>(json))
        .transpose()
        .context("deserialize response headers")?;

    Ok(CapturedExchange {
        exchange_id,
        session_id,
        resource_type,
        method,
        url,
        request_headers,
        request_body,
        request_observed,
        response_status: response_status
            .map(u16::try_from)
            .transpose()
            .context("deserialize response_status")?,
        response_status_text,
        response_headers,
        mime_type,
        content_type: content_type
            .parse::<ContentTypeTag>()
            .context("deserialize content_type")?,
        encoded_body_size: encoded_body_size
            .map(u64::try_from)
            .transpose()
            .context("deserialize encoded_body_size")?,
        body,
        body_is_binary,
        observed_at,
    })
}

fn get_exchanges_by_session_blocking(
    path: &Path,
    session_id: &str,
) -> anyhow::Result<Vec<CapturedExchange>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
              session_id,
              exchange_id,
              resource_type,
              method,
              url,
              request_headers_json,
              request_body,
              request_observed,
              response_status,
              response_status_text,
              response_headers_json,
              mime_type,
              content_type,
              encoded_body_size,
              body,
              body_is_binary,
              observed_at
            FROM exchanges
            WHERE session_id = ?1
            ORDER BY observed_at ASC, exchange_id ASC
            "#,
        )
        .context("prepare select exchanges by session")?;

    let mut rows = stmt
        .query(params![session_id])
        .context("query exchanges by session")?;

    let mut exchanges = Vec::new();
    while let Some(row) = rows.next().context("iterate exchanges by session")? {
        exchanges.push(deserialize_exchange(row)?);
    }
    Ok(exchanges)
}

fn delete_session_blocking(path: &Path, session_id: &str) -> anyhow::Result<usize> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction()
        .context("begin delete session transaction")?;
    tx.execute(
        "DELETE FROM saved_files WHERE session_id = ?1",
        params![session_id],
    )
    .context("delete saved files by session")?;
    let deleted = tx
        .execute(
            "DELETE FROM exchanges WHERE session_id = ?1",
            params![session_id],
        )
        .context("delete exchanges by session")?;
    tx.commit().context("commit delete session transaction")?;
    Ok(deleted)
}

fn list_sessions_blocking(path: &Path) -> anyhow::Result<Vec<SessionSummary>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT session_id, COUNT(*)
            FROM exchanges
            GROUP BY session_id
            ORDER BY session_id ASC
            "#,
        )
        .context("prepare list sessions")?;

    let mut rows = stmt.query([]).context("query list sessions")?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next().context("iterate list sessions")? {
        let session_id = row.get::<_, String>(0).context("deserialize session_id")?;
        let count = row.get::<_, i64>(1).context("deserialize exchange count")?;
        sessions.push(SessionSummary {
            session_id,
            exchange_count: usize::try_from(count).context("deserialize exchange count")?,
        });
    }
    Ok(sessions)
}

fn record_saved_file_blocking(path: &Path, saved_file: &SavedFile) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO saved_files (
          file_id,
          session_id,
          exchange_id,
          domain,
          filename,
          saved_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            saved_file.file_id,
            saved_file.session_id,
            saved_file.exchange_id,
            saved_file.domain,
            saved_file.filename,
            saved_file.saved_at,
        ],
    )
    .with_context(|| format!("record saved file `{}`", saved_file.file_id))?;
    Ok(())
}

fn list_saved_files_blocking(path: &Path, session_id: &str) -> anyhow::Result<Vec<SavedFile>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT file_id, session_id, exchange_id, domain, filename, saved_at
            FROM saved_files
            WHERE session_id = ?1
            ORDER BY saved_at ASC, file_id ASC
            "#,
        )
        .context("prepare list saved files")?;

    let mut rows = stmt
        .query(params![session_id])
        .context("query list saved files")?;
    let mut saved_files = Vec::new();
    while let Some(row) = rows.next().context("iterate list saved files")? {
        saved_files.push(SavedFile {
            file_id: row.get(0).context("deserialize file_id")?,
            session_id: row.get(1).context("deserialize session_id")?,
            exchange_id: row.get(2).context("deserialize exchange_id")?,
            domain: row.get(3).context("deserialize domain")?,
            filename: row.get(4).context("deserialize filename")?,
            saved_at: row.get(5).context("deserialize saved_at")?,
        });
    }
    Ok(saved_files)
}
