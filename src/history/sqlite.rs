//! SQLite history backend
//!
//! One row per download in `downloads`, plus a `visits` table that backs
//! the referrer check. WAL mode keeps the file consistent across crashes.
//! Timestamps are stored as microseconds since the Unix epoch.

use super::{today_midnight, DownloadHistory};
use crate::error::{EngineError, Result};
use crate::protocol::{DownloadState, PersistentStoreInfo, StoreHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

/// SQLite-backed [`DownloadHistory`]
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory").finish_non_exhaustive()
    }
}

impl SqliteHistory {
    /// Open (or create) the database at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    EngineError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| EngineError::Database(format!("Failed to initialize database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| {
            EngineError::Database(format!("Failed to create in-memory database: {}", e))
        })??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record a page visit used by referrer checks
    pub async fn record_visit(&self, url: &Url, at: DateTime<Utc>) -> Result<()> {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Ok(());
        };
        let url = url.to_string();
        self.blocking("record visit", move |conn| {
            conn.execute(
                "INSERT INTO visits (url, host, visit_time) VALUES (?1, ?2, ?3)",
                params![url, host, to_micros(at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| EngineError::Database(format!("Failed to {}: {}", what, e)))?
    }
}

const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    full_path TEXT NOT NULL,
    url TEXT NOT NULL,
    referrer TEXT,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    received_bytes INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL,
    state TEXT NOT NULL,
    opened INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    visit_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_downloads_start ON downloads(start_time);
CREATE INDEX IF NOT EXISTS idx_visits_host ON visits(host);
"#;

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`] using
/// `PRAGMA user_version`. Running it on a current database does nothing.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap_or_default(),
        CURRENT_SCHEMA_VERSION
    );
    Ok(())
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn row_to_info(row: &Row<'_>) -> rusqlite::Result<PersistentStoreInfo> {
    let id: i64 = row.get(0)?;
    let path: String = row.get(1)?;
    let url: String = row.get(2)?;
    let referrer: Option<String> = row.get(3)?;
    let start_time: i64 = row.get(4)?;
    let end_time: Option<i64> = row.get(5)?;
    let state: String = row.get(8)?;

    let url = Url::parse(&url).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    // An unknown state can only come from a damaged row; treat it as cancelled
    let state = DownloadState::parse(&state).unwrap_or(DownloadState::Cancelled);

    Ok(PersistentStoreInfo {
        path: PathBuf::from(path),
        url,
        referrer_url: referrer.and_then(|r| Url::parse(&r).ok()),
        start_time: from_micros(start_time),
        end_time: end_time.map(from_micros),
        received_bytes: row.get(6)?,
        total_bytes: row.get(7)?,
        state,
        db_handle: StoreHandle::new(id),
        opened: row.get::<_, i64>(9)? != 0,
    })
}

#[async_trait]
impl DownloadHistory for SqliteHistory {
    async fn add_entry(&self, info: &PersistentStoreInfo) -> Result<StoreHandle> {
        let info = info.clone();
        self.blocking("add history entry", move |conn| {
            conn.execute(
                r#"
                INSERT INTO downloads (
                    full_path, url, referrer, start_time, end_time,
                    received_bytes, total_bytes, state, opened
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    info.path.to_string_lossy().to_string(),
                    info.url.as_str(),
                    info.referrer_url.as_ref().map(Url::as_str),
                    to_micros(info.start_time),
                    info.end_time.map(to_micros),
                    info.received_bytes,
                    info.total_bytes,
                    info.state.as_str(),
                    info.opened as i64,
                ],
            )?;
            Ok(StoreHandle::new(conn.last_insert_rowid()))
        })
        .await
    }

    async fn update_entry(&self, info: &PersistentStoreInfo) -> Result<()> {
        let info = info.clone();
        self.blocking("update history entry", move |conn| {
            let changed = conn.execute(
                r#"
                UPDATE downloads
                SET received_bytes = ?1, total_bytes = ?2, state = ?3, end_time = ?4, opened = ?5
                WHERE id = ?6
                "#,
                params![
                    info.received_bytes,
                    info.total_bytes,
                    info.state.as_str(),
                    info.end_time.map(to_micros),
                    info.opened as i64,
                    info.db_handle.raw(),
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!(
                    "history entry {}",
                    info.db_handle
                )));
            }
            Ok(())
        })
        .await
    }

    async fn update_download_path(&self, handle: StoreHandle, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().to_string();
        self.blocking("update history path", move |conn| {
            conn.execute(
                "UPDATE downloads SET full_path = ?1 WHERE id = ?2",
                params![path, handle.raw()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_entry(&self, handle: StoreHandle) -> Result<()> {
        self.blocking("remove history entry", move |conn| {
            conn.execute("DELETE FROM downloads WHERE id = ?1", params![handle.raw()])?;
            Ok(())
        })
        .await
    }

    async fn remove_entries_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let begin = begin.map(to_micros).unwrap_or(i64::MIN);
        let end = end.map(to_micros).unwrap_or(i64::MAX);
        self.blocking("remove history entries", move |conn| {
            let removed = conn.execute(
                r#"
                DELETE FROM downloads
                WHERE start_time >= ?1 AND start_time < ?2 AND state != ?3
                "#,
                params![begin, end, DownloadState::InProgress.as_str()],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn query_all(&self) -> Result<Vec<PersistentStoreInfo>> {
        self.blocking("load download history", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, full_path, url, referrer, start_time, end_time,
                       received_bytes, total_bytes, state, opened
                FROM downloads
                ORDER BY start_time ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_info(row) {
                    Ok(info) => results.push(info),
                    Err(e) => tracing::warn!("Skipping unreadable history row: {}", e),
                }
            }
            Ok(results)
        })
        .await
    }

    async fn check_visited_referrer_before(&self, referrer: &Url) -> Result<bool> {
        let Some(host) = referrer.host_str().map(str::to_ascii_lowercase) else {
            return Ok(false);
        };
        let midnight = to_micros(today_midnight());
        self.blocking("check referrer", move |conn| {
            let visited: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM visits WHERE host = ?1 AND visit_time < ?2",
                params![host, midnight],
                |row| row.get(0),
            )?;
            Ok(visited)
        })
        .await
    }
}
