use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::records::{GenerationRecord, ImageData, NewGeneration};

/// Durable store of generation results, one row per finished generation.
///
/// Records are append-only: nothing updates or deletes a single row, the only
/// destructive operation is [`HistoryStore::clear`]. The store assigns ids and
/// timestamps so callers never fabricate either.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    inner: Arc<HistoryStoreInner>,
}

#[derive(Debug)]
struct HistoryStoreInner {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl HistoryStore {
    /// Open (or create) the store at `path`. Reopening an existing file keeps
    /// its rows.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create history directory {}", parent.display()))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("open history database {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS generations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image BLOB,
                image_mime TEXT,
                secondary_image BLOB,
                secondary_mime TEXT,
                video BLOB,
                text TEXT,
                original_filename TEXT,
                timestamp_ms INTEGER NOT NULL
            )",
            [],
        )
        .context("create generations table")?;
        Ok(Self {
            inner: Arc::new(HistoryStoreInner {
                path,
                conn: Mutex::new(conn),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Persist one generation and return the full record as stored.
    ///
    /// Rejects entries that carry neither an image nor a video; a text-only
    /// refusal is session state, not history.
    pub fn append(&self, new: &NewGeneration) -> Result<GenerationRecord> {
        if new.image.is_none() && new.video.is_none() {
            bail!("history entry must carry an image or a video");
        }
        let timestamp_ms = Utc::now().timestamp_millis();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO generations
                (image, image_mime, secondary_image, secondary_mime,
                 video, text, original_filename, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.image.as_ref().map(|image| image.bytes.as_slice()),
                new.image.as_ref().map(|image| image.mime_type.as_str()),
                new.secondary_image
                    .as_ref()
                    .map(|image| image.bytes.as_slice()),
                new.secondary_image
                    .as_ref()
                    .map(|image| image.mime_type.as_str()),
                new.video.as_deref(),
                new.text.as_deref(),
                new.original_filename.as_deref(),
                timestamp_ms,
            ],
        )
        .context("insert generation record")?;
        let id = conn.last_insert_rowid();
        Ok(GenerationRecord {
            id,
            image: new.image.clone(),
            secondary_image: new.secondary_image.clone(),
            video: new.video.clone(),
            text: new.text.clone(),
            original_filename: new.original_filename.clone(),
            timestamp_ms,
        })
    }

    /// All records, newest first. Rows written within the same millisecond
    /// fall back to id order so the listing stays stable.
    pub fn list_all(&self) -> Result<Vec<GenerationRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, image, image_mime, secondary_image, secondary_mime,
                        video, text, original_filename, timestamp_ms
                 FROM generations
                 ORDER BY timestamp_ms DESC, id DESC",
            )
            .context("prepare history listing")?;
        let rows = stmt
            .query_map([], record_from_row)
            .context("query history listing")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("read history row")?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM generations", [], |row| row.get(0))
            .context("count history rows")
    }

    /// Delete every record. Returns the number of rows removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM generations", [])
            .context("clear history")
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("history store lock poisoned"))
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<GenerationRecord> {
    Ok(GenerationRecord {
        id: row.get(0)?,
        image: image_from_columns(row.get(1)?, row.get(2)?),
        secondary_image: image_from_columns(row.get(3)?, row.get(4)?),
        video: row.get(5)?,
        text: row.get(6)?,
        original_filename: row.get(7)?,
        timestamp_ms: row.get(8)?,
    })
}

fn image_from_columns(bytes: Option<Vec<u8>>, mime_type: Option<String>) -> Option<ImageData> {
    let bytes = bytes?;
    let mime_type = mime_type.unwrap_or_else(|| "application/octet-stream".to_string());
    Some(ImageData::new(bytes, mime_type))
}
