//! Durable translation store backed by SQLite.
//! Source of truth for the cache: entries are written once and never
//! updated or expired. `synchronous=FULL` so a returned insert has landed.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What an insert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// Same value already stored.
    AlreadyPresent,
    /// A different value is already stored; it was kept.
    Conflict { existing: String },
    /// Whitespace-only translations are never stored.
    SkippedEmpty,
}

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(&conn)?;
        info!(path = %db_path.display(), "translation cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A non-persistent database, used when the file cannot be opened.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<(), CacheError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                cache_key BLOB PRIMARY KEY,
                source_text TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &[u8; 32]) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT translated_text FROM translation_cache WHERE cache_key = ?1",
                params![key.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found)
    }

    /// Insert unless the key exists. Existing values are never replaced.
    pub fn insert(
        &self,
        key: &[u8; 32],
        source_text: &str,
        translated_text: &str,
    ) -> Result<StoreOutcome, CacheError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO translation_cache
             (cache_key, source_text, translated_text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.as_slice(), source_text, translated_text, now_unix()],
        )?;
        if inserted == 1 {
            debug!(len = translated_text.len(), "cache entry written");
            return Ok(StoreOutcome::Inserted);
        }

        let existing: String = conn.query_row(
            "SELECT translated_text FROM translation_cache WHERE cache_key = ?1",
            params![key.as_slice()],
            |row| row.get(0),
        )?;
        if existing == translated_text {
            Ok(StoreOutcome::AlreadyPresent)
        } else {
            Ok(StoreOutcome::Conflict { existing })
        }
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM translation_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
