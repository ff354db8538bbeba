//! Translation history: a bounded, append-only log of (original, translation)
//! pairs for operator review. Duplicates are kept; only the newest
//! `MAX_HISTORY` entries survive.
//!
//! Reads come from the in-memory deque. Writes are buffered in a channel and
//! flushed to SQLite every 300ms so the rendering path never waits on disk.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};

pub const MAX_HISTORY: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("history IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub original: String,
    pub translation: String,
}

enum HistoryOp {
    Append(HistoryEntry),
    Flush(oneshot::Sender<()>),
}

pub struct HistoryLog {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    tx: Option<mpsc::UnboundedSender<HistoryOp>>,
    bus: Arc<EventBus>,
}

impl HistoryLog {
    /// Open (or create) the history database, load the newest entries, and
    /// start the background flush loop. Must be called inside a Tokio runtime.
    pub fn open(db_path: &Path, bus: Arc<EventBus>) -> Result<Arc<Self>, HistoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original TEXT NOT NULL,
                translation TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );",
        )?;

        let entries = load_recent(&conn, MAX_HISTORY)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(rx, conn, MAX_HISTORY));

        info!(path = %db_path.display(), loaded = entries.len(), "history log opened");

        Ok(Arc::new(Self {
            entries: Mutex::new(entries),
            capacity: MAX_HISTORY,
            tx: Some(tx),
            bus,
        }))
    }

    /// History kept only in memory (used when the database is unavailable).
    pub fn in_memory(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: MAX_HISTORY,
            tx: None,
            bus,
        })
    }

    /// Append an entry, drop the oldest beyond the cap, and announce the
    /// change. Entries with an empty side are ignored.
    pub fn append(&self, original: &str, translation: &str) -> bool {
        if original.trim().is_empty() || translation.trim().is_empty() {
            return false;
        }
        let entry = HistoryEntry {
            original: original.to_string(),
            translation: translation.to_string(),
        };

        let len = {
            let mut entries = self.entries.lock();
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
            entries.len()
        };

        if let Some(tx) = &self.tx {
            if tx.send(HistoryOp::Append(entry)).is_err() {
                warn!("history writer stopped, entry kept in memory only");
            }
        }
        self.bus.publish(Event::HistoryUpdated { len });
        true
    }

    /// All entries, oldest first.
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wait until everything appended so far has been written.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(HistoryOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn load_recent(conn: &Connection, limit: usize) -> Result<VecDeque<HistoryEntry>, HistoryError> {
    let mut stmt = conn.prepare(
        "SELECT original, translation FROM (
             SELECT id, original, translation FROM history ORDER BY id DESC LIMIT ?1
         ) ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok(HistoryEntry {
            original: row.get(0)?,
            translation: row.get(1)?,
        })
    })?;
    let mut entries = VecDeque::with_capacity(limit);
    for row in rows {
        entries.push_back(row?);
    }
    Ok(entries)
}

/// Background flush loop: collects appends from the channel and
/// batch-inserts them every 300ms. Flush requests are answered after the
/// batch they follow has been written.
async fn flush_loop(mut rx: mpsc::UnboundedReceiver<HistoryOp>, conn: Connection, capacity: usize) {
    let mut buffer: Vec<HistoryEntry> = Vec::with_capacity(32);
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let mut closed = false;
        tokio::select! {
            _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
            op = rx.recv() => match op {
                Some(op) => take_op(op, &mut buffer, &mut waiters),
                None => closed = true,
            }
        }

        while let Ok(op) = rx.try_recv() {
            take_op(op, &mut buffer, &mut waiters);
        }

        if !buffer.is_empty() {
            flush_batch(&conn, &buffer, capacity);
            buffer.clear();
        }
        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }

        if closed {
            info!("history flush loop exiting (channel closed)");
            return;
        }
    }
}

fn take_op(op: HistoryOp, buffer: &mut Vec<HistoryEntry>, waiters: &mut Vec<oneshot::Sender<()>>) {
    match op {
        HistoryOp::Append(entry) => buffer.push(entry),
        HistoryOp::Flush(done) => waiters.push(done),
    }
}

/// Insert a batch in one transaction, then trim the table to `capacity` rows.
fn flush_batch(conn: &Connection, entries: &[HistoryEntry], capacity: usize) {
    let start = std::time::Instant::now();

    if let Err(e) = conn.execute_batch("BEGIN TRANSACTION") {
        warn!(error = %e, "history batch begin failed");
        return;
    }

    let mut stmt = match conn.prepare_cached(
        "INSERT INTO history (original, translation, created_at) VALUES (?1, ?2, ?3)",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "history batch prepare failed");
            let _ = conn.execute_batch("ROLLBACK");
            return;
        }
    };

    let now = now_unix();
    for entry in entries {
        if let Err(e) = stmt.execute(params![entry.original, entry.translation, now]) {
            warn!(error = %e, "history insert failed");
        }
    }
    drop(stmt);

    if let Err(e) = conn.execute(
        "DELETE FROM history WHERE id <= (
             SELECT id FROM history ORDER BY id DESC LIMIT 1 OFFSET ?1
         )",
        params![capacity as i64],
    ) {
        warn!(error = %e, "history trim failed");
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        warn!(error = %e, "history batch commit failed");
    } else {
        debug!(
            count = entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "history batch flushed"
        );
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;

    #[tokio::test]
    async fn append_and_list_oldest_first() {
        let log = HistoryLog::in_memory(Arc::new(EventBus::default()));
        log.append("一", "one");
        log.append("二", "two");
        log.append("一", "one");
        let list = log.list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].translation, "one");
        assert_eq!(list[1].translation, "two");
        assert_eq!(list[2], list[0]);
    }

    #[tokio::test]
    async fn empty_sides_are_ignored() {
        let log = HistoryLog::in_memory(Arc::new(EventBus::default()));
        assert!(!log.append(" ", "x"));
        assert!(!log.append("x", ""));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn cap_drops_exactly_the_oldest() {
        let log = HistoryLog::in_memory(Arc::new(EventBus::default()));
        for i in 0..MAX_HISTORY + 5 {
            log.append(&format!("src {i}"), &format!("dst {i}"));
        }
        let list = log.list();
        assert_eq!(list.len(), MAX_HISTORY);
        assert_eq!(list[0].original, "src 5");
        assert_eq!(list[MAX_HISTORY - 1].original, format!("src {}", MAX_HISTORY + 4));
        for (i, entry) in list.iter().enumerate() {
            assert_eq!(entry.original, format!("src {}", i + 5));
        }
    }

    #[tokio::test]
    async fn append_publishes_history_updated() {
        let bus = Arc::new(EventBus::default());
        let mut sub = bus.subscribe(Topic::HistoryUpdated);
        let log = HistoryLog::in_memory(Arc::clone(&bus));
        log.append("a", "b");
        assert_eq!(sub.recv().await, Some(Event::HistoryUpdated { len: 1 }));
    }

    #[tokio::test]
    async fn persists_and_trims_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.sqlite3");
        let bus = Arc::new(EventBus::default());
        {
            let log = HistoryLog::open(&path, Arc::clone(&bus)).unwrap();
            for i in 0..MAX_HISTORY + 3 {
                log.append(&format!("src {i}"), &format!("dst {i}"));
            }
            log.flush().await;
        }

        let reopened = HistoryLog::open(&path, bus).unwrap();
        let list = reopened.list();
        assert_eq!(list.len(), MAX_HISTORY);
        assert_eq!(list[0].original, "src 3");
        assert_eq!(list.last().unwrap().original, format!("src {}", MAX_HISTORY + 2));

        let conn = Connection::open(&path).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows as usize, MAX_HISTORY);
    }
}
