//! SQLite-backed persistent store.
//!
//! One writer connection (WAL, busy_timeout 5000 ms, synchronous NORMAL,
//! foreign keys on) serializes all mutation behind a mutex; a small pool of
//! read-only connections serves queries without ever blocking the writer.

pub mod artifacts;
pub mod cursors;
pub mod issues;
pub mod jobs;
mod schema;
pub mod sessions;

use mender_core::job::JobState;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use uuid::Uuid;

const READER_POOL_SIZE: usize = 4;
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Errors surfaced by store operations. `Sqlite` wraps everything the engine
/// reports; the rest are the typed conditions callers branch on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
    #[error("ambiguous job id prefix {0:?}")]
    AmbiguousId(String),
    #[error("job field {0:?} is not updatable")]
    InvalidField(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read/write access to the job database. Cheap to share behind an `Arc`;
/// all methods take `&self`.
pub struct Store {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Store> {
        let writer = Connection::open(path)?;
        configure_connection(&writer, false)?;
        schema::create_schema(&writer)?;

        let mut readers = Vec::with_capacity(READER_POOL_SIZE);
        for _ in 0..READER_POOL_SIZE {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            configure_connection(&conn, true)?;
            readers.push(Mutex::new(conn));
        }

        Ok(Store {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_writer<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        f(&conn)
    }

    pub(crate) fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock().expect("reader mutex poisoned");
        f(&conn)
    }
}

fn configure_connection(conn: &Connection, read_only: bool) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if !read_only {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    // Millisecond precision keeps same-second rows ordered sensibly.
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Opaque id: short prefix + 128 random bits as lowercase hex.
fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

pub(crate) fn new_issue_id() -> String {
    new_id("mnd-")
}

pub(crate) fn new_job_id() -> String {
    new_id("mnd-job-")
}

pub(crate) fn new_session_id() -> String {
    new_id("mnd-sess-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_format() {
        let id = new_issue_id();
        assert!(id.starts_with("mnd-"));
        let hex = &id["mnd-".len()..];
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(new_issue_id(), new_issue_id());
    }

    #[test]
    fn open_creates_schema_and_wal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("mender.db")).unwrap();
        store
            .with_writer(|conn| {
                let mode: String =
                    conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
                assert_eq!(mode, "wal");
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('issues','jobs','sessions','artifacts','sync_cursors')",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(n, 5);
                Ok(())
            })
            .unwrap();
    }
}
