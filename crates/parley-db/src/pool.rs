//! SQLite pool for the gateway database.
//!
//! Every gateway process on a host opens the same file: it holds the message
//! history and, with the sqlite presence backend, one row per open
//! connection in the fleet. Connections are tuned for many short write
//! transactions coming from several processes at once.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Pool and per-connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on another process's write lock, in
    /// milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled connections.
    pub pool_max_size: u32,

    /// How long a caller waits for a free pooled connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            acquire_timeout_ms: 10_000,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The path names no file that other gateway processes could open.
    #[error("database path {0:?} is not a shared file")]
    NotAFile(String),

    #[error("failed to create database directory: {0}")]
    Directory(#[from] std::io::Error),

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Opens the gateway database at `db_path`, creating the file and its parent
/// directory if needed.
///
/// # Errors
///
/// `PoolError::NotAFile` for empty or in-memory paths, `PoolError::Directory`
/// if the parent directory cannot be created, and `PoolError::PoolInit` if the
/// first connection cannot be configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if is_private_path(db_path) {
        return Err(PoolError::NotAFile(db_path.to_string()));
    }
    if let Some(parent) = Path::new(db_path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.acquire_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        "opened gateway database"
    );
    Ok(pool)
}

/// In-memory databases are private to one connection.
fn is_private_path(db_path: &str) -> bool {
    db_path.trim().is_empty() || db_path == ":memory:" || db_path.starts_with("file::memory:")
}

/// The busy timeout goes first so that switching to WAL waits out another
/// process doing the same.
fn configure_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;

    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("database refused WAL journal mode, got {journal_mode}")),
        ));
    }

    // WAL keeps NORMAL durable across application crashes.
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(())
}
