//! Database module for session and exchange persistence

mod schema;
pub mod session;

use std::path::Path;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

pub use schema::SCHEMA_VERSION;
pub use session::{Exchange, HistoryEntry, Session, SessionStore, SessionSummary, Stats};

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// How long a writer waits for another process's transaction to finish
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings applied by the pool
fn configure(conn: &mut rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

/// Initialize the database
///
/// Creates parent directories as needed and runs pending migrations.
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(configure);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Storage(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::Storage(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(
        version = SCHEMA_VERSION,
        path = %path.display(),
        "database initialized"
    );
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    // Every in-memory connection is its own database, so the pool holds one
    let manager = SqliteConnectionManager::memory().with_init(configure);
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Storage(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::Storage(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory() {
        let pool = init_memory().unwrap();
        let _conn = pool.get().unwrap();
    }

    #[test]
    fn test_init_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conversations.db");

        let pool = init(&path).unwrap();
        drop(pool);

        assert!(path.exists());
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let pool = init_memory().unwrap();
        let conn = pool.get().unwrap();

        let enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
