//! `SQLite` connection shared by every storage of a factory.
//!
//! One [`DbClient`] owns one connection behind a mutex; storages clone the
//! client and run their statements through [`DbClient::with_conn`], so each
//! statement group is serialized against the others.

use super::StorageError;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a statement waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the store lives, parsed from a `sqlite://` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Parse a connection string.
    ///
    /// - `sqlite://` and `sqlite:///:memory:` are in-memory
    /// - `sqlite:///split.sqlite` is relative to the working directory
    /// - `sqlite:////var/lib/split.sqlite` is absolute
    ///
    /// Query parameters are ignored.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let rest = url
            .strip_prefix("sqlite://")
            .ok_or_else(|| StorageError::UnsupportedUrl(url.to_string()))?;
        let rest = rest.split('?').next().unwrap_or_default();

        if rest.is_empty() {
            return Ok(StoreLocation::Memory);
        }

        match rest.strip_prefix('/') {
            Some(":memory:") => Ok(StoreLocation::Memory),
            Some(path) if !path.is_empty() => Ok(StoreLocation::File(PathBuf::from(path))),
            _ => Err(StorageError::UnsupportedUrl(url.to_string())),
        }
    }
}

/// Client for the local flag store.
#[derive(Clone)]
pub struct DbClient {
    conn: Arc<Mutex<Connection>>,
    location: StoreLocation,
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl DbClient {
    /// Open the store named by a connection string, creating the schema if needed.
    pub fn open(url: &str) -> Result<Self, StorageError> {
        match StoreLocation::parse(url)? {
            StoreLocation::Memory => Self::in_memory(),
            StoreLocation::File(path) => Self::open_path(&path),
        }
    }

    /// Open (or create) a store file.
    pub fn open_path(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::initialize_connection(&conn)?;
        tracing::debug!(path = %path.display(), "opened flag store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: StoreLocation::File(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: StoreLocation::Memory,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        // A panic while holding the lock leaves the connection itself intact.
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        assert_eq!(StoreLocation::parse("sqlite://").unwrap(), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::parse("sqlite:///:memory:").unwrap(),
            StoreLocation::Memory
        );
        assert_eq!(
            StoreLocation::parse("sqlite:///split.sqlite").unwrap(),
            StoreLocation::File(PathBuf::from("split.sqlite"))
        );
        assert_eq!(
            StoreLocation::parse("sqlite:////var/lib/split.sqlite?mode=rw").unwrap(),
            StoreLocation::File(PathBuf::from("/var/lib/split.sqlite"))
        );
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(
            StoreLocation::parse("postgres://localhost/split"),
            Err(StorageError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            StoreLocation::parse("sqlite://remote-host/split.sqlite"),
            Err(StorageError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn test_open_file_creates_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("split.sqlite");
        let url = format!("sqlite:///{}", path.display());

        let db = DbClient::open(&url).unwrap();
        assert_eq!(db.location(), &StoreLocation::File(path.clone()));

        let tables: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'split_%'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 10);

        // Reopening an existing store keeps working.
        assert!(DbClient::open(&url).is_ok());
    }

    #[test]
    fn test_open_missing_directory_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite:///{}/missing/split.sqlite", dir.path().display());
        assert!(matches!(DbClient::open(&url), Err(StorageError::Database(_))));
    }
}
