//! Local flag store.
//!
//! Everything the factory reads or queues lives in one `SQLite` database:
//! split definitions and the change number they were exported at, segment
//! membership, and the impression/event/telemetry queues waiting to be
//! flushed.

pub mod adapter;
pub mod sql;

use thiserror::Error;

pub use adapter::{DbClient, StoreLocation};
pub use sql::{
    SqlEventStorage, SqlImpressionStorage, SqlMySegmentsStorage, SqlSegmentStorage,
    SqlSplitStorage, SqlTelemetryStorage, TableFullHook, MAX_LATENCY_BUCKET,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record could not be (de)serialized.
    #[error("stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection string does not name a `SQLite` store.
    #[error("unsupported connection string: {0}")]
    UnsupportedUrl(String),
}
