//! Error types for the durable store

use std::path::PathBuf;

use thiserror::Error;

use crate::Bucket;

/// Result type for store operations
pub type DbResult<T> = Result<T, DbError>;

/// Durable store errors
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying rocksdb failure
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Filesystem failure while exporting or restoring
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A bucket the store expects is missing
    #[error("bucket '{}' not found", .0.name())]
    MissingBucket(Bucket),

    /// Metadata value could not be (de)serialized
    #[error("metadata '{key}' is malformed: {source}")]
    Metadata {
        /// Key of the offending value
        key: String,
        /// Serialization failure
        source: serde_json::Error,
    },

    /// Stored integer value has the wrong width
    #[error("value for '{0}' is not an 8 byte integer")]
    BadInteger(String),

    /// Snapshot path is not usable
    #[error("invalid snapshot location {}: {reason}", path.display())]
    InvalidSnapshot {
        /// Offending path
        path: PathBuf,
        /// Why it was rejected
        reason: String,
    },

    /// No store exists at the path
    #[error("no store at {}", .0.display())]
    Missing(PathBuf),
}
