//! Error types for every engine layer, folded into [`DbError`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use vecstore_core::VectorError;

/// Storage adapter failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage is corrupt: {0}")]
    Corrupt(String),
    #[error("storage codec error: {0}")]
    Codec(String),
    #[error("storage is closed")]
    Closed,
    #[error("collection '{0}' already exists")]
    DuplicateCollection(String),
    #[error("collection {0} not found")]
    CollectionNotFound(String),
    #[error("store at '{}' is already open in another handle", .0.display())]
    Locked(PathBuf),
    #[error("document and vector rows disagree: {0}")]
    Mismatch(String),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}

/// Write-ahead log failures.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL codec error: {0}")]
    Codec(String),
    #[error("WAL entry {0} not found")]
    EntryNotFound(String),
    #[error("operation cancelled before it was logged")]
    Cancelled,
    #[error("WAL at '{}' is already open in another handle", .0.display())]
    Locked(PathBuf),
}

impl From<bincode::Error> for WalError {
    fn from(e: bincode::Error) -> Self {
        WalError::Codec(e.to_string())
    }
}

/// Schema migration failures. Fatal at open time.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration versions must be strictly ascending: {previous} then {next}")]
    NotAscending { previous: u32, next: u32 },
    #[error("stored schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("migration {version} ({description}) failed: {reason}")]
    StepFailed {
        version: u32,
        description: String,
        reason: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lock acquisition failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms} ms waiting for lock '{resource}'")]
    Timeout { resource: String, waited_ms: u64 },
    #[error("lock '{0}' is not available")]
    Unavailable(String),
    #[error("lock request for '{0}' was aborted")]
    Aborted(String),
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Transport proxy failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database worker is gone")]
    Disconnected,
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
    #[error("unexpected response for request {0}")]
    UnexpectedResponse(u64),
}

/// Input rejected before any durable write.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error("document id must not be empty")]
    EmptyId,
    #[error("{what} exceeds the limit of {limit}")]
    TooLong { what: &'static str, limit: usize },
    #[error("invalid collection name '{0}'")]
    InvalidCollectionName(String),
    #[error("dimensions must be between 1 and {max}, got {actual}")]
    InvalidDimensions { actual: usize, max: usize },
    #[error("k must be between 1 and {max}, got {actual}")]
    InvalidK { actual: usize, max: usize },
    #[error("batch of {actual} documents exceeds the limit of {max}")]
    BatchTooLarge { actual: usize, max: usize },
    #[error("malformed input: {0}")]
    Malformed(String),
}

/// Top-level error returned by the [`crate::db::VectorDb`] facade.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Wal(WalError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("document '{0}' not found")]
    DocumentNotFound(String),
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("database is closed")]
    Closed,
}

impl From<WalError> for DbError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Cancelled => DbError::Cancelled,
            other => DbError::Wal(other),
        }
    }
}

impl From<VectorError> for DbError {
    fn from(e: VectorError) -> Self {
        DbError::Validation(ValidationError::Vector(e))
    }
}

impl DbError {
    /// Stable short name of the error kind, used on the transport wire.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Validation(_) => "validation",
            DbError::Storage(_) => "storage",
            DbError::Wal(_) => "wal",
            DbError::Migration(_) => "migration",
            DbError::Lock(LockError::Timeout { .. }) => "lock_timeout",
            DbError::Lock(_) => "lock",
            DbError::Sync(_) => "sync",
            DbError::DocumentNotFound(_) => "document_not_found",
            DbError::CollectionNotFound(_) => "collection_not_found",
            DbError::Cancelled => "cancelled",
            DbError::Closed => "closed",
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;
