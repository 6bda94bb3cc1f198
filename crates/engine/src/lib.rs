//! # vecstore
//!
//! Embedded vector database built on `vecstore-core`: durable document and
//! vector storage, a write-ahead log with crash replay, versioned schema
//! migrations, cross-process locking, and a [`VectorDb`] facade exposing
//! collection CRUD with vector, keyword and hybrid search. [`transport`]
//! runs the facade on its own thread behind a message-passing proxy.

/// Runtime configuration: `DbConfig` and collection options.
pub mod config;
/// The `VectorDb` facade and collection handles.
pub mod db;
/// Error types for every layer, folded into `DbError`.
pub mod error;
/// Length-prefixed, CRC-checked record files and sealed snapshots.
pub mod frame;
/// Shared/exclusive named locks across tasks and processes.
pub mod lock;
/// Versioned schema migrations.
pub mod migration;
/// Storage adapter trait with in-memory and file-backed implementations.
pub mod storage;
/// Worker thread and message-passing proxy.
pub mod transport;
/// Write-ahead log: entries, replay and transactions.
pub mod wal;

pub use config::{CollectionOptions, DbConfig};
pub use db::{
    Collection, CollectionStats, DbStats, DocumentUpdate, HybridQuery, HybridResult,
    SearchOptions, SearchResult, VectorDb,
};
pub use error::{DbError, DbResult};
pub use vecstore_core::{Document, FilterClause, FilterCondition, FilterOperator, Metadata, MetadataValue};
