//! # vecstore-core
//!
//! Embeddable vector search algorithms: HNSW approximate nearest neighbor
//! search, BM25 full-text search, and hybrid fusion of the two.
//!
//! This is the core library crate with zero async dependencies. The `vecstore`
//! crate layers durable storage, a write-ahead log and locking on top of it.

/// BM25 full-text search: inverted index, Okapi BM25 scoring, and pluggable tokenizer.
pub mod bm25;
/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Core document types: `Document` struct and `MetadataValue` enum.
pub mod document;
/// Error type for distance functions and index snapshots.
pub mod error;
/// Filter types used by search and storage layers.
pub mod filter_types;
/// HNSW approximate nearest neighbor index: graph structure, search, insertion, deletion and distance metrics.
pub mod hnsw;
/// Search primitives: scored results, metadata filtering, and hybrid fusion strategies.
pub mod search;

pub use document::{Document, Metadata, MetadataValue};
pub use error::VectorError;
pub use filter_types::{FilterClause, FilterCondition, FilterOperator};
