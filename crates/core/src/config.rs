//! Global configuration constants for vecstore.
//!
//! All tuning parameters and input validation limits are defined here.
//! These are compile-time constants; runtime configuration is handled by
//! `DbConfig` in the engine crate and by CLI arguments in the `vecstore` binary.

/// BM25 Okapi term frequency saturation parameter.
///
/// Controls how quickly term frequency saturates. Higher values allow TF to grow more.
/// Typical range: 1.2–2.0.
pub const BM25_K1: f32 = 1.5;

/// BM25 Okapi document length normalization parameter.
///
/// Controls the impact of document length on scoring. 0.0 = no normalization,
/// 1.0 = full normalization. Standard value is 0.75.
pub const BM25_B: f32 = 0.75;

/// Tokens shorter than this many characters are dropped by the default tokenizer.
pub const BM25_MIN_TOKEN_LEN: usize = 2;

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64. Default: 16.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
///
/// Controls the size of the dynamic candidate list during insertion.
/// Higher values produce a better graph but slow down build time.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
///
/// Controls the size of the dynamic candidate list during query.
/// Higher values improve recall at the cost of latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Default seed for the HNSW level generator.
pub const HNSW_DEFAULT_SEED: u64 = 0x5EED_2024;

/// Reciprocal Rank Fusion (RRF) constant `k`.
///
/// Used in the formula `1 / (k + rank)` to combine ranked lists.
/// Standard value is 60.0 (from the original RRF paper).
pub const RRF_K: f32 = 60.0;

/// Default vector weight for weighted hybrid fusion.
pub const HYBRID_DEFAULT_VECTOR_WEIGHT: f32 = 0.5;

/// Default keyword weight for weighted hybrid fusion.
pub const HYBRID_DEFAULT_KEYWORD_WEIGHT: f32 = 0.5;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// Maximum length of a collection name in characters.
pub const MAX_COLLECTION_NAME_LEN: usize = 128;

/// Maximum length of a document id in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 512;

/// Maximum length of document text in bytes.
pub const MAX_TEXT_LEN: usize = 1_000_000;

/// Maximum number of documents per batch insert request.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum number of metadata keys per document.
pub const MAX_METADATA_KEYS: usize = 64;
