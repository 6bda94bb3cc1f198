//! Error type shared by the core algorithms.

use thiserror::Error;

/// Errors raised by distance functions and the in-memory indices.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorError {
    /// Two vectors (or a vector and an index) disagree on length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// A vector contains NaN or infinite components.
    #[error("vector contains non-finite values")]
    NonFinite,
    /// The vector has no components.
    #[error("vector is empty")]
    Empty,
    /// A serialized index could not be decoded or failed validation.
    #[error("invalid serialized index: {0}")]
    InvalidSnapshot(String),
}
