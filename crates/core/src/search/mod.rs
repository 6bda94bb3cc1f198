//! Search primitives: scored ids, metadata filtering, and hybrid fusion.
//!
//! This module provides the building blocks for combining vector search and
//! keyword search results and applying metadata filters.

/// Metadata filtering predicates for search queries.
pub mod filter;
/// Hybrid fusion strategies: Reciprocal Rank Fusion (RRF) and weighted combination.
pub mod hybrid;
/// Scored id types.
pub mod types;

pub use filter::matches_filter;
pub use hybrid::{rrf_fusion, weighted_fusion, FusionMethod, WeightedFusion};
pub use types::{FusedHit, ScoredId};
