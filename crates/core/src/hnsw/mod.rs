//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor index.
//!
//! Vectors are stored as full-precision f32 in a contiguous arena; every
//! distance is exact for the configured metric. Deletes repair the neighbor
//! lists they touch, and [`HnswIndex::compact`] reclaims tombstoned slots.
//!
//! The graph uses a Struct-of-Arrays (SoA) layout: one vector arena, with
//! separate arrays for neighbor lists, layer assignments and tombstones.

/// Node removal with neighbor repair, and compaction.
pub mod delete;
/// Distance metrics: cosine, euclidean, and dot product.
pub mod distance;
/// HNSW graph structure, configuration, and data storage.
pub mod graph;
/// HNSW insertion algorithm with bidirectional connections and heuristic pruning.
pub mod insert;
/// HNSW search: single-layer search, multi-layer KNN, and filtered search.
pub mod search;
/// Serialized (JSON / bincode) form of the graph.
pub mod serialize;
/// Epoch-stamped visited set for graph traversal.
pub mod visited;

pub use distance::{
    cosine_distance, cosine_similarity, dot_product, euclidean_distance, normalize,
    validate_vector, DistanceMetric,
};
pub use graph::{HnswConfig, HnswIndex};
pub use serialize::{SerializedIndex, SerializedNode};
