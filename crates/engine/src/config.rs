//! Runtime configuration for a [`crate::db::VectorDb`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vecstore_core::bm25::Bm25Params;
use vecstore_core::hnsw::{DistanceMetric, HnswConfig};

/// Default dimensions for collections created implicitly via `collection(name)`.
pub const DEFAULT_DIMENSIONS: usize = 384;
/// Persist a collection's index after this many mutations.
pub const DEFAULT_INDEX_SAVE_INTERVAL: usize = 1_000;
/// Resolved WAL entries older than this are purged on open.
pub const DEFAULT_WAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Name of the collection behind the `VectorDb` shortcut methods.
pub const DEFAULT_COLLECTION: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Store directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub default_dimensions: usize,
    pub hnsw: HnswConfig,
    pub bm25: Bm25Params,
    /// How long writers wait for a collection lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Mutations between automatic index snapshots. 0 disables them.
    pub index_save_interval: usize,
    pub wal_retention: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_dimensions: DEFAULT_DIMENSIONS,
            hnsw: HnswConfig::default(),
            bm25: Bm25Params::default(),
            lock_timeout: Some(Duration::from_secs(30)),
            index_save_interval: DEFAULT_INDEX_SAVE_INTERVAL,
            wal_retention: DEFAULT_WAL_RETENTION,
        }
    }
}

impl DbConfig {
    pub fn in_memory(default_dimensions: usize) -> Self {
        Self {
            default_dimensions,
            ..Self::default()
        }
    }

    pub fn persistent(data_dir: impl AsRef<Path>, default_dimensions: usize) -> Self {
        Self {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            default_dimensions,
            ..Self::default()
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some()
    }
}

/// Options for creating a collection. Unset fields fall back to [`DbConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub dimensions: Option<usize>,
    pub metric: Option<DistanceMetric>,
}

impl CollectionOptions {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: Some(dimensions),
            metric: None,
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = Some(metric);
        self
    }
}
