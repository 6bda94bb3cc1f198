//! Portable single-blob export of one collection.
//!
//! Layout: bincode [`CollectionExport`] followed by the `VSX1` magic and a
//! CRC32 (big-endian) of the payload.

use crate::error::StorageError;
use crate::frame;
use crate::storage::{CollectionRecord, StoredDocument, StoredVector};
use serde::{Deserialize, Serialize};

const EXPORT_MAGIC: &[u8; 4] = b"VSX1";
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionExport {
    pub format_version: u32,
    pub collection: CollectionRecord,
    pub documents: Vec<StoredDocument>,
    pub vectors: Vec<StoredVector>,
    /// Serialized HNSW index, if one had been persisted.
    pub index: Option<Vec<u8>>,
}

impl CollectionExport {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let payload = bincode::serialize(self)?;
        Ok(frame::seal(&payload, EXPORT_MAGIC))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let payload = frame::unseal(bytes, EXPORT_MAGIC).map_err(StorageError::Corrupt)?;
        let export: CollectionExport = bincode::deserialize(payload)?;
        if export.format_version != EXPORT_FORMAT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported export format version {}",
                export.format_version
            )));
        }
        if export.documents.len() != export.vectors.len() {
            return Err(StorageError::Corrupt(format!(
                "export has {} documents but {} vectors",
                export.documents.len(),
                export.vectors.len()
            )));
        }
        Ok(export)
    }
}
