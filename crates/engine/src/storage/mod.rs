//! Durable CRUD for documents, vectors, index blobs and collection records.
//!
//! [`StorageAdapter`] is the storage-agnostic seam the engine talks to.
//! Both shipped adapters keep a [`StoreState`] image in memory and mutate it
//! only through [`Mutation`] records, so every logical mutation (including
//! cascading ones like clearing a collection) is applied as one unit.

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::{MigrationError, StorageError};
use crate::migration::{MigrationManager, Schema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use vecstore_core::hnsw::DistanceMetric;
use vecstore_core::Metadata;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A document row. The embedding lives in the matching [`StoredVector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub collection_id: String,
    pub metadata: Metadata,
    pub text: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVector {
    pub id: String,
    pub collection_id: String,
    pub vector: Vec<f32>,
}

/// Collection metadata. `name` is unique across the store and `dimensions`
/// never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub name: String,
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub created_at: u64,
}

/// The serialized ANN index of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub collection_id: String,
    pub blob: Vec<u8>,
    pub updated_at: u64,
}

/// The complete persisted image of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub schema: Schema,
    pub meta: BTreeMap<String, String>,
    /// Keyed by collection id.
    pub collections: BTreeMap<String, CollectionRecord>,
    /// collection id -> document id -> document.
    pub documents: BTreeMap<String, BTreeMap<String, StoredDocument>>,
    /// collection id -> document id -> vector.
    pub vectors: BTreeMap<String, BTreeMap<String, StoredVector>>,
    /// Keyed by collection id.
    pub indexes: BTreeMap<String, IndexRecord>,
}

/// One logical storage mutation. The file adapter journals these verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    PutDocument(StoredDocument),
    DeleteDocument { collection_id: String, id: String },
    /// A document and its vector written as one unit. `None` leaves any
    /// existing vector row untouched.
    PutRow {
        document: StoredDocument,
        vector: Option<StoredVector>,
    },
    /// Removes a document and its vector as one unit.
    DeleteRow { collection_id: String, id: String },
    PutVector(StoredVector),
    DeleteVector { collection_id: String, id: String },
    PutIndex(IndexRecord),
    DeleteIndex { collection_id: String },
    CreateCollection(CollectionRecord),
    DeleteCollection { collection_id: String },
    ClearCollection { collection_id: String },
    Clear,
}

impl StoreState {
    /// Reject a mutation that would break referential or uniqueness rules.
    pub fn check(&self, mutation: &Mutation) -> Result<(), StorageError> {
        let require = |collection_id: &str| {
            if self.collections.contains_key(collection_id) {
                Ok(())
            } else {
                Err(StorageError::CollectionNotFound(collection_id.to_string()))
            }
        };
        match mutation {
            Mutation::PutDocument(doc) => require(&doc.collection_id),
            Mutation::PutRow { document, vector } => {
                require(&document.collection_id)?;
                match vector {
                    Some(v) if v.id != document.id || v.collection_id != document.collection_id => {
                        Err(StorageError::Mismatch(format!(
                            "document {}/{} paired with vector {}/{}",
                            document.collection_id, document.id, v.collection_id, v.id
                        )))
                    }
                    _ => Ok(()),
                }
            }
            Mutation::PutVector(vector) => require(&vector.collection_id),
            Mutation::PutIndex(record) => require(&record.collection_id),
            Mutation::CreateCollection(record) => {
                let clash = self
                    .collections
                    .values()
                    .any(|c| c.name == record.name && c.id != record.id);
                if clash {
                    Err(StorageError::DuplicateCollection(record.name.clone()))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Apply a mutation. Returns whether anything was affected.
    pub fn apply(&mut self, mutation: Mutation) -> bool {
        match mutation {
            Mutation::PutDocument(doc) => {
                self.documents
                    .entry(doc.collection_id.clone())
                    .or_default()
                    .insert(doc.id.clone(), doc);
                true
            }
            Mutation::DeleteDocument { collection_id, id } => self
                .documents
                .get_mut(&collection_id)
                .is_some_and(|docs| docs.remove(&id).is_some()),
            Mutation::PutRow { document, vector } => {
                if let Some(vector) = vector {
                    self.apply(Mutation::PutVector(vector));
                }
                self.apply(Mutation::PutDocument(document))
            }
            Mutation::DeleteRow { collection_id, id } => {
                let vector = self.apply(Mutation::DeleteVector {
                    collection_id: collection_id.clone(),
                    id: id.clone(),
                });
                let document = self.apply(Mutation::DeleteDocument { collection_id, id });
                document || vector
            }
            Mutation::PutVector(vector) => {
                self.vectors
                    .entry(vector.collection_id.clone())
                    .or_default()
                    .insert(vector.id.clone(), vector);
                true
            }
            Mutation::DeleteVector { collection_id, id } => self
                .vectors
                .get_mut(&collection_id)
                .is_some_and(|vectors| vectors.remove(&id).is_some()),
            Mutation::PutIndex(record) => {
                self.indexes.insert(record.collection_id.clone(), record);
                true
            }
            Mutation::DeleteIndex { collection_id } => {
                self.indexes.remove(&collection_id).is_some()
            }
            Mutation::CreateCollection(record) => {
                self.collections.insert(record.id.clone(), record);
                true
            }
            Mutation::DeleteCollection { collection_id } => {
                self.clear_collection_rows(&collection_id);
                self.collections.remove(&collection_id).is_some()
            }
            Mutation::ClearCollection { collection_id } => {
                self.clear_collection_rows(&collection_id);
                self.collections.contains_key(&collection_id)
            }
            Mutation::Clear => {
                self.collections.clear();
                self.documents.clear();
                self.vectors.clear();
                self.indexes.clear();
                true
            }
        }
    }

    fn clear_collection_rows(&mut self, collection_id: &str) {
        self.documents.remove(collection_id);
        self.vectors.remove(collection_id);
        self.indexes.remove(collection_id);
    }

    pub fn document(&self, collection_id: &str, id: &str) -> Option<&StoredDocument> {
        self.documents.get(collection_id)?.get(id)
    }

    pub fn vector(&self, collection_id: &str, id: &str) -> Option<&StoredVector> {
        self.vectors.get(collection_id)?.get(id)
    }

    pub fn collection_by_name(&self, name: &str) -> Option<&CollectionRecord> {
        self.collections.values().find(|c| c.name == name)
    }
}

/// Storage-agnostic persistence interface.
///
/// Adds are upserts, which keeps WAL replay idempotent. Operations on
/// documents, vectors and index blobs require the owning collection to exist.
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    /// Bring the persisted layout up to `migrations`' current version.
    /// Returns the resulting schema version.
    async fn initialize(&self, migrations: &MigrationManager) -> Result<u32, MigrationError>;
    async fn schema_version(&self) -> Result<u32, StorageError>;

    async fn add_document(&self, document: StoredDocument) -> Result<(), StorageError>;
    async fn get_document(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StorageError>;
    async fn delete_document(&self, collection_id: &str, id: &str) -> Result<bool, StorageError>;
    async fn get_all_documents(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredDocument>, StorageError>;
    async fn count_documents(&self, collection_id: &str) -> Result<usize, StorageError>;

    async fn add_vector(&self, vector: StoredVector) -> Result<(), StorageError>;
    async fn get_vector(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredVector>, StorageError>;
    async fn delete_vector(&self, collection_id: &str, id: &str) -> Result<bool, StorageError>;
    async fn get_all_vectors(&self, collection_id: &str)
        -> Result<Vec<StoredVector>, StorageError>;
    async fn count_vectors(&self, collection_id: &str) -> Result<usize, StorageError>;

    /// Upsert a document and (if given) its vector in one durable step, so a
    /// crash never leaves one row without the other.
    async fn put_document_with_vector(
        &self,
        document: StoredDocument,
        vector: Option<StoredVector>,
    ) -> Result<(), StorageError>;
    /// Delete a document and its vector in one durable step. Returns whether
    /// either row existed.
    async fn delete_document_with_vector(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<bool, StorageError>;

    async fn save_index(&self, record: IndexRecord) -> Result<(), StorageError>;
    async fn load_index(&self, collection_id: &str) -> Result<Option<IndexRecord>, StorageError>;
    async fn delete_index(&self, collection_id: &str) -> Result<bool, StorageError>;

    async fn create_collection(&self, record: CollectionRecord) -> Result<(), StorageError>;
    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>, StorageError>;
    async fn get_collection_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CollectionRecord>, StorageError>;
    async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>, StorageError>;
    /// Deletes the collection with all of its documents, vectors and index.
    async fn delete_collection(&self, id: &str) -> Result<bool, StorageError>;

    /// Remove every collection and its data. Schema and meta survive.
    async fn clear(&self) -> Result<(), StorageError>;
    /// Remove a collection's documents, vectors and index, keeping the record.
    async fn clear_collection(&self, id: &str) -> Result<(), StorageError>;

    /// Flush and release resources. Further calls fail with [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn collection(id: &str, name: &str, dims: usize) -> CollectionRecord {
        CollectionRecord {
            id: id.into(),
            name: name.into(),
            dimensions: dims,
            metric: DistanceMetric::Cosine,
            created_at: 1,
        }
    }

    pub(crate) fn document(collection_id: &str, id: &str) -> StoredDocument {
        StoredDocument {
            id: id.into(),
            collection_id: collection_id.into(),
            metadata: Metadata::new(),
            text: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    pub(crate) fn vector(collection_id: &str, id: &str, v: Vec<f32>) -> StoredVector {
        StoredVector {
            id: id.into(),
            collection_id: collection_id.into(),
            vector: v,
        }
    }

    /// Contract every adapter must satisfy.
    pub(crate) async fn exercise_adapter(storage: &dyn StorageAdapter) {
        storage.create_collection(collection("c1", "docs", 2)).await.unwrap();
        assert!(matches!(
            storage.create_collection(collection("c2", "docs", 2)).await,
            Err(StorageError::DuplicateCollection(_))
        ));
        assert!(matches!(
            storage.add_document(document("missing", "a")).await,
            Err(StorageError::CollectionNotFound(_))
        ));

        storage.add_document(document("c1", "a")).await.unwrap();
        storage.add_document(document("c1", "a")).await.unwrap();
        storage.add_vector(vector("c1", "a", vec![1.0, 0.0])).await.unwrap();
        storage.add_document(document("c1", "b")).await.unwrap();
        storage.add_vector(vector("c1", "b", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(storage.count_documents("c1").await.unwrap(), 2);
        assert_eq!(storage.count_vectors("c1").await.unwrap(), 2);
        let ids: Vec<String> = storage
            .get_all_documents("c1")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(storage.delete_document("c1", "b").await.unwrap());
        assert!(!storage.delete_document("c1", "b").await.unwrap());
        assert!(storage.delete_vector("c1", "b").await.unwrap());
        assert!(storage.get_vector("c1", "b").await.unwrap().is_none());

        storage
            .save_index(IndexRecord {
                collection_id: "c1".into(),
                blob: vec![1, 2, 3],
                updated_at: 5,
            })
            .await
            .unwrap();
        assert_eq!(storage.load_index("c1").await.unwrap().unwrap().blob, vec![1, 2, 3]);

        assert_eq!(
            storage.get_collection_by_name("docs").await.unwrap().unwrap().id,
            "c1"
        );

        storage.clear_collection("c1").await.unwrap();
        assert_eq!(storage.count_documents("c1").await.unwrap(), 0);
        assert_eq!(storage.count_vectors("c1").await.unwrap(), 0);
        assert!(storage.load_index("c1").await.unwrap().is_none());
        assert!(storage.get_collection("c1").await.unwrap().is_some());

        storage
            .put_document_with_vector(document("c1", "p"), Some(vector("c1", "p", vec![0.5, 0.5])))
            .await
            .unwrap();
        assert!(storage.get_document("c1", "p").await.unwrap().is_some());
        assert!(storage.get_vector("c1", "p").await.unwrap().is_some());
        assert!(matches!(
            storage
                .put_document_with_vector(document("c1", "q"), Some(vector("c1", "other", vec![1.0, 0.0])))
                .await,
            Err(StorageError::Mismatch(_))
        ));
        assert!(storage.get_document("c1", "q").await.unwrap().is_none());
        assert!(storage.delete_document_with_vector("c1", "p").await.unwrap());
        assert!(!storage.delete_document_with_vector("c1", "p").await.unwrap());
        assert!(storage.get_vector("c1", "p").await.unwrap().is_none());

        storage.add_document(document("c1", "z")).await.unwrap();
        assert!(storage.delete_collection("c1").await.unwrap());
        assert!(storage.get_all_collections().await.unwrap().is_empty());
        assert_eq!(storage.count_documents("c1").await.unwrap(), 0);
    }

    #[test]
    fn test_clear_keeps_schema() {
        let mut state = StoreState {
            schema: Schema::latest(),
            ..StoreState::default()
        };
        state.apply(Mutation::CreateCollection(collection("c", "n", 2)));
        state.apply(Mutation::PutDocument(document("c", "a")));
        state.apply(Mutation::Clear);
        assert!(state.collections.is_empty());
        assert!(state.documents.is_empty());
        assert_eq!(state.schema, Schema::latest());
    }

    #[test]
    fn test_recreate_same_collection_is_idempotent() {
        let mut state = StoreState::default();
        let record = collection("c", "n", 2);
        state.apply(Mutation::CreateCollection(record.clone()));
        assert!(state.check(&Mutation::CreateCollection(record)).is_ok());
    }
}
