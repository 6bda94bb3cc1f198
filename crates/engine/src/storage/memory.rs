//! In-memory storage adapter for tests and ephemeral stores.

use super::{
    CollectionRecord, IndexRecord, Mutation, StorageAdapter, StoreState, StoredDocument,
    StoredVector,
};
use crate::error::{MigrationError, StorageError};
use crate::migration::MigrationManager;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage adapter holding its whole [`StoreState`] behind a lock.
///
/// [`super::FileStorage`] wraps one of these and journals each mutation
/// before it is applied.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing image, e.g. one at an old schema version.
    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        }
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> Result<R, StorageError> {
        self.ensure_open()?;
        Ok(f(&self.state.read()))
    }

    /// Validate a mutation against the current image without applying it.
    pub(crate) fn check(&self, mutation: &Mutation) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.state.read().check(mutation)
    }

    /// Apply an already checked mutation.
    pub(crate) fn apply(&self, mutation: Mutation) -> bool {
        self.state.write().apply(mutation)
    }

    /// Replace the whole image, e.g. after a schema upgrade.
    pub(crate) fn replace(&self, state: StoreState) {
        *self.state.write() = state;
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn mutate(&self, mutation: Mutation) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let mut state = self.state.write();
        state.check(&mutation)?;
        Ok(state.apply(mutation))
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn initialize(&self, migrations: &MigrationManager) -> Result<u32, MigrationError> {
        self.ensure_open()?;
        let mut state = self.state.write();
        if let Some(upgraded) = migrations.upgrade(&state)? {
            *state = upgraded;
        }
        Ok(state.schema.version)
    }

    async fn schema_version(&self) -> Result<u32, StorageError> {
        self.read(|s| s.schema.version)
    }

    async fn add_document(&self, document: StoredDocument) -> Result<(), StorageError> {
        self.mutate(Mutation::PutDocument(document)).map(|_| ())
    }

    async fn get_document(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StorageError> {
        self.read(|s| s.document(collection_id, id).cloned())
    }

    async fn delete_document(&self, collection_id: &str, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteDocument {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
        })
    }

    async fn get_all_documents(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredDocument>, StorageError> {
        self.read(|s| {
            s.documents
                .get(collection_id)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn count_documents(&self, collection_id: &str) -> Result<usize, StorageError> {
        self.read(|s| s.documents.get(collection_id).map_or(0, |d| d.len()))
    }

    async fn add_vector(&self, vector: StoredVector) -> Result<(), StorageError> {
        self.mutate(Mutation::PutVector(vector)).map(|_| ())
    }

    async fn get_vector(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredVector>, StorageError> {
        self.read(|s| s.vector(collection_id, id).cloned())
    }

    async fn delete_vector(&self, collection_id: &str, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteVector {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
        })
    }

    async fn get_all_vectors(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredVector>, StorageError> {
        self.read(|s| {
            s.vectors
                .get(collection_id)
                .map(|vectors| vectors.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn count_vectors(&self, collection_id: &str) -> Result<usize, StorageError> {
        self.read(|s| s.vectors.get(collection_id).map_or(0, |v| v.len()))
    }

    async fn put_document_with_vector(
        &self,
        document: StoredDocument,
        vector: Option<StoredVector>,
    ) -> Result<(), StorageError> {
        self.mutate(Mutation::PutRow { document, vector }).map(|_| ())
    }

    async fn delete_document_with_vector(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteRow {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
        })
    }

    async fn save_index(&self, record: IndexRecord) -> Result<(), StorageError> {
        self.mutate(Mutation::PutIndex(record)).map(|_| ())
    }

    async fn load_index(&self, collection_id: &str) -> Result<Option<IndexRecord>, StorageError> {
        self.read(|s| s.indexes.get(collection_id).cloned())
    }

    async fn delete_index(&self, collection_id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteIndex {
            collection_id: collection_id.to_string(),
        })
    }

    async fn create_collection(&self, record: CollectionRecord) -> Result<(), StorageError> {
        self.mutate(Mutation::CreateCollection(record)).map(|_| ())
    }

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>, StorageError> {
        self.read(|s| s.collections.get(id).cloned())
    }

    async fn get_collection_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CollectionRecord>, StorageError> {
        self.read(|s| s.collection_by_name(name).cloned())
    }

    async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        self.read(|s| s.collections.values().cloned().collect())
    }

    async fn delete_collection(&self, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteCollection {
            collection_id: id.to_string(),
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.mutate(Mutation::Clear).map(|_| ())
    }

    async fn clear_collection(&self, id: &str) -> Result<(), StorageError> {
        self.mutate(Mutation::ClearCollection {
            collection_id: id.to_string(),
        })
        .map(|_| ())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.mark_closed();
        Ok(())
    }
}
