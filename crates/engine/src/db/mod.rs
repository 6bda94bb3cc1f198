//! The database facade.
//!
//! Opening a [`VectorDb`] brings storage up to the current schema, replays
//! WAL entries that were pending at the last shutdown, and purges old
//! resolved entries. Collections are loaded lazily on first access.

mod collection;
mod export;
mod validate;

pub use collection::{
    Collection, CollectionStats, DocumentUpdate, HybridQuery, HybridResult, ProgressFn,
    SearchOptions, SearchResult,
};
pub use export::{CollectionExport, EXPORT_FORMAT_VERSION};

use crate::config::{CollectionOptions, DbConfig, DEFAULT_COLLECTION};
use crate::error::{DbError, DbResult, StorageError};
use crate::lock::{LockCapability, LockManager, LockOptions, LockSnapshot};
use crate::migration::MigrationManager;
use crate::storage::{now_ms, CollectionRecord, FileStorage, MemoryStorage, StorageAdapter};
use crate::wal::{FileWalStore, MemoryWalStore, StorageExecutor, WalOperation, WalStore, WriteAheadLog};
use collection::CollectionState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vecstore_core::hnsw::validate_vector;
use vecstore_core::Document;

const CATALOG_LOCK: &str = "catalog";

#[derive(Debug)]
pub(crate) struct DbInner {
    pub(crate) config: DbConfig,
    pub(crate) storage: Arc<dyn StorageAdapter>,
    pub(crate) wal: WriteAheadLog,
    pub(crate) locks: LockManager,
    schema_version: u32,
    collections: RwLock<HashMap<String, Arc<CollectionState>>>,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbStats {
    pub schema_version: u32,
    pub collections: Vec<CollectionStats>,
    pub wal_entries: usize,
    pub wal_pending: usize,
    pub lock_capability: LockCapability,
    pub locks: LockSnapshot,
}

/// An embedded vector database. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct VectorDb {
    inner: Arc<DbInner>,
}

impl VectorDb {
    /// Open a database. With `config.data_dir` set, storage, the WAL and
    /// the lock files live in that directory; otherwise everything is in memory.
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        match config.data_dir.clone() {
            Some(dir) => {
                let storage_dir = dir.clone();
                let storage = tokio::task::spawn_blocking(move || FileStorage::open(&storage_dir))
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e.to_string())))??;
                let storage = Arc::new(storage);
                let wal_store = Arc::new(FileWalStore::open(&dir)?);
                let locks = LockManager::cross_process(&dir);
                Self::assemble(config, storage, wal_store, locks).await
            }
            None => {
                let storage = Arc::new(MemoryStorage::new());
                let wal_store = Arc::new(MemoryWalStore::new());
                Self::assemble(config, storage, wal_store, LockManager::in_process()).await
            }
        }
    }

    /// Open over caller-provided storage and WAL store.
    pub async fn with_storage(
        config: DbConfig,
        storage: Arc<dyn StorageAdapter>,
        wal_store: Arc<dyn WalStore>,
    ) -> DbResult<Self> {
        let locks = match &config.data_dir {
            Some(dir) => LockManager::cross_process(dir),
            None => LockManager::in_process(),
        };
        Self::assemble(config, storage, wal_store, locks).await
    }

    async fn assemble(
        config: DbConfig,
        storage: Arc<dyn StorageAdapter>,
        wal_store: Arc<dyn WalStore>,
        locks: LockManager,
    ) -> DbResult<Self> {
        let schema_version = storage.initialize(&MigrationManager::default()).await?;
        let wal = WriteAheadLog::open(wal_store).await?;
        let replay = wal.replay(&StorageExecutor::new(storage.as_ref())).await?;
        let purged = wal.cleanup(config.wal_retention).await?;
        tracing::info!(
            schema_version,
            replayed = replay.replayed,
            rolled_back = replay.rolled_back,
            purged,
            lock_capability = ?locks.capability(),
            persistent = config.is_persistent(),
            "database opened"
        );
        Ok(Self {
            inner: Arc::new(DbInner {
                config,
                storage,
                wal,
                locks,
                schema_version,
                collections: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.inner.wal
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.storage
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.schema_version
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn handle(&self, state: Arc<CollectionState>) -> Collection {
        Collection::new(self.inner.clone(), state)
    }

    /// Get `name`, creating it with default options if it does not exist.
    pub async fn collection(&self, name: &str) -> DbResult<Collection> {
        if let Some(collection) = self.get_collection(name).await? {
            return Ok(collection);
        }
        match self.create_collection(name, CollectionOptions::default()).await {
            Err(DbError::Storage(StorageError::DuplicateCollection(_))) => self
                .get_collection(name)
                .await?
                .ok_or_else(|| DbError::CollectionNotFound(name.to_string())),
            other => other,
        }
    }

    pub async fn get_collection(&self, name: &str) -> DbResult<Option<Collection>> {
        self.inner.ensure_open()?;
        if let Some(state) = self.inner.collections.read().await.get(name) {
            return Ok(Some(self.handle(state.clone())));
        }
        let mut cache = self.inner.collections.write().await;
        if let Some(state) = cache.get(name) {
            return Ok(Some(self.handle(state.clone())));
        }
        let Some(record) = self.inner.storage.get_collection_by_name(name).await? else {
            return Ok(None);
        };
        let state = Arc::new(CollectionState::load(&self.inner, record).await?);
        cache.insert(name.to_string(), state.clone());
        Ok(Some(self.handle(state)))
    }

    /// Create a collection. Fails if the name is taken.
    pub async fn create_collection(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> DbResult<Collection> {
        self.inner.ensure_open()?;
        validate::collection_name(name)?;
        let dimensions = options
            .dimensions
            .unwrap_or(self.inner.config.default_dimensions);
        validate::dimensions(dimensions)?;
        let metric = options.metric.unwrap_or(self.inner.config.hnsw.metric);

        let mut cache = self.inner.collections.write().await;
        let lock_options = LockOptions::exclusive().with_timeout(self.inner.config.lock_timeout);
        let _lock = self.inner.locks.acquire(CATALOG_LOCK, lock_options).await?;
        if cache.contains_key(name)
            || self
                .inner
                .storage
                .get_collection_by_name(name)
                .await?
                .is_some()
        {
            return Err(StorageError::DuplicateCollection(name.to_string()).into());
        }

        let record = CollectionRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            dimensions,
            metric,
            created_at: now_ms(),
        };
        self.inner
            .wal
            .with_wal(
                WalOperation::CreateCollection {
                    record: record.clone(),
                },
                || async {
                    self.inner.storage.create_collection(record.clone()).await?;
                    Ok::<(), DbError>(())
                },
            )
            .await?;

        tracing::info!(collection = name, id = %record.id, dimensions, metric = ?metric, "collection created");
        let state = Arc::new(CollectionState::new(&self.inner.config, record));
        cache.insert(name.to_string(), state.clone());
        Ok(self.handle(state))
    }

    /// Delete a collection and everything in it. Returns `false` if it did not exist.
    pub async fn delete_collection(&self, name: &str) -> DbResult<bool> {
        let Some(collection) = self.get_collection(name).await? else {
            return Ok(false);
        };
        {
            let _guard = collection.begin_write(None).await?;
            let collection_id = collection.id().to_string();
            self.inner
                .wal
                .with_wal(
                    WalOperation::DeleteCollection {
                        collection_id: collection_id.clone(),
                    },
                    || async {
                        self.inner.storage.delete_collection(&collection_id).await?;
                        Ok::<(), DbError>(())
                    },
                )
                .await?;
            collection.state.mark_dropped();
        }
        self.inner.collections.write().await.remove(name);
        tracing::info!(collection = name, "collection deleted");
        Ok(true)
    }

    pub async fn list_collections(&self) -> DbResult<Vec<CollectionRecord>> {
        self.inner.ensure_open()?;
        let mut records = self.inner.storage.get_all_collections().await?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Import a blob produced by [`Collection::export`] under its original name.
    pub async fn import(&self, bytes: &[u8]) -> DbResult<Collection> {
        self.import_as(bytes, None).await
    }

    /// Import a collection export, optionally under a different name. The
    /// imported collection always gets a fresh id.
    pub async fn import_as(&self, bytes: &[u8], name: Option<&str>) -> DbResult<Collection> {
        self.import_cancellable(bytes, name, &CancellationToken::new())
            .await
    }

    /// [`Self::import_as`] that stops between documents once `token` is
    /// cancelled. A cancelled or failed import leaves no collection behind.
    pub async fn import_cancellable(
        &self,
        bytes: &[u8],
        name: Option<&str>,
        token: &CancellationToken,
    ) -> DbResult<Collection> {
        if token.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let export = CollectionExport::from_bytes(bytes)?;
        let name = name.unwrap_or(&export.collection.name).to_string();
        let dimensions = export.collection.dimensions;

        let mut vectors: HashMap<String, _> = export
            .vectors
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();
        let mut items = Vec::with_capacity(export.documents.len());
        for doc in export.documents {
            let Some(vector) = vectors.remove(&doc.id) else {
                return Err(StorageError::Corrupt(format!(
                    "exported document '{}' has no vector",
                    doc.id
                ))
                .into());
            };
            validate::document_id(&doc.id)?;
            validate_vector(&vector.vector, dimensions)?;
            items.push((doc, vector));
        }

        let options = CollectionOptions::new(dimensions).with_metric(export.collection.metric);
        let collection = self.create_collection(&name, options).await?;
        for (doc, vector) in &mut items {
            doc.collection_id = collection.id().to_string();
            vector.collection_id = collection.id().to_string();
        }

        let count = items.len();
        let written = async {
            let _guard = collection.begin_write(Some(token)).await?;
            collection.write_batch(items, None, token, false).await?;
            if let Some(blob) = export.index {
                let record = crate::storage::IndexRecord {
                    collection_id: collection.id().to_string(),
                    blob,
                    updated_at: now_ms(),
                };
                self.inner
                    .wal
                    .with_wal(WalOperation::SaveIndex { record: record.clone() }, || async {
                        self.inner.storage.save_index(record).await?;
                        Ok::<(), DbError>(())
                    })
                    .await?;
            }
            collection.state.reload(&self.inner).await?;
            if collection.state.unsaved() > 0 {
                collection.persist_locked().await?;
            }
            Ok::<(), DbError>(())
        }
        .await;

        if let Err(e) = written {
            tracing::warn!(collection = %name, error = %e, "import failed, removing partial collection");
            if let Err(cleanup) = self.delete_collection(&name).await {
                tracing::warn!(collection = %name, error = %cleanup, "failed to remove partial import");
            }
            return Err(e);
        }
        tracing::info!(collection = %name, documents = count, "collection imported");
        Ok(collection)
    }

    pub async fn stats(&self) -> DbResult<DbStats> {
        self.inner.ensure_open()?;
        let mut collections = Vec::new();
        for record in self.list_collections().await? {
            if let Some(collection) = self.get_collection(&record.name).await? {
                collections.push(collection.stats().await?);
            }
        }
        Ok(DbStats {
            schema_version: self.inner.schema_version,
            collections,
            wal_entries: self.inner.wal.entries().await.len(),
            wal_pending: self.inner.wal.pending().await.len(),
            lock_capability: self.inner.locks.capability(),
            locks: self.inner.locks.lock_state(),
        })
    }

    /// Remove every collection and document. Schema and metadata are kept.
    pub async fn clear(&self) -> DbResult<()> {
        self.inner.ensure_open()?;
        let mut cache = self.inner.collections.write().await;
        let lock_options = LockOptions::exclusive().with_timeout(self.inner.config.lock_timeout);
        let _lock = self.inner.locks.acquire(CATALOG_LOCK, lock_options).await?;
        self.inner
            .wal
            .with_wal(WalOperation::ClearDatabase, || async {
                self.inner.storage.clear().await?;
                Ok::<(), DbError>(())
            })
            .await?;
        for state in cache.values() {
            state.mark_dropped();
        }
        cache.clear();
        tracing::info!("database cleared");
        Ok(())
    }

    /// Persist every index with unsaved changes, then close storage.
    /// Further calls on this database or its collections fail with
    /// [`DbError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> DbResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let states: Vec<_> = self
            .inner
            .collections
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for state in states {
            if state.unsaved() == 0 {
                continue;
            }
            let collection = self.handle(state);
            if let Err(e) = collection.persist_index().await {
                tracing::warn!(collection = %collection.name(), error = %e, "index save on close failed");
            }
        }
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.storage.close().await?;
        self.inner.wal.close().await?;
        tracing::info!("database closed");
        Ok(())
    }

    /// The collection behind the shortcut methods.
    pub async fn default_collection(&self) -> DbResult<Collection> {
        self.collection(DEFAULT_COLLECTION).await
    }

    pub async fn add(&self, doc: Document) -> DbResult<()> {
        self.default_collection().await?.add(doc).await
    }

    pub async fn add_many(&self, docs: Vec<Document>) -> DbResult<usize> {
        self.default_collection().await?.add_many(docs, None).await
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Document>> {
        self.default_collection().await?.get(id).await
    }

    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        self.default_collection().await?.delete(id).await
    }

    pub async fn search(&self, query: &[f32], options: SearchOptions) -> DbResult<Vec<SearchResult>> {
        self.default_collection().await?.search(query, options).await
    }
}
