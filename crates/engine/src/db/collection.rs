//! One collection: CRUD, vector/keyword/hybrid search and index maintenance.
//!
//! Writers are serialized per collection by a run queue and, across
//! processes, by the `collection:<id>` write lock. Each mutation is logged to
//! the WAL, applied to storage, and only then applied to the in-memory HNSW
//! and BM25 indexes. The indexes are rebuilt from (and reconciled against)
//! stored vectors whenever a collection is loaded.

use super::export::{CollectionExport, EXPORT_FORMAT_VERSION};
use super::validate;
use super::DbInner;
use crate::config::DbConfig;
use crate::error::{DbError, DbResult, LockError, StorageError};
use crate::lock::{LockGuard, LockOptions};
use crate::storage::{now_ms, CollectionRecord, IndexRecord, StoredDocument, StoredVector};
use crate::wal::WalOperation;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vecstore_core::bm25::{Bm25Index, Bm25Params};
use vecstore_core::config::MAX_K;
use vecstore_core::hnsw::{validate_vector, DistanceMetric, HnswConfig, HnswIndex};
use vecstore_core::search::{matches_filter, FusionMethod, ScoredId};
use vecstore_core::{Document, FilterClause, Metadata};

/// Batch progress callback: `(completed, total)`.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

type Previous = Option<(StoredDocument, Option<StoredVector>)>;

/// Vectors inserted between cancellation checks during a rebuild.
const REBUILD_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub filter: Option<FilterClause>,
    /// Drop results scoring below this.
    pub threshold: Option<f32>,
    pub include_vectors: bool,
    /// Beam width override; defaults to `max(ef_search, k)`.
    pub ef: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::new(10)
    }
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            filter: None,
            threshold: None,
            include_vectors: false,
            ef: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterClause) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_vectors(mut self) -> Self {
        self.include_vectors = true;
        self
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = Some(ef);
        self
    }
}

/// A hydrated search hit. Higher scores are better for every metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub metadata: Metadata,
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
}

/// A combined vector + keyword query.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub vector: Vec<f32>,
    pub text: String,
    pub k: usize,
    pub fusion: FusionMethod,
    pub filter: Option<FilterClause>,
    /// Applied to the fused score.
    pub min_score: Option<f32>,
}

impl HybridQuery {
    pub fn new(vector: Vec<f32>, text: impl Into<String>, k: usize) -> Self {
        Self {
            vector,
            text: text.into(),
            k,
            fusion: FusionMethod::default(),
            filter: None,
            min_score: None,
        }
    }

    pub fn with_fusion(mut self, fusion: FusionMethod) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_filter(mut self, filter: FilterClause) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub id: String,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub keyword_score: Option<f32>,
    pub metadata: Metadata,
    pub text: Option<String>,
}

/// Partial update for [`Collection::update`]. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub vector: Option<Vec<f32>>,
    pub metadata: Option<Metadata>,
    /// `Some(None)` clears the stored text.
    pub text: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub id: String,
    pub name: String,
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub documents: usize,
    pub vectors: usize,
    /// Live nodes in the HNSW graph.
    pub indexed: usize,
    pub tombstones: usize,
    pub keyword_documents: usize,
    /// Index mutations since the index was last persisted.
    pub unsaved_mutations: usize,
}

/// In-memory state shared by every handle to one collection.
#[derive(Debug)]
pub(crate) struct CollectionState {
    pub(crate) record: CollectionRecord,
    hnsw_config: HnswConfig,
    bm25: Bm25Params,
    run_queue: Mutex<()>,
    index: RwLock<HnswIndex>,
    keywords: RwLock<Bm25Index>,
    unsaved: AtomicUsize,
    dropped: AtomicBool,
}

impl CollectionState {
    pub(crate) fn new(config: &DbConfig, record: CollectionRecord) -> Self {
        let hnsw_config = HnswConfig {
            metric: record.metric,
            ..config.hnsw.clone()
        };
        Self {
            index: RwLock::new(HnswIndex::new(record.dimensions, hnsw_config.clone())),
            keywords: RwLock::new(Bm25Index::new(config.bm25)),
            hnsw_config,
            bm25: config.bm25,
            run_queue: Mutex::new(()),
            unsaved: AtomicUsize::new(0),
            dropped: AtomicBool::new(false),
            record,
        }
    }

    pub(crate) async fn load(db: &DbInner, record: CollectionRecord) -> DbResult<Self> {
        let state = Self::new(&db.config, record);
        state.reload(db).await?;
        Ok(state)
    }

    /// Rebuild the in-memory indexes from the persisted index blob and the
    /// stored rows. Stored vectors are authoritative: missing ids are
    /// inserted and ids with no stored vector are removed.
    pub(crate) async fn reload(&self, db: &DbInner) -> DbResult<()> {
        let record = &self.record;
        let mut index = match db.storage.load_index(&record.id).await? {
            Some(saved) => match HnswIndex::from_bytes(&saved.blob) {
                Ok(index)
                    if index.dimension() == record.dimensions
                        && index.metric() == record.metric =>
                {
                    index
                }
                Ok(_) => {
                    tracing::warn!(collection = %record.name, "saved index does not match collection, rebuilding");
                    self.empty_index()
                }
                Err(e) => {
                    tracing::warn!(collection = %record.name, error = %e, "saved index unreadable, rebuilding");
                    self.empty_index()
                }
            },
            None => self.empty_index(),
        };
        let vectors = db.storage.get_all_vectors(&record.id).await?;
        let (inserted, removed) = reconcile(&mut index, &vectors, &record.name);

        let mut keywords = Bm25Index::new(self.bm25);
        for doc in db.storage.get_all_documents(&record.id).await? {
            if let Some(text) = &doc.text {
                keywords.add(doc.id.clone(), text);
            }
        }

        tracing::info!(
            collection = %record.name,
            nodes = index.len(),
            inserted,
            removed,
            "collection loaded"
        );
        *self.index.write() = index;
        *self.keywords.write() = keywords;
        self.unsaved.store(inserted + removed, Ordering::Relaxed);
        Ok(())
    }

    fn empty_index(&self) -> HnswIndex {
        HnswIndex::new(self.record.dimensions, self.hnsw_config.clone())
    }

    fn index_put(&self, id: &str, vector: &[f32], text: Option<&str>) -> DbResult<()> {
        self.index.write().insert(id, vector)?;
        let mut keywords = self.keywords.write();
        match text {
            Some(text) => keywords.add(id, text),
            None => {
                keywords.remove(id);
            }
        }
        self.unsaved.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn index_remove(&self, id: &str) {
        self.index.write().delete(id);
        self.keywords.write().remove(id);
        self.unsaved.fetch_add(1, Ordering::Relaxed);
    }

    fn index_restore(&self, id: &str, previous: &Previous) {
        match previous {
            Some((doc, Some(vector))) => {
                if let Err(e) = self.index_put(id, &vector.vector, doc.text.as_deref()) {
                    tracing::warn!(collection = %self.record.name, id, error = %e, "index restore failed");
                }
            }
            _ => self.index_remove(id),
        }
    }

    fn index_reset(&self) {
        *self.index.write() = self.empty_index();
        self.keywords.write().clear();
        self.unsaved.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub(crate) fn unsaved(&self) -> usize {
        self.unsaved.load(Ordering::Relaxed)
    }
}

fn reconcile(index: &mut HnswIndex, vectors: &[StoredVector], collection: &str) -> (usize, usize) {
    let live: HashSet<&str> = vectors.iter().map(|v| v.id.as_str()).collect();
    let stale: Vec<String> = index
        .ids()
        .filter(|id| !live.contains(id))
        .map(str::to_string)
        .collect();
    for id in &stale {
        index.delete(id);
    }
    let mut inserted = 0;
    for v in vectors {
        if index.get_vector(&v.id) == Some(v.vector.as_slice()) {
            continue;
        }
        match index.insert(v.id.clone(), &v.vector) {
            Ok(()) => inserted += 1,
            Err(e) => tracing::warn!(collection, id = %v.id, error = %e, "stored vector rejected by index"),
        }
    }
    (inserted, stale.len())
}

/// Held for the duration of a write.
pub(crate) struct WriteGuard<'a> {
    _queue: MutexGuard<'a, ()>,
    _lock: LockGuard,
}

/// Handle to a collection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Collection {
    db: Arc<DbInner>,
    pub(crate) state: Arc<CollectionState>,
}

impl Collection {
    pub(crate) fn new(db: Arc<DbInner>, state: Arc<CollectionState>) -> Self {
        Self { db, state }
    }

    pub fn name(&self) -> &str {
        &self.state.record.name
    }

    pub fn id(&self) -> &str {
        &self.state.record.id
    }

    pub fn dimensions(&self) -> usize {
        self.state.record.dimensions
    }

    pub fn metric(&self) -> DistanceMetric {
        self.state.record.metric
    }

    pub fn record(&self) -> &CollectionRecord {
        &self.state.record
    }

    fn ensure_live(&self) -> DbResult<()> {
        self.db.ensure_open()?;
        if self.state.dropped.load(Ordering::Acquire) {
            return Err(DbError::CollectionNotFound(self.name().to_string()));
        }
        Ok(())
    }

    fn lock_resource(&self) -> String {
        format!("collection:{}", self.id())
    }

    /// Wait for the run queue, then the cross-process write lock.
    pub(crate) async fn begin_write(
        &self,
        signal: Option<&CancellationToken>,
    ) -> DbResult<WriteGuard<'_>> {
        self.ensure_live()?;
        let queue = match signal {
            Some(token) => tokio::select! {
                guard = self.state.run_queue.lock() => guard,
                _ = token.cancelled() => return Err(DbError::Cancelled),
            },
            None => self.state.run_queue.lock().await,
        };
        let options = LockOptions::exclusive()
            .with_timeout(self.db.config.lock_timeout)
            .with_signal(signal.cloned());
        let lock = self
            .db
            .locks
            .acquire(&self.lock_resource(), options)
            .await
            .map_err(|e| match e {
                LockError::Aborted(_) => DbError::Cancelled,
                other => other.into(),
            })?;
        self.ensure_live()?;
        Ok(WriteGuard {
            _queue: queue,
            _lock: lock,
        })
    }

    fn rows(&self, doc: Document) -> (StoredDocument, StoredVector) {
        let now = now_ms();
        let collection_id = self.id().to_string();
        (
            StoredDocument {
                id: doc.id.clone(),
                collection_id: collection_id.clone(),
                metadata: doc.metadata,
                text: doc.text,
                created_at: now,
                updated_at: now,
            },
            StoredVector {
                id: doc.id,
                collection_id,
                vector: doc.vector,
            },
        )
    }

    async fn previous(&self, id: &str) -> DbResult<Previous> {
        let storage = &self.db.storage;
        let Some(doc) = storage.get_document(self.id(), id).await? else {
            return Ok(None);
        };
        let vector = storage.get_vector(self.id(), id).await?;
        Ok(Some((doc, vector)))
    }

    async fn put_rows(&self, doc: &StoredDocument, vector: &StoredVector) -> DbResult<()> {
        self.db
            .storage
            .put_document_with_vector(doc.clone(), Some(vector.clone()))
            .await?;
        Ok(())
    }

    /// Put the stored rows of `id` back to `previous`. Failures are logged.
    async fn restore_rows(&self, id: &str, previous: &Previous) {
        let storage = &self.db.storage;
        let collection_id = self.id();
        let result: Result<(), StorageError> = async {
            match previous {
                Some((doc, Some(vector))) => {
                    storage
                        .put_document_with_vector(doc.clone(), Some(vector.clone()))
                        .await?
                }
                Some((doc, None)) => {
                    storage.delete_document_with_vector(collection_id, id).await?;
                    storage.add_document(doc.clone()).await?;
                }
                None => {
                    storage.delete_document_with_vector(collection_id, id).await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(collection = %self.name(), id, error = %e, "failed to restore rows");
        }
    }

    async fn write_one(&self, doc: Document, update: bool) -> DbResult<()> {
        let previous = self.previous(&doc.id).await?;
        let (mut stored, vector) = self.rows(doc);
        if let Some((prev, _)) = &previous {
            stored.created_at = prev.created_at;
        }
        let operation = if update {
            WalOperation::UpdateDocument {
                document: stored.clone(),
                vector: Some(vector.clone()),
            }
        } else {
            WalOperation::AddDocument {
                document: stored.clone(),
                vector: Some(vector.clone()),
            }
        };
        self.db
            .wal
            .with_wal(operation, || async {
                self.put_rows(&stored, &vector).await?;
                if let Err(e) =
                    self.state
                        .index_put(&stored.id, &vector.vector, stored.text.as_deref())
                {
                    self.restore_rows(&stored.id, &previous).await;
                    return Err(e);
                }
                Ok(())
            })
            .await
    }

    /// Persist the index if enough mutations have piled up. Runs under the write guard.
    async fn after_mutation(&self) {
        let interval = self.db.config.index_save_interval;
        if interval > 0 && self.state.unsaved() >= interval {
            if let Err(e) = self.persist_locked().await {
                tracing::warn!(collection = %self.name(), error = %e, "automatic index save failed");
            }
        }
    }

    /// Insert or replace a document.
    pub async fn add(&self, doc: Document) -> DbResult<()> {
        validate::document(&doc, self.dimensions())?;
        let _guard = self.begin_write(None).await?;
        self.write_one(doc, false).await?;
        self.after_mutation().await;
        Ok(())
    }

    /// Insert or replace many documents, all or nothing.
    pub async fn add_many(
        &self,
        docs: Vec<Document>,
        progress: Option<&ProgressFn>,
    ) -> DbResult<usize> {
        self.add_many_cancellable(docs, progress, &CancellationToken::new())
            .await
    }

    /// [`Self::add_many`] that stops between documents once `token` is
    /// cancelled, restoring every touched id and failing with [`DbError::Cancelled`].
    pub async fn add_many_cancellable(
        &self,
        docs: Vec<Document>,
        progress: Option<&ProgressFn>,
        token: &CancellationToken,
    ) -> DbResult<usize> {
        validate::batch(&docs, self.dimensions())?;
        if token.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        if docs.is_empty() {
            return Ok(0);
        }
        let _guard = self.begin_write(Some(token)).await?;
        let items = docs.into_iter().map(|doc| self.rows(doc)).collect();
        let written = self.write_batch(items, progress, token, true).await?;
        self.after_mutation().await;
        Ok(written)
    }

    /// Write rows under one WAL transaction. On failure or cancellation every
    /// touched id is restored and the transaction rolled back. Runs under the
    /// write guard.
    pub(crate) async fn write_batch(
        &self,
        items: Vec<(StoredDocument, StoredVector)>,
        progress: Option<&ProgressFn>,
        token: &CancellationToken,
        update_index: bool,
    ) -> DbResult<usize> {
        let transaction = Uuid::new_v4().to_string();
        let total = items.len();
        let mut seen = HashSet::new();
        let mut touched: Vec<(String, Previous)> = Vec::new();
        let mut failure = None;

        for (i, (mut doc, vector)) in items.into_iter().enumerate() {
            if token.is_cancelled() {
                failure = Some(DbError::Cancelled);
                break;
            }
            let previous = match self.previous(&doc.id).await {
                Ok(previous) => previous,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if let Some((prev, _)) = &previous {
                doc.created_at = prev.created_at;
            }
            if seen.insert(doc.id.clone()) {
                touched.push((doc.id.clone(), previous.clone()));
            }

            let operation = WalOperation::AddDocument {
                document: doc.clone(),
                vector: Some(vector.clone()),
            };
            if let Err(e) = self
                .db
                .wal
                .log_in_transaction(operation, Some(&transaction))
                .await
            {
                failure = Some(e.into());
                break;
            }
            if let Err(e) = self.put_rows(&doc, &vector).await {
                failure = Some(e);
                break;
            }
            if update_index {
                if let Err(e) = self.state.index_put(&doc.id, &vector.vector, doc.text.as_deref()) {
                    failure = Some(e);
                    break;
                }
            }
            if let Some(progress) = progress {
                progress(i + 1, total);
            }
            tokio::task::yield_now().await;
        }

        if let Some(err) = failure {
            for (id, previous) in touched.iter().rev() {
                self.restore_rows(id, previous).await;
                if update_index {
                    self.state.index_restore(id, previous);
                }
            }
            if let Err(e) = self.db.wal.rollback_transaction(&transaction).await {
                tracing::warn!(collection = %self.name(), error = %e, "batch WAL rollback failed");
            }
            tracing::warn!(collection = %self.name(), error = %err, restored = touched.len(), "batch rolled back");
            return Err(err);
        }

        self.db.wal.commit_transaction(&transaction).await?;
        tracing::debug!(collection = %self.name(), count = total, "batch written");
        Ok(total)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Document>> {
        self.ensure_live()?;
        let Some((doc, vector)) = self.previous(id).await? else {
            return Ok(None);
        };
        let vector = match vector {
            Some(v) => v.vector,
            None => self
                .state
                .index
                .read()
                .get_vector(id)
                .map(<[f32]>::to_vec)
                .unwrap_or_default(),
        };
        Ok(Some(Document {
            id: doc.id,
            vector,
            metadata: doc.metadata,
            text: doc.text,
        }))
    }

    /// Apply a partial update to an existing document and return the result.
    pub async fn update(&self, id: &str, update: DocumentUpdate) -> DbResult<Document> {
        validate::document_id(id)?;
        if let Some(vector) = &update.vector {
            validate_vector(vector, self.dimensions())?;
        }
        let _guard = self.begin_write(None).await?;
        let Some((doc, vector)) = self.previous(id).await? else {
            return Err(DbError::DocumentNotFound(id.to_string()));
        };
        let vector = match (update.vector, vector) {
            (Some(v), _) => v,
            (None, Some(stored)) => stored.vector,
            (None, None) => {
                return Err(StorageError::Corrupt(format!("document '{id}' has no stored vector")).into())
            }
        };
        let merged = Document {
            id: id.to_string(),
            vector,
            metadata: update.metadata.unwrap_or(doc.metadata),
            text: update.text.unwrap_or(doc.text),
        };
        validate::document(&merged, self.dimensions())?;
        self.write_one(merged.clone(), true).await?;
        self.after_mutation().await;
        Ok(merged)
    }

    /// Returns `false` if the id was not present.
    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        let _guard = self.begin_write(None).await?;
        let deleted = self.delete_locked(id).await?;
        self.after_mutation().await;
        Ok(deleted)
    }

    async fn delete_locked(&self, id: &str) -> DbResult<bool> {
        let previous = self.previous(id).await?;
        if previous.is_none() && !self.state.index.read().contains(id) {
            return Ok(false);
        }
        let operation = WalOperation::DeleteDocument {
            collection_id: self.id().to_string(),
            id: id.to_string(),
        };
        self.db
            .wal
            .with_wal(operation, || async {
                self.db
                    .storage
                    .delete_document_with_vector(self.id(), id)
                    .await?;
                self.state.index_remove(id);
                Ok::<(), DbError>(())
            })
            .await?;
        Ok(true)
    }

    /// Delete `ids` under one WAL transaction. On failure or cancellation
    /// every deleted id is restored and the transaction rolled back. Runs
    /// under the write guard.
    async fn delete_batch(&self, ids: Vec<String>, token: &CancellationToken) -> DbResult<usize> {
        let transaction = Uuid::new_v4().to_string();
        let mut seen = HashSet::new();
        let mut touched: Vec<(String, Previous)> = Vec::new();
        let mut failure = None;

        for id in ids {
            if token.is_cancelled() {
                failure = Some(DbError::Cancelled);
                break;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            let previous = match self.previous(&id).await {
                Ok(previous) => previous,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if previous.is_none() && !self.state.index.read().contains(&id) {
                continue;
            }
            let operation = WalOperation::DeleteDocument {
                collection_id: self.id().to_string(),
                id: id.clone(),
            };
            if let Err(e) = self
                .db
                .wal
                .log_in_transaction(operation, Some(&transaction))
                .await
            {
                failure = Some(e.into());
                break;
            }
            touched.push((id.clone(), previous));
            if let Err(e) = self.db.storage.delete_document_with_vector(self.id(), &id).await {
                failure = Some(e.into());
                break;
            }
            self.state.index_remove(&id);
            tokio::task::yield_now().await;
        }

        if let Some(err) = failure {
            for (id, previous) in touched.iter().rev() {
                self.restore_rows(id, previous).await;
                self.state.index_restore(id, previous);
            }
            if let Err(e) = self.db.wal.rollback_transaction(&transaction).await {
                tracing::warn!(collection = %self.name(), error = %e, "batch WAL rollback failed");
            }
            tracing::warn!(collection = %self.name(), error = %err, restored = touched.len(), "batch delete rolled back");
            return Err(err);
        }

        self.db.wal.commit_transaction(&transaction).await?;
        Ok(touched.len())
    }

    /// Returns how many of `ids` were present.
    pub async fn delete_many<I, S>(&self, ids: I) -> DbResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.delete_many_cancellable(ids, &CancellationToken::new())
            .await
    }

    /// [`Self::delete_many`], all or nothing: once `token` is cancelled the
    /// ids deleted so far are restored and the call fails with [`DbError::Cancelled`].
    pub async fn delete_many_cancellable<I, S>(
        &self,
        ids: I,
        token: &CancellationToken,
    ) -> DbResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = ids.into_iter().map(|id| id.as_ref().to_string()).collect();
        if token.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let _guard = self.begin_write(Some(token)).await?;
        let deleted = self.delete_batch(ids, token).await?;
        self.after_mutation().await;
        Ok(deleted)
    }

    /// Delete every document whose metadata matches `filter`.
    pub async fn delete_where(&self, filter: &FilterClause) -> DbResult<usize> {
        self.delete_where_cancellable(filter, &CancellationToken::new())
            .await
    }

    /// [`Self::delete_where`] with the rollback semantics of [`Self::delete_many_cancellable`].
    pub async fn delete_where_cancellable(
        &self,
        filter: &FilterClause,
        token: &CancellationToken,
    ) -> DbResult<usize> {
        if token.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let _guard = self.begin_write(Some(token)).await?;
        let matching: Vec<String> = self
            .db
            .storage
            .get_all_documents(self.id())
            .await?
            .into_iter()
            .filter(|doc| matches_filter(&doc.metadata, filter))
            .map(|doc| doc.id)
            .collect();
        let deleted = self.delete_batch(matching, token).await?;
        self.after_mutation().await;
        tracing::debug!(collection = %self.name(), deleted, "delete_where");
        Ok(deleted)
    }

    /// Ids of stored documents matching `filter`, or `None` for no filtering.
    async fn allowed_ids(&self, filter: Option<&FilterClause>) -> DbResult<Option<HashSet<String>>> {
        let Some(filter) = filter.filter(|f| !f.is_empty()) else {
            return Ok(None);
        };
        let ids = self
            .db
            .storage
            .get_all_documents(self.id())
            .await?
            .into_iter()
            .filter(|doc| matches_filter(&doc.metadata, filter))
            .map(|doc| doc.id)
            .collect();
        Ok(Some(ids))
    }

    /// `(id, score)` pairs from the ANN index, best first.
    async fn vector_hits(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: Option<&FilterClause>,
    ) -> DbResult<Vec<(String, f32)>> {
        let allowed = self.allowed_ids(filter).await?;
        if allowed.as_ref().is_some_and(HashSet::is_empty) {
            return Ok(Vec::new());
        }
        let index = self.state.index.read();
        if index.is_empty() {
            return Ok(Vec::new());
        }
        let raw = match &allowed {
            Some(set) => index.search_filtered(query, k, ef, |id| set.contains(id))?,
            None => index.search(query, k, ef)?,
        };
        let metric = index.metric();
        Ok(raw
            .into_iter()
            .map(|(id, distance)| (id, metric.score(distance)))
            .collect())
    }

    /// Nearest neighbors of `query`, best first, hydrated from storage.
    pub async fn search(&self, query: &[f32], options: SearchOptions) -> DbResult<Vec<SearchResult>> {
        self.ensure_live()?;
        validate::k(options.k)?;
        validate_vector(query, self.dimensions())?;

        let hits = self
            .vector_hits(query, options.k, options.ef, options.filter.as_ref())
            .await?;
        let mut results = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            if options.threshold.is_some_and(|t| score < t) {
                continue;
            }
            let Some(doc) = self.db.storage.get_document(self.id(), &id).await? else {
                tracing::debug!(collection = %self.name(), id = %id, "index hit without stored document");
                continue;
            };
            let vector = if options.include_vectors {
                self.db
                    .storage
                    .get_vector(self.id(), &id)
                    .await?
                    .map(|v| v.vector)
            } else {
                None
            };
            results.push(SearchResult {
                id,
                score,
                metadata: doc.metadata,
                text: doc.text,
                vector,
            });
        }
        Ok(results)
    }

    /// BM25 search over document text, best first.
    pub async fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&FilterClause>,
    ) -> DbResult<Vec<SearchResult>> {
        self.ensure_live()?;
        validate::k(k)?;
        let hits = {
            let keywords = self.state.keywords.read();
            let fetch = if filter.is_some() { keywords.len().max(k) } else { k };
            keywords.search(query, fetch)
        };
        let mut results = Vec::with_capacity(k.min(hits.len()));
        for hit in hits {
            if results.len() == k {
                break;
            }
            let Some(doc) = self.db.storage.get_document(self.id(), &hit.id).await? else {
                continue;
            };
            if filter.is_some_and(|f| !matches_filter(&doc.metadata, f)) {
                continue;
            }
            results.push(SearchResult {
                id: hit.id,
                score: hit.score,
                metadata: doc.metadata,
                text: doc.text,
                vector: None,
            });
        }
        Ok(results)
    }

    /// Fuse vector and keyword rankings into one list.
    pub async fn hybrid_search(&self, query: HybridQuery) -> DbResult<Vec<HybridResult>> {
        self.ensure_live()?;
        validate::k(query.k)?;
        validate_vector(&query.vector, self.dimensions())?;

        let fetch = query.k.saturating_mul(4).min(MAX_K).max(query.k);
        let vector: Vec<ScoredId> = self
            .vector_hits(&query.vector, fetch, None, query.filter.as_ref())
            .await?
            .into_iter()
            .map(|(id, score)| ScoredId::new(id, score))
            .collect();
        let keyword = {
            let keywords = self.state.keywords.read();
            let fetch = if query.filter.is_some() { keywords.len().max(fetch) } else { fetch };
            keywords.search(&query.text, fetch)
        };

        let mut results = Vec::with_capacity(query.k);
        for hit in query.fusion.fuse(&vector, &keyword) {
            if results.len() == query.k || query.min_score.is_some_and(|m| hit.score < m) {
                break;
            }
            let Some(doc) = self.db.storage.get_document(self.id(), &hit.id).await? else {
                continue;
            };
            if query
                .filter
                .as_ref()
                .is_some_and(|f| !matches_filter(&doc.metadata, f))
            {
                continue;
            }
            results.push(HybridResult {
                id: hit.id,
                score: hit.score,
                vector_score: hit.vector_score,
                keyword_score: hit.keyword_score,
                metadata: doc.metadata,
                text: doc.text,
            });
        }
        Ok(results)
    }

    pub async fn stats(&self) -> DbResult<CollectionStats> {
        self.ensure_live()?;
        let documents = self.db.storage.count_documents(self.id()).await?;
        let vectors = self.db.storage.count_vectors(self.id()).await?;
        let (indexed, tombstones) = {
            let index = self.state.index.read();
            (index.len(), index.tombstones())
        };
        Ok(CollectionStats {
            id: self.id().to_string(),
            name: self.name().to_string(),
            dimensions: self.dimensions(),
            metric: self.metric(),
            documents,
            vectors,
            indexed,
            tombstones,
            keyword_documents: self.state.keywords.read().len(),
            unsaved_mutations: self.state.unsaved(),
        })
    }

    /// Remove every document, keeping the collection itself.
    pub async fn clear(&self) -> DbResult<()> {
        self.clear_cancellable(&CancellationToken::new()).await
    }

    /// [`Self::clear`] that gives up while waiting for the write lock, and
    /// logs nothing, once `token` is cancelled.
    pub async fn clear_cancellable(&self, token: &CancellationToken) -> DbResult<()> {
        let _guard = self.begin_write(Some(token)).await?;
        let operation = WalOperation::ClearCollection {
            collection_id: self.id().to_string(),
        };
        self.db
            .wal
            .with_wal_cancellable(operation, token, || async {
                self.db.storage.clear_collection(self.id()).await?;
                self.state.index_reset();
                Ok::<(), DbError>(())
            })
            .await?;
        tracing::info!(collection = %self.name(), "collection cleared");
        Ok(())
    }

    /// Serialize the collection (record, rows and index) into one blob.
    pub async fn export(&self) -> DbResult<Vec<u8>> {
        self.ensure_live()?;
        let _queue = self.state.run_queue.lock().await;
        let options = LockOptions::shared().with_timeout(self.db.config.lock_timeout);
        let _lock = self.db.locks.acquire(&self.lock_resource(), options).await?;

        let documents = self.db.storage.get_all_documents(self.id()).await?;
        let vectors = self.db.storage.get_all_vectors(self.id()).await?;
        let index = self
            .state
            .index
            .read()
            .to_bytes()
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        let export = CollectionExport {
            format_version: EXPORT_FORMAT_VERSION,
            collection: self.state.record.clone(),
            documents,
            vectors,
            index: Some(index),
        };
        let bytes = export.to_bytes()?;
        tracing::info!(collection = %self.name(), documents = export.documents.len(), bytes = bytes.len(), "collection exported");
        Ok(bytes)
    }

    /// Rebuild the HNSW graph and BM25 index from stored rows and persist
    /// the result. Returns the number of indexed vectors.
    pub async fn rebuild_index(&self) -> DbResult<usize> {
        self.rebuild_index_cancellable(&CancellationToken::new())
            .await
    }

    /// [`Self::rebuild_index`] that checks `token` while building. The new
    /// index is swapped in only when the build completes, so a cancelled
    /// rebuild leaves the live index untouched.
    pub async fn rebuild_index_cancellable(&self, token: &CancellationToken) -> DbResult<usize> {
        let _guard = self.begin_write(Some(token)).await?;
        let vectors = self.db.storage.get_all_vectors(self.id()).await?;
        let mut index = self.state.empty_index();
        let mut inserted = 0;
        for (i, v) in vectors.iter().enumerate() {
            if i % REBUILD_CHECK_INTERVAL == 0 {
                if token.is_cancelled() {
                    tracing::info!(collection = %self.name(), done = i, total = vectors.len(), "index rebuild cancelled");
                    return Err(DbError::Cancelled);
                }
                tokio::task::yield_now().await;
            }
            match index.insert(v.id.clone(), &v.vector) {
                Ok(()) => inserted += 1,
                Err(e) => tracing::warn!(collection = %self.name(), id = %v.id, error = %e, "stored vector rejected by index"),
            }
        }
        let mut keywords = Bm25Index::new(self.state.bm25);
        for doc in self.db.storage.get_all_documents(self.id()).await? {
            if let Some(text) = &doc.text {
                keywords.add(doc.id.clone(), text);
            }
        }
        if token.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        *self.state.index.write() = index;
        *self.state.keywords.write() = keywords;
        self.persist_locked().await?;
        tracing::info!(collection = %self.name(), nodes = inserted, "index rebuilt");
        Ok(inserted)
    }

    /// Write the current HNSW index to storage.
    pub async fn persist_index(&self) -> DbResult<()> {
        let _guard = self.begin_write(None).await?;
        self.persist_locked().await
    }

    pub(crate) async fn persist_locked(&self) -> DbResult<()> {
        let blob = self
            .state
            .index
            .read()
            .to_bytes()
            .map_err(|e| StorageError::Codec(e.to_string()))?;
        let record = IndexRecord {
            collection_id: self.id().to_string(),
            blob,
            updated_at: now_ms(),
        };
        let size = record.blob.len();
        self.db
            .wal
            .with_wal(
                WalOperation::SaveIndex {
                    record: record.clone(),
                },
                || async {
                    self.db.storage.save_index(record).await?;
                    Ok::<(), DbError>(())
                },
            )
            .await?;
        self.state.unsaved.store(0, Ordering::Relaxed);
        tracing::debug!(collection = %self.name(), bytes = size, "index persisted");
        Ok(())
    }
}
