//! Write-ahead log.
//!
//! Every mutation is logged as a `pending` [`WalEntry`] before storage is
//! touched, then marked `committed` or `rolled_back`. On reopen,
//! [`WriteAheadLog::replay`] re-applies whatever is still pending through a
//! [`WalExecutor`]. Storage adds are upserts, so re-applying an entry whose
//! effect already landed is harmless.

pub mod store;

pub use store::{FileWalStore, MemoryWalStore, WalLoad, WalStore};

use crate::error::{StorageError, WalError};
use crate::storage::{
    now_ms, CollectionRecord, IndexRecord, StorageAdapter, StoredDocument, StoredVector,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The payload of a WAL entry, one variant per operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperation {
    AddDocument {
        document: StoredDocument,
        vector: Option<StoredVector>,
    },
    UpdateDocument {
        document: StoredDocument,
        vector: Option<StoredVector>,
    },
    /// Removes the document together with its vector.
    DeleteDocument { collection_id: String, id: String },
    AddVector { vector: StoredVector },
    DeleteVector { collection_id: String, id: String },
    SaveIndex { record: IndexRecord },
    CreateCollection { record: CollectionRecord },
    DeleteCollection { collection_id: String },
    ClearCollection { collection_id: String },
    ClearDatabase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOperationType {
    AddDocument,
    UpdateDocument,
    DeleteDocument,
    AddVector,
    DeleteVector,
    SaveIndex,
    CreateCollection,
    DeleteCollection,
    ClearCollection,
    ClearDatabase,
}

impl WalOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalOperationType::AddDocument => "add_document",
            WalOperationType::UpdateDocument => "update_document",
            WalOperationType::DeleteDocument => "delete_document",
            WalOperationType::AddVector => "add_vector",
            WalOperationType::DeleteVector => "delete_vector",
            WalOperationType::SaveIndex => "save_index",
            WalOperationType::CreateCollection => "create_collection",
            WalOperationType::DeleteCollection => "delete_collection",
            WalOperationType::ClearCollection => "clear_collection",
            WalOperationType::ClearDatabase => "clear_database",
        }
    }
}

impl fmt::Display for WalOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WalOperation {
    pub fn kind(&self) -> WalOperationType {
        match self {
            WalOperation::AddDocument { .. } => WalOperationType::AddDocument,
            WalOperation::UpdateDocument { .. } => WalOperationType::UpdateDocument,
            WalOperation::DeleteDocument { .. } => WalOperationType::DeleteDocument,
            WalOperation::AddVector { .. } => WalOperationType::AddVector,
            WalOperation::DeleteVector { .. } => WalOperationType::DeleteVector,
            WalOperation::SaveIndex { .. } => WalOperationType::SaveIndex,
            WalOperation::CreateCollection { .. } => WalOperationType::CreateCollection,
            WalOperation::DeleteCollection { .. } => WalOperationType::DeleteCollection,
            WalOperation::ClearCollection { .. } => WalOperationType::ClearCollection,
            WalOperation::ClearDatabase => WalOperationType::ClearDatabase,
        }
    }

    /// Collection the operation touches, if it is collection-scoped.
    pub fn collection_id(&self) -> Option<&str> {
        match self {
            WalOperation::AddDocument { document, .. }
            | WalOperation::UpdateDocument { document, .. } => Some(&document.collection_id),
            WalOperation::DeleteDocument { collection_id, .. }
            | WalOperation::DeleteVector { collection_id, .. }
            | WalOperation::DeleteCollection { collection_id }
            | WalOperation::ClearCollection { collection_id } => Some(collection_id),
            WalOperation::AddVector { vector } => Some(&vector.collection_id),
            WalOperation::SaveIndex { record } => Some(&record.collection_id),
            WalOperation::CreateCollection { record } => Some(&record.id),
            WalOperation::ClearDatabase => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    pub id: String,
    pub sequence: u64,
    pub operation: WalOperation,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub status: WalStatus,
    pub transaction_id: Option<String>,
}

/// Applies a logged operation to storage during replay.
#[async_trait]
pub trait WalExecutor: Send + Sync {
    async fn execute(&self, operation: &WalOperation) -> Result<(), StorageError>;
}

/// Replays operations straight into a [`StorageAdapter`].
pub struct StorageExecutor<'a> {
    storage: &'a dyn StorageAdapter,
}

impl<'a> StorageExecutor<'a> {
    pub fn new(storage: &'a dyn StorageAdapter) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl WalExecutor for StorageExecutor<'_> {
    async fn execute(&self, operation: &WalOperation) -> Result<(), StorageError> {
        match operation {
            WalOperation::AddDocument { document, vector }
            | WalOperation::UpdateDocument { document, vector } => {
                self.storage
                    .put_document_with_vector(document.clone(), vector.clone())
                    .await?;
            }
            WalOperation::DeleteDocument { collection_id, id } => {
                self.storage
                    .delete_document_with_vector(collection_id, id)
                    .await?;
            }
            WalOperation::AddVector { vector } => self.storage.add_vector(vector.clone()).await?,
            WalOperation::DeleteVector { collection_id, id } => {
                self.storage.delete_vector(collection_id, id).await?;
            }
            WalOperation::SaveIndex { record } => self.storage.save_index(record.clone()).await?,
            WalOperation::CreateCollection { record } => {
                self.storage.create_collection(record.clone()).await?
            }
            WalOperation::DeleteCollection { collection_id } => {
                self.storage.delete_collection(collection_id).await?;
            }
            WalOperation::ClearCollection { collection_id } => {
                self.storage.clear_collection(collection_id).await?
            }
            WalOperation::ClearDatabase => self.storage.clear().await?,
        }
        Ok(())
    }
}

/// Outcome of [`WriteAheadLog::replay`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: usize,
    pub rolled_back: usize,
}

#[derive(Debug, Default)]
struct WalState {
    entries: BTreeMap<u64, WalEntry>,
    by_id: HashMap<String, u64>,
    next_sequence: u64,
    active_transaction: Option<String>,
}

impl WalState {
    fn entry_mut(&mut self, id: &str) -> Result<&mut WalEntry, WalError> {
        self.by_id
            .get(id)
            .and_then(|seq| self.entries.get_mut(seq))
            .ok_or_else(|| WalError::EntryNotFound(id.to_string()))
    }
}

/// Write-ahead log over a pluggable [`WalStore`].
#[derive(Debug)]
pub struct WriteAheadLog {
    store: Arc<dyn WalStore>,
    state: Mutex<WalState>,
}

impl WriteAheadLog {
    /// Open a log over `store`, restoring surviving entries and the sequence counter.
    pub async fn open(store: Arc<dyn WalStore>) -> Result<Self, WalError> {
        let load = store.load().await?;
        let mut state = WalState::default();
        let mut high_water = load.high_water;
        for entry in load.entries {
            high_water = high_water.max(entry.sequence);
            state.by_id.insert(entry.id.clone(), entry.sequence);
            state.entries.insert(entry.sequence, entry);
        }
        state.next_sequence = high_water + 1;
        let pending = state
            .entries
            .values()
            .filter(|e| e.status == WalStatus::Pending)
            .count();
        tracing::info!(
            entries = state.entries.len(),
            pending,
            next_sequence = state.next_sequence,
            "WAL opened"
        );
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Log backed by a fresh [`MemoryWalStore`].
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryWalStore::new()),
            state: Mutex::new(WalState {
                next_sequence: 1,
                ..WalState::default()
            }),
        }
    }

    /// Append a pending entry, tagged with the active transaction if any.
    /// Returns once the entry is durable.
    pub async fn log(&self, operation: WalOperation) -> Result<String, WalError> {
        let mut state = self.state.lock().await;
        let transaction_id = state.active_transaction.clone();
        self.append_locked(&mut state, operation, transaction_id).await
    }

    /// Append a pending entry under an explicit transaction id.
    pub async fn log_in_transaction(
        &self,
        operation: WalOperation,
        transaction_id: Option<&str>,
    ) -> Result<String, WalError> {
        let mut state = self.state.lock().await;
        self.append_locked(&mut state, operation, transaction_id.map(str::to_string))
            .await
    }

    async fn append_locked(
        &self,
        state: &mut WalState,
        operation: WalOperation,
        transaction_id: Option<String>,
    ) -> Result<String, WalError> {
        let entry = WalEntry {
            id: Uuid::new_v4().to_string(),
            sequence: state.next_sequence,
            operation,
            timestamp: now_ms(),
            status: WalStatus::Pending,
            transaction_id,
        };
        self.store.append(&entry).await?;
        tracing::debug!(
            sequence = entry.sequence,
            op = %entry.operation.kind(),
            "WAL entry logged"
        );
        let id = entry.id.clone();
        state.next_sequence += 1;
        state.by_id.insert(id.clone(), entry.sequence);
        state.entries.insert(entry.sequence, entry);
        Ok(id)
    }

    pub async fn commit(&self, id: &str) -> Result<(), WalError> {
        self.set_status(id, WalStatus::Committed).await
    }

    pub async fn rollback(&self, id: &str) -> Result<(), WalError> {
        self.set_status(id, WalStatus::RolledBack).await
    }

    async fn set_status(&self, id: &str, status: WalStatus) -> Result<(), WalError> {
        let mut state = self.state.lock().await;
        state.entry_mut(id)?;
        self.store.set_status(id, status).await?;
        state.entry_mut(id)?.status = status;
        Ok(())
    }

    /// Log `operation`, run `f`, then commit on success or roll back on
    /// failure. The error from `f` is returned unchanged.
    pub async fn with_wal<T, E, F, Fut>(&self, operation: WalOperation, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<WalError>,
    {
        let id = self.log(operation).await?;
        self.finish(id, f().await).await
    }

    /// Like [`Self::with_wal`], but nothing is logged if `token` is already cancelled.
    pub async fn with_wal_cancellable<T, E, F, Fut>(
        &self,
        operation: WalOperation,
        token: &CancellationToken,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<WalError>,
    {
        if token.is_cancelled() {
            return Err(WalError::Cancelled.into());
        }
        self.with_wal(operation, f).await
    }

    /// Resolve entry `id` according to the outcome of its protected operation.
    pub async fn finish<T, E>(&self, id: String, outcome: Result<T, E>) -> Result<T, E>
    where
        E: From<WalError>,
    {
        match outcome {
            Ok(value) => {
                self.commit(&id).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(&id).await {
                    tracing::warn!(entry = %id, error = %rollback_err, "WAL rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Re-apply every pending entry in sequence order. Each entry is committed
    /// if `executor` succeeds and rolled back otherwise; one failure does not
    /// stop the rest.
    pub async fn replay(&self, executor: &dyn WalExecutor) -> Result<ReplayStats, WalError> {
        let pending = self.pending().await;
        let mut stats = ReplayStats::default();
        if pending.is_empty() {
            return Ok(stats);
        }
        tracing::info!(count = pending.len(), "replaying pending WAL entries");
        for entry in pending {
            match executor.execute(&entry.operation).await {
                Ok(()) => {
                    self.commit(&entry.id).await?;
                    stats.replayed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        sequence = entry.sequence,
                        op = %entry.operation.kind(),
                        error = %e,
                        "WAL replay failed, rolling back entry"
                    );
                    self.rollback(&entry.id).await?;
                    stats.rolled_back += 1;
                }
            }
        }
        tracing::info!(
            replayed = stats.replayed,
            rolled_back = stats.rolled_back,
            "WAL replay complete"
        );
        Ok(stats)
    }

    /// Start tagging [`Self::log`] entries with a new transaction id.
    pub async fn begin_transaction(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.active_transaction = Some(id.clone());
        id
    }

    pub async fn end_transaction(&self) {
        self.state.lock().await.active_transaction = None;
    }

    /// Commit every pending entry of `transaction_id`. Returns how many changed.
    pub async fn commit_transaction(&self, transaction_id: &str) -> Result<usize, WalError> {
        self.resolve_transaction(transaction_id, WalStatus::Committed)
            .await
    }

    /// Roll back every pending entry of `transaction_id`. Returns how many changed.
    pub async fn rollback_transaction(&self, transaction_id: &str) -> Result<usize, WalError> {
        self.resolve_transaction(transaction_id, WalStatus::RolledBack)
            .await
    }

    async fn resolve_transaction(
        &self,
        transaction_id: &str,
        status: WalStatus,
    ) -> Result<usize, WalError> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for entry in state.entries.values_mut() {
            if entry.status == WalStatus::Pending
                && entry.transaction_id.as_deref() == Some(transaction_id)
            {
                self.store.set_status(&entry.id, status).await?;
                entry.status = status;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Purge resolved entries older than `max_age`. Pending entries are never purged.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, WalError> {
        let mut state = self.state.lock().await;
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as u64);
        let doomed: Vec<u64> = state
            .entries
            .values()
            .filter(|e| e.status != WalStatus::Pending && e.timestamp < cutoff)
            .map(|e| e.sequence)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let remaining: Vec<WalEntry> = state
            .entries
            .values()
            .filter(|e| !doomed.contains(&e.sequence))
            .cloned()
            .collect();
        self.store.purge(&remaining, state.next_sequence - 1).await?;
        for seq in &doomed {
            if let Some(entry) = state.entries.remove(seq) {
                state.by_id.remove(&entry.id);
            }
        }
        tracing::debug!(purged = doomed.len(), "WAL cleanup");
        Ok(doomed.len())
    }

    /// Pending entries in sequence order.
    pub async fn pending(&self) -> Vec<WalEntry> {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.status == WalStatus::Pending)
            .cloned()
            .collect()
    }

    /// All retained entries in sequence order.
    pub async fn entries(&self) -> Vec<WalEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<WalEntry> {
        let state = self.state.lock().await;
        state.by_id.get(id).and_then(|seq| state.entries.get(seq)).cloned()
    }

    /// Sequence number the next entry will receive.
    pub async fn next_sequence(&self) -> u64 {
        self.state.lock().await.next_sequence
    }

    /// Release the backing store. Waits for in-flight appends first.
    pub async fn close(&self) -> Result<(), WalError> {
        let _state = self.state.lock().await;
        self.store.close().await
    }
}
