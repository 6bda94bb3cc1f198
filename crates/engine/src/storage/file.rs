//! File-backed storage adapter: snapshot + mutation journal.
//!
//! Layout under the store directory:
//! - `store.lock`: held exclusively for the lifetime of an open handle.
//! - `store.snap`: bincode [`StoreState`] sealed with `VSS1` + CRC32, replaced atomically.
//! - `journal.bin`: CRC-framed [`Mutation`] records, group-committed by a [`LogWriter`].
//!
//! Opening loads the snapshot and replays the journal on top of it. Mutations
//! are overwrites, so replaying a journal prefix the snapshot already contains
//! yields the same state.

use super::memory::MemoryStorage;
use super::{
    CollectionRecord, IndexRecord, Mutation, StorageAdapter, StoreState, StoredDocument,
    StoredVector,
};
use crate::error::{MigrationError, StorageError};
use crate::frame::{self, LogWriter};
use crate::lock::OwnerLock;
use crate::migration::MigrationManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

const SNAPSHOT_FILE: &str = "store.snap";
const JOURNAL_FILE: &str = "journal.bin";
const SNAPSHOT_MAGIC: &[u8; 4] = b"VSS1";

/// Journal length (in records) that triggers an automatic compaction.
pub const JOURNAL_COMPACT_THRESHOLD: usize = 50_000;

/// Persistent [`StorageAdapter`] rooted at a directory.
///
/// One handle owns a directory at a time; a second [`FileStorage::open`] on
/// the same directory fails with [`StorageError::Locked`] until the first is
/// closed or dropped.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    inner: MemoryStorage,
    journal: LogWriter,
    journal_records: AtomicUsize,
    /// Serializes check, journal append and apply.
    gate: tokio::sync::Mutex<()>,
    owner: Mutex<Option<OwnerLock>>,
}

impl FileStorage {
    /// Open (creating if needed) a store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        let owner =
            OwnerLock::try_acquire(&dir, "store")?.ok_or_else(|| StorageError::Locked(dir.clone()))?;

        let snap_path = dir.join(SNAPSHOT_FILE);
        let mut state = if snap_path.exists() {
            read_snapshot(&snap_path)?
        } else {
            StoreState::default()
        };

        let journal_path = dir.join(JOURNAL_FILE);
        let (mutations, stats) = frame::read_frames::<Mutation>(&journal_path)?;
        let mut replayed = mutations.len();
        for mutation in mutations {
            state.apply(mutation);
        }
        tracing::info!(
            dir = %dir.display(),
            collections = state.collections.len(),
            journal_records = replayed,
            "storage opened"
        );

        if !stats.is_clean() {
            tracing::warn!(
                skipped = stats.skipped,
                crc_errors = stats.crc_errors,
                truncated = stats.truncated,
                "journal damaged, compacting the recovered prefix"
            );
            write_snapshot(&snap_path, &state)?;
            let truncated = OpenOptions::new().write(true).truncate(true).open(&journal_path)?;
            truncated.sync_all()?;
            replayed = 0;
        }

        Ok(Self {
            journal: LogWriter::open(&journal_path)?,
            journal_records: AtomicUsize::new(replayed),
            inner: MemoryStorage::with_state(state),
            gate: tokio::sync::Mutex::new(()),
            owner: Mutex::new(Some(owner)),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records in the journal since the last snapshot.
    pub fn journal_len(&self) -> usize {
        self.journal_records.load(Ordering::Acquire)
    }

    /// Fold the journal into a fresh snapshot and truncate it.
    pub async fn compact(&self) -> Result<(), StorageError> {
        let _gate = self.gate.lock().await;
        self.inner.ensure_open()?;
        self.checkpoint(self.inner.snapshot()).await?;
        tracing::info!(dir = %self.dir.display(), "storage compacted");
        Ok(())
    }

    /// Write `state` as the snapshot, then empty the journal. Callers hold the gate.
    async fn checkpoint(&self, state: StoreState) -> Result<(), StorageError> {
        let path = self.dir.join(SNAPSHOT_FILE);
        tokio::task::spawn_blocking(move || write_snapshot(&path, &state))
            .await
            .map_err(|e| io::Error::other(e.to_string()))??;
        self.journal.replace(Vec::new()).await?;
        self.journal_records.store(0, Ordering::Release);
        Ok(())
    }

    async fn mutate(&self, mutation: Mutation) -> Result<bool, StorageError> {
        let affected = {
            let _gate = self.gate.lock().await;
            self.inner.check(&mutation)?;
            let framed = frame::encode_frame(&mutation)?;
            self.journal.append(framed).await?;
            self.journal_records.fetch_add(1, Ordering::AcqRel);
            self.inner.apply(mutation)
        };

        if self.journal_len() >= JOURNAL_COMPACT_THRESHOLD {
            self.compact().await?;
        }
        Ok(affected)
    }
}

fn write_snapshot(path: &Path, state: &StoreState) -> Result<(), StorageError> {
    let payload = bincode::serialize(state)?;
    frame::write_atomic(path, &frame::seal(&payload, SNAPSHOT_MAGIC))?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<StoreState, StorageError> {
    let raw = fs::read(path)?;
    let payload = frame::unseal(&raw, SNAPSHOT_MAGIC)
        .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())))?;
    bincode::deserialize(payload)
        .map_err(|e| StorageError::Corrupt(format!("{}: {e}", path.display())))
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn initialize(&self, migrations: &MigrationManager) -> Result<u32, MigrationError> {
        let _gate = self.gate.lock().await;
        let current = self.inner.read(StoreState::clone)?;
        match migrations.upgrade(&current)? {
            Some(upgraded) => {
                let version = upgraded.schema.version;
                self.checkpoint(upgraded.clone()).await?;
                self.inner.replace(upgraded);
                Ok(version)
            }
            None => Ok(current.schema.version),
        }
    }

    async fn schema_version(&self) -> Result<u32, StorageError> {
        self.inner.schema_version().await
    }

    async fn add_document(&self, document: StoredDocument) -> Result<(), StorageError> {
        self.mutate(Mutation::PutDocument(document)).await.map(|_| ())
    }

    async fn get_document(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StorageError> {
        self.inner.get_document(collection_id, id).await
    }

    async fn delete_document(&self, collection_id: &str, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteDocument {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
        })
        .await
    }

    async fn get_all_documents(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredDocument>, StorageError> {
        self.inner.get_all_documents(collection_id).await
    }

    async fn count_documents(&self, collection_id: &str) -> Result<usize, StorageError> {
        self.inner.count_documents(collection_id).await
    }

    async fn add_vector(&self, vector: StoredVector) -> Result<(), StorageError> {
        self.mutate(Mutation::PutVector(vector)).await.map(|_| ())
    }

    async fn get_vector(
        &self,
        collection_id: &str,
        id: &str,
    ) -> Result<Option<StoredVector>, StorageError> {
        self.inner.get_vector(collection_id, id).await
    }

    async fn delete_vector(&self, collection_id: &str, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteVector {
            collection_id: collection_id.to_string(),
            id: id.to_string(),
        })
        .await
    }

    async fn get_all_vectors(
        &self,
        collection_id: &str,
    ) -> Result<Vec<StoredVector>, StorageError> {
        self.inner.get_all_vectors(collection_id).await
    }

    async fn count_vectors(&self, collection_id: &str) -> Result<usize, StorageError> {
        self.inner.count_vectors(collection_id).await
    }

    async fn put_document_with_vector(
        &self,
        document: StoredDocument,
        vector: Option<StoredVector>,
    ) -> Result<(), StorageError> {
        self.mutate(Mutation::PutRow { document, vector }).await.map(|_| ())
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
        .await
    }

    async fn save_index(&self, record: IndexRecord) -> Result<(), StorageError> {
        self.mutate(Mutation::PutIndex(record)).await.map(|_| ())
    }

    async fn load_index(&self, collection_id: &str) -> Result<Option<IndexRecord>, StorageError> {
        self.inner.load_index(collection_id).await
    }

    async fn delete_index(&self, collection_id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteIndex {
            collection_id: collection_id.to_string(),
        })
        .await
    }

    async fn create_collection(&self, record: CollectionRecord) -> Result<(), StorageError> {
        self.mutate(Mutation::CreateCollection(record)).await.map(|_| ())
    }

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>, StorageError> {
        self.inner.get_collection(id).await
    }

    async fn get_collection_by_name(
        &self,
        name: &str,
    ) -> Result<Option<CollectionRecord>, StorageError> {
        self.inner.get_collection_by_name(name).await
    }

    async fn get_all_collections(&self) -> Result<Vec<CollectionRecord>, StorageError> {
        self.inner.get_all_collections().await
    }

    async fn delete_collection(&self, id: &str) -> Result<bool, StorageError> {
        self.mutate(Mutation::DeleteCollection {
            collection_id: id.to_string(),
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.mutate(Mutation::Clear).await.map(|_| ())
    }

    async fn clear_collection(&self, id: &str) -> Result<(), StorageError> {
        self.mutate(Mutation::ClearCollection {
            collection_id: id.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.inner.mark_closed() {
            return Ok(());
        }
        // Every append made under the gate has already been acknowledged.
        let _gate = self.gate.lock().await;
        self.journal.shutdown();
        self.owner.lock().take();
        tracing::info!(dir = %self.dir.display(), "storage closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Schema;
    use crate::storage::tests::{collection, document, exercise_adapter, vector};

    #[tokio::test]
    async fn test_adapter_contract() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.initialize(&MigrationManager::default()).await.unwrap();
        exercise_adapter(&storage).await;
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.initialize(&MigrationManager::default()).await.unwrap();
            storage.create_collection(collection("c", "docs", 2)).await.unwrap();
            storage.add_document(document("c", "a")).await.unwrap();
            storage.add_vector(vector("c", "a", vec![1.0, 2.0])).await.unwrap();
            storage.close().await.unwrap();
        }
        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.journal_len(), 3);
        assert_eq!(
            storage.get_vector("c", "a").await.unwrap().unwrap().vector,
            vec![1.0, 2.0]
        );
        assert_eq!(storage.schema_version().await.unwrap(), Schema::latest().version);
    }

    #[tokio::test]
    async fn test_compact_folds_journal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.initialize(&MigrationManager::default()).await.unwrap();
        storage.create_collection(collection("c", "docs", 2)).await.unwrap();
        storage.add_document(document("c", "a")).await.unwrap();
        storage.compact().await.unwrap();
        assert_eq!(storage.journal_len(), 0);
        storage.close().await.unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert!(reopened.get_document("c", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_torn_journal_recovers_prefix() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.create_collection(collection("c", "docs", 2)).await.unwrap();
            storage.add_document(document("c", "a")).await.unwrap();
        }
        let journal = dir.path().join(JOURNAL_FILE);
        let mut bytes = fs::read(&journal).unwrap();
        bytes.truncate(bytes.len() - 3);
        fs::write(&journal, &bytes).unwrap();

        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(storage.get_collection("c").await.unwrap().is_some());
        assert!(storage.get_document("c", "a").await.unwrap().is_none());
        assert_eq!(storage.journal_len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"garbage").unwrap();
        assert!(matches!(
            FileStorage::open(dir.path()),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_second_open_is_refused_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileStorage::open(dir.path()).unwrap();
        first.create_collection(collection("c", "docs", 2)).await.unwrap();

        assert!(matches!(
            FileStorage::open(dir.path()),
            Err(StorageError::Locked(_))
        ));

        first.close().await.unwrap();
        let second = FileStorage::open(dir.path()).unwrap();
        assert!(second.get_collection("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_row_pair_is_one_journal_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.create_collection(collection("c", "docs", 2)).await.unwrap();
        storage
            .put_document_with_vector(document("c", "a"), Some(vector("c", "a", vec![1.0, 0.0])))
            .await
            .unwrap();
        assert_eq!(storage.journal_len(), 2);
        assert!(storage.delete_document_with_vector("c", "a").await.unwrap());
        assert_eq!(storage.journal_len(), 3);
        assert!(storage.get_document("c", "a").await.unwrap().is_none());
        assert!(storage.get_vector("c", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_torn_row_pair_leaves_no_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join(JOURNAL_FILE);
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.create_collection(collection("c", "docs", 2)).await.unwrap();
            storage
                .put_document_with_vector(document("c", "a"), Some(vector("c", "a", vec![1.0, 0.0])))
                .await
                .unwrap();
            storage.close().await.unwrap();
        }
        // Cut the row-pair frame anywhere past its header: both rows go or neither.
        let full = fs::read(&journal).unwrap();
        let mut bytes = full.clone();
        bytes.truncate(full.len() - 5);
        fs::write(&journal, &bytes).unwrap();

        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(storage.get_collection("c").await.unwrap().is_some());
        assert!(storage.get_document("c", "a").await.unwrap().is_none());
        assert!(storage.get_vector("c", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_length_header_recovers_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join(JOURNAL_FILE);
        let tail_start;
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.create_collection(collection("c", "docs", 2)).await.unwrap();
            tail_start = fs::metadata(&journal).unwrap().len() as usize;
            storage
                .put_document_with_vector(document("c", "a"), Some(vector("c", "a", vec![1.0, 0.0])))
                .await
                .unwrap();
            storage.close().await.unwrap();
        }
        // Length header claims far more than the file holds; CRC and payload are intact.
        let mut bytes = fs::read(&journal).unwrap();
        bytes[tail_start..tail_start + 4].copy_from_slice(&0x7FFF_FFFFu32.to_be_bytes());
        fs::write(&journal, &bytes).unwrap();

        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(storage.get_collection("c").await.unwrap().is_some());
        assert!(storage.get_document("c", "a").await.unwrap().is_none());
        assert!(storage.get_vector("c", "a").await.unwrap().is_none());
        assert_eq!(storage.journal_len(), 0);
        storage.add_document(document("c", "b")).await.unwrap();
        storage.close().await.unwrap();

        let reopened = FileStorage::open(dir.path()).unwrap();
        assert!(reopened.get_document("c", "b").await.unwrap().is_some());
    }
}
