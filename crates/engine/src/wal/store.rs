//! Persistence backends for the write-ahead log.

use super::{WalEntry, WalStatus};
use crate::error::WalError;
use crate::frame::{self, FrameReadStats, LogWriter};
use crate::lock::OwnerLock;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything a store knows after (re)opening.
#[derive(Debug, Default)]
pub struct WalLoad {
    /// Surviving entries in sequence order.
    pub entries: Vec<WalEntry>,
    /// Highest sequence ever assigned, including purged entries.
    pub high_water: u64,
    pub stats: FrameReadStats,
}

/// Durable home of WAL entries. Calls return only after the change is durable.
#[async_trait]
pub trait WalStore: Send + Sync + std::fmt::Debug {
    async fn load(&self) -> Result<WalLoad, WalError>;
    async fn append(&self, entry: &WalEntry) -> Result<(), WalError>;
    async fn set_status(&self, id: &str, status: WalStatus) -> Result<(), WalError>;
    /// Replace the stored entries with `remaining`, remembering `high_water`.
    async fn purge(&self, remaining: &[WalEntry], high_water: u64) -> Result<(), WalError>;
    /// Stop writing and release any ownership of the backing files.
    async fn close(&self) -> Result<(), WalError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryWal {
    entries: BTreeMap<u64, WalEntry>,
    high_water: u64,
}

/// Volatile store. Shared through an `Arc`, it outlives a dropped
/// [`super::WriteAheadLog`], which is how tests simulate a crash.
#[derive(Debug, Default)]
pub struct MemoryWalStore {
    inner: Mutex<MemoryWal>,
}

impl MemoryWalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalStore for MemoryWalStore {
    async fn load(&self) -> Result<WalLoad, WalError> {
        let inner = self.inner.lock();
        Ok(WalLoad {
            entries: inner.entries.values().cloned().collect(),
            high_water: inner.high_water,
            stats: FrameReadStats::default(),
        })
    }

    async fn append(&self, entry: &WalEntry) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        inner.high_water = inner.high_water.max(entry.sequence);
        inner.entries.insert(entry.sequence, entry.clone());
        Ok(())
    }

    async fn set_status(&self, id: &str, status: WalStatus) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .values_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WalError::EntryNotFound(id.to_string()))?;
        entry.status = status;
        Ok(())
    }

    async fn purge(&self, remaining: &[WalEntry], high_water: u64) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        inner.entries = remaining.iter().map(|e| (e.sequence, e.clone())).collect();
        inner.high_water = inner.high_water.max(high_water);
        Ok(())
    }
}

/// One frame of `wal.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WalRecord {
    Entry(WalEntry),
    Status { id: String, status: WalStatus },
    HighWater(u64),
}

/// `wal.bin` in the data directory: CRC-framed records written through a
/// group-commit [`LogWriter`]. Status changes are appended as their own
/// records; purges rewrite the file.
///
/// The store owns `wal.lock` from open until [`WalStore::close`] or drop, so
/// exactly one handle assigns sequence numbers for a data directory and the
/// high-water mark read by `load` stays authoritative.
#[derive(Debug)]
pub struct FileWalStore {
    path: PathBuf,
    writer: LogWriter,
    owner: Mutex<Option<OwnerLock>>,
}

impl FileWalStore {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, WalError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let owner = OwnerLock::try_acquire(dir, "wal")?
            .ok_or_else(|| WalError::Locked(dir.to_path_buf()))?;
        let path = dir.join("wal.bin");
        let writer = LogWriter::open(&path)?;
        Ok(Self {
            path,
            writer,
            owner: Mutex::new(Some(owner)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, record: &WalRecord) -> Result<(), WalError> {
        let framed = frame::encode_frame(record)?;
        self.writer.append(framed).await?;
        Ok(())
    }
}

#[async_trait]
impl WalStore for FileWalStore {
    async fn load(&self) -> Result<WalLoad, WalError> {
        let path = self.path.clone();
        let (records, stats) =
            tokio::task::spawn_blocking(move || frame::read_frames::<WalRecord>(&path))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))??;
        let mut entries: BTreeMap<u64, WalEntry> = BTreeMap::new();
        let mut ids: BTreeMap<String, u64> = BTreeMap::new();
        let mut high_water = 0;
        for record in records {
            match record {
                WalRecord::Entry(entry) => {
                    high_water = high_water.max(entry.sequence);
                    ids.insert(entry.id.clone(), entry.sequence);
                    entries.insert(entry.sequence, entry);
                }
                WalRecord::Status { id, status } => {
                    if let Some(entry) = ids.get(&id).and_then(|seq| entries.get_mut(seq)) {
                        entry.status = status;
                    }
                }
                WalRecord::HighWater(seq) => high_water = high_water.max(seq),
            }
        }
        if !stats.is_clean() {
            tracing::warn!(
                path = %self.path.display(),
                recovered = entries.len(),
                crc_errors = stats.crc_errors,
                truncated = stats.truncated,
                "WAL file damaged, rewriting recovered entries"
            );
            let recovered: Vec<WalEntry> = entries.values().cloned().collect();
            self.purge(&recovered, high_water).await?;
        }
        Ok(WalLoad {
            entries: entries.into_values().collect(),
            high_water,
            stats,
        })
    }

    async fn append(&self, entry: &WalEntry) -> Result<(), WalError> {
        self.write(&WalRecord::Entry(entry.clone())).await
    }

    async fn set_status(&self, id: &str, status: WalStatus) -> Result<(), WalError> {
        self.write(&WalRecord::Status {
            id: id.to_string(),
            status,
        })
        .await
    }

    async fn purge(&self, remaining: &[WalEntry], high_water: u64) -> Result<(), WalError> {
        let mut records = Vec::with_capacity(remaining.len() + 1);
        records.push(WalRecord::HighWater(high_water));
        records.extend(remaining.iter().cloned().map(WalRecord::Entry));
        self.writer.replace(frame::encode_frames(&records)?).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), WalError> {
        self.writer.shutdown();
        self.owner.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalOperation;

    fn entry(seq: u64) -> WalEntry {
        WalEntry {
            id: format!("e{seq}"),
            sequence: seq,
            operation: WalOperation::ClearDatabase,
            timestamp: seq,
            status: WalStatus::Pending,
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn test_file_store_folds_status_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWalStore::open(dir.path()).unwrap();
        store.append(&entry(1)).await.unwrap();
        store.append(&entry(2)).await.unwrap();
        store.set_status("e1", WalStatus::Committed).await.unwrap();
        drop(store);

        let store = FileWalStore::open(dir.path()).unwrap();
        let load = store.load().await.unwrap();
        assert_eq!(load.entries.len(), 2);
        assert_eq!(load.entries[0].status, WalStatus::Committed);
        assert_eq!(load.entries[1].status, WalStatus::Pending);
        assert_eq!(load.high_water, 2);
    }

    #[tokio::test]
    async fn test_purge_keeps_high_water() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWalStore::open(dir.path()).unwrap();
        store.append(&entry(1)).await.unwrap();
        store.append(&entry(2)).await.unwrap();
        store.purge(&[], 2).await.unwrap();
        store.append(&entry(3)).await.unwrap();
        drop(store);

        let load = FileWalStore::open(dir.path()).unwrap().load().await.unwrap();
        assert_eq!(load.entries.len(), 1);
        assert_eq!(load.entries[0].sequence, 3);
        assert_eq!(load.high_water, 3);
    }

    #[tokio::test]
    async fn test_torn_wal_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWalStore::open(dir.path()).unwrap();
        store.append(&entry(1)).await.unwrap();
        store.append(&entry(2)).await.unwrap();
        drop(store);
        let path = dir.path().join("wal.bin");
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 1);
        fs::write(&path, &bytes).unwrap();

        let store = FileWalStore::open(dir.path()).unwrap();
        let load = store.load().await.unwrap();
        assert!(load.stats.truncated);
        assert_eq!(load.entries.len(), 1);
        let clean = store.load().await.unwrap();
        assert!(clean.stats.is_clean());
    }

    #[tokio::test]
    async fn test_memory_store_status() {
        let store = MemoryWalStore::new();
        store.append(&entry(1)).await.unwrap();
        store.set_status("e1", WalStatus::RolledBack).await.unwrap();
        assert!(matches!(
            store.set_status("nope", WalStatus::Committed).await,
            Err(WalError::EntryNotFound(_))
        ));
        assert_eq!(store.load().await.unwrap().entries[0].status, WalStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_second_file_store_is_refused_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileWalStore::open(dir.path()).unwrap();
        first.append(&entry(1)).await.unwrap();

        let err = FileWalStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, WalError::Locked(_)));

        first.close().await.unwrap();
        let second = FileWalStore::open(dir.path()).unwrap();
        let load = second.load().await.unwrap();
        assert_eq!(load.high_water, 1);
    }
}
