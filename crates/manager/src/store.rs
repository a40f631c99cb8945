//! Persistent transfer rows.
//!
//! One row per [`BlobTransfer`] and one per [`ChunkTransfer`], linked by
//! parent id. Deleting a parent removes its chunks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use blobferry_model::{BlobTransfer, ChunkTransfer, TransferId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StoreError;

/// Transfer and chunk rows read back from a store.
#[derive(Debug, Clone, Default)]
pub struct StoredTransfers {
    pub blobs: Vec<BlobTransfer>,
    pub chunks: Vec<ChunkTransfer>,
}

/// Storage backend for transfer rows. Calls are blocking.
pub trait TransferStore: Send + Sync {
    /// Every transfer in a rehydratable state, with all its chunks.
    fn load(&self) -> Result<StoredTransfers, StoreError>;

    /// Every stored row, terminal transfers included.
    fn all(&self) -> Result<StoredTransfers, StoreError>;

    fn save_blob(&self, blob: &BlobTransfer) -> Result<(), StoreError>;

    fn save_chunks(&self, chunks: &[ChunkTransfer]) -> Result<(), StoreError>;

    /// Deletes a transfer and its chunks.
    fn delete(&self, id: TransferId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Rows {
    #[serde(default)]
    blobs: BTreeMap<TransferId, BlobTransfer>,
    #[serde(default)]
    chunks: BTreeMap<TransferId, ChunkTransfer>,
}

impl Rows {
    fn rehydratable(&self) -> StoredTransfers {
        let blobs: Vec<BlobTransfer> = self
            .blobs
            .values()
            .filter(|b| !b.state.is_terminal())
            .cloned()
            .collect();
        let chunks = self
            .chunks
            .values()
            .filter(|c| blobs.iter().any(|b| b.id == c.parent))
            .cloned()
            .collect();
        StoredTransfers { blobs, chunks }
    }

    fn everything(&self) -> StoredTransfers {
        StoredTransfers {
            blobs: self.blobs.values().cloned().collect(),
            chunks: self.chunks.values().cloned().collect(),
        }
    }

    fn delete(&mut self, id: TransferId) {
        self.blobs.remove(&id);
        self.chunks.retain(|_, c| c.parent != id);
    }
}

/// JSON file store. Every write replaces the file atomically.
pub struct JsonFileStore {
    path: PathBuf,
    rows: RwLock<Rows>,
}

impl JsonFileStore {
    /// Opens the store, loading existing rows from disk.
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let rows = load_rows(&path)?;
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, f: impl FnOnce(&mut Rows)) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut rows);
        self.persist(&rows)
    }

    fn persist(&self, rows: &Rows) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(rows)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            path = %self.path.display(),
            blobs = rows.blobs.len(),
            chunks = rows.chunks.len(),
            "persisted transfers"
        );
        Ok(())
    }
}

impl TransferStore for JsonFileStore {
    fn load(&self) -> Result<StoredTransfers, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.rehydratable())
    }

    fn all(&self) -> Result<StoredTransfers, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.everything())
    }

    fn save_blob(&self, blob: &BlobTransfer) -> Result<(), StoreError> {
        self.update(|rows| {
            rows.blobs.insert(blob.id, blob.clone());
        })
    }

    fn save_chunks(&self, chunks: &[ChunkTransfer]) -> Result<(), StoreError> {
        self.update(|rows| {
            for c in chunks {
                rows.chunks.insert(c.id, c.clone());
            }
        })
    }

    fn delete(&self, id: TransferId) -> Result<(), StoreError> {
        self.update(|rows| rows.delete(id))
    }
}

fn load_rows(path: &Path) -> Result<Rows, StoreError> {
    if !path.exists() {
        return Ok(Rows::default());
    }
    let data = std::fs::read_to_string(path)?;
    let rows: Rows = serde_json::from_str(&data)?;
    debug!(
        path = %path.display(),
        blobs = rows.blobs.len(),
        chunks = rows.chunks.len(),
        "loaded transfers"
    );
    Ok(rows)
}

/// In-memory store, used by tests and short-lived managers.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Rows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transfer and chunk rows.
    pub fn row_counts(&self) -> (usize, usize) {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        (rows.blobs.len(), rows.chunks.len())
    }

    pub fn blob(&self, id: TransferId) -> Option<BlobTransfer> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        rows.blobs.get(&id).cloned()
    }
}

impl TransferStore for MemoryStore {
    fn load(&self) -> Result<StoredTransfers, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.rehydratable())
    }

    fn all(&self) -> Result<StoredTransfers, StoreError> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.everything())
    }

    fn save_blob(&self, blob: &BlobTransfer) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.blobs.insert(blob.id, blob.clone());
        Ok(())
    }

    fn save_chunks(&self, chunks: &[ChunkTransfer]) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for c in chunks {
            rows.chunks.insert(c.id, c.clone());
        }
        Ok(())
    }

    fn delete(&self, id: TransferId) -> Result<(), StoreError> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.delete(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobferry_model::{BlobRef, ByteRange, TransferOptions, TransferState};

    fn upload_with_chunks() -> (BlobTransfer, Vec<ChunkTransfer>) {
        let mut blob = BlobTransfer::new_upload(
            "/tmp/a.bin",
            BlobRef::new("c", "a.bin"),
            TransferOptions::default(),
            8,
        );
        let chunks = vec![
            ChunkTransfer::new_upload(blob.id, ByteRange::new(0, 4), 0),
            ChunkTransfer::new_upload(blob.id, ByteRange::new(4, 8), 1),
        ];
        blob.chunk_ids = chunks.iter().map(|c| c.id).collect();
        (blob, chunks)
    }

    #[test]
    fn json_store_persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("transfers.json");
        let (blob, chunks) = upload_with_chunks();

        {
            let store = JsonFileStore::new(path.clone()).unwrap();
            store.save_blob(&blob).unwrap();
            store.save_chunks(&chunks).unwrap();
        }

        let store = JsonFileStore::new(path).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.blobs.len(), 1);
        assert_eq!(loaded.blobs[0].chunk_ids, blob.chunk_ids);
        assert_eq!(loaded.chunks.len(), 2);
        assert!(loaded.chunks.iter().all(|c| c.block_id.is_some()));
    }

    #[test]
    fn delete_cascades_to_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path().join("transfers.json")).unwrap();
        let (blob, chunks) = upload_with_chunks();
        store.save_blob(&blob).unwrap();
        store.save_chunks(&chunks).unwrap();

        store.delete(blob.id).unwrap();

        let reopened = JsonFileStore::new(store.path().to_path_buf()).unwrap();
        let loaded = reopened.load().unwrap();
        assert!(loaded.blobs.is_empty());
        assert!(loaded.chunks.is_empty());
    }

    #[test]
    fn terminal_rows_not_rehydrated() {
        let store = MemoryStore::new();
        let (mut blob, chunks) = upload_with_chunks();
        blob.state = TransferState::Complete;
        store.save_blob(&blob).unwrap();
        store.save_chunks(&chunks).unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.blobs.is_empty());
        assert!(loaded.chunks.is_empty());
        assert_eq!(store.row_counts(), (1, 2));
    }

    #[test]
    fn all_includes_finished_transfers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");
        let (mut done, chunks) = upload_with_chunks();
        done.state = TransferState::Complete;
        let (mut canceled, _) = upload_with_chunks();
        canceled.state = TransferState::Canceled;
        let (paused, _) = upload_with_chunks();
        {
            let store = JsonFileStore::new(path.clone()).unwrap();
            for b in [&done, &canceled, &paused] {
                store.save_blob(b).unwrap();
            }
            store.save_chunks(&chunks).unwrap();
        }

        let store = JsonFileStore::new(path).unwrap();
        let all = store.all().unwrap();
        assert_eq!(all.blobs.len(), 3);
        assert_eq!(all.chunks.len(), 2);
        assert!(all.blobs.iter().any(|b| b.state == TransferState::Complete));
        assert_eq!(store.load().unwrap().blobs.len(), 1);
    }

    #[test]
    fn paused_and_failed_rows_rehydrated() {
        let store = MemoryStore::new();
        for state in [TransferState::Paused, TransferState::Failed, TransferState::InProgress] {
            let (mut blob, _) = upload_with_chunks();
            blob.state = state;
            store.save_blob(&blob).unwrap();
        }
        assert_eq!(store.load().unwrap().blobs.len(), 3);
    }
}
