use std::fmt;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    BlobRef, ByteRange, ModelError, TransferFailure, TransferId, TransferOptions,
    TransferProgress, TransferState, TransferType,
};

/// Reference to either kind of transfer held by the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TransferKey {
    Blob(TransferId),
    Chunk(TransferId),
}

impl TransferKey {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Blob(id) | Self::Chunk(id) => *id,
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob(id) => write!(f, "blob:{id}"),
            Self::Chunk(id) => write!(f, "chunk:{id}"),
        }
    }
}

/// A whole-object upload or download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobTransfer {
    pub id: TransferId,
    pub transfer_type: TransferType,
    pub state: TransferState,
    /// Upload source or download destination.
    pub local_path: PathBuf,
    pub blob: BlobRef,
    #[serde(default)]
    pub options: TransferOptions,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferFailure>,
    /// Child chunks in partition order.
    #[serde(default)]
    pub chunk_ids: Vec<TransferId>,
    /// Downloads only: the total length is known and the remaining chunks exist.
    #[serde(default)]
    pub initial_call_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Currently queued top-level operation.
    #[serde(skip)]
    pub operation: Option<TransferId>,
}

impl BlobTransfer {
    /// Creates a pending upload of `total_bytes` read from `local_path`.
    pub fn new_upload(
        local_path: impl Into<PathBuf>,
        blob: BlobRef,
        options: TransferOptions,
        total_bytes: u64,
    ) -> Self {
        Self::new(TransferType::Upload, local_path.into(), blob, options, total_bytes)
    }

    /// Creates a pending download. The total length is learned from the
    /// first response.
    pub fn new_download(
        blob: BlobRef,
        local_path: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        Self::new(TransferType::Download, local_path.into(), blob, options, 0)
    }

    fn new(
        transfer_type: TransferType,
        local_path: PathBuf,
        blob: BlobRef,
        options: TransferOptions,
        total_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            transfer_type,
            state: TransferState::Pending,
            local_path,
            blob,
            options,
            total_bytes,
            transferred_bytes: 0,
            error: None,
            chunk_ids: Vec::new(),
            initial_call_complete: false,
            created_at: now,
            updated_at: now,
            operation: None,
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey::Blob(self.id)
    }

    pub fn is_upload(&self) -> bool {
        self.transfer_type == TransferType::Upload
    }

    /// Moves to `next`, returning whether the state actually changed.
    pub fn set_state(&mut self, next: TransferState) -> Result<bool, ModelError> {
        let next = self.state.transition(next)?;
        let changed = next != self.state;
        if changed {
            self.state = next;
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    /// Records completed bytes, never exceeding the total.
    pub fn add_transferred(&mut self, bytes: u64) {
        self.transferred_bytes = self
            .transferred_bytes
            .saturating_add(bytes)
            .min(self.total_bytes);
        self.updated_at = Utc::now();
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress::new(self.transferred_bytes, self.total_bytes)
    }

    /// Offset of `range` within the local file.
    ///
    /// Downloads of a sub-range write relative to the requested start.
    pub fn file_offset(&self, range: ByteRange) -> u64 {
        match (self.transfer_type, self.options.range) {
            (TransferType::Download, Some(r)) => range.start.saturating_sub(r.start),
            _ => range.start,
        }
    }
}

/// One byte-range unit of a whole-object transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTransfer {
    pub id: TransferId,
    pub parent: TransferId,
    pub transfer_type: TransferType,
    pub range: ByteRange,
    pub state: TransferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferFailure>,
    /// Uploads only: staged block id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    /// Position in the commit order.
    #[serde(default)]
    pub sequence: u32,
    #[serde(skip)]
    pub operation: Option<TransferId>,
}

impl ChunkTransfer {
    /// Upload chunk with a fresh block id.
    pub fn new_upload(parent: TransferId, range: ByteRange, sequence: u32) -> Self {
        let mut chunk = Self::new(parent, TransferType::Upload, range, sequence);
        chunk.block_id = Some(new_block_id());
        chunk
    }

    pub fn new_download(parent: TransferId, range: ByteRange, sequence: u32) -> Self {
        Self::new(parent, TransferType::Download, range, sequence)
    }

    fn new(parent: TransferId, transfer_type: TransferType, range: ByteRange, sequence: u32) -> Self {
        Self {
            id: TransferId::new(),
            parent,
            transfer_type,
            range,
            state: TransferState::Pending,
            error: None,
            block_id: None,
            sequence,
            operation: None,
        }
    }

    pub fn key(&self) -> TransferKey {
        TransferKey::Chunk(self.id)
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Moves to `next`, returning whether the state actually changed.
    pub fn set_state(&mut self, next: TransferState) -> Result<bool, ModelError> {
        let next = self.state.transition(next)?;
        let changed = next != self.state;
        self.state = next;
        Ok(changed)
    }
}

/// Block ids are base64 of a UUID so every id of a blob has the same length.
pub fn new_block_id() -> String {
    BASE64.encode(Uuid::new_v4().hyphenated().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_chunks_get_distinct_block_ids() {
        let parent = TransferId::new();
        let a = ChunkTransfer::new_upload(parent, ByteRange::new(0, 4), 0);
        let b = ChunkTransfer::new_upload(parent, ByteRange::new(4, 8), 1);
        let (ida, idb) = (a.block_id.unwrap(), b.block_id.unwrap());
        assert_ne!(ida, idb);
        assert_eq!(ida.len(), idb.len());
        assert!(BASE64.decode(&ida).is_ok());
    }

    #[test]
    fn download_chunk_has_no_block_id() {
        let c = ChunkTransfer::new_download(TransferId::new(), ByteRange::new(0, 4), 0);
        assert!(c.block_id.is_none());
        assert_eq!(c.key(), TransferKey::Chunk(c.id));
    }

    #[test]
    fn set_state_reports_change() {
        let mut t = BlobTransfer::new_upload("/tmp/a", BlobRef::new("c", "b"), TransferOptions::default(), 10);
        assert!(t.set_state(TransferState::InProgress).unwrap());
        assert!(!t.set_state(TransferState::InProgress).unwrap());
        assert!(t.set_state(TransferState::Pending).is_err());
        assert_eq!(t.state, TransferState::InProgress);
    }

    #[test]
    fn transferred_bytes_capped_at_total() {
        let mut t = BlobTransfer::new_upload("/tmp/a", BlobRef::new("c", "b"), TransferOptions::default(), 10);
        t.add_transferred(6);
        t.add_transferred(6);
        assert_eq!(t.transferred_bytes, 10);
        assert_eq!(t.progress().as_fraction(), 1.0);
    }

    #[test]
    fn sub_range_download_offsets() {
        let options = TransferOptions {
            range: Some(ByteRange::new(100, 200)),
            ..Default::default()
        };
        let t = BlobTransfer::new_download(BlobRef::new("c", "b"), "/tmp/out", options);
        assert_eq!(t.file_offset(ByteRange::new(150, 160)), 50);

        let up = BlobTransfer::new_upload("/tmp/a", BlobRef::new("c", "b"), TransferOptions::default(), 10);
        assert_eq!(up.file_offset(ByteRange::new(4, 8)), 4);
    }

    #[test]
    fn runtime_operation_not_persisted() {
        let mut t = BlobTransfer::new_download(BlobRef::new("c", "b"), "/tmp/out", TransferOptions::default());
        t.operation = Some(TransferId::new());
        let json = serde_json::to_string(&t).unwrap();
        let back: BlobTransfer = serde_json::from_str(&json).unwrap();
        assert!(back.operation.is_none());
        assert_eq!(back.id, t.id);
    }

    #[test]
    fn key_serialization() {
        let id = TransferId::new();
        let json = serde_json::to_value(TransferKey::Chunk(id)).unwrap();
        assert_eq!(json["kind"], "chunk");
        assert_eq!(json["id"], id.to_string());
    }
}
