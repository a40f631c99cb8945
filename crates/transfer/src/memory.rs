//! In-memory [`RemoteBlobStore`] used by tests and embedding callers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use blobferry_model::{BlobKind, BlobRef, ByteRange};

use crate::checksum::content_md5;
use crate::remote::{
    AccessConditions, CommitResponse, RangeResponse, RemoteBlobStore, RemoteError,
    RemoteErrorKind, RemoteFuture,
};

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    etag: String,
    kind: BlobKind,
    lease_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<BlobRef, StoredBlob>,
    staged: HashMap<BlobRef, HashMap<String, Vec<u8>>>,
    etag_counter: u64,
}

impl Inner {
    fn next_etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("\"0x{:016X}\"", self.etag_counter)
    }
}

/// Remote store kept entirely in memory.
///
/// Models the parts of block-blob semantics the executor relies on:
/// ranged reads with `Content-Range`, staged blocks, block-list commits,
/// `If-Match` and lease preconditions.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<Inner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces a committed block blob. Returns its etag.
    pub fn put_blob(&self, blob: &BlobRef, data: impl Into<Vec<u8>>) -> String {
        self.put_blob_with_kind(blob, data, BlobKind::Block)
    }

    pub fn put_blob_with_kind(&self, blob: &BlobRef, data: impl Into<Vec<u8>>, kind: BlobKind) -> String {
        let mut inner = self.lock();
        let etag = inner.next_etag();
        inner.blobs.insert(
            blob.clone(),
            StoredBlob {
                data: data.into(),
                etag: etag.clone(),
                kind,
                lease_id: None,
            },
        );
        etag
    }

    /// Requires `lease_id` on every later request for `blob`.
    pub fn set_lease(&self, blob: &BlobRef, lease_id: Option<String>) {
        if let Some(stored) = self.lock().blobs.get_mut(blob) {
            stored.lease_id = lease_id;
        }
    }

    /// Committed content of `blob`.
    pub fn blob(&self, blob: &BlobRef) -> Option<Vec<u8>> {
        self.lock().blobs.get(blob).map(|b| b.data.clone())
    }

    pub fn etag(&self, blob: &BlobRef) -> Option<String> {
        self.lock().blobs.get(blob).map(|b| b.etag.clone())
    }

    /// Number of uncommitted blocks staged for `blob`.
    pub fn staged_block_count(&self, blob: &BlobRef) -> usize {
        self.lock().staged.get(blob).map_or(0, HashMap::len)
    }

    fn check_conditions(stored: &StoredBlob, conditions: &AccessConditions) -> Result<(), RemoteError> {
        if let Some(expected) = &conditions.if_match
            && expected != "*"
            && *expected != stored.etag
        {
            return Err(RemoteError::new(
                RemoteErrorKind::PreconditionFailed,
                format!("etag {} does not match {expected}", stored.etag),
            ));
        }
        if let Some(lease) = &stored.lease_id
            && conditions.lease_id.as_ref() != Some(lease)
        {
            return Err(RemoteError::new(
                RemoteErrorKind::PreconditionFailed,
                "lease id missing or does not match",
            ));
        }
        Ok(())
    }

    fn read(&self, blob: &BlobRef, range: ByteRange, conditions: &AccessConditions) -> Result<RangeResponse, RemoteError> {
        let inner = self.lock();
        let stored = inner.blobs.get(blob).ok_or_else(|| RemoteError::not_found(blob))?;
        Self::check_conditions(stored, conditions)?;

        let total = stored.data.len() as u64;
        if total == 0 {
            return Ok(RangeResponse {
                content_range: Some("bytes */0".into()),
                etag: Some(stored.etag.clone()),
                content_md5: Some(content_md5(&[])),
                blob_type: stored.kind,
                ..Default::default()
            });
        }
        if range.start >= total {
            return Err(RemoteError::new(
                RemoteErrorKind::Status(416),
                format!("range {range} not satisfiable for {total} bytes"),
            ));
        }

        let end = range.end.min(total);
        let data = stored.data[range.start as usize..end as usize].to_vec();
        Ok(RangeResponse {
            content_range: Some(format!("bytes {}-{}/{total}", range.start, end - 1)),
            etag: Some(stored.etag.clone()),
            content_md5: Some(content_md5(&data)),
            content_crc64: None,
            blob_type: stored.kind,
            data,
        })
    }

    fn stage(&self, blob: &BlobRef, block_id: &str, data: Vec<u8>, conditions: &AccessConditions) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        if let Some(stored) = inner.blobs.get(blob)
            && let Some(lease) = &stored.lease_id
            && conditions.lease_id.as_ref() != Some(lease)
        {
            return Err(RemoteError::new(
                RemoteErrorKind::PreconditionFailed,
                "lease id missing or does not match",
            ));
        }
        inner
            .staged
            .entry(blob.clone())
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    fn commit(&self, blob: &BlobRef, block_ids: &[String], conditions: &AccessConditions) -> Result<CommitResponse, RemoteError> {
        let mut inner = self.lock();
        if let Some(stored) = inner.blobs.get(blob) {
            Self::check_conditions(stored, conditions)?;
        } else if conditions.if_match.as_deref().is_some_and(|m| m != "*") {
            return Err(RemoteError::not_found(blob));
        }

        let staged = inner.staged.get(blob);
        let mut data = Vec::new();
        for id in block_ids {
            let block = staged.and_then(|s| s.get(id)).ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorKind::InvalidRequest,
                    format!("block {id} is not staged for {blob}"),
                )
            })?;
            data.extend_from_slice(block);
        }

        let etag = inner.next_etag();
        let lease_id = inner.blobs.get(blob).and_then(|b| b.lease_id.clone());
        inner.blobs.insert(
            blob.clone(),
            StoredBlob {
                data,
                etag: etag.clone(),
                kind: BlobKind::Block,
                lease_id,
            },
        );
        inner.staged.remove(blob);
        Ok(CommitResponse { etag: Some(etag) })
    }
}

impl RemoteBlobStore for MemoryBlobStore {
    fn get_range<'a>(
        &'a self,
        blob: &'a BlobRef,
        range: ByteRange,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, RangeResponse> {
        Box::pin(async move { self.read(blob, range, conditions) })
    }

    fn put_block<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_id: &'a str,
        data: Vec<u8>,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move { self.stage(blob, block_id, data, conditions) })
    }

    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_ids: &'a [String],
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, CommitResponse> {
        Box::pin(async move { self.commit(blob, block_ids, conditions) })
    }
}
