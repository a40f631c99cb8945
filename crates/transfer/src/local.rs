//! [`RemoteBlobStore`] backed by a local directory.
//!
//! Committed blobs live at `<root>/<container>/<name>`. Staged blocks live
//! under `<root>/.staging/<container>/<hex name>/<hex block id>` and survive
//! restarts, so an interrupted upload can resume and commit later.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use blobferry_model::{BlobKind, BlobRef, ByteRange};
use tracing::debug;

use crate::checksum::content_md5;
use crate::chunked::read_range;
use crate::remote::{
    AccessConditions, CommitResponse, RangeResponse, RemoteBlobStore, RemoteError,
    RemoteErrorKind, RemoteFuture,
};
use crate::validation::validate_blob_ref;

const STAGING_DIR: &str = ".staging";

/// Directory-backed remote store.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the committed blob.
    pub fn blob_path(&self, blob: &BlobRef) -> Result<PathBuf, RemoteError> {
        validate_blob_ref(blob)
            .map_err(|e| RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))?;
        Ok(self.root.join(&blob.container).join(&blob.name))
    }

    fn staging_dir(&self, blob: &BlobRef) -> Result<PathBuf, RemoteError> {
        validate_blob_ref(blob)
            .map_err(|e| RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))?;
        Ok(self
            .root
            .join(STAGING_DIR)
            .join(&blob.container)
            .join(hex::encode(blob.name.as_bytes())))
    }

    fn read(&self, blob: &BlobRef, range: ByteRange, conditions: &AccessConditions) -> Result<RangeResponse, RemoteError> {
        let path = self.blob_path(blob)?;
        let meta = fs::metadata(&path).map_err(|e| map_io(blob, e))?;
        let etag = etag_of(&meta);
        check_if_match(&etag, conditions)?;
        if conditions.lease_id.is_some() {
            debug!(blob = %blob, "lease ignored by local store");
        }

        let total = meta.len();
        if total == 0 {
            return Ok(RangeResponse {
                content_range: Some("bytes */0".into()),
                etag: Some(etag),
                content_md5: Some(content_md5(&[])),
                blob_type: BlobKind::Block,
                ..Default::default()
            });
        }
        if range.start >= total {
            return Err(RemoteError::new(
                RemoteErrorKind::Status(416),
                format!("range {range} not satisfiable for {total} bytes"),
            ));
        }

        let clamped = ByteRange::new(range.start, range.end.min(total));
        let data = read_range(&path, clamped)
            .map_err(|e| RemoteError::new(RemoteErrorKind::Status(500), e.to_string()))?;
        Ok(RangeResponse {
            content_range: Some(format!("bytes {}-{}/{total}", clamped.start, clamped.end - 1)),
            etag: Some(etag),
            content_md5: Some(content_md5(&data)),
            content_crc64: None,
            blob_type: BlobKind::Block,
            data,
        })
    }

    fn stage(&self, blob: &BlobRef, block_id: &str, data: &[u8]) -> Result<(), RemoteError> {
        let dir = self.staging_dir(blob)?;
        fs::create_dir_all(&dir).map_err(|e| map_io(blob, e))?;
        let path = dir.join(hex::encode(block_id.as_bytes()));
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|e| map_io(blob, e))?;
        fs::rename(&tmp, &path).map_err(|e| map_io(blob, e))?;
        Ok(())
    }

    fn commit(&self, blob: &BlobRef, block_ids: &[String], conditions: &AccessConditions) -> Result<CommitResponse, RemoteError> {
        let path = self.blob_path(blob)?;
        if let Some(expected) = &conditions.if_match
            && expected != "*"
        {
            let meta = fs::metadata(&path).map_err(|e| map_io(blob, e))?;
            check_if_match(&etag_of(&meta), conditions)?;
        }

        let dir = self.staging_dir(blob)?;
        let mut data = Vec::new();
        for id in block_ids {
            let block = fs::read(dir.join(hex::encode(id.as_bytes()))).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    RemoteError::new(
                        RemoteErrorKind::InvalidRequest,
                        format!("block {id} is not staged for {blob}"),
                    )
                } else {
                    map_io(blob, e)
                }
            })?;
            data.extend_from_slice(&block);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| map_io(blob, e))?;
        }
        let tmp = path.with_extension("blobferry-commit");
        fs::write(&tmp, &data).map_err(|e| map_io(blob, e))?;
        fs::rename(&tmp, &path).map_err(|e| map_io(blob, e))?;
        if let Err(e) = fs::remove_dir_all(&dir) {
            debug!(blob = %blob, error = %e, "failed to clear staged blocks");
        }

        let meta = fs::metadata(&path).map_err(|e| map_io(blob, e))?;
        Ok(CommitResponse {
            etag: Some(etag_of(&meta)),
        })
    }
}

fn etag_of(meta: &fs::Metadata) -> String {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("\"{:x}-{:x}\"", meta.len(), mtime)
}

fn check_if_match(etag: &str, conditions: &AccessConditions) -> Result<(), RemoteError> {
    match &conditions.if_match {
        Some(expected) if expected != "*" && expected != etag => Err(RemoteError::new(
            RemoteErrorKind::PreconditionFailed,
            format!("etag {etag} does not match {expected}"),
        )),
        _ => Ok(()),
    }
}

fn map_io(blob: &BlobRef, e: io::Error) -> RemoteError {
    if e.kind() == io::ErrorKind::NotFound {
        RemoteError::not_found(blob)
    } else {
        RemoteError::new(RemoteErrorKind::Status(500), format!("{blob}: {e}"))
    }
}

fn join_error(e: tokio::task::JoinError) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Status(500), format!("store task failed: {e}"))
}

impl RemoteBlobStore for LocalBlobStore {
    fn get_range<'a>(
        &'a self,
        blob: &'a BlobRef,
        range: ByteRange,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, RangeResponse> {
        let store = self.clone();
        let blob = blob.clone();
        let conditions = conditions.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.read(&blob, range, &conditions))
                .await
                .map_err(join_error)?
        })
    }

    fn put_block<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_id: &'a str,
        data: Vec<u8>,
        _conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, ()> {
        let store = self.clone();
        let blob = blob.clone();
        let block_id = block_id.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.stage(&blob, &block_id, &data))
                .await
                .map_err(join_error)?
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_ids: &'a [String],
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, CommitResponse> {
        let store = self.clone();
        let blob = blob.clone();
        let block_ids = block_ids.to_vec();
        let conditions = conditions.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || store.commit(&blob, &block_ids, &conditions))
                .await
                .map_err(join_error)?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stage_commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        let blob = BlobRef::new("docs", "2024/report.txt");
        let none = AccessConditions::default();

        // Block ids are base64 and may contain '/'.
        store.put_block(&blob, "a/b=", b"hello ".to_vec(), &none).await.unwrap();
        store.put_block(&blob, "c+d=", b"world".to_vec(), &none).await.unwrap();

        let ids = vec!["a/b=".to_string(), "c+d=".to_string()];
        let commit = store.commit_block_list(&blob, &ids, &none).await.unwrap();

        let path = dir.path().join("docs/2024/report.txt");
        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert!(!store.staging_dir(&blob).unwrap().exists());

        let resp = store.get_range(&blob, ByteRange::new(6, 64), &none).await.unwrap();
        assert_eq!(resp.data, b"world");
        assert_eq!(resp.content_range.as_deref(), Some("bytes 6-10/11"));
        assert_eq!(resp.etag, commit.etag);
    }

    #[tokio::test]
    async fn staged_blocks_survive_new_store_instance() {
        let dir = TempDir::new().unwrap();
        let blob = BlobRef::new("c", "b");
        let none = AccessConditions::default();
        {
            let store = LocalBlobStore::new(dir.path()).unwrap();
            store.put_block(&blob, "A", b"xy".to_vec(), &none).await.unwrap();
        }
        let store = LocalBlobStore::new(dir.path()).unwrap();
        store.put_block(&blob, "B", b"z".to_vec(), &none).await.unwrap();
        let ids = vec!["A".to_string(), "B".to_string()];
        store.commit_block_list(&blob, &ids, &none).await.unwrap();
        assert_eq!(fs::read(dir.path().join("c/b")).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn missing_blob_and_stale_etag() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        let blob = BlobRef::new("c", "b");

        let err = store
            .get_range(&blob, ByteRange::new(0, 1), &AccessConditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);

        fs::create_dir_all(dir.path().join("c")).unwrap();
        fs::write(dir.path().join("c/b"), b"data").unwrap();
        let stale = AccessConditions {
            if_match: Some("\"nope\"".into()),
            ..Default::default()
        };
        let err = store.get_range(&blob, ByteRange::new(0, 1), &stale).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        let blob = BlobRef::new("c", "../../escape");
        let err = store
            .put_block(&blob, "A", b"x".to_vec(), &AccessConditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::InvalidRequest);
    }
}
