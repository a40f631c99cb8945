//! Single-chunk wire operations.
//!
//! `ChunkExecutor` performs exactly one remote call per method. It knows
//! nothing about scheduling, dependencies or persistence; the caller owns
//! all of that and passes in the cancellation token of the running op.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobferry_model::{BlobKind, BlobRef, ByteRange, TransferOptions, parse_content_range};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checksum::verify_content_md5;
use crate::chunked::{RangeWriter, read_range};
use crate::remote::{AccessConditions, CommitResponse, RangeResponse, RemoteBlobStore};
use crate::TransferError;

/// Result of the first request of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialChunk {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Total length of the remote object.
    pub total: u64,
    pub etag: Option<String>,
}

/// Executes chunk reads, block stages and commits against a remote store.
#[derive(Clone)]
pub struct ChunkExecutor {
    store: Arc<dyn RemoteBlobStore>,
}

impl ChunkExecutor {
    pub fn new(store: Arc<dyn RemoteBlobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RemoteBlobStore> {
        &self.store
    }

    /// Fetches the first range of a download and learns the object length.
    ///
    /// Data is written at offset 0 of the destination.
    pub async fn download_initial(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        options: &TransferOptions,
        writer: &Arc<RangeWriter>,
        cancel: &CancellationToken,
    ) -> Result<InitialChunk, TransferError> {
        let resp = self.fetch(blob, range, options, cancel).await?;

        let header = resp
            .content_range
            .as_deref()
            .ok_or(TransferError::MissingContentRange)?;
        let content_range = parse_content_range(header)?;
        if let Some(returned) = content_range.range {
            ensure_len(returned.len(), resp.data.len())?;
        }

        let bytes = resp.data.len() as u64;
        write_blocking(writer, 0, resp.data).await?;
        check_cancelled(cancel)?;

        debug!(blob = %blob, bytes, total = content_range.total, "initial chunk written");
        Ok(InitialChunk {
            bytes,
            total: content_range.total,
            etag: resp.etag,
        })
    }

    /// Fetches `range` and writes it at `dest_offset` of the destination.
    pub async fn download_chunk(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        dest_offset: u64,
        options: &TransferOptions,
        writer: &Arc<RangeWriter>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let resp = self.fetch(blob, range, options, cancel).await?;
        ensure_len(range.len(), resp.data.len())?;

        let bytes = resp.data.len() as u64;
        write_blocking(writer, dest_offset, resp.data).await?;
        check_cancelled(cancel)?;

        debug!(blob = %blob, range = %range, bytes, "chunk written");
        Ok(bytes)
    }

    /// Reads `range` of `source` and stages it as block `block_id`.
    pub async fn upload_chunk(
        &self,
        blob: &BlobRef,
        source: &Path,
        range: ByteRange,
        block_id: &str,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        check_cancelled(cancel)?;

        let path: PathBuf = source.to_path_buf();
        let data = tokio::task::spawn_blocking(move || read_range(&path, range))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        check_cancelled(cancel)?;

        let bytes = data.len() as u64;
        let conditions = AccessConditions::from_options(options);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Interrupted),
            res = self.store.put_block(blob, block_id, data, &conditions) => res?,
        }
        check_cancelled(cancel)?;

        debug!(blob = %blob, range = %range, block_id, bytes, "block staged");
        Ok(bytes)
    }

    /// Commits the staged blocks in the given order.
    pub async fn commit(
        &self,
        blob: &BlobRef,
        ordered_block_ids: &[String],
        options: &TransferOptions,
    ) -> Result<CommitResponse, TransferError> {
        let conditions = AccessConditions::from_options(options);
        let resp = self
            .store
            .commit_block_list(blob, ordered_block_ids, &conditions)
            .await?;
        debug!(blob = %blob, blocks = ordered_block_ids.len(), "block list committed");
        Ok(resp)
    }

    async fn fetch(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<RangeResponse, TransferError> {
        check_cancelled(cancel)?;

        let conditions = AccessConditions::from_options(options);
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Interrupted),
            res = self.store.get_range(blob, range, &conditions) => res?,
        };
        check_cancelled(cancel)?;

        if resp.blob_type != BlobKind::Block {
            return Err(TransferError::UnsupportedBlobType(resp.blob_type));
        }
        if options.validate_content_md5
            && let Some(expected) = &resp.content_md5
        {
            verify_content_md5(&resp.data, expected)?;
        }
        if resp.content_crc64.is_some() {
            debug!(blob = %blob, range = %range, "content CRC64 present but not validated");
        }
        Ok(resp)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Interrupted);
    }
    Ok(())
}

fn ensure_len(expected: u64, actual: usize) -> Result<(), TransferError> {
    if expected != actual as u64 {
        return Err(TransferError::ShortResponse {
            expected,
            actual: actual as u64,
        });
    }
    Ok(())
}

async fn write_blocking(writer: &Arc<RangeWriter>, offset: u64, data: Vec<u8>) -> Result<(), TransferError> {
    let writer = Arc::clone(writer);
    tokio::task::spawn_blocking(move || writer.write_at(offset, &data))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::content_md5;
    use crate::memory::MemoryBlobStore;
    use crate::remote::{RemoteError, RemoteErrorKind, RemoteFuture};
    use blobferry_model::ErrorClass;
    use tempfile::TempDir;

    fn blob() -> BlobRef {
        BlobRef::new("c", "b")
    }

    /// Store answering every read with a fixed response.
    struct FixedResponse(RangeResponse);

    impl RemoteBlobStore for FixedResponse {
        fn get_range<'a>(
            &'a self,
            _blob: &'a BlobRef,
            _range: ByteRange,
            _conditions: &'a AccessConditions,
        ) -> RemoteFuture<'a, RangeResponse> {
            let resp = self.0.clone();
            Box::pin(async move { Ok::<_, RemoteError>(resp) })
        }

        fn put_block<'a>(
            &'a self,
            _blob: &'a BlobRef,
            _block_id: &'a str,
            _data: Vec<u8>,
            _conditions: &'a AccessConditions,
        ) -> RemoteFuture<'a, ()> {
            Box::pin(async { Err::<(), _>(RemoteError::new(RemoteErrorKind::ConnectionLost, "unplugged")) })
        }

        fn commit_block_list<'a>(
            &'a self,
            _blob: &'a BlobRef,
            _block_ids: &'a [String],
            _conditions: &'a AccessConditions,
        ) -> RemoteFuture<'a, CommitResponse> {
            Box::pin(async { Ok::<_, RemoteError>(CommitResponse::default()) })
        }
    }

    fn writer(dir: &TempDir) -> Arc<RangeWriter> {
        Arc::new(RangeWriter::open(&dir.path().join("out.bin")).unwrap())
    }

    #[tokio::test]
    async fn initial_then_remaining_chunks() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put_blob(&blob(), b"0123456789".to_vec());
        let exec = ChunkExecutor::new(store);
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        let cancel = CancellationToken::new();
        let options = TransferOptions::default();

        let initial = exec
            .download_initial(&blob(), ByteRange::new(0, 4), &options, &w, &cancel)
            .await
            .unwrap();
        assert_eq!(initial.bytes, 4);
        assert_eq!(initial.total, 10);
        assert!(initial.etag.is_some());

        // Out of order on purpose.
        exec.download_chunk(&blob(), ByteRange::new(8, 10), 8, &options, &w, &cancel)
            .await
            .unwrap();
        exec.download_chunk(&blob(), ByteRange::new(4, 8), 4, &options, &w, &cancel)
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("out.bin")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn page_blob_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put_blob_with_kind(&blob(), b"abc".to_vec(), BlobKind::Page);
        let exec = ChunkExecutor::new(store);
        let dir = TempDir::new().unwrap();

        let err = exec
            .download_initial(&blob(), ByteRange::new(0, 4), &TransferOptions::default(), &writer(&dir), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnsupportedBlobType(BlobKind::Page)));
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[tokio::test]
    async fn missing_content_range_is_protocol_error() {
        let exec = ChunkExecutor::new(Arc::new(FixedResponse(RangeResponse {
            data: b"abc".to_vec(),
            ..Default::default()
        })));
        let dir = TempDir::new().unwrap();
        let err = exec
            .download_initial(&blob(), ByteRange::new(0, 4), &TransferOptions::default(), &writer(&dir), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingContentRange));
    }

    #[tokio::test]
    async fn md5_mismatch_only_when_validation_enabled() {
        let exec = ChunkExecutor::new(Arc::new(FixedResponse(RangeResponse {
            data: b"abcd".to_vec(),
            content_range: Some("bytes 0-3/4".into()),
            content_md5: Some(content_md5(b"xxxx")),
            ..Default::default()
        })));
        let dir = TempDir::new().unwrap();
        let w = writer(&dir);
        let cancel = CancellationToken::new();

        exec.download_chunk(&blob(), ByteRange::new(0, 4), 0, &TransferOptions::default(), &w, &cancel)
            .await
            .unwrap();

        let validating = TransferOptions {
            validate_content_md5: true,
            ..Default::default()
        };
        let err = exec
            .download_chunk(&blob(), ByteRange::new(0, 4), 0, &validating, &w, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Integrity);
    }

    #[tokio::test]
    async fn short_chunk_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put_blob(&blob(), b"0123".to_vec());
        let exec = ChunkExecutor::new(store);
        let dir = TempDir::new().unwrap();

        let err = exec
            .download_chunk(&blob(), ByteRange::new(0, 8), 0, &TransferOptions::default(), &writer(&dir), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ShortResponse { expected: 8, actual: 4 }));
    }

    #[tokio::test]
    async fn cancelled_before_start_is_interrupted() {
        let store = Arc::new(MemoryBlobStore::new());
        let exec = ChunkExecutor::new(store.clone());
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"data").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exec
            .upload_chunk(&blob(), &src, ByteRange::new(0, 4), "A", &TransferOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(store.staged_block_count(&blob()), 0);
    }

    #[tokio::test]
    async fn upload_and_commit() {
        let store = Arc::new(MemoryBlobStore::new());
        let exec = ChunkExecutor::new(store.clone());
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"hello world").unwrap();
        let options = TransferOptions::default();
        let cancel = CancellationToken::new();

        let n = exec
            .upload_chunk(&blob(), &src, ByteRange::new(6, 11), "B", &options, &cancel)
            .await
            .unwrap();
        assert_eq!(n, 5);
        exec.upload_chunk(&blob(), &src, ByteRange::new(0, 6), "A", &options, &cancel)
            .await
            .unwrap();

        let resp = exec
            .commit(&blob(), &["A".to_string(), "B".to_string()], &options)
            .await
            .unwrap();
        assert!(resp.etag.is_some());
        assert_eq!(store.blob(&blob()).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn transient_stage_failure_classified() {
        let exec = ChunkExecutor::new(Arc::new(FixedResponse(RangeResponse::default())));
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"data").unwrap();

        let err = exec
            .upload_chunk(&blob(), &src, ByteRange::new(0, 4), "A", &TransferOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
