#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobferry_manager::{ManagerConfig, TransferManager};
use blobferry_model::{BlobRef, BlobTransfer, ByteRange, TransferId, TransferState};
use blobferry_transfer::{
    AccessConditions, CommitResponse, MemoryBlobStore, RangeResponse, RemoteBlobStore, RemoteError,
    RemoteErrorKind, RemoteFuture,
};
use tokio::sync::Semaphore;

/// Wraps a [`MemoryBlobStore`] with injectable faults.
///
/// Uploaded blocks are identified by their first byte, reads by the start of
/// the requested range.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryBlobStore,
    pub put_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub corrupt_md5: AtomicBool,
    put_failures: Mutex<HashMap<u8, RemoteErrorKind>>,
    get_failures: Mutex<HashMap<u64, RemoteErrorKind>>,
    put_holds: Mutex<HashMap<u8, Arc<Semaphore>>>,
    get_holds: Mutex<HashMap<u64, Arc<Semaphore>>>,
    staged_order: Mutex<Vec<u8>>,
    commits: Mutex<Vec<Vec<String>>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_put_once(&self, tag: u8, kind: RemoteErrorKind) {
        self.put_failures.lock().unwrap().insert(tag, kind);
    }

    pub fn fail_get_once(&self, start: u64, kind: RemoteErrorKind) {
        self.get_failures.lock().unwrap().insert(start, kind);
    }

    /// Blocks `put_block` for `tag` until [`release_put`](Self::release_put).
    pub fn hold_put(&self, tag: u8) {
        self.put_holds
            .lock()
            .unwrap()
            .insert(tag, Arc::new(Semaphore::new(0)));
    }

    pub fn release_put(&self, tag: u8) {
        if let Some(gate) = self.put_holds.lock().unwrap().get(&tag) {
            gate.add_permits(1);
        }
    }

    pub fn hold_get(&self, start: u64) {
        self.get_holds
            .lock()
            .unwrap()
            .insert(start, Arc::new(Semaphore::new(0)));
    }

    pub fn release_get(&self, start: u64) {
        if let Some(gate) = self.get_holds.lock().unwrap().get(&start) {
            gate.add_permits(1);
        }
    }

    pub fn puts(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Tags of staged blocks in completion order.
    pub fn staged_order(&self) -> Vec<u8> {
        self.staged_order.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<Vec<String>> {
        self.commits.lock().unwrap().clone()
    }
}

async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

impl RemoteBlobStore for FaultyStore {
    fn get_range<'a>(
        &'a self,
        blob: &'a BlobRef,
        range: ByteRange,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, RangeResponse> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.get_holds.lock().unwrap().get(&range.start).cloned();
            pass(gate).await;
            let failure = self.get_failures.lock().unwrap().remove(&range.start);
            if let Some(kind) = failure {
                return Err(RemoteError::new(kind, "injected"));
            }
            let mut resp = self.inner.get_range(blob, range, conditions).await?;
            if self.corrupt_md5.load(Ordering::SeqCst) {
                resp.content_md5 = Some("AAAAAAAAAAAAAAAAAAAAAA==".into());
            }
            Ok(resp)
        })
    }

    fn put_block<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_id: &'a str,
        data: Vec<u8>,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let tag = data.first().copied().unwrap_or_default();
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.put_holds.lock().unwrap().get(&tag).cloned();
            pass(gate).await;
            let failure = self.put_failures.lock().unwrap().remove(&tag);
            if let Some(kind) = failure {
                return Err(RemoteError::new(kind, "injected"));
            }
            self.inner.put_block(blob, block_id, data, conditions).await?;
            self.staged_order.lock().unwrap().push(tag);
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_ids: &'a [String],
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, CommitResponse> {
        Box::pin(async move {
            let resp = self.inner.commit_block_list(blob, block_ids, conditions).await?;
            self.commits.lock().unwrap().push(block_ids.to_vec());
            Ok(resp)
        })
    }
}

pub fn config(dir: &Path, chunk_size: u64, max_concurrency: usize) -> ManagerConfig {
    ManagerConfig {
        max_concurrency,
        chunk_size,
        store_path: dir.join("transfers.json"),
        ..ManagerConfig::default()
    }
}

/// File whose chunk `i` is filled with byte `b'a' + i`.
pub fn tagged_data(total: usize, chunk_size: usize) -> Vec<u8> {
    (0..total).map(|i| b'a' + (i / chunk_size) as u8).collect()
}

pub fn write_source(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Polls until the transfer reaches `state`.
pub async fn wait_state(manager: &TransferManager, id: TransferId, state: TransferState) -> BlobTransfer {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(t) = manager.get(id)
            && t.state == state
        {
            return t;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {state}, transfer is {:?}",
            manager.get(id).map(|t| t.state)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls until `f` holds.
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
