use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use blobferry_model::{
    BlobRef, BlobTransfer, ChunkTransfer, TransferId, TransferOptions, TransferState, TransferType,
};
use blobferry_queue::{OperationQueue, OperationRunner, QueueEvent};
use blobferry_transfer::{ChunkExecutor, RemoteBlobStore, TransferError, validate_blob_ref};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::persist::Persister;
use crate::shared::{Core, CoreParts};
use crate::{
    EventStream, JsonFileStore, ManagerConfig, ManagerError, NetworkStatus, ProgressCallback,
    Reachability, TransferFilter, TransferHandle, TransferStore,
};

/// Owns every transfer, schedules its operations and persists its rows.
///
/// Construct one per application and share it through `Arc`. Must be
/// created inside a tokio runtime.
pub struct TransferManager {
    core: Arc<Core>,
}

impl TransferManager {
    pub fn new(
        config: ManagerConfig,
        remote: Arc<dyn RemoteBlobStore>,
        store: Arc<dyn TransferStore>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let reachability = Reachability::default();
        let shutdown = CancellationToken::new();
        let persister = Persister::spawn(Arc::clone(&store));
        let max_concurrency = config.max_concurrency;

        let core = Arc::new_cyclic(|weak: &Weak<Core>| {
            let runner: Weak<dyn OperationRunner> = weak.clone();
            Core::new(CoreParts {
                config,
                executor: ChunkExecutor::new(remote),
                queue: OperationQueue::new(max_concurrency, runner),
                store,
                persister,
                reachability: reachability.clone(),
                shutdown: shutdown.clone(),
            })
        });

        if let Some(changes) = core.queue.take_events() {
            tokio::spawn(persist_queue_changes(
                Arc::downgrade(&core),
                changes,
                shutdown.clone(),
            ));
        }
        tokio::spawn(watch_network(
            Arc::downgrade(&core),
            reachability.subscribe(),
            shutdown,
        ));
        info!(
            max_concurrency,
            chunk_size = core.config.chunk_size,
            "transfer manager started"
        );
        Ok(Self { core })
    }

    /// Manager persisting to a [`JsonFileStore`] at `config.store_path`.
    pub fn open(config: ManagerConfig, remote: Arc<dyn RemoteBlobStore>) -> Result<Self, ManagerError> {
        let store = JsonFileStore::new(config.store_path.clone())?;
        Self::new(config, remote, Arc::new(store))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.core.config
    }

    /// Connectivity signal. Report status changes through [`Reachability::set`].
    pub fn reachability(&self) -> Reachability {
        self.core.reachability.clone()
    }

    /// Takes the event stream. Returns `None` after the first call.
    ///
    /// Events raised before the stream is taken are not kept.
    pub fn take_events(&self) -> Option<EventStream> {
        self.core.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Adding
    // -----------------------------------------------------------------------

    /// Uploads `local_path` to `blob`.
    pub async fn add_upload(
        &self,
        local_path: impl Into<PathBuf>,
        blob: BlobRef,
        options: TransferOptions,
    ) -> Result<TransferHandle, ManagerError> {
        validate_blob_ref(&blob)?;
        let local_path = local_path.into();
        let meta = tokio::fs::metadata(&local_path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(local_path.display().to_string()).into());
        }
        let transfer = BlobTransfer::new_upload(local_path, blob, options, meta.len());
        self.add(transfer).await
    }

    /// Downloads `blob` into `local_path`.
    pub async fn add_download(
        &self,
        blob: BlobRef,
        local_path: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Result<TransferHandle, ManagerError> {
        validate_blob_ref(&blob)?;
        let transfer = BlobTransfer::new_download(blob, local_path, options);
        self.add(transfer).await
    }

    /// Takes ownership of `transfer` and schedules it.
    ///
    /// A brand-new upload is partitioned into chunks first. Transfers whose
    /// records are inconsistent are removed and reported as an error.
    pub async fn add(&self, transfer: BlobTransfer) -> Result<TransferHandle, ManagerError> {
        let id = transfer.id;
        let (kind, blob, total) = (transfer.transfer_type, transfer.blob.clone(), transfer.total_bytes);
        {
            let mut arena = self.core.lock();
            if !arena.blobs.contains_key(&id) {
                arena.insert(transfer, Vec::new());
            }
        }
        self.core.submit(id)?;
        info!(transfer = %id, kind = %kind, blob = %blob, bytes = total, "transfer added");
        Ok(TransferHandle::new(id))
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Pauses a transfer. Pausing an already paused transfer is a no-op.
    pub async fn pause(&self, handle: &TransferHandle) -> Result<(), ManagerError> {
        self.core.pause_transfer(handle.id())?;
        Ok(())
    }

    /// Resumes a paused or failed transfer, optionally installing a
    /// progress callback.
    ///
    /// Refused with [`ManagerError::NotReachable`] while offline. Resuming
    /// an active transfer only installs the callback.
    pub async fn resume(
        &self,
        handle: &TransferHandle,
        progress: Option<ProgressCallback>,
    ) -> Result<(), ManagerError> {
        let id = handle.id();
        if self.core.transfer(id).is_none() {
            return Err(ManagerError::NotFound(id));
        }
        if let Some(cb) = progress {
            self.core.set_callback(id, cb);
        }
        self.core.resume_transfer(id)?;
        Ok(())
    }

    pub async fn cancel(&self, handle: &TransferHandle) -> Result<(), ManagerError> {
        self.core.cancel_transfer(handle.id())?;
        Ok(())
    }

    /// Cancels outstanding work and deletes the transfer and its chunks.
    pub async fn remove(&self, handle: &TransferHandle) -> Result<(), ManagerError> {
        self.core.remove_transfer(handle.id())
    }

    /// Number of transfers paused.
    pub async fn pause_all(&self) -> usize {
        self.each(|core, id| core.pause_transfer(id))
    }

    /// Number of transfers resumed. Transfers whose network policy forbids
    /// the current network are skipped.
    pub async fn resume_all(&self) -> Result<usize, ManagerError> {
        if !self.core.reachability.status().is_reachable() {
            return Err(ManagerError::NotReachable);
        }
        Ok(self.each(|core, id| core.resume_transfer(id)))
    }

    pub async fn cancel_all(&self) -> usize {
        self.each(|core, id| core.cancel_transfer(id))
    }

    pub async fn remove_all(&self) -> usize {
        self.each(|core, id| core.remove_transfer(id).map(|()| true))
    }

    fn each(&self, f: impl Fn(&Core, TransferId) -> Result<bool, ManagerError>) -> usize {
        let ids: Vec<TransferId> = self.core.lock().ordered().map(|b| b.id).collect();
        let mut count = 0;
        for id in ids {
            match f(&self.core, id) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => debug!(transfer = %id, error = %e, "bulk operation skipped transfer"),
            }
        }
        count
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Re-adds every stored transfer in a rehydratable state.
    ///
    /// Transfers and chunks left in progress by an earlier run come back as
    /// pending. Returns the number of transfers restored.
    pub async fn load_context(&self) -> Result<usize, ManagerError> {
        let store = Arc::clone(&self.core.store);
        let stored = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| ManagerError::Io(std::io::Error::other(e)))??;

        let mut by_parent: HashMap<TransferId, Vec<ChunkTransfer>> = HashMap::new();
        for chunk in stored.chunks {
            by_parent.entry(chunk.parent).or_default().push(chunk);
        }

        let mut restored = 0;
        for mut blob in stored.blobs {
            let id = blob.id;
            if self.core.lock().blobs.contains_key(&id) {
                continue;
            }
            let mut chunks: Vec<ChunkTransfer> = by_parent
                .remove(&id)
                .unwrap_or_default()
                .into_iter()
                .filter(|c| blob.chunk_ids.contains(&c.id))
                .collect();

            // Interrupted by the previous shutdown.
            if blob.state == TransferState::InProgress {
                blob.state = TransferState::Pending;
            }
            for c in &mut chunks {
                if c.state == TransferState::InProgress {
                    c.state = TransferState::Pending;
                }
                c.operation = None;
            }
            blob.operation = None;

            {
                let mut arena = self.core.lock();
                arena.insert(blob, chunks);
                arena.recount_transferred(id);
            }
            match self.core.submit(id) {
                Ok(()) => {
                    restored += 1;
                    debug!(transfer = %id, "transfer rehydrated");
                }
                Err(e @ ManagerError::Invariant { .. }) => {
                    warn!(transfer = %id, error = %e, "stored transfer discarded");
                }
                Err(e) => return Err(e),
            }
        }
        info!(restored, "transfer context loaded");
        Ok(restored)
    }

    /// Waits until every queued store write has been applied.
    pub async fn flush(&self) {
        self.core.persister.flush().await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: TransferId) -> Option<BlobTransfer> {
        self.core.transfer(id)
    }

    /// Every transfer, in the order it was added.
    pub fn transfers(&self) -> Vec<BlobTransfer> {
        self.core.lock().ordered().cloned().collect()
    }

    pub fn uploads(&self) -> Vec<BlobTransfer> {
        self.filter(&TransferFilter::default().transfer_type(TransferType::Upload))
    }

    pub fn downloads(&self) -> Vec<BlobTransfer> {
        self.filter(&TransferFilter::default().transfer_type(TransferType::Download))
    }

    pub fn filter(&self, filter: &TransferFilter) -> Vec<BlobTransfer> {
        self.core
            .lock()
            .ordered()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub fn first_with(&self, filter: &TransferFilter) -> Option<BlobTransfer> {
        self.core
            .lock()
            .ordered()
            .find(|t| filter.matches(t))
            .cloned()
    }

    /// Chunks of a transfer in partition order.
    pub fn chunks(&self, id: TransferId) -> Vec<ChunkTransfer> {
        self.core.lock().children(id)
    }

    /// Operations currently queued or running.
    pub fn queued_operations(&self) -> usize {
        self.core.queue.len()
    }
}

impl Drop for TransferManager {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}

/// Saves the rows behind each queue state change as the queue reports it:
/// a single change writes one row, a batch writes them together.
async fn persist_queue_changes(
    core: Weak<Core>,
    mut rx: mpsc::UnboundedReceiver<QueueEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        let Some(core) = core.upgrade() else {
            break;
        };
        core.persist_changes(&event.into_changes());
    }
    debug!("queue persistence stopped");
}

async fn watch_network(
    core: Weak<Core>,
    mut rx: watch::Receiver<NetworkStatus>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let status = *rx.borrow_and_update();
        let Some(core) = core.upgrade() else {
            break;
        };
        core.on_network_change(status);
    }
    debug!("network watcher stopped");
}
