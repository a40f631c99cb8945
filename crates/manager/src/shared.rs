//! Shared manager state and the transitions every entry point goes through.
//!
//! Arena mutations and the matching queue calls happen under the arena
//! lock. The queue never calls back into the arena while holding its own
//! lock, so the order arena -> queue cannot deadlock.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use blobferry_model::{
    BlobTransfer, ChunkTransfer, ErrorClass, TransferFailure, TransferId, TransferKey,
    TransferProgress, TransferState, TransferType, partition,
};
use blobferry_queue::OperationQueue;
use blobferry_transfer::{ChunkExecutor, RangeWriter, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::events::EventSink;
use crate::persist::Persister;
use crate::reachability::policy_for;
use crate::{
    ManagerConfig, ManagerError, NetworkPolicy, NetworkStatus, ProgressCallback, Reachability,
    TransferEvent, TransferStore,
};

pub(crate) struct Core {
    pub(crate) config: ManagerConfig,
    pub(crate) executor: ChunkExecutor,
    pub(crate) queue: OperationQueue,
    pub(crate) store: Arc<dyn TransferStore>,
    pub(crate) persister: Persister,
    pub(crate) reachability: Reachability,
    pub(crate) shutdown: CancellationToken,
    arena: Mutex<Arena>,
    pub(crate) events: EventSink,
    callbacks: Mutex<HashMap<TransferId, ProgressCallback>>,
    writers: Mutex<HashMap<TransferId, Arc<RangeWriter>>>,
}

/// Outcome of an operation that finished without doing its work.
pub(crate) fn op_outcome(state: TransferState) -> TransferState {
    match state {
        TransferState::Paused => TransferState::Paused,
        TransferState::Failed => TransferState::Failed,
        TransferState::Complete => TransferState::Complete,
        _ => TransferState::Canceled,
    }
}

pub(crate) struct CoreParts {
    pub(crate) config: ManagerConfig,
    pub(crate) executor: ChunkExecutor,
    pub(crate) queue: OperationQueue,
    pub(crate) store: Arc<dyn TransferStore>,
    pub(crate) persister: Persister,
    pub(crate) reachability: Reachability,
    pub(crate) shutdown: CancellationToken,
}

impl Core {
    pub(crate) fn new(parts: CoreParts) -> Self {
        let events = EventSink::new(parts.config.event_buffer);
        Self {
            config: parts.config,
            executor: parts.executor,
            queue: parts.queue,
            store: parts.store,
            persister: parts.persister,
            reachability: parts.reachability,
            shutdown: parts.shutdown,
            arena: Mutex::new(Arena::default()),
            events,
            callbacks: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn policy(&self, transfer_type: TransferType) -> &NetworkPolicy {
        policy_for(
            transfer_type,
            &self.config.upload_policy,
            &self.config.download_policy,
        )
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub(crate) fn emit(&self, event: TransferEvent) {
        self.events.emit(event);
    }

    pub(crate) fn set_callback(&self, id: TransferId, callback: ProgressCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
    }

    /// Invokes the progress callback of a transfer. Never called under the
    /// arena lock.
    pub(crate) fn report_progress(&self, id: TransferId, progress: TransferProgress) {
        let callback = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(cb) = callback {
            cb(id, progress);
        }
    }

    // -----------------------------------------------------------------------
    // Download destinations
    // -----------------------------------------------------------------------

    /// Destination file of a download, opened once per transfer.
    pub(crate) fn writer(&self, id: TransferId, path: &Path) -> Result<Arc<RangeWriter>, TransferError> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = writers.get(&id) {
            return Ok(Arc::clone(w));
        }
        let w = Arc::new(RangeWriter::open(path)?);
        writers.insert(id, Arc::clone(&w));
        Ok(w)
    }

    fn release(&self, id: TransferId, drop_callback: bool) {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if drop_callback {
            self.callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub(crate) fn persist_transfer(&self, arena: &Arena, id: TransferId) {
        if let Some(blob) = arena.blobs.get(&id) {
            self.persister.save_blob(blob);
            self.persister.save_chunks(arena.children(id));
        }
    }

    /// Saves the rows behind queue state changes: one chunk batch, then every
    /// transfer they belong to. Queued (pending) changes were saved on submit.
    pub(crate) fn persist_changes(&self, changes: &[(TransferId, TransferKey, TransferState)]) {
        let arena = self.lock();
        let mut chunks = Vec::new();
        let mut blobs = BTreeSet::new();
        for (_, key, state) in changes {
            if *state == TransferState::Pending {
                continue;
            }
            match key {
                TransferKey::Chunk(id) => {
                    if let Some(chunk) = arena.chunks.get(id) {
                        blobs.insert(chunk.parent);
                        chunks.push(chunk.clone());
                    }
                }
                TransferKey::Blob(id) => {
                    blobs.insert(*id);
                }
            }
        }
        self.persister.save_chunks(chunks);
        for id in blobs {
            if let Some(blob) = arena.blobs.get(&id) {
                self.persister.save_blob(blob);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Builds and submits the operation graph of a transfer held by the
    /// arena. Brand-new uploads are partitioned first.
    pub(crate) fn submit(&self, id: TransferId) -> Result<(), ManagerError> {
        let mut arena = self.lock();
        if let Err(e) = arena.check_consistency(id) {
            drop(arena);
            self.discard(id, &e);
            return Err(e);
        }

        let blob = arena.blob(id)?;
        if let Some(op) = blob.operation
            && self.queue.contains(op)
        {
            debug!(transfer = %id, "transfer already queued");
            return Ok(());
        }

        if blob.is_upload() && blob.chunk_ids.is_empty() && blob.state == TransferState::Pending {
            let ranges = partition(blob.total_bytes, self.config.chunk_size)?;
            let chunks: Vec<ChunkTransfer> = ranges
                .into_iter()
                .enumerate()
                .map(|(seq, range)| ChunkTransfer::new_upload(id, range, seq as u32))
                .collect();
            debug!(transfer = %id, chunks = chunks.len(), "upload partitioned");
            let blob = arena.blob_mut(id)?;
            blob.chunk_ids = chunks.iter().map(|c| c.id).collect();
            let blob = blob.clone();
            arena.insert(blob, chunks);
        }
        arena.rebuild_ledger(id);

        let (state, transfer_type) = {
            let blob = arena.blob(id)?;
            (blob.state, blob.transfer_type)
        };
        let status = self.reachability.status();
        if state.is_active() && !self.policy(transfer_type).allows(status) {
            let ops = arena.halt(id, TransferState::Paused, TransferState::Paused)?;
            self.stop_ops(&ops, TransferState::Paused);
            self.persist_transfer(&arena, id);
            self.emit(TransferEvent::StateChanged {
                id,
                state: TransferState::Paused,
            });
            info!(transfer = %id, status = %status, "transfer paused by network policy");
            return Ok(());
        }

        let ops = match arena.build_operations(id) {
            Ok(ops) => ops,
            Err(e @ ManagerError::Invariant { .. }) => {
                drop(arena);
                self.discard(id, &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.persist_transfer(&arena, id);
        let submitted = self.queue.add_all(ops);
        debug!(transfer = %id, ops = submitted, "operations submitted");
        Ok(())
    }

    fn stop_ops(&self, ops: &[TransferId], mode: TransferState) {
        for op in ops {
            let res = if mode == TransferState::Canceled {
                self.queue.cancel(*op)
            } else {
                self.queue.pause(*op)
            };
            if res.is_err() {
                debug!(op = %op, "operation already finished");
            }
        }
    }

    /// Pauses an active transfer. Returns `false` if it was not active.
    pub(crate) fn pause_transfer(&self, id: TransferId) -> Result<bool, ManagerError> {
        let mut arena = self.lock();
        if !arena.blob(id)?.state.is_pauseable() {
            return Ok(false);
        }
        let ops = arena.halt(id, TransferState::Paused, TransferState::Paused)?;
        self.stop_ops(&ops, TransferState::Paused);
        self.persist_transfer(&arena, id);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Paused,
        });
        drop(arena);
        info!(transfer = %id, "transfer paused");
        Ok(true)
    }

    /// Resumes a paused or failed transfer. Returns `false` if it was not
    /// resumable.
    pub(crate) fn resume_transfer(&self, id: TransferId) -> Result<bool, ManagerError> {
        let status = self.reachability.status();
        if !status.is_reachable() {
            return Err(ManagerError::NotReachable);
        }

        let mut arena = self.lock();
        let blob = arena.blob(id)?;
        if !blob.state.is_resumable() {
            return Ok(false);
        }
        if !self.policy(blob.transfer_type).allows(status) {
            return Err(ManagerError::NetworkPolicy {
                transfer_type: blob.transfer_type,
                status,
            });
        }

        arena.prepare_resume(id)?;
        let ops = match arena.build_operations(id) {
            Ok(ops) => ops,
            Err(e @ ManagerError::Invariant { .. }) => {
                drop(arena);
                self.discard(id, &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.persist_transfer(&arena, id);
        self.queue.add_all(ops);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Pending,
        });
        drop(arena);
        info!(transfer = %id, "transfer resumed");
        Ok(true)
    }

    /// Cancels a transfer. Returns `false` if it was already canceled.
    pub(crate) fn cancel_transfer(&self, id: TransferId) -> Result<bool, ManagerError> {
        let mut arena = self.lock();
        if arena.blob(id)?.state == TransferState::Canceled {
            return Ok(false);
        }
        let ops = arena.halt(id, TransferState::Canceled, TransferState::Canceled)?;
        self.stop_ops(&ops, TransferState::Canceled);
        self.persist_transfer(&arena, id);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Canceled,
        });
        drop(arena);
        self.release(id, true);
        info!(transfer = %id, "transfer canceled");
        Ok(true)
    }

    /// Drops a transfer from the arena, the queue and the store.
    pub(crate) fn remove_transfer(&self, id: TransferId) -> Result<(), ManagerError> {
        let mut arena = self.lock();
        let ops = arena.remove(id).ok_or(ManagerError::NotFound(id))?;
        self.stop_ops(&ops, TransferState::Canceled);
        self.persister.delete(id);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Deleted,
        });
        drop(arena);
        self.release(id, true);
        info!(transfer = %id, "transfer removed");
        Ok(())
    }

    /// Removes a transfer whose records contradict each other.
    pub(crate) fn discard(&self, id: TransferId, error: &ManagerError) {
        warn!(transfer = %id, error = %error, "discarding inconsistent transfer");
        self.emit(TransferEvent::Failed {
            id,
            error: TransferFailure::new(ErrorClass::Invariant, error.to_string()),
        });
        if let Err(e) = self.remove_transfer(id) {
            debug!(transfer = %id, error = %e, "inconsistent transfer already gone");
        }
    }

    /// Applies a failure to a whole transfer according to its class.
    ///
    /// Transient failures pause, invariant violations remove, everything
    /// else fails the transfer. Returns the outcome of the reporting op.
    pub(crate) fn fail_transfer(&self, id: TransferId, failure: TransferFailure) -> TransferState {
        match failure.class {
            ErrorClass::Transient => {
                warn!(transfer = %id, error = %failure, "transient failure, pausing transfer");
                if let Err(e) = self.pause_transfer(id) {
                    debug!(transfer = %id, error = %e, "pause after transient failure skipped");
                }
                return TransferState::Paused;
            }
            ErrorClass::Invariant => {
                self.discard(
                    id,
                    &ManagerError::Invariant {
                        id,
                        reason: failure.message,
                    },
                );
                return TransferState::Canceled;
            }
            ErrorClass::Integrity | ErrorClass::Protocol => {}
        }

        let mut arena = self.lock();
        let Ok(blob) = arena.blob_mut(id) else {
            return TransferState::Canceled;
        };
        if !blob.state.is_active() {
            return op_outcome(blob.state);
        }
        if blob.state == TransferState::Pending
            && let Err(e) = blob.set_state(TransferState::InProgress)
        {
            warn!(transfer = %id, error = %e, "cannot fail transfer");
            return TransferState::Failed;
        }
        blob.error = Some(failure.clone());
        let ops = match arena.halt(id, TransferState::Failed, TransferState::Paused) {
            Ok(ops) => ops,
            Err(e) => {
                warn!(transfer = %id, error = %e, "cannot fail transfer");
                return TransferState::Failed;
            }
        };
        self.stop_ops(&ops, TransferState::Paused);
        self.persist_transfer(&arena, id);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Failed,
        });
        self.emit(TransferEvent::Failed {
            id,
            error: failure.clone(),
        });
        drop(arena);
        self.release(id, false);
        warn!(transfer = %id, class = %failure.class, error = %failure.message, "transfer failed");
        TransferState::Failed
    }

    /// Marks a transfer complete once its final op succeeded.
    pub(crate) fn complete_transfer(&self, id: TransferId, op: TransferId) -> TransferState {
        let mut arena = self.lock();
        let Ok(blob) = arena.blob_mut(id) else {
            return TransferState::Canceled;
        };
        if blob.operation != Some(op) || blob.state != TransferState::InProgress {
            return op_outcome(blob.state);
        }
        if let Err(e) = blob.set_state(TransferState::Complete) {
            warn!(transfer = %id, error = %e, "cannot complete transfer");
            return TransferState::Failed;
        }
        blob.operation = None;
        blob.error = None;
        blob.transferred_bytes = blob.total_bytes;
        let bytes = blob.total_bytes;
        let blob_name = blob.blob.clone();
        self.persist_transfer(&arena, id);
        self.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Complete,
        });
        self.emit(TransferEvent::Completed { id });
        drop(arena);
        self.release(id, true);
        info!(transfer = %id, blob = %blob_name, bytes, "transfer complete");
        TransferState::Complete
    }

    /// Reacts to a connectivity change.
    ///
    /// Losing the network pauses every active transfer. Otherwise each
    /// transfer follows its direction's policy: paused when the network is
    /// not allowed, resumed when it is and auto-resume is on.
    pub(crate) fn on_network_change(&self, status: NetworkStatus) {
        info!(status = %status, "network changed");
        let snapshot: Vec<(TransferId, TransferType, TransferState)> = self
            .lock()
            .ordered()
            .map(|b| (b.id, b.transfer_type, b.state))
            .collect();

        for (id, transfer_type, state) in snapshot {
            let policy = self.policy(transfer_type);
            let res = if !policy.allows(status) {
                if state.is_pauseable() {
                    self.pause_transfer(id)
                } else {
                    Ok(false)
                }
            } else if policy.auto_resume && state == TransferState::Paused {
                self.resume_transfer(id)
            } else {
                Ok(false)
            };
            if let Err(e) = res {
                warn!(transfer = %id, error = %e, "network transition not applied");
            }
        }
    }

    pub(crate) fn transfer(&self, id: TransferId) -> Option<BlobTransfer> {
        self.lock().blobs.get(&id).cloned()
    }
}
