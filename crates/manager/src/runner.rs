//! Operation execution: what a chunk, initial or final op actually does.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use blobferry_model::{
    BlobRef, ByteRange, ChunkTransfer, ErrorClass, TransferFailure, TransferId, TransferKey,
    TransferOptions, TransferState, TransferType, initial_range, remaining_ranges,
};
use blobferry_queue::{OperationKind, OperationRunner, RunContext};
use blobferry_transfer::{InitialChunk, RangeWriter, TransferError};
use tracing::{debug, info, warn};

use crate::shared::{Core, op_outcome};
use crate::{ManagerError, TransferEvent};

enum Start<T> {
    Run(T),
    Skip(TransferState),
}

struct ChunkPlan {
    parent: TransferId,
    transfer_type: TransferType,
    blob: BlobRef,
    local_path: PathBuf,
    options: TransferOptions,
    range: ByteRange,
    file_offset: u64,
    block_id: Option<String>,
}

struct BlobPlan {
    transfer_type: TransferType,
    blob: BlobRef,
    local_path: PathBuf,
    options: TransferOptions,
}

impl OperationRunner for Core {
    fn run(&self, ctx: RunContext) -> Pin<Box<dyn Future<Output = TransferState> + Send + '_>> {
        Box::pin(async move {
            let result = match (ctx.kind, ctx.key) {
                (OperationKind::Chunk, TransferKey::Chunk(id)) => self.run_chunk(id, &ctx).await,
                (OperationKind::Initial, TransferKey::Blob(id)) => self.run_initial(id, &ctx).await,
                (OperationKind::Final, TransferKey::Blob(id)) => self.run_final(id, &ctx).await,
                (kind, key) => {
                    warn!(op = %ctx.op, key = %key, kind = %kind, "operation kind does not match its key");
                    Ok(TransferState::Failed)
                }
            };
            match result {
                Ok(state) => state,
                Err(ManagerError::NotFound(id)) => {
                    debug!(op = %ctx.op, transfer = %id, "transfer gone before its operation ran");
                    TransferState::Canceled
                }
                Err(ManagerError::Invariant { id, reason }) => {
                    self.discard(id, &ManagerError::Invariant { id, reason });
                    TransferState::Canceled
                }
                Err(e) => {
                    warn!(op = %ctx.op, key = %ctx.key, error = %e, "operation failed");
                    TransferState::Failed
                }
            }
        })
    }
}

impl Core {
    // -----------------------------------------------------------------------
    // Chunk ops
    // -----------------------------------------------------------------------

    async fn run_chunk(&self, id: TransferId, ctx: &RunContext) -> Result<TransferState, ManagerError> {
        let plan = match self.begin_chunk(id, ctx.op)? {
            Start::Run(plan) => plan,
            Start::Skip(state) => return Ok(state),
        };

        let result = match plan.transfer_type {
            TransferType::Upload => {
                let block_id = plan.block_id.as_deref().unwrap_or_default();
                self.executor
                    .upload_chunk(
                        &plan.blob,
                        &plan.local_path,
                        plan.range,
                        block_id,
                        &plan.options,
                        &ctx.cancel,
                    )
                    .await
            }
            TransferType::Download => match self.writer(plan.parent, &plan.local_path) {
                Ok(writer) => {
                    self.executor
                        .download_chunk(
                            &plan.blob,
                            plan.range,
                            plan.file_offset,
                            &plan.options,
                            &writer,
                            &ctx.cancel,
                        )
                        .await
                }
                Err(e) => Err(e),
            },
        };

        Ok(match result {
            Ok(bytes) => self.finish_chunk(id, ctx.op, bytes),
            Err(e) if e.is_interrupted() => self.chunk_outcome(id),
            Err(e) => self.chunk_failed(id, ctx.op, &e),
        })
    }

    /// Marks a chunk in progress, starting its parent if needed.
    fn begin_chunk(&self, id: TransferId, op: TransferId) -> Result<Start<ChunkPlan>, ManagerError> {
        let mut guard = self.lock();
        let arena = &mut *guard;

        let Some(chunk) = arena.chunks.get(&id) else {
            return Ok(Start::Skip(TransferState::Canceled));
        };
        if chunk.operation != Some(op) {
            return Ok(Start::Skip(op_outcome(chunk.state)));
        }
        let parent_id = chunk.parent;
        let range = chunk.range;
        let block_id = chunk.block_id.clone();

        let Some(parent) = arena.blobs.get_mut(&parent_id) else {
            warn!(chunk = %id, parent = %parent_id, "chunk without parent dropped");
            arena.chunks.remove(&id);
            return Ok(Start::Skip(TransferState::Canceled));
        };
        if !parent.state.is_active() {
            return Ok(Start::Skip(op_outcome(parent.state)));
        }
        if parent.is_upload() && block_id.is_none() {
            return Err(ManagerError::Invariant {
                id: parent_id,
                reason: format!("chunk {id} has no block id"),
            });
        }

        let started = parent.state == TransferState::Pending;
        if started {
            parent.set_state(TransferState::InProgress)?;
        }
        let plan = ChunkPlan {
            parent: parent_id,
            transfer_type: parent.transfer_type,
            blob: parent.blob.clone(),
            local_path: parent.local_path.clone(),
            options: parent.options.clone(),
            range,
            file_offset: parent.file_offset(range),
            block_id,
        };

        if let Some(chunk) = arena.chunks.get_mut(&id) {
            chunk.set_state(TransferState::InProgress)?;
        }
        if started {
            arena.mark_started(parent_id);
            self.emit(TransferEvent::StateChanged {
                id: parent_id,
                state: TransferState::InProgress,
            });
            info!(transfer = %parent_id, "transfer started");
        }
        Ok(Start::Run(plan))
    }

    fn finish_chunk(&self, id: TransferId, op: TransferId, bytes: u64) -> TransferState {
        let (parent, progress) = {
            let mut guard = self.lock();
            let arena = &mut *guard;
            let Some(chunk) = arena.chunks.get_mut(&id) else {
                return TransferState::Canceled;
            };
            if chunk.operation != Some(op) || chunk.state != TransferState::InProgress {
                return op_outcome(chunk.state);
            }
            if let Err(e) = chunk.set_state(TransferState::Complete) {
                warn!(chunk = %id, error = %e, "cannot complete chunk");
                return TransferState::Failed;
            }
            chunk.operation = None;
            chunk.error = None;
            let parent = chunk.parent;
            if chunk.transfer_type == TransferType::Upload
                && let Some(block_id) = chunk.block_id.clone()
            {
                arena
                    .ledgers
                    .entry(parent)
                    .or_default()
                    .record(block_id, chunk.sequence);
            }

            if let Some(blob) = arena.blobs.get_mut(&parent) {
                blob.add_transferred(bytes);
            }
            arena.record_speed(parent, bytes);
            let progress = arena.progress(parent);
            if let Some(progress) = progress {
                self.emit(TransferEvent::Progress {
                    id: parent,
                    progress,
                });
            }
            (parent, progress)
        };

        debug!(chunk = %id, transfer = %parent, bytes, "chunk complete");
        if let Some(progress) = progress {
            self.report_progress(parent, progress);
        }
        TransferState::Complete
    }

    /// Outcome of a chunk whose op was interrupted by pause or cancel.
    fn chunk_outcome(&self, id: TransferId) -> TransferState {
        let arena = self.lock();
        match arena.chunks.get(&id) {
            Some(c) if c.state == TransferState::Paused => TransferState::Paused,
            _ => TransferState::Canceled,
        }
    }

    fn chunk_failed(&self, id: TransferId, op: TransferId, error: &TransferError) -> TransferState {
        let failure = error.to_failure();
        let parent = {
            let mut arena = self.lock();
            let Some(chunk) = arena.chunks.get_mut(&id) else {
                return TransferState::Canceled;
            };
            if chunk.operation != Some(op) || chunk.state != TransferState::InProgress {
                return op_outcome(chunk.state);
            }
            chunk.error = Some(failure.clone());
            if !failure.class.is_transient() {
                // The op reports its own failure; keep it out of the halt.
                chunk.operation = None;
                if let Err(e) = chunk.set_state(TransferState::Failed) {
                    warn!(chunk = %id, error = %e, "cannot fail chunk");
                }
            }
            chunk.parent
        };
        warn!(chunk = %id, transfer = %parent, class = %failure.class, error = %failure.message, "chunk failed");
        self.fail_transfer(parent, failure)
    }

    // -----------------------------------------------------------------------
    // Initial op (downloads)
    // -----------------------------------------------------------------------

    async fn run_initial(&self, id: TransferId, ctx: &RunContext) -> Result<TransferState, ManagerError> {
        let plan = match self.begin_blob(id, ctx.op)? {
            Start::Run(plan) => plan,
            Start::Skip(state) => return Ok(state),
        };
        let range = initial_range(plan.options.range, self.config.chunk_size);

        let writer = match self.writer(id, &plan.local_path) {
            Ok(w) => w,
            Err(e) => return Ok(self.fail_transfer(id, e.to_failure())),
        };
        let initial = match self
            .executor
            .download_initial(&plan.blob, range, &plan.options, &writer, &ctx.cancel)
            .await
        {
            Ok(initial) => initial,
            Err(e) if e.is_interrupted() => return Ok(self.blob_outcome(id)),
            Err(e) => return Ok(self.fail_transfer(id, e.to_failure())),
        };

        let len = wanted_len(plan.options.range, initial.total);
        if let Err(e) = set_len(&writer, len).await {
            return Ok(self.fail_transfer(id, e.to_failure()));
        }
        Ok(self.finish_initial(id, ctx.op, range, &initial))
    }

    /// Records the learned length, creates the remaining chunks and submits
    /// them with a final op.
    fn finish_initial(
        &self,
        id: TransferId,
        op: TransferId,
        range: ByteRange,
        initial: &InitialChunk,
    ) -> TransferState {
        let progress = {
            let mut arena = self.lock();
            let Ok(blob) = arena.blob_mut(id) else {
                return TransferState::Canceled;
            };
            if blob.operation != Some(op) || blob.state != TransferState::InProgress {
                return op_outcome(blob.state);
            }

            let requested = blob.options.range;
            let remaining = match remaining_ranges(
                requested,
                range,
                initial.total,
                self.config.chunk_size,
            ) {
                Ok(r) => r,
                Err(e) => {
                    drop(arena);
                    return self.fail_transfer(id, TransferFailure::new(ErrorClass::Protocol, e.to_string()));
                }
            };
            let chunks: Vec<ChunkTransfer> = remaining
                .into_iter()
                .enumerate()
                .map(|(i, r)| ChunkTransfer::new_download(id, r, i as u32 + 1))
                .collect();

            blob.total_bytes = wanted_len(requested, initial.total);
            blob.transferred_bytes = 0;
            blob.add_transferred(initial.bytes);
            if blob.options.if_match.is_none() {
                blob.options.if_match = initial.etag.clone();
            }
            blob.chunk_ids = chunks.iter().map(|c| c.id).collect();
            blob.initial_call_complete = true;
            blob.operation = None;
            let blob = blob.clone();
            debug!(
                transfer = %id,
                total = blob.total_bytes,
                chunks = chunks.len(),
                "download length learned"
            );
            arena.insert(blob, chunks);
            arena.record_speed(id, initial.bytes);

            let ops = match arena.build_operations(id) {
                Ok(ops) => ops,
                Err(e) => {
                    drop(arena);
                    warn!(transfer = %id, error = %e, "cannot schedule download chunks");
                    return self.fail_transfer(id, TransferFailure::new(ErrorClass::Invariant, e.to_string()));
                }
            };
            self.persist_transfer(&arena, id);
            self.queue.add_all(ops);

            let progress = arena.progress(id);
            if let Some(progress) = progress {
                self.emit(TransferEvent::Progress { id, progress });
            }
            progress
        };

        if let Some(progress) = progress {
            self.report_progress(id, progress);
        }
        TransferState::Complete
    }

    // -----------------------------------------------------------------------
    // Final op
    // -----------------------------------------------------------------------

    async fn run_final(&self, id: TransferId, ctx: &RunContext) -> Result<TransferState, ManagerError> {
        let plan = match self.begin_blob(id, ctx.op)? {
            Start::Run(plan) => plan,
            Start::Skip(state) => return Ok(state),
        };

        match plan.transfer_type {
            TransferType::Upload => {
                let block_ids = self.commit_list(id)?;
                if ctx.cancel.is_cancelled() {
                    return Ok(self.blob_outcome(id));
                }
                match self
                    .executor
                    .commit(&plan.blob, &block_ids, &plan.options)
                    .await
                {
                    Ok(resp) => {
                        debug!(transfer = %id, blocks = block_ids.len(), etag = ?resp.etag, "upload committed");
                    }
                    Err(e) => return Ok(self.fail_transfer(id, e.to_failure())),
                }
            }
            TransferType::Download => {
                self.ensure_chunks_complete(id)?;
                let synced = match self.writer(id, &plan.local_path) {
                    Ok(writer) => sync(&writer).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = synced {
                    return Ok(self.fail_transfer(id, e.to_failure()));
                }
            }
        }
        Ok(self.complete_transfer(id, ctx.op))
    }

    /// Block ids to commit, in partition order.
    fn commit_list(&self, id: TransferId) -> Result<Vec<String>, ManagerError> {
        let arena = self.lock();
        let expected = arena.blob(id)?.chunk_ids.len();
        let block_ids = arena
            .ledgers
            .get(&id)
            .map(|l| l.ordered_block_ids())
            .unwrap_or_default();
        if block_ids.len() != expected {
            return Err(ManagerError::Invariant {
                id,
                reason: format!("{} of {expected} blocks staged", block_ids.len()),
            });
        }
        Ok(block_ids)
    }

    fn ensure_chunks_complete(&self, id: TransferId) -> Result<(), ManagerError> {
        let arena = self.lock();
        let pending = arena
            .children(id)
            .iter()
            .filter(|c| c.state != TransferState::Complete)
            .count();
        if pending > 0 {
            return Err(ManagerError::Invariant {
                id,
                reason: format!("{pending} chunk(s) incomplete at finalize"),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared
    // -----------------------------------------------------------------------

    /// Marks the transfer in progress for its initial or final op.
    fn begin_blob(&self, id: TransferId, op: TransferId) -> Result<Start<BlobPlan>, ManagerError> {
        let mut arena = self.lock();
        let Some(blob) = arena.blobs.get_mut(&id) else {
            return Ok(Start::Skip(TransferState::Canceled));
        };
        if blob.operation != Some(op) || !blob.state.is_active() {
            return Ok(Start::Skip(op_outcome(blob.state)));
        }

        let started = blob.state == TransferState::Pending;
        if started {
            blob.set_state(TransferState::InProgress)?;
        }
        let plan = BlobPlan {
            transfer_type: blob.transfer_type,
            blob: blob.blob.clone(),
            local_path: blob.local_path.clone(),
            options: blob.options.clone(),
        };
        if started {
            arena.mark_started(id);
            self.emit(TransferEvent::StateChanged {
                id,
                state: TransferState::InProgress,
            });
            info!(transfer = %id, "transfer started");
        }
        Ok(Start::Run(plan))
    }

    /// Outcome of a top-level op interrupted by pause or cancel.
    fn blob_outcome(&self, id: TransferId) -> TransferState {
        let arena = self.lock();
        arena
            .blobs
            .get(&id)
            .map_or(TransferState::Canceled, |b| op_outcome(b.state))
    }
}

/// Bytes a download ends up with: the requested sub-range clamped to the
/// object, or the whole object.
fn wanted_len(requested: Option<ByteRange>, total: u64) -> u64 {
    match requested {
        Some(r) => r.end.min(total).saturating_sub(r.start),
        None => total,
    }
}

async fn set_len(writer: &Arc<RangeWriter>, len: u64) -> Result<(), TransferError> {
    let writer = Arc::clone(writer);
    tokio::task::spawn_blocking(move || writer.set_len(len))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}

async fn sync(writer: &Arc<RangeWriter>) -> Result<(), TransferError> {
    let writer = Arc::clone(writer);
    tokio::task::spawn_blocking(move || writer.sync())
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
}
