//! In-memory owner of every transfer and chunk, addressed by id.

use std::collections::HashMap;

use blobferry_model::{
    BlobTransfer, ChunkTransfer, TransferId, TransferKey, TransferProgress, TransferState,
};
use blobferry_queue::{Operation, OperationKind};
use blobferry_transfer::{CommitLedger, SpeedCalculator};

use crate::ManagerError;

#[derive(Default)]
pub(crate) struct Arena {
    pub(crate) blobs: HashMap<TransferId, BlobTransfer>,
    pub(crate) chunks: HashMap<TransferId, ChunkTransfer>,
    pub(crate) ledgers: HashMap<TransferId, CommitLedger>,
    speeds: HashMap<TransferId, SpeedCalculator>,
    order: Vec<TransferId>,
}

impl Arena {
    pub(crate) fn insert(&mut self, blob: BlobTransfer, chunks: Vec<ChunkTransfer>) {
        if !self.blobs.contains_key(&blob.id) {
            self.order.push(blob.id);
        }
        for c in chunks {
            self.chunks.insert(c.id, c);
        }
        self.blobs.insert(blob.id, blob);
    }

    /// Drops a transfer and its chunks, returning every operation still
    /// attached to them.
    pub(crate) fn remove(&mut self, id: TransferId) -> Option<Vec<TransferId>> {
        let mut blob = self.blobs.remove(&id)?;
        self.order.retain(|o| *o != id);
        self.ledgers.remove(&id);
        self.speeds.remove(&id);

        let mut ops: Vec<TransferId> = blob.operation.take().into_iter().collect();
        for cid in &blob.chunk_ids {
            if let Some(c) = self.chunks.remove(cid) {
                ops.extend(c.operation);
            }
        }
        Some(ops)
    }

    pub(crate) fn blob(&self, id: TransferId) -> Result<&BlobTransfer, ManagerError> {
        self.blobs.get(&id).ok_or(ManagerError::NotFound(id))
    }

    pub(crate) fn blob_mut(&mut self, id: TransferId) -> Result<&mut BlobTransfer, ManagerError> {
        self.blobs.get_mut(&id).ok_or(ManagerError::NotFound(id))
    }

    /// Transfers in insertion order.
    pub(crate) fn ordered(&self) -> impl Iterator<Item = &BlobTransfer> {
        self.order.iter().filter_map(|id| self.blobs.get(id))
    }

    pub(crate) fn children(&self, id: TransferId) -> Vec<ChunkTransfer> {
        self.blobs
            .get(&id)
            .map(|b| {
                b.chunk_ids
                    .iter()
                    .filter_map(|cid| self.chunks.get(cid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Verifies that the rows of a transfer agree with each other.
    pub(crate) fn check_consistency(&self, id: TransferId) -> Result<(), ManagerError> {
        let blob = self.blob(id)?;
        let broken = |reason: String| ManagerError::Invariant { id, reason };

        if !blob.is_upload() && !blob.initial_call_complete && !blob.chunk_ids.is_empty() {
            return Err(broken("download has chunks before its first response".into()));
        }
        for cid in &blob.chunk_ids {
            let c = self
                .chunks
                .get(cid)
                .ok_or_else(|| broken(format!("missing chunk {cid}")))?;
            if c.parent != id {
                return Err(broken(format!("chunk {cid} belongs to {}", c.parent)));
            }
            if c.transfer_type != blob.transfer_type {
                return Err(broken(format!("chunk {cid} is a {}", c.transfer_type)));
            }
            if blob.is_upload() && c.block_id.is_none() {
                return Err(broken(format!("chunk {cid} has no block id")));
            }
        }
        Ok(())
    }

    /// Recomputes the commit ledger from completed upload chunks.
    pub(crate) fn rebuild_ledger(&mut self, id: TransferId) {
        let Some(blob) = self.blobs.get(&id) else {
            return;
        };
        if !blob.is_upload() {
            return;
        }
        let ledger = CommitLedger::from_completed(
            blob.chunk_ids
                .iter()
                .filter_map(|cid| self.chunks.get(cid))
                .filter(|c| c.state == TransferState::Complete)
                .filter_map(|c| c.block_id.clone().map(|b| (b, c.sequence))),
        );
        self.ledgers.insert(id, ledger);
    }

    /// Derives transferred bytes from the chunk rows.
    pub(crate) fn recount_transferred(&mut self, id: TransferId) {
        let Some(blob) = self.blobs.get(&id) else {
            return;
        };
        if !blob.is_upload() && !blob.initial_call_complete {
            return;
        }
        let outstanding: u64 = blob
            .chunk_ids
            .iter()
            .filter_map(|cid| self.chunks.get(cid))
            .filter(|c| c.state != TransferState::Complete)
            .map(|c| c.len())
            .sum();
        let total = blob.total_bytes;
        if let Some(blob) = self.blobs.get_mut(&id) {
            blob.transferred_bytes = total.saturating_sub(outstanding);
        }
    }

    /// Moves a transfer to `blob_state` and its unfinished chunks to
    /// `chunk_state`. Returns the operations that must be stopped.
    pub(crate) fn halt(
        &mut self,
        id: TransferId,
        blob_state: TransferState,
        chunk_state: TransferState,
    ) -> Result<Vec<TransferId>, ManagerError> {
        let blob = self.blobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        blob.set_state(blob_state)?;
        let mut ops: Vec<TransferId> = blob.operation.take().into_iter().collect();

        for cid in &blob.chunk_ids {
            let Some(c) = self.chunks.get_mut(cid) else {
                continue;
            };
            if !c.state.is_terminal()
                && c.state != chunk_state
                && c.state.can_transition_to(chunk_state)
            {
                c.set_state(chunk_state)?;
            }
            ops.extend(c.operation.take());
        }
        Ok(ops)
    }

    /// Moves a paused or failed transfer and its resumable chunks back to
    /// pending.
    pub(crate) fn prepare_resume(&mut self, id: TransferId) -> Result<(), ManagerError> {
        let blob = self.blobs.get_mut(&id).ok_or(ManagerError::NotFound(id))?;
        blob.set_state(TransferState::Pending)?;
        blob.error = None;
        for cid in &blob.chunk_ids {
            if let Some(c) = self.chunks.get_mut(cid)
                && c.state.is_resumable()
            {
                c.set_state(TransferState::Pending)?;
                c.error = None;
            }
        }
        Ok(())
    }

    /// Builds the operation graph of an active transfer.
    ///
    /// A download that has not seen its first response gets a single
    /// initial op. Everything else gets one op per unfinished chunk plus a
    /// final op depending on all of them.
    pub(crate) fn build_operations(&mut self, id: TransferId) -> Result<Vec<Operation>, ManagerError> {
        let blob = self.blob(id)?;
        if !blob.state.is_active() {
            return Ok(Vec::new());
        }

        if !blob.is_upload() && !blob.initial_call_complete {
            let op = Operation::new(TransferKey::Blob(id), OperationKind::Initial);
            self.blob_mut(id)?.operation = Some(op.id);
            return Ok(vec![op]);
        }

        let chunk_ids = blob.chunk_ids.clone();
        let mut ops = Vec::with_capacity(chunk_ids.len() + 1);
        for cid in chunk_ids {
            let c = self.chunks.get_mut(&cid).ok_or_else(|| ManagerError::Invariant {
                id,
                reason: format!("missing chunk {cid}"),
            })?;
            match c.state {
                TransferState::Complete => continue,
                TransferState::Pending => {}
                // Left over from an interrupted run.
                TransferState::InProgress => c.state = TransferState::Pending,
                TransferState::Paused | TransferState::Failed => {
                    c.set_state(TransferState::Pending)?;
                    c.error = None;
                }
                s @ (TransferState::Canceled | TransferState::Deleted) => {
                    return Err(ManagerError::Invariant {
                        id,
                        reason: format!("chunk {cid} of an active transfer is {s}"),
                    });
                }
            }
            let op = Operation::new(c.key(), OperationKind::Chunk);
            c.operation = Some(op.id);
            ops.push(op);
        }

        let fin = Operation::new(TransferKey::Blob(id), OperationKind::Final)
            .with_dependencies(ops.iter().map(|o| o.id));
        self.blob_mut(id)?.operation = Some(fin.id);
        ops.push(fin);
        Ok(ops)
    }

    /// Starts a fresh speed window for a transfer.
    pub(crate) fn mark_started(&mut self, id: TransferId) {
        let speed = self.speeds.entry(id).or_default();
        speed.reset();
        speed.add_sample(0);
    }

    pub(crate) fn record_speed(&mut self, id: TransferId, bytes: u64) {
        self.speeds.entry(id).or_default().add_sample(bytes);
    }

    /// Progress snapshot including throughput and ETA.
    pub(crate) fn progress(&self, id: TransferId) -> Option<TransferProgress> {
        let blob = self.blobs.get(&id)?;
        let mut progress = blob.progress();
        if let Some(speed) = self.speeds.get(&id) {
            progress.bytes_per_second = speed.bytes_per_second();
            progress.eta_secs = speed.eta(progress.remaining()).map(|d| d.as_secs_f64());
        }
        Some(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobferry_model::{BlobRef, TransferOptions, partition};

    fn upload(arena: &mut Arena, total: u64, chunk: u64) -> TransferId {
        let mut blob = BlobTransfer::new_upload(
            "/tmp/src.bin",
            BlobRef::new("c", "b"),
            TransferOptions::default(),
            total,
        );
        let chunks: Vec<ChunkTransfer> = partition(total, chunk)
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, r)| ChunkTransfer::new_upload(blob.id, r, i as u32))
            .collect();
        blob.chunk_ids = chunks.iter().map(|c| c.id).collect();
        let id = blob.id;
        arena.insert(blob, chunks);
        id
    }

    #[test]
    fn graph_skips_complete_chunks() {
        let mut arena = Arena::default();
        let id = upload(&mut arena, 10, 4);
        let first = arena.blobs[&id].chunk_ids[0];
        arena.chunks.get_mut(&first).unwrap().state = TransferState::Complete;

        let ops = arena.build_operations(id).unwrap();
        assert_eq!(ops.len(), 3);
        let fin = ops.last().unwrap();
        assert_eq!(fin.kind, OperationKind::Final);
        assert_eq!(fin.dependencies.len(), 2);
        assert_eq!(arena.blobs[&id].operation, Some(fin.id));
        assert!(arena.chunks[&first].operation.is_none());
    }

    #[test]
    fn fresh_download_gets_initial_op() {
        let mut arena = Arena::default();
        let blob = BlobTransfer::new_download(
            BlobRef::new("c", "b"),
            "/tmp/dst.bin",
            TransferOptions::default(),
        );
        let id = blob.id;
        arena.insert(blob, Vec::new());
        let ops = arena.build_operations(id).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Initial);
        assert_eq!(ops[0].key, TransferKey::Blob(id));
    }

    #[test]
    fn halt_and_resume_chunks() {
        let mut arena = Arena::default();
        let id = upload(&mut arena, 12, 4);
        let ids = arena.blobs[&id].chunk_ids.clone();
        arena.chunks.get_mut(&ids[0]).unwrap().state = TransferState::Complete;
        let ops = arena.build_operations(id).unwrap();

        let stopped = arena
            .halt(id, TransferState::Paused, TransferState::Paused)
            .unwrap();
        assert_eq!(stopped.len(), ops.len());
        assert_eq!(arena.chunks[&ids[0]].state, TransferState::Complete);
        assert_eq!(arena.chunks[&ids[1]].state, TransferState::Paused);

        arena.prepare_resume(id).unwrap();
        assert_eq!(arena.blobs[&id].state, TransferState::Pending);
        assert_eq!(arena.chunks[&ids[2]].state, TransferState::Pending);
        assert_eq!(arena.chunks[&ids[0]].state, TransferState::Complete);
    }

    #[test]
    fn ledger_and_bytes_from_rows() {
        let mut arena = Arena::default();
        let id = upload(&mut arena, 10, 4);
        let ids = arena.blobs[&id].chunk_ids.clone();
        for cid in &ids[..2] {
            arena.chunks.get_mut(cid).unwrap().state = TransferState::Complete;
        }
        arena.rebuild_ledger(id);
        arena.recount_transferred(id);

        assert_eq!(arena.ledgers[&id].len(), 2);
        assert_eq!(arena.blobs[&id].transferred_bytes, 8);
        let expected: Vec<String> = ids[..2]
            .iter()
            .map(|c| arena.chunks[c].block_id.clone().unwrap())
            .collect();
        assert_eq!(arena.ledgers[&id].ordered_block_ids(), expected);
    }

    #[test]
    fn missing_chunk_is_inconsistent() {
        let mut arena = Arena::default();
        let id = upload(&mut arena, 8, 4);
        let gone = arena.blobs[&id].chunk_ids[1];
        arena.chunks.remove(&gone);
        assert!(matches!(
            arena.check_consistency(id),
            Err(ManagerError::Invariant { .. })
        ));
    }

    #[test]
    fn remove_returns_attached_ops() {
        let mut arena = Arena::default();
        let id = upload(&mut arena, 8, 4);
        let ops = arena.build_operations(id).unwrap();
        let removed = arena.remove(id).unwrap();
        assert_eq!(removed.len(), ops.len());
        assert!(arena.chunks.is_empty());
        assert_eq!(arena.ordered().count(), 0);
    }
}
