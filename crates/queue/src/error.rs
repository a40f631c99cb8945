use blobferry_model::{TransferId, TransferState};

/// Errors produced by the operation queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("operation not queued: {0}")]
    NotFound(TransferId),

    #[error("operation already queued: {0}")]
    AlreadyQueued(TransferId),

    #[error("operation {id} cannot be queued in state {state:?}")]
    NotQueueable { id: TransferId, state: TransferState },
}
