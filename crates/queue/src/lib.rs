//! Dependency-scheduled operation queue.
//!
//! Operations refer to transfers only by [`TransferKey`](blobferry_model::TransferKey);
//! the actual work is delegated to an [`OperationRunner`].

mod error;
mod operation;
mod queue;

pub use error::QueueError;
pub use operation::{Operation, OperationKind, OperationRunner, QueueEvent, RunContext};
pub use queue::OperationQueue;
