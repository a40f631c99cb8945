use std::fmt;
use std::future::Future;
use std::pin::Pin;

use blobferry_model::{TransferId, TransferKey, TransferState};
use tokio_util::sync::CancellationToken;

/// What an operation does for its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Transfers one chunk.
    Chunk,
    /// First request of a download; learns the object length.
    Initial,
    /// Commits an upload or finalizes a download after every chunk.
    Final,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Chunk => "chunk",
            Self::Initial => "initial",
            Self::Final => "final",
        })
    }
}

/// A unit of scheduled work for exactly one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: TransferId,
    pub key: TransferKey,
    pub kind: OperationKind,
    pub state: TransferState,
    /// Operations that must finish before this one starts.
    pub dependencies: Vec<TransferId>,
}

impl Operation {
    pub fn new(key: TransferKey, kind: OperationKind) -> Self {
        Self {
            id: TransferId::new(),
            key,
            kind,
            state: TransferState::Pending,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TransferId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn add_dependency(&mut self, id: TransferId) {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
    }
}

/// What the runner sees of a started operation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub op: TransferId,
    pub key: TransferKey,
    pub kind: OperationKind,
    /// Fired when the operation is paused, canceled or removed.
    pub cancel: CancellationToken,
}

/// Performs the work of an operation.
///
/// Returns the state the operation finished in: `Complete`, `Failed`,
/// `Paused` or `Canceled`.
pub trait OperationRunner: Send + Sync {
    fn run(&self, ctx: RunContext) -> Pin<Box<dyn Future<Output = TransferState> + Send + '_>>;
}

/// State change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// One operation changed state.
    Changed {
        op: TransferId,
        key: TransferKey,
        state: TransferState,
    },
    /// Several operations changed state in one call.
    BatchChanged {
        changes: Vec<(TransferId, TransferKey, TransferState)>,
    },
}

impl QueueEvent {
    /// Every `(op, key, state)` change carried by this event.
    pub fn into_changes(self) -> Vec<(TransferId, TransferKey, TransferState)> {
        match self {
            Self::Changed { op, key, state } => vec![(op, key, state)],
            Self::BatchChanged { changes } => changes,
        }
    }
}

/// Finished from the queue's point of view.
pub(crate) fn is_finished(state: TransferState) -> bool {
    matches!(
        state,
        TransferState::Complete
            | TransferState::Failed
            | TransferState::Canceled
            | TransferState::Paused
            | TransferState::Deleted
    )
}

/// Combines the outcomes of unsatisfied dependencies: failed wins over
/// canceled, canceled over paused.
pub(crate) fn blocking_state(current: Option<TransferState>, next: TransferState) -> TransferState {
    fn rank(s: TransferState) -> u8 {
        match s {
            TransferState::Failed => 3,
            TransferState::Canceled | TransferState::Deleted => 2,
            _ => 1,
        }
    }
    let next = if next == TransferState::Deleted {
        TransferState::Canceled
    } else {
        next
    };
    match current {
        Some(c) if rank(c) >= rank(next) => c,
        _ => next,
    }
}
