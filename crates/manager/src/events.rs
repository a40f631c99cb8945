//! Caller-facing events, handles and collection filters.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use blobferry_model::{
    BlobTransfer, TransferFailure, TransferId, TransferProgress, TransferState, TransferType,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

/// Notification emitted by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        progress: TransferProgress,
    },
    StateChanged {
        id: TransferId,
        state: TransferState,
    },
    Failed {
        id: TransferId,
        error: TransferFailure,
    },
    Completed {
        id: TransferId,
    },
}

impl TransferEvent {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Progress { id, .. }
            | Self::StateChanged { id, .. }
            | Self::Failed { id, .. }
            | Self::Completed { id } => *id,
        }
    }
}

/// Receiving end of the manager's events.
///
/// State changes, failures and completions are always delivered. Progress
/// events are capped: while `event_buffer` of them wait unread, newer ones
/// are dropped.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TransferEvent>,
    queued_progress: Arc<AtomicUsize>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        let event = self.rx.recv().await?;
        Some(self.delivered(event))
    }

    pub fn try_recv(&mut self) -> Result<TransferEvent, TryRecvError> {
        let event = self.rx.try_recv()?;
        Ok(self.delivered(event))
    }

    fn delivered(&self, event: TransferEvent) -> TransferEvent {
        if matches!(event, TransferEvent::Progress { .. }) {
            self.queued_progress.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

/// Sending side of [`EventStream`]. Events are discarded until a stream
/// is taken.
pub(crate) struct EventSink {
    tx: Mutex<Option<mpsc::UnboundedSender<TransferEvent>>>,
    queued_progress: Arc<AtomicUsize>,
    progress_limit: usize,
}

impl EventSink {
    pub(crate) fn new(progress_limit: usize) -> Self {
        Self {
            tx: Mutex::new(None),
            queued_progress: Arc::new(AtomicUsize::new(0)),
            progress_limit: progress_limit.max(1),
        }
    }

    /// Opens the stream. Returns `None` after the first call.
    pub(crate) fn subscribe(&self) -> Option<EventStream> {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.is_some() {
            return None;
        }
        let (sender, rx) = mpsc::unbounded_channel();
        *tx = Some(sender);
        Some(EventStream {
            rx,
            queued_progress: Arc::clone(&self.queued_progress),
        })
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return;
        };
        let progress = matches!(event, TransferEvent::Progress { .. });
        if progress {
            let limit = self.progress_limit;
            let reserved = self
                .queued_progress
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));
            if reserved.is_err() {
                debug!(transfer = %event.id(), "event stream backed up, progress event dropped");
                return;
            }
        }
        if tx.send(event).is_err() && progress {
            self.queued_progress.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Called with every progress snapshot of one transfer.
pub type ProgressCallback = Arc<dyn Fn(TransferId, TransferProgress) + Send + Sync>;

/// Opaque reference to a transfer owned by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    id: TransferId,
}

impl TransferHandle {
    pub fn new(id: TransferId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }
}

impl From<TransferId> for TransferHandle {
    fn from(id: TransferId) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Matches transfers by any combination of fields. Empty matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    pub container: Option<String>,
    pub blob_name: Option<String>,
    pub local_path: Option<PathBuf>,
    pub state: Option<TransferState>,
    pub transfer_type: Option<TransferType>,
}

impl TransferFilter {
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn blob_name(mut self, name: impl Into<String>) -> Self {
        self.blob_name = Some(name.into());
        self
    }

    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn state(mut self, state: TransferState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = Some(transfer_type);
        self
    }

    pub fn matches(&self, t: &BlobTransfer) -> bool {
        self.container.as_ref().is_none_or(|c| *c == t.blob.container)
            && self.blob_name.as_ref().is_none_or(|n| *n == t.blob.name)
            && self.local_path.as_ref().is_none_or(|p| *p == t.local_path)
            && self.state.is_none_or(|s| s == t.state)
            && self.transfer_type.is_none_or(|k| k == t.transfer_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobferry_model::{BlobRef, TransferOptions};

    fn progress(id: TransferId, bytes: u64) -> TransferEvent {
        TransferEvent::Progress {
            id,
            progress: TransferProgress::new(bytes, 100),
        }
    }

    #[test]
    fn full_stream_drops_progress_but_keeps_state_changes() {
        let sink = EventSink::new(2);
        let id = TransferId::new();
        sink.emit(TransferEvent::Completed { id });
        let mut stream = sink.subscribe().unwrap();
        assert!(sink.subscribe().is_none());

        for bytes in 1..=5 {
            sink.emit(progress(id, bytes));
        }
        sink.emit(TransferEvent::StateChanged {
            id,
            state: TransferState::Complete,
        });
        sink.emit(TransferEvent::Completed { id });

        let mut received = Vec::new();
        while let Ok(event) = stream.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                progress(id, 1),
                progress(id, 2),
                TransferEvent::StateChanged {
                    id,
                    state: TransferState::Complete,
                },
                TransferEvent::Completed { id },
            ]
        );

        sink.emit(progress(id, 6));
        assert_eq!(stream.try_recv().unwrap(), progress(id, 6));
    }

    fn upload() -> BlobTransfer {
        BlobTransfer::new_upload(
            "/data/a.bin",
            BlobRef::new("media", "a.bin"),
            TransferOptions::default(),
            10,
        )
    }

    #[test]
    fn empty_filter_matches() {
        assert!(TransferFilter::default().matches(&upload()));
    }

    #[test]
    fn fields_combine() {
        let t = upload();
        assert!(TransferFilter::default()
            .container("media")
            .blob_name("a.bin")
            .state(TransferState::Pending)
            .matches(&t));
        assert!(!TransferFilter::default().container("other").matches(&t));
        assert!(!TransferFilter::default()
            .transfer_type(TransferType::Download)
            .matches(&t));
        assert!(TransferFilter::default().local_path("/data/a.bin").matches(&t));
    }
}
