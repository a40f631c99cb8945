//! Serialized persistence worker.
//!
//! All store writes go through one task so they apply in submission order.

use std::sync::Arc;

use blobferry_model::{BlobTransfer, ChunkTransfer, TransferId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::TransferStore;

enum PersistCommand {
    SaveBlob(BlobTransfer),
    SaveChunks(Vec<ChunkTransfer>),
    Delete(TransferId),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub(crate) struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl Persister {
    /// Spawns the worker. Must be called inside a tokio runtime.
    pub(crate) fn spawn(store: Arc<dyn TransferStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store, rx));
        Self { tx }
    }

    pub(crate) fn save_blob(&self, blob: &BlobTransfer) {
        self.send(PersistCommand::SaveBlob(blob.clone()));
    }

    pub(crate) fn save_chunks(&self, chunks: Vec<ChunkTransfer>) {
        if !chunks.is_empty() {
            self.send(PersistCommand::SaveChunks(chunks));
        }
    }

    pub(crate) fn delete(&self, id: TransferId) {
        self.send(PersistCommand::Delete(id));
    }

    /// Resolves once every earlier command has been applied.
    pub(crate) async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(PersistCommand::Flush(ack));
        let _ = done.await;
    }

    fn send(&self, cmd: PersistCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("persistence worker stopped, write dropped");
        }
    }
}

async fn run(store: Arc<dyn TransferStore>, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(cmd) = rx.recv().await {
        let store = Arc::clone(&store);
        let res = match cmd {
            PersistCommand::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            PersistCommand::SaveBlob(blob) => {
                tokio::task::spawn_blocking(move || store.save_blob(&blob)).await
            }
            PersistCommand::SaveChunks(chunks) => {
                tokio::task::spawn_blocking(move || store.save_chunks(&chunks)).await
            }
            PersistCommand::Delete(id) => {
                tokio::task::spawn_blocking(move || store.delete(id)).await
            }
        };
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist transfer"),
            Err(e) => warn!(error = %e, "persistence task panicked"),
        }
    }
    debug!("persistence worker stopped");
}
