use blobferry_model::{ModelError, TransferId, TransferType};
use blobferry_queue::QueueError;
use blobferry_transfer::TransferError;

use crate::NetworkStatus;

/// Errors from the persistent transfer store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by [`TransferManager`](crate::TransferManager).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("network is not reachable")]
    NotReachable,

    #[error("{transfer_type} not allowed over {status}")]
    NetworkPolicy {
        transfer_type: TransferType,
        status: NetworkStatus,
    },

    #[error("inconsistent transfer {id}: {reason}")]
    Invariant { id: TransferId, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Model(#[from] ModelError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for ManagerError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for ManagerError {
    fn from(e: toml::ser::Error) -> Self {
        Self::Config(e.to_string())
    }
}
