//! Transfer manager for blobferry.
//!
//! [`TransferManager`] owns every transfer in an id-keyed arena, feeds their
//! operations to an [`OperationQueue`](blobferry_queue::OperationQueue),
//! persists rows through a [`TransferStore`] and reacts to connectivity
//! changes reported through [`Reachability`].

mod arena;
mod config;
mod error;
mod events;
mod manager;
mod persist;
mod reachability;
mod runner;
mod shared;
mod store;

pub use config::ManagerConfig;
pub use error::{ManagerError, StoreError};
pub use events::{EventStream, ProgressCallback, TransferEvent, TransferFilter, TransferHandle};
pub use manager::TransferManager;
pub use reachability::{NetworkPolicy, NetworkStatus, NetworkType, Reachability};
pub use store::{JsonFileStore, MemoryStore, StoredTransfers, TransferStore};
