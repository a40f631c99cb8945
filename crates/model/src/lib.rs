//! Transfer entities, lifecycle state machine and chunk partitioning.

pub mod entity;
pub mod error;
pub mod partition;
pub mod state;
pub mod types;

pub use entity::{BlobTransfer, ChunkTransfer, TransferKey, new_block_id};
pub use error::{ErrorClass, ModelError, TransferFailure};
pub use partition::{ContentRange, initial_range, parse_content_range, partition, partition_span, remaining_ranges};
pub use state::TransferState;
pub use types::{BlobKind, BlobRef, ByteRange, TransferId, TransferOptions, TransferProgress, TransferType};

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of concurrently running operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
