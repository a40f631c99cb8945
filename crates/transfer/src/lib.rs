//! Chunk executor, remote store seam and local file I/O for blobferry.

mod checksum;
mod chunked;
mod commit;
mod error;
mod executor;
mod local;
mod memory;
mod progress;
mod remote;
mod validation;

pub use checksum::{calculate_file_checksum, checksum_bytes, content_md5, verify_content_md5};
pub use chunked::{RangeWriter, read_range};
pub use commit::CommitLedger;
pub use error::TransferError;
pub use executor::{ChunkExecutor, InitialChunk};
pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use progress::SpeedCalculator;
pub use remote::{
    AccessConditions, CommitResponse, RangeResponse, RemoteBlobStore, RemoteError,
    RemoteErrorKind, RemoteFuture,
};
pub use validation::validate_blob_ref;
