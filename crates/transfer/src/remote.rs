//! Transport seam between the chunk executor and a remote object store.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use blobferry_model::{BlobKind, BlobRef, ByteRange, ErrorClass, TransferOptions};

/// Boxed future returned by [`RemoteBlobStore`] methods.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Request preconditions sent with every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConditions {
    pub lease_id: Option<String>,
    pub if_match: Option<String>,
}

impl AccessConditions {
    pub fn from_options(options: &TransferOptions) -> Self {
        Self {
            lease_id: options.lease_id.clone(),
            if_match: options.if_match.clone(),
        }
    }
}

/// Response to a ranged read.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub data: Vec<u8>,
    /// Raw `Content-Range` header.
    pub content_range: Option<String>,
    pub etag: Option<String>,
    /// Base64 MD5 of `data`.
    pub content_md5: Option<String>,
    /// Base64 CRC64 of `data`.
    pub content_crc64: Option<String>,
    pub blob_type: BlobKind,
}

#[derive(Debug, Clone, Default)]
pub struct CommitResponse {
    pub etag: Option<String>,
}

/// Abstract remote object store.
///
/// One method per wire operation the executor needs. Implementations must be
/// safe to call concurrently for different ranges of the same object.
pub trait RemoteBlobStore: Send + Sync {
    /// Reads `range` of `blob`. The range may extend past the end of the object.
    fn get_range<'a>(
        &'a self,
        blob: &'a BlobRef,
        range: ByteRange,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, RangeResponse>;

    /// Stages `data` as uncommitted block `block_id`.
    fn put_block<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_id: &'a str,
        data: Vec<u8>,
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, ()>;

    /// Replaces the content of `blob` with the staged blocks, in order.
    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobRef,
        block_ids: &'a [String],
        conditions: &'a AccessConditions,
    ) -> RemoteFuture<'a, CommitResponse>;
}

/// Failure kind reported by a [`RemoteBlobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    ConnectionLost,
    TimedOut,
    Offline,
    NotFound,
    PreconditionFailed,
    InvalidRequest,
    /// Any other non-success HTTP status.
    Status(u16),
}

impl RemoteErrorKind {
    /// Connectivity failures pause a transfer instead of failing it.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ConnectionLost | Self::TimedOut | Self::Offline)
    }

    pub fn class(self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Protocol
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Offline => f.write_str("offline"),
            Self::NotFound => f.write_str("not found"),
            Self::PreconditionFailed => f.write_str("precondition failed"),
            Self::InvalidRequest => f.write_str("invalid request"),
            Self::Status(code) => write!(f, "status {code}"),
        }
    }
}

/// Error returned by a [`RemoteBlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(blob: &BlobRef) -> Self {
        Self::new(RemoteErrorKind::NotFound, format!("blob {blob} does not exist"))
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
