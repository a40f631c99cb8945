use blobferry_model::{BlobKind, ErrorClass, ModelError, TransferFailure};

use crate::RemoteError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Model(#[from] ModelError),

    #[error("response has no content range")]
    MissingContentRange,

    #[error("unsupported blob type: {0:?}")]
    UnsupportedBlobType(BlobKind),

    #[error("content MD5 mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: u64, actual: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("interrupted")]
    Interrupted,
}

impl TransferError {
    /// Failure class driving what happens to the whole transfer.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Remote(e) => e.kind.class(),
            Self::ChecksumMismatch { .. } => ErrorClass::Integrity,
            Self::Interrupted => ErrorClass::Transient,
            _ => ErrorClass::Protocol,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    pub fn to_failure(&self) -> TransferFailure {
        TransferFailure::new(self.class(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RemoteErrorKind;

    #[test]
    fn classification() {
        let lost: TransferError = RemoteError::new(RemoteErrorKind::ConnectionLost, "reset").into();
        assert_eq!(lost.class(), ErrorClass::Transient);

        let missing: TransferError = RemoteError::new(RemoteErrorKind::NotFound, "gone").into();
        assert_eq!(missing.class(), ErrorClass::Protocol);

        let md5 = TransferError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(md5.class(), ErrorClass::Integrity);

        let io: TransferError = std::io::Error::other("disk full").into();
        assert_eq!(io.class(), ErrorClass::Protocol);

        assert_eq!(TransferError::UnsupportedBlobType(BlobKind::Page).class(), ErrorClass::Protocol);
    }

    #[test]
    fn failure_record_keeps_message() {
        let f = TransferError::MissingContentRange.to_failure();
        assert_eq!(f.class, ErrorClass::Protocol);
        assert_eq!(f.message, "response has no content range");
    }
}
