use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransferState;

/// Errors produced by the transfer model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("unknown transfer state: {0}")]
    UnknownState(String),

    #[error("invalid transfer id: {0}")]
    InvalidId(String),

    #[error("invalid blob reference (expected container/name): {0}")]
    InvalidBlobRef(String),

    #[error("malformed content range: {0}")]
    MalformedContentRange(String),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Failure class of a transfer error.
///
/// Drives what the manager does with the whole transfer when one unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Connectivity problem. The transfer is paused, not failed.
    #[serde(rename = "transient")]
    Transient,
    /// Content hash mismatch.
    #[serde(rename = "integrity")]
    Integrity,
    /// Bad response, rejected request or local I/O problem.
    #[serde(rename = "protocol")]
    Protocol,
    /// Inconsistent records. The transfer is removed.
    #[serde(rename = "invariant")]
    Invariant,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        self == Self::Transient
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Integrity => "integrity",
            Self::Protocol => "protocol",
            Self::Invariant => "invariant",
        })
    }
}

/// Last recorded failure of a transfer, as persisted and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl TransferFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.class, self.message)
    }
}

impl std::error::Error for TransferFailure {}
