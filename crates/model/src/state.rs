use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Lifecycle state shared by whole-object and chunk transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "deleted")]
    Deleted,
}

impl TransferState {
    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
            Self::Deleted => "Deleted",
        }
    }

    /// Pending or in progress: work that still has to run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Only paused and failed transfers can be resumed.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Failed)
    }

    /// Only pending and in-progress transfers can be paused.
    pub fn is_pauseable(self) -> bool {
        self.is_active()
    }

    /// Complete, canceled and deleted transfers never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Canceled | Self::Deleted)
    }

    /// Returns `true` if `self -> next` is an edge of the state machine.
    ///
    /// A transition to the current state is always allowed (no-op).
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (_, Deleted) => true,
            (Pending, InProgress) => true,
            (InProgress, Complete | Failed) => true,
            (Pending | InProgress, Paused) => true,
            (Pending | InProgress | Paused | Failed, Canceled) => true,
            (Paused | Failed, Pending) => true,
            _ => false,
        }
    }

    /// Validates and returns the next state.
    pub fn transition(self, next: TransferState) -> Result<TransferState, ModelError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ModelError::InvalidTransition { from: self, to: next })
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for TransferState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "complete" | "completed" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "deleted" => Ok(Self::Deleted),
            _ => Err(ModelError::UnknownState(s.to_string())),
        }
    }
}
