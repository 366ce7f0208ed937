use serde::{Deserialize, Serialize};

/// Direction of a transfer, from the client host's point of view.
///
/// `Upload` moves a local file to the operator; `Download` writes a file
/// received from the operator to the local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Approved,
    Rejected,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Failed
                | TransferStatus::Cancelled
                | TransferStatus::Rejected
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Absent edges are invalid:
    /// Pending → {Approved, Rejected, Cancelled}
    /// Approved → {InProgress, Cancelled}
    /// InProgress → {Paused, Completed, Failed, Cancelled}
    /// Paused → {InProgress, Cancelled}
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match self {
            Pending => matches!(next, Approved | Rejected | Cancelled),
            Approved => matches!(next, InProgress | Cancelled),
            InProgress => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, InProgress | Cancelled),
            Completed | Failed | Cancelled | Rejected => false,
        }
    }
}
