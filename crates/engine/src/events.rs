//! Observable engine events.

use std::path::PathBuf;

use remotedrop_transfer::{TransferProgress, TransferRequest};

/// Events emitted by the engine. Consumed through
/// [`FileTransferEngine::take_events`](crate::FileTransferEngine::take_events).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connected,
    Disconnected,
    ConnectionError(String),

    /// A transfer request was created (outbound) or received (inbound).
    TransferRequested {
        transfer_id: String,
        request: TransferRequest,
    },
    /// An inbound request needs a user decision.
    ApprovalRequested {
        request: TransferRequest,
        high_risk: bool,
    },
    /// The local decision made for an inbound request.
    ApprovalDecision {
        transfer_id: String,
        approved: bool,
        message: String,
    },
    TransferApproved {
        transfer_id: String,
    },
    TransferRejected {
        transfer_id: String,
        reason: String,
    },
    TransferStarted {
        transfer_id: String,
    },
    TransferProgress {
        progress: TransferProgress,
    },
    /// An uploaded chunk was acknowledged by the peer.
    ChunkSent {
        transfer_id: String,
        chunk_index: u32,
    },
    /// A chunk arrived for a download.
    ChunkReceived {
        transfer_id: String,
        chunk_index: u32,
    },
    TransferCompleted {
        transfer_id: String,
        local_path: PathBuf,
    },
    TransferFailed {
        transfer_id: String,
        error: String,
    },
    TransferCancelled {
        transfer_id: String,
    },
    /// A prompt was annotated as high-risk, or another security-relevant
    /// condition was observed.
    SecurityWarning {
        message: String,
        details: String,
    },
    /// An outbound request was aborted before it reached the wire.
    FileValidationFailed {
        path: PathBuf,
        reason: String,
    },
    /// A frame referenced a transfer this engine does not know.
    UnauthorizedTransferAttempt {
        transfer_id: String,
        reason: String,
    },
}
