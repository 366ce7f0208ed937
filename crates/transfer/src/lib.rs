//! Per-transfer state for the remotedrop client.
//!
//! A [`TransferSession`] is the single source of truth for one transfer:
//! the immutable request, the status state machine, progress, and the open
//! file handle. Sessions are shared as `Arc<TransferSession>` and locked
//! internally; at most one worker drives a session at a time.

mod checksum;
mod progress;
mod request;
mod session;

pub use checksum::{calculate_file_checksum, checksum_bytes};
pub use progress::{SpeedCalculator, TransferProgress};
pub use request::TransferRequest;
pub use session::TransferSession;

use remotedrop_protocol::TransferStatus;

/// Errors produced by transfer sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file: {0}")]
    FileOpen(String),

    #[error("chunk read failed: {0}")]
    Read(String),

    #[error("chunk write failed: {0}")]
    Write(String),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("no open file handle")]
    FileNotOpen,

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },
}
