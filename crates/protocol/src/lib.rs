//! Wire protocol for the remotedrop file transfer client.
//!
//! Two frame kinds travel over the duplex channel:
//! - JSON control frames with a mandatory `type` field and a `timestamp`
//! - binary chunk frames: 4-byte big-endian header length + JSON header + payload

use std::time::Duration;

mod binary;
mod envelope;
pub mod messages;
mod types;

pub use binary::FileChunk;
pub use envelope::{ControlFrame, FrameKind};
pub use types::{TransferDirection, TransferStatus};

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Largest accepted chunk size: 1 MiB.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of simultaneously running transfers.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Lower/upper clamp for the concurrent transfer limit.
pub const MIN_CONCURRENT_TRANSFERS: usize = 1;
pub const MAX_CONCURRENT_TRANSFERS: usize = 10;

/// Default maximum file size: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Smallest accepted value for the maximum file size.
pub const MIN_MAX_FILE_SIZE: u64 = 1024;

/// Application-level ping cadence on the control channel.
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// Silence window after which the connection is considered dead.
/// Three missed pings.
pub const PONG_WAIT: Duration = Duration::from_secs(90);

/// Delay between reconnect attempts after an unsolicited disconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long a sent chunk may remain unacknowledged.
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retransmissions per chunk before the transfer fails.
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// Base delay for the exponential chunk retry backoff
/// (`RETRY_DELAY_BASE * 2^(attempt-1)`).
pub const RETRY_DELAY_BASE: Duration = Duration::from_millis(1000);

/// Default approval prompt timeout and its lower clamp.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_APPROVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single WebSocket message: max chunk plus header slack.
pub const MAX_WS_MESSAGE_SIZE: usize = MAX_CHUNK_SIZE + 16 * 1024;

/// Errors produced while decoding frames.
///
/// All variants are recoverable: a malformed frame is logged and
/// discarded, the channel stays open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("binary frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("chunk header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid chunk header JSON: {0}")]
    InvalidHeader(String),

    #[error("malformed control frame: {0}")]
    MalformedControl(String),
}

/// Number of chunks for a file of `file_size` bytes: `ceil(size / chunk)`.
/// An empty file still occupies one (empty, final) chunk.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    let chunk = chunk_size as u64;
    if file_size == 0 {
        return 1;
    }
    file_size.div_ceil(chunk) as u32
}

/// Byte offset and length of chunk `index` within a file of `file_size` bytes.
pub fn chunk_span(index: u32, chunk_size: usize, file_size: u64) -> (u64, usize) {
    let offset = index as u64 * chunk_size as u64;
    let remaining = file_size.saturating_sub(offset);
    (offset, remaining.min(chunk_size as u64) as usize)
}
