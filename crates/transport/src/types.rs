//! Public types for the transport layer.

use std::time::Duration;

use remotedrop_protocol::{ControlFrame, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY};
use tokio_tungstenite::tungstenite;

/// Connection state of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connection lost, reconnect attempt in progress.
    Reconnecting { attempt: u32 },
}

/// Events emitted by the transport, delivered in on-wire order for frames.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// A reconnect attempt is about to run.
    Reconnecting { attempt: u32 },
    /// All reconnect attempts failed; the transport gives up.
    ReconnectExhausted,
    /// A text control frame arrived (undecoded wire document).
    TextFrame(String),
    /// A binary chunk frame arrived.
    BinaryFrame(Vec<u8>),
    /// Transport-level error report.
    Error(String),
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

/// Reconnection policy: fixed delay between attempts, bounded attempt count.
/// A successful connection resets the counter.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: RECONNECT_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Outbound half of a duplex frame channel.
///
/// The engine talks to the wire only through this trait, so tests (and
/// alternative transports) can substitute their own sink.
pub trait FrameSink: Send + Sync {
    /// Enqueues a control frame for transmission.
    fn send_text(&self, frame: &ControlFrame) -> Result<(), TransportError>;

    /// Enqueues a binary frame for transmission.
    fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
