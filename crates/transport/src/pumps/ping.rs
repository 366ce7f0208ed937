//! Heartbeat pump — periodic application-level `ping` control frames.
//!
//! The protocol heartbeats with JSON `ping`/`pong` control frames rather
//! than WebSocket ping frames; the server's `pong` is a liveness no-op
//! handled upstream.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use remotedrop_protocol::{ControlFrame, FrameKind, PING_PERIOD};

/// Sends a `ping` control frame every [`PING_PERIOD`] until cancelled.
pub(crate) async fn ping_pump(
    write_tx: mpsc::UnboundedSender<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = ControlFrame::bare(FrameKind::Ping).encode();
                if write_tx.send(tungstenite::Message::Text(ping.into())).is_err() {
                    break;
                }
            }
        }
    }
}
