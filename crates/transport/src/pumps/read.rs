//! WebSocket read pump — delivers inbound frames in on-wire order.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use remotedrop_protocol::{MAX_WS_MESSAGE_SIZE, PONG_WAIT};

use crate::types::TransportEvent;

/// Reads frames from the WebSocket and forwards them as events.
///
/// A silence deadline detects dead connections: if nothing arrives within
/// [`PONG_WAIT`] the connection is considered dead and the pump exits,
/// which triggers the disconnect path (and possibly a reconnect).
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    write_tx: mpsc::UnboundedSender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    // Any incoming message resets the deadline; the server answers our
    // application-level pings, so a healthy link is never silent this long.
    let silence_deadline = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(silence_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut silence_deadline => {
                warn!("no traffic within the silence window, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        silence_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                if text.len() > MAX_WS_MESSAGE_SIZE {
                                    warn!("text frame too large ({} bytes), dropping", text.len());
                                    continue;
                                }
                                let _ = events_tx.send(TransportEvent::TextFrame(text.to_string()));
                            }
                            tungstenite::Message::Binary(data) => {
                                let _ = events_tx.send(TransportEvent::BinaryFrame(data.to_vec()));
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ws ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data));
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received ws pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }
}
