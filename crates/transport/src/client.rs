//! WebSocket transport client.
//!
//! One duplex channel to the configured server. Frames are written through
//! a single write pump (serialisation point for concurrent senders) and
//! read by a single read pump that preserves on-wire order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use remotedrop_protocol::ControlFrame;

use crate::pumps;
use crate::reconnection;
use crate::types::{ConnectionState, FrameSink, ReconnectPolicy, TransportError, TransportEvent};

/// Shared transport state, passed to the pumps and the reconnect loop.
pub(crate) struct Shared {
    pub(crate) events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) write_tx: RwLock<Option<mpsc::UnboundedSender<tungstenite::Message>>>,
    pub(crate) url: RwLock<Option<String>>,
    /// Set when the user asked for the disconnect; suppresses reconnection.
    pub(crate) manual_disconnect: AtomicBool,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) reconnect_cancel: Mutex<Option<CancellationToken>>,
    pub(crate) session_cancel: Mutex<Option<CancellationToken>>,
}

/// WebSocket transport with heartbeat and bounded automatic reconnection.
pub struct WsTransport {
    pub(crate) shared: Arc<Shared>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::with_policy(ReconnectPolicy::default())
    }

    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                state: RwLock::new(ConnectionState::Disconnected),
                write_tx: RwLock::new(None),
                url: RwLock::new(None),
                manual_disconnect: AtomicBool::new(false),
                policy,
                reconnect_cancel: Mutex::new(None),
                session_cancel: Mutex::new(None),
            }),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.shared.events_rx.lock().unwrap().take()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().unwrap().clone()
    }

    /// Connects to the server. Idempotent: a call while connected is a no-op.
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            debug!("connect called while already connected, ignoring");
            return Ok(());
        }
        self.shared.manual_disconnect.store(false, Ordering::Relaxed);
        reconnection::cancel_reconnect(&self.shared);

        *self.shared.state.write().unwrap() = ConnectionState::Connecting;
        match open_connection(&self.shared, url).await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.shared.state.write().unwrap() = ConnectionState::Disconnected;
                let _ = self
                    .shared
                    .events_tx
                    .send(TransportEvent::Error(format!("connect failed: {e}")));
                Err(e)
            }
        }
    }

    /// Deliberately closes the connection and cancels any pending reconnect.
    pub fn close(&self) {
        self.shared.manual_disconnect.store(true, Ordering::Relaxed);
        reconnection::cancel_reconnect(&self.shared);

        if let Some(tx) = self.shared.write_tx.write().unwrap().take() {
            let _ = tx.send(tungstenite::Message::Close(None));
        }
        if let Some(token) = self.shared.session_cancel.lock().unwrap().take() {
            token.cancel();
        }
        *self.shared.state.write().unwrap() = ConnectionState::Disconnected;
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        reconnection::cancel_reconnect(&self.shared);
        if let Some(token) = self.shared.session_cancel.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl FrameSink for WsTransport {
    fn send_text(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        let guard = self.shared.write_tx.read().unwrap();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(tungstenite::Message::Text(frame.encode().into()))
            .map_err(|_| TransportError::NotConnected)
    }

    fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let guard = self.shared.write_tx.read().unwrap();
        let tx = guard.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(tungstenite::Message::Binary(bytes.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        *self.shared.state.read().unwrap() == ConnectionState::Connected
    }
}

/// Opens the socket, spawns the pumps, and publishes `Connected`.
/// Shared by the initial connect and the reconnect loop.
pub(crate) async fn open_connection(
    shared: &Arc<Shared>,
    url: &str,
) -> Result<(), TransportError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (write, read) = ws_stream.split();

    let cancel = CancellationToken::new();
    if let Some(old) = shared
        .session_cancel
        .lock()
        .unwrap()
        .replace(cancel.clone())
    {
        old.cancel();
    }

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
    let read_handle = tokio::spawn(pumps::read::read_pump(
        read,
        shared.events_tx.clone(),
        write_tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(pumps::ping::ping_pump(write_tx.clone(), cancel));

    *shared.write_tx.write().unwrap() = Some(write_tx);
    *shared.url.write().unwrap() = Some(url.to_string());
    *shared.state.write().unwrap() = ConnectionState::Connected;
    let _ = shared.events_tx.send(TransportEvent::Connected);

    reconnection::spawn_disconnect_monitor(shared.clone(), read_handle);
    Ok(())
}
