//! Engine controller: public surface, session table, worker pool, and
//! inbound frame dispatch.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use remotedrop_protocol::messages::{
    ChunkAck, ControlAction, ErrorFrame, FileTransferRequestFrame, FileTransferResponse,
    InboundTransferRequest, ProgressResponse, SessionRegister, TransferApproval, TransferControl,
};
use remotedrop_protocol::{
    ControlFrame, FileChunk, FrameKind, TransferDirection, TransferStatus,
};
use remotedrop_transfer::{
    calculate_file_checksum, TransferProgress, TransferRequest, TransferSession,
};
use remotedrop_transport::{FrameSink, TransportError, TransportEvent, WsTransport};

use crate::approval::{is_high_risk, ApprovalAdapter, ApprovalUi};
use crate::config::EngineConfig;
use crate::events::EngineEvent;
use crate::policy::{evaluate, PolicyDecision, PolicySnapshot};
use crate::settings::{
    SettingsStore, KEY_ALLOWED_EXTENSIONS, KEY_APPROVAL_TIMEOUT, KEY_AUTO_APPROVAL_ENABLED,
    KEY_MAX_FILE_SIZE, KEY_REMEMBER_DECISION,
};
use crate::validate::validate_file;
use crate::worker::{self, WorkerContext, WorkerHandle, WorkerMsg};

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("engine was constructed without a managed transport")]
    TransportNotManaged,
}

/// Client-side endpoint of the file transfer protocol.
///
/// Owns the transport, a session table, a worker pool, the policy gate,
/// and the settings store. All observable behavior is delivered as
/// [`EngineEvent`]s through [`take_events`](Self::take_events).
pub struct FileTransferEngine {
    shared: Arc<EngineShared>,
    transport: Option<Arc<WsTransport>>,
}

struct EngineShared {
    sink: Arc<dyn FrameSink>,
    settings: Arc<SettingsStore>,
    config: RwLock<EngineConfig>,
    sessions: Mutex<HashMap<String, Arc<TransferSession>>>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Approved transfers waiting for a worker slot, oldest first.
    queue: Mutex<VecDeque<String>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    approval_ui: RwLock<Option<Arc<dyn ApprovalUi>>>,
    support_session_id: RwLock<Option<String>>,
    connected_tx: watch::Sender<bool>,
    dispatch_started: AtomicBool,
}

impl FileTransferEngine {
    /// Creates an engine with its own WebSocket transport.
    pub fn new(settings: SettingsStore) -> Self {
        let transport = Arc::new(WsTransport::new());
        let transport_events = transport.take_events();
        let sink: Arc<dyn FrameSink> = transport.clone();
        Self::build(sink, transport_events, settings, Some(transport))
    }

    /// Creates an engine on top of an externally managed duplex frame
    /// channel. The caller feeds [`TransportEvent`]s through the receiver
    /// and owns the connection lifecycle.
    pub fn with_transport(
        sink: Arc<dyn FrameSink>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        settings: SettingsStore,
    ) -> Self {
        Self::build(sink, Some(transport_events), settings, None)
    }

    fn build(
        sink: Arc<dyn FrameSink>,
        transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
        settings: SettingsStore,
        transport: Option<Arc<WsTransport>>,
    ) -> Self {
        let config = EngineConfig::load_from(&settings);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connected_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(EngineShared {
                sink,
                settings: Arc::new(settings),
                config: RwLock::new(config),
                sessions: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                transport_events: Mutex::new(transport_events),
                approval_ui: RwLock::new(None),
                support_session_id: RwLock::new(None),
                connected_tx,
                dispatch_started: AtomicBool::new(false),
            }),
            transport,
        }
    }

    /// Takes the engine event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.shared.events_rx.lock().unwrap().take()
    }

    /// Registers the approval UI used for deferred decisions.
    pub fn set_approval_ui(&self, ui: Arc<dyn ApprovalUi>) {
        *self.shared.approval_ui.write().unwrap() = Some(ui);
    }

    /// Sets the remote-support session id announced on (re)connect.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        *self.shared.support_session_id.write().unwrap() = Some(session_id.into());
    }

    /// Starts the dispatch task. Implicit in every operation; embedders
    /// driving their own transport call this once after construction.
    pub fn start(&self) {
        self.ensure_dispatch();
    }

    // ── Connection management ────────────────────────────────────────────

    /// Connects to the server. Idempotent while connected.
    pub async fn connect(&self, url: &str) -> Result<(), EngineError> {
        self.ensure_dispatch();
        let transport = self
            .transport
            .as_ref()
            .ok_or(EngineError::TransportNotManaged)?;
        transport.connect(url).await?;
        Ok(())
    }

    /// Cancels all active transfers, stops heartbeats and reconnects, and
    /// closes the transport.
    pub fn disconnect(&self) {
        let ids: Vec<String> = {
            let sessions = self.shared.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| !s.status().is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.cancel_transfer(&id);
        }
        if let Some(transport) = &self.transport {
            transport.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.sink.is_connected()
    }

    // ── Transfer operations ──────────────────────────────────────────────

    /// Validates a local file, computes its SHA-256, creates a `Pending`
    /// session, and sends the transfer request. Returns `None` (after
    /// emitting `FileValidationFailed` or `ConnectionError`) when the
    /// request cannot be made.
    pub fn request_file_upload(
        &self,
        path: impl AsRef<Path>,
        session_id: &str,
        technician: &str,
    ) -> Option<String> {
        self.ensure_dispatch();
        let path = path.as_ref();
        let config = self.shared.config.read().unwrap().clone();

        let file_size = match validate_file(path, &config) {
            Ok(size) => size,
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "upload validation failed");
                self.emit(EngineEvent::FileValidationFailed {
                    path: path.to_path_buf(),
                    reason,
                });
                return None;
            }
        };

        if !self.shared.sink.is_connected() {
            self.emit(EngineEvent::ConnectionError("not connected".into()));
            return None;
        }

        let checksum = match calculate_file_checksum(path) {
            Ok(checksum) => checksum,
            Err(e) => {
                self.emit(EngineEvent::FileValidationFailed {
                    path: path.to_path_buf(),
                    reason: format!("checksum computation failed: {e}"),
                });
                return None;
            }
        };

        let id = Uuid::new_v4().to_string();
        let request = TransferRequest::upload(
            id.clone(),
            session_id,
            path,
            file_size,
            checksum.clone(),
            technician,
        );
        let session = Arc::new(TransferSession::new(request.clone(), config.chunk_size));
        self.shared
            .sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session);

        let frame = FileTransferRequestFrame {
            id: id.clone(),
            session_id: session_id.to_string(),
            filename: request.filename.clone(),
            file_size,
            checksum,
            direction: TransferDirection::Upload,
            technician: technician.to_string(),
        };
        if !send_control(&self.shared, FrameKind::FileTransferRequest, &frame) {
            self.emit(EngineEvent::ConnectionError(
                "failed to send transfer request".into(),
            ));
            self.shared.sessions.lock().unwrap().remove(&id);
            return None;
        }

        info!(transfer_id = %id, filename = %request.filename, file_size, "upload requested");
        self.emit(EngineEvent::TransferRequested {
            transfer_id: id.clone(),
            request,
        });
        Some(id)
    }

    /// Requests a download from the operator into `save_path`. The file
    /// size stays unknown until the peer's response.
    pub fn request_file_download(
        &self,
        filename: &str,
        session_id: &str,
        technician: &str,
        save_path: impl Into<PathBuf>,
    ) -> Option<String> {
        self.ensure_dispatch();
        let save_path = save_path.into();

        if let Some(parent) = save_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                self.emit(EngineEvent::FileValidationFailed {
                    path: save_path.clone(),
                    reason: format!("cannot create destination directory: {e}"),
                });
                return None;
            }
        }

        if !self.shared.sink.is_connected() {
            self.emit(EngineEvent::ConnectionError("not connected".into()));
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let config = self.shared.config.read().unwrap();
        let request =
            TransferRequest::download(id.clone(), session_id, filename, save_path, technician);
        let session = Arc::new(TransferSession::new(request.clone(), config.chunk_size));
        drop(config);
        self.shared
            .sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session);

        let frame = FileTransferRequestFrame {
            id: id.clone(),
            session_id: session_id.to_string(),
            filename: filename.to_string(),
            file_size: 0,
            checksum: String::new(),
            direction: TransferDirection::Download,
            technician: technician.to_string(),
        };
        if !send_control(&self.shared, FrameKind::FileTransferRequest, &frame) {
            self.emit(EngineEvent::ConnectionError(
                "failed to send transfer request".into(),
            ));
            self.shared.sessions.lock().unwrap().remove(&id);
            return None;
        }

        info!(transfer_id = %id, filename, "download requested");
        self.emit(EngineEvent::TransferRequested {
            transfer_id: id.clone(),
            request,
        });
        Some(id)
    }

    /// Pauses a running transfer and notifies the peer.
    pub fn pause_transfer(&self, transfer_id: &str) {
        if let Some(handle) = self.shared.workers.lock().unwrap().get(transfer_id) {
            let _ = handle.pause_tx.send(true);
        }
        self.send_transfer_control(transfer_id, ControlAction::Pause, None);
    }

    /// Resumes a paused transfer and notifies the peer.
    pub fn resume_transfer(&self, transfer_id: &str) {
        if let Some(handle) = self.shared.workers.lock().unwrap().get(transfer_id) {
            let _ = handle.pause_tx.send(false);
        }
        self.send_transfer_control(transfer_id, ControlAction::Resume, None);
    }

    /// Cancels a transfer: signals the worker (observed at its next
    /// suspension point), notifies the peer, and dequeues the session.
    pub fn cancel_transfer(&self, transfer_id: &str) {
        self.shared
            .queue
            .lock()
            .unwrap()
            .retain(|queued| queued != transfer_id);
        self.send_transfer_control(transfer_id, ControlAction::Cancel, None);

        let worker_cancel = self
            .shared
            .workers
            .lock()
            .unwrap()
            .get(transfer_id)
            .map(|h| h.cancel.clone());
        match worker_cancel {
            Some(token) => token.cancel(),
            None => {
                // No worker yet: cancel the session directly.
                let session = self
                    .shared
                    .sessions
                    .lock()
                    .unwrap()
                    .get(transfer_id)
                    .cloned();
                if let Some(session) = session {
                    if session.set_status(TransferStatus::Cancelled).is_ok() {
                        self.emit(EngineEvent::TransferCancelled {
                            transfer_id: transfer_id.to_string(),
                        });
                    }
                }
            }
        }
    }

    // ── Snapshot queries ─────────────────────────────────────────────────

    pub fn transfer_progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        let session = self
            .shared
            .sessions
            .lock()
            .unwrap()
            .get(transfer_id)
            .cloned();
        session.map(|s| s.progress())
    }

    pub fn transfer_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        let session = self
            .shared
            .sessions
            .lock()
            .unwrap()
            .get(transfer_id)
            .cloned();
        session.map(|s| s.status())
    }

    /// Ids of all sessions that have not reached a terminal state.
    pub fn active_transfers(&self) -> Vec<String> {
        let sessions = self.shared.sessions.lock().unwrap();
        let mut ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !s.status().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Configuration ────────────────────────────────────────────────────

    pub fn set_chunk_size(&self, size: usize) {
        self.shared.config.write().unwrap().set_chunk_size(size);
    }

    pub fn chunk_size(&self) -> usize {
        self.shared.config.read().unwrap().chunk_size
    }

    pub fn set_max_concurrent_transfers(&self, max: usize) {
        self.shared
            .config
            .write()
            .unwrap()
            .set_max_concurrent_transfers(max);
        // A raised limit may admit queued transfers immediately.
        try_start_workers(&self.shared);
    }

    pub fn max_concurrent_transfers(&self) -> usize {
        self.shared.config.read().unwrap().max_concurrent_transfers
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.shared.config.write().unwrap().encryption_enabled = enabled;
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.shared.config.write().unwrap().compression_enabled = enabled;
    }

    pub fn set_max_file_size(&self, size: u64) {
        let clamped = {
            let mut config = self.shared.config.write().unwrap();
            config.set_max_file_size(size);
            config.max_file_size
        };
        self.shared.settings.set_u64(KEY_MAX_FILE_SIZE, clamped);
    }

    pub fn max_file_size(&self) -> u64 {
        self.shared.config.read().unwrap().max_file_size
    }

    pub fn add_allowed_file_extension(&self, extension: &str) {
        let extensions = {
            let mut config = self.shared.config.write().unwrap();
            if !config.add_allowed_extension(extension) {
                return;
            }
            config.allowed_extensions.iter().cloned().collect::<Vec<_>>()
        };
        self.shared
            .settings
            .set_strings(KEY_ALLOWED_EXTENSIONS, &extensions);
    }

    pub fn remove_allowed_file_extension(&self, extension: &str) {
        let extensions = {
            let mut config = self.shared.config.write().unwrap();
            if !config.remove_allowed_extension(extension) {
                return;
            }
            config.allowed_extensions.iter().cloned().collect::<Vec<_>>()
        };
        self.shared
            .settings
            .set_strings(KEY_ALLOWED_EXTENSIONS, &extensions);
    }

    pub fn allowed_file_extensions(&self) -> Vec<String> {
        self.shared
            .config
            .read()
            .unwrap()
            .allowed_extensions
            .iter()
            .cloned()
            .collect()
    }

    pub fn set_auto_approval_enabled(&self, enabled: bool) {
        self.shared.config.write().unwrap().auto_approval_enabled = enabled;
        self.shared
            .settings
            .set_bool(KEY_AUTO_APPROVAL_ENABLED, enabled);
    }

    pub fn is_auto_approval_enabled(&self) -> bool {
        self.shared.config.read().unwrap().auto_approval_enabled
    }

    pub fn set_approval_timeout(&self, timeout: Duration) {
        let clamped = {
            let mut config = self.shared.config.write().unwrap();
            config.set_approval_timeout(timeout);
            config.approval_timeout
        };
        self.shared
            .settings
            .set_u64(KEY_APPROVAL_TIMEOUT, clamped.as_secs());
    }

    pub fn approval_timeout(&self) -> Duration {
        self.shared.config.read().unwrap().approval_timeout
    }

    pub fn set_remember_decision_enabled(&self, enabled: bool) {
        self.shared.config.write().unwrap().remember_decisions = enabled;
        self.shared.settings.set_bool(KEY_REMEMBER_DECISION, enabled);
    }

    pub fn is_remember_decision_enabled(&self) -> bool {
        self.shared.config.read().unwrap().remember_decisions
    }

    /// Destination directory for technician-initiated downloads.
    pub fn set_download_dir(&self, dir: impl Into<PathBuf>) {
        self.shared.config.write().unwrap().download_dir = dir.into();
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn ensure_dispatch(&self) {
        if self.shared.dispatch_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(rx) = self.shared.transport_events.lock().unwrap().take() {
            tokio::spawn(dispatch_loop(self.shared.clone(), rx));
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    fn send_transfer_control(&self, transfer_id: &str, action: ControlAction, index: Option<u32>) {
        let control = TransferControl {
            transfer_id: transfer_id.to_string(),
            action,
            index,
        };
        send_control(&self.shared, FrameKind::TransferControl, &control);
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

async fn dispatch_loop(
    shared: Arc<EngineShared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => on_connected(&shared),
            TransportEvent::Disconnected => {
                let _ = shared.connected_tx.send(false);
                emit(&shared, EngineEvent::Disconnected);
            }
            TransportEvent::Reconnecting { attempt } => {
                debug!(attempt, "transport reconnecting");
            }
            TransportEvent::ReconnectExhausted => on_reconnect_exhausted(&shared),
            TransportEvent::Error(message) => {
                emit(&shared, EngineEvent::ConnectionError(message));
            }
            TransportEvent::TextFrame(text) => handle_text(&shared, &text),
            TransportEvent::BinaryFrame(bytes) => handle_binary(&shared, &bytes),
        }
    }
}

fn on_connected(shared: &Arc<EngineShared>) {
    let _ = shared.connected_tx.send(true);
    emit(shared, EngineEvent::Connected);
    let session_id = shared.support_session_id.read().unwrap().clone();
    if let Some(session_id) = session_id {
        send_control(
            shared,
            FrameKind::SessionRegister,
            &SessionRegister::client(session_id),
        );
    }
}

/// The transport gave up reconnecting: in-flight sessions fail with
/// "transport lost"; paused and queued ones keep waiting for a future
/// connect call.
fn on_reconnect_exhausted(shared: &Arc<EngineShared>) {
    emit(
        shared,
        EngineEvent::ConnectionError("reconnect attempts exhausted".into()),
    );

    let in_flight: Vec<Arc<TransferSession>> = {
        let sessions = shared.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|s| s.status() == TransferStatus::InProgress)
            .cloned()
            .collect()
    };
    for session in in_flight {
        let id = session.transfer_id();
        if session.fail("transport lost").is_ok() {
            emit(
                shared,
                EngineEvent::TransferFailed {
                    transfer_id: id.clone(),
                    error: "transport lost".into(),
                },
            );
        }
        if let Some(handle) = shared.workers.lock().unwrap().get(&id) {
            handle.cancel.cancel();
        }
    }
}

fn handle_text(shared: &Arc<EngineShared>, text: &str) {
    let frame = match ControlFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "discarding malformed control frame");
            return;
        }
    };

    match frame.kind {
        FrameKind::Pong => {} // heartbeat liveness, nothing to do
        FrameKind::Ping => {
            send_control_frame(shared, ControlFrame::bare(FrameKind::Pong));
        }
        // `file_transfer_response` is the authoritative approval path;
        // `transfer_status_update` carries the same shape and funnels into
        // the same routine, where terminal states refuse re-transition.
        FrameKind::FileTransferResponse | FrameKind::TransferStatusUpdate => {
            match frame.parse_payload::<FileTransferResponse>() {
                Ok(payload) => handle_status_update(
                    shared,
                    &payload.transfer_id,
                    payload.status,
                    &payload.message,
                ),
                Err(e) => warn!(error = %e, "discarding malformed status frame"),
            }
        }
        FrameKind::ChunkAck => match frame.parse_payload::<ChunkAck>() {
            Ok(ack) => handle_chunk_ack(shared, ack),
            Err(e) => warn!(error = %e, "discarding malformed chunk_ack"),
        },
        FrameKind::ProgressResponse => match frame.parse_payload::<ProgressResponse>() {
            Ok(payload) => handle_progress_response(shared, payload),
            Err(e) => warn!(error = %e, "discarding malformed progress_response"),
        },
        FrameKind::Error => match frame.parse_payload::<ErrorFrame>() {
            Ok(payload) => emit(
                shared,
                EngineEvent::ConnectionError(format!("{}: {}", payload.error, payload.message)),
            ),
            Err(e) => warn!(error = %e, "discarding malformed error frame"),
        },
        FrameKind::TransferRequest => match frame.parse_payload::<InboundTransferRequest>() {
            Ok(payload) => handle_inbound_request(shared, payload),
            Err(e) => warn!(error = %e, "discarding malformed transfer_request"),
        },
        FrameKind::SessionRegister
        | FrameKind::FileTransferRequest
        | FrameKind::TransferApproval
        | FrameKind::TransferControl => {
            debug!(kind = ?frame.kind, "ignoring unexpected frame kind from server");
        }
    }
}

fn handle_status_update(
    shared: &Arc<EngineShared>,
    transfer_id: &str,
    status: TransferStatus,
    message: &str,
) {
    let session = shared.sessions.lock().unwrap().get(transfer_id).cloned();
    let Some(session) = session else {
        warn!(transfer_id, "status update for unknown transfer");
        return;
    };

    match status {
        TransferStatus::Approved => {
            if session.set_status(TransferStatus::Approved).is_ok() {
                info!(transfer_id, "transfer approved by peer");
                emit(
                    shared,
                    EngineEvent::TransferApproved {
                        transfer_id: transfer_id.to_string(),
                    },
                );
                shared
                    .queue
                    .lock()
                    .unwrap()
                    .push_back(transfer_id.to_string());
                try_start_workers(shared);
            } else {
                debug!(transfer_id, "duplicate approval ignored");
            }
        }
        TransferStatus::Rejected => {
            if session.set_status(TransferStatus::Rejected).is_ok() {
                info!(transfer_id, reason = message, "transfer rejected by peer");
                emit(
                    shared,
                    EngineEvent::TransferRejected {
                        transfer_id: transfer_id.to_string(),
                        reason: message.to_string(),
                    },
                );
            }
        }
        TransferStatus::Pending => {
            debug!(transfer_id, "transfer pending on server");
        }
        other => {
            debug!(transfer_id, status = ?other, "ignoring server status update");
        }
    }
}

fn handle_chunk_ack(shared: &Arc<EngineShared>, ack: ChunkAck) {
    let routed = {
        let workers = shared.workers.lock().unwrap();
        workers
            .get(&ack.transfer_id)
            .map(|h| h.msg_tx.send(WorkerMsg::Ack(ack.chunk_index)).is_ok())
            .unwrap_or(false)
    };
    if routed {
        emit(
            shared,
            EngineEvent::ChunkSent {
                transfer_id: ack.transfer_id,
                chunk_index: ack.chunk_index,
            },
        );
    } else {
        warn!(transfer_id = %ack.transfer_id, chunk_index = ack.chunk_index, "chunk_ack for unknown worker");
    }
}

fn handle_progress_response(shared: &Arc<EngineShared>, payload: ProgressResponse) {
    let body = payload.progress;
    let session = shared.sessions.lock().unwrap().get(&body.transfer_id).cloned();
    let Some(session) = session else {
        debug!(transfer_id = %body.transfer_id, "progress for unknown transfer");
        return;
    };
    session.apply_remote_progress(body.bytes_transferred, body.total_bytes);
    emit(
        shared,
        EngineEvent::TransferProgress {
            progress: session.progress(),
        },
    );
}

fn handle_binary(shared: &Arc<EngineShared>, bytes: &[u8]) {
    let chunk = match FileChunk::decode(bytes) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "discarding malformed chunk frame");
            return;
        }
    };

    let transfer_id = chunk.transfer_id.clone();
    let chunk_index = chunk.chunk_index;
    let routed = {
        let workers = shared.workers.lock().unwrap();
        workers
            .get(&transfer_id)
            .map(|h| h.msg_tx.send(WorkerMsg::Chunk(chunk)).is_ok())
            .unwrap_or(false)
    };
    if routed {
        emit(
            shared,
            EngineEvent::ChunkReceived {
                transfer_id,
                chunk_index,
            },
        );
    } else {
        warn!(transfer_id = %transfer_id, chunk_index, "chunk for unknown transfer");
        emit(
            shared,
            EngineEvent::UnauthorizedTransferAttempt {
                transfer_id,
                reason: "chunk for unknown transfer".into(),
            },
        );
    }
}

/// Inbound technician-initiated request: create the session, run the
/// policy gate, and either answer immediately or defer to the approval UI.
fn handle_inbound_request(shared: &Arc<EngineShared>, payload: InboundTransferRequest) {
    if shared
        .sessions
        .lock()
        .unwrap()
        .contains_key(&payload.id)
    {
        warn!(transfer_id = %payload.id, "duplicate transfer request ignored");
        return;
    }

    let config = shared.config.read().unwrap().clone();

    // Only the final path component of the offered name is used, so a
    // hostile filename cannot escape the download directory.
    let safe_name = Path::new(&payload.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let local_path = config.download_dir.join(&safe_name);

    let request = TransferRequest {
        id: payload.id.clone(),
        session_id: payload.session_id.clone(),
        filename: payload.filename.clone(),
        file_size: payload.file_size,
        checksum: payload.checksum.clone(),
        direction: TransferDirection::Download,
        technician: payload.technician.clone(),
        local_path,
        remote_path: String::new(),
        metadata: serde_json::Value::Null,
    };
    let session = Arc::new(TransferSession::new(request.clone(), config.chunk_size));
    shared
        .sessions
        .lock()
        .unwrap()
        .insert(request.id.clone(), session.clone());

    info!(
        transfer_id = %request.id,
        filename = %request.filename,
        file_size = request.file_size,
        technician = %request.technician,
        "transfer request received"
    );
    emit(
        shared,
        EngineEvent::TransferRequested {
            transfer_id: request.id.clone(),
            request: request.clone(),
        },
    );

    let snapshot = PolicySnapshot {
        max_file_size: config.max_file_size,
        allowed_extensions: config.allowed_extensions.clone(),
        auto_approval_enabled: config.auto_approval_enabled,
        remembered_decisions: shared.settings.remembered_decisions(),
    };
    match evaluate(&request, &snapshot) {
        PolicyDecision::AutoAllow => approve_inbound(shared, &session, "auto-approved"),
        PolicyDecision::AutoDeny(reason) => reject_inbound(shared, &session, &reason),
        PolicyDecision::Prompt => {
            let high_risk = is_high_risk(&request.filename);
            if high_risk {
                emit(
                    shared,
                    EngineEvent::SecurityWarning {
                        message: "transfer of a high-risk file type requested".into(),
                        details: request.filename.clone(),
                    },
                );
            }
            emit(
                shared,
                EngineEvent::ApprovalRequested {
                    request: request.clone(),
                    high_risk,
                },
            );

            let ui = shared.approval_ui.read().unwrap().clone();
            match ui {
                Some(ui) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let timeout = shared.config.read().unwrap().approval_timeout;
                        let decision = ApprovalAdapter::new(ui)
                            .request_decision(&request, timeout)
                            .await;
                        let remember_enabled =
                            shared.config.read().unwrap().remember_decisions;
                        if decision.remember && remember_enabled {
                            shared
                                .settings
                                .remember_decision(&request.id, decision.approved);
                        }
                        if decision.approved {
                            approve_inbound(&shared, &session, &decision.message);
                        } else {
                            let reason = if decision.message.is_empty() {
                                "user declined"
                            } else {
                                &decision.message
                            };
                            reject_inbound(&shared, &session, reason);
                        }
                    });
                }
                None => reject_inbound(shared, &session, "no approval handler available"),
            }
        }
    }
}

fn approve_inbound(shared: &Arc<EngineShared>, session: &Arc<TransferSession>, message: &str) {
    let transfer_id = session.transfer_id();
    if session.set_status(TransferStatus::Approved).is_err() {
        // Cancelled while the prompt was open.
        return;
    }

    let approval = TransferApproval {
        transfer_id: transfer_id.clone(),
        approved: true,
        message: message.to_string(),
    };
    send_control(shared, FrameKind::TransferApproval, &approval);

    emit(
        shared,
        EngineEvent::ApprovalDecision {
            transfer_id: transfer_id.clone(),
            approved: true,
            message: message.to_string(),
        },
    );
    emit(
        shared,
        EngineEvent::TransferApproved {
            transfer_id: transfer_id.clone(),
        },
    );
    shared.queue.lock().unwrap().push_back(transfer_id);
    try_start_workers(shared);
}

fn reject_inbound(shared: &Arc<EngineShared>, session: &Arc<TransferSession>, reason: &str) {
    let transfer_id = session.transfer_id();
    let _ = session.set_status(TransferStatus::Rejected);

    let approval = TransferApproval {
        transfer_id: transfer_id.clone(),
        approved: false,
        message: reason.to_string(),
    };
    send_control(shared, FrameKind::TransferApproval, &approval);

    emit(
        shared,
        EngineEvent::ApprovalDecision {
            transfer_id: transfer_id.clone(),
            approved: false,
            message: reason.to_string(),
        },
    );
    emit(
        shared,
        EngineEvent::TransferRejected {
            transfer_id,
            reason: reason.to_string(),
        },
    );
}

// ── Worker admission ─────────────────────────────────────────────────────

/// Starts workers for queued approved sessions while slots are free.
/// Holding the workers lock across the decision keeps the concurrency
/// bound exact under concurrent callers.
fn try_start_workers(shared: &Arc<EngineShared>) {
    loop {
        let mut workers = shared.workers.lock().unwrap();
        let max = shared.config.read().unwrap().max_concurrent_transfers;
        if workers.len() >= max {
            return;
        }

        let candidate = {
            let mut queue = shared.queue.lock().unwrap();
            let mut found = None;
            while let Some(id) = queue.pop_front() {
                let session = shared.sessions.lock().unwrap().get(&id).cloned();
                if let Some(session) = session {
                    if session.status() == TransferStatus::Approved {
                        found = Some((id, session));
                        break;
                    }
                }
            }
            found
        };

        let Some((id, session)) = candidate else { return };
        let handle = spawn_worker(shared, &id, session);
        workers.insert(id, handle);
        drop(workers);
    }
}

fn spawn_worker(
    shared: &Arc<EngineShared>,
    transfer_id: &str,
    session: Arc<TransferSession>,
) -> WorkerHandle {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (pause_tx, pause_rx) = watch::channel(false);
    let cancel = tokio_util::sync::CancellationToken::new();

    let ctx = WorkerContext {
        session,
        sink: shared.sink.clone(),
        events: shared.events_tx.clone(),
        msg_rx,
        pause_rx,
        cancel: cancel.clone(),
        connected_rx: shared.connected_tx.subscribe(),
    };

    let shared = shared.clone();
    let id = transfer_id.to_string();
    tokio::spawn(async move {
        worker::run(ctx).await;
        shared.workers.lock().unwrap().remove(&id);
        // A freed slot admits the oldest queued approved transfer.
        try_start_workers(&shared);
    });

    WorkerHandle {
        msg_tx,
        pause_tx,
        cancel,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn emit(shared: &EngineShared, event: EngineEvent) {
    let _ = shared.events_tx.send(event);
}

fn send_control<T: Serialize>(shared: &EngineShared, kind: FrameKind, payload: &T) -> bool {
    match ControlFrame::new(kind, payload) {
        Ok(frame) => send_control_frame(shared, frame),
        Err(e) => {
            warn!(error = %e, "failed to encode control frame");
            false
        }
    }
}

fn send_control_frame(shared: &EngineShared, frame: ControlFrame) -> bool {
    match shared.sink.send_text(&frame) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "failed to send control frame");
            false
        }
    }
}
