//! End-to-end engine flows against a mock frame sink.
//!
//! The harness feeds transport events into the engine and inspects the
//! frames the engine writes, with the tokio clock paused so timeout and
//! backoff behavior is deterministic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use remotedrop_engine::{
    ApprovalDecision, ApprovalFuture, ApprovalUi, EngineEvent, FileTransferEngine, SettingsStore,
};
use remotedrop_protocol::messages::{
    ChunkAck, ControlAction, FileTransferResponse, TransferApproval, TransferControl,
};
use remotedrop_protocol::{ControlFrame, FileChunk, FrameKind, TransferStatus};
use remotedrop_transfer::{checksum_bytes, TransferRequest};
use remotedrop_transport::{FrameSink, TransportError, TransportEvent};

// ── Mock sink ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockSink {
    connected: AtomicBool,
    texts: Mutex<Vec<ControlFrame>>,
    chunks: Mutex<Vec<FileChunk>>,
}

impl MockSink {
    fn new() -> Arc<Self> {
        let sink = Self::default();
        sink.connected.store(true, Ordering::Relaxed);
        Arc::new(sink)
    }

    /// How often a chunk with `index` was put on the wire.
    fn chunk_sends(&self, index: u32) -> usize {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.chunk_index == index)
            .count()
    }

    fn sent_chunks(&self) -> Vec<FileChunk> {
        self.chunks.lock().unwrap().clone()
    }

    fn approvals(&self) -> Vec<TransferApproval> {
        self.frames_of(FrameKind::TransferApproval)
    }

    fn chunk_requests(&self) -> Vec<TransferControl> {
        self.frames_of::<TransferControl>(FrameKind::TransferControl)
            .into_iter()
            .filter(|c| c.action == ControlAction::RequestChunk)
            .collect()
    }

    fn chunk_acks(&self) -> Vec<ChunkAck> {
        self.frames_of(FrameKind::ChunkAck)
    }

    fn frames_of<T: serde::de::DeserializeOwned>(&self, kind: FrameKind) -> Vec<T> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.kind == kind)
            .filter_map(|f| f.parse_payload().ok())
            .collect()
    }
}

impl FrameSink for MockSink {
    fn send_text(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.texts.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let chunk = FileChunk::decode(&bytes).expect("engine emits well-formed chunk frames");
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

struct Harness {
    engine: FileTransferEngine,
    sink: Arc<MockSink>,
    net_tx: mpsc::UnboundedSender<TransportEvent>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

fn harness() -> Harness {
    let sink = MockSink::new();
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let engine =
        FileTransferEngine::with_transport(sink.clone(), net_rx, SettingsStore::in_memory());
    let events = engine.take_events().unwrap();
    engine.start();
    net_tx.send(TransportEvent::Connected).unwrap();
    Harness {
        engine,
        sink,
        net_tx,
        events,
    }
}

impl Harness {
    fn feed_text(&self, frame: ControlFrame) {
        self.net_tx
            .send(TransportEvent::TextFrame(frame.encode()))
            .unwrap();
    }

    fn feed_ack(&self, transfer_id: &str, chunk_index: u32) {
        self.feed_text(
            ControlFrame::new(
                FrameKind::ChunkAck,
                &ChunkAck {
                    transfer_id: transfer_id.into(),
                    chunk_index,
                },
            )
            .unwrap(),
        );
    }

    fn feed_response(&self, transfer_id: &str, status: TransferStatus, message: &str) {
        self.feed_text(
            ControlFrame::new(
                FrameKind::FileTransferResponse,
                &FileTransferResponse {
                    transfer_id: transfer_id.into(),
                    status,
                    message: message.into(),
                },
            )
            .unwrap(),
        );
    }

    fn feed_chunk(&self, chunk: &FileChunk) {
        self.net_tx
            .send(TransportEvent::BinaryFrame(chunk.encode()))
            .unwrap();
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Lets spawned tasks make progress on the current-thread runtime.
async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

fn write_file(dir: &std::path::Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Scenario: happy-path upload, 130 KiB file, 64 KiB chunks ─────────────

#[tokio::test(start_paused = true)]
async fn upload_happy_path_three_chunks() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let data = patterned(130 * 1024);
    let path = write_file(dir.path(), "payload.txt", &data);

    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .expect("valid upload request");
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Pending));

    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;
    assert_eq!(
        h.engine.transfer_status(&id),
        Some(TransferStatus::InProgress)
    );

    // Window of one: ack each chunk as it appears.
    for index in 0..3u32 {
        settle().await;
        assert_eq!(h.sink.chunk_sends(index), 1, "chunk {index} sent once");
        h.feed_ack(&id, index);
    }
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Completed));
    let progress = h.engine.transfer_progress(&id).unwrap();
    assert_eq!(progress.bytes_transferred, 133_120);

    let chunks = h.sink.sent_chunks();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].data.len(), 64 * 1024);
    assert_eq!(chunks[1].data.len(), 64 * 1024);
    assert_eq!(chunks[2].data.len(), 2048);
    assert!(chunks[2].is_last);
    assert!(!chunks[0].is_last);
    let total: usize = chunks.iter().map(|c| c.data.len()).sum();
    assert_eq!(total, data.len());
    for chunk in &chunks {
        assert_eq!(chunk.checksum, checksum_bytes(&chunk.data));
    }

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCompleted { transfer_id, .. } if *transfer_id == id)));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ChunkSent { chunk_index: 2, .. })));
}

// ── Scenario: policy auto-deny on extension ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn inbound_exe_request_is_denied() {
    let mut h = harness();

    h.feed_text(
        ControlFrame::new(
            FrameKind::TransferRequest,
            &serde_json::json!({
                "id": "t-exe",
                "session_id": "support-1",
                "filename": "x.exe",
                "file_size": 1000,
                "checksum": "",
                "transfer_type": "upload",
                "technician": "tech-7",
            }),
        )
        .unwrap(),
    );
    settle().await;

    let approvals = h.sink.approvals();
    assert_eq!(approvals.len(), 1);
    assert!(!approvals[0].approved);
    assert_eq!(approvals[0].message, "extension not allowed");
    assert_eq!(approvals[0].transfer_id, "t-exe");

    // No session in a non-terminal state.
    assert_eq!(
        h.engine.transfer_status("t-exe"),
        Some(TransferStatus::Rejected)
    );
    assert!(h.engine.active_transfers().is_empty());

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferRejected { reason, .. } if reason == "extension not allowed")));
}

// ── Scenario: chunk retry then success ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn dropped_ack_retries_once_then_succeeds() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    let data = patterned(2048); // two chunks
    let path = write_file(dir.path(), "two-chunks.txt", &data);

    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;

    // First transmission of chunk 0 goes unacknowledged.
    assert_eq!(h.sink.chunk_sends(0), 1);

    // The 30-second ack window expires, then the 1000 ms backoff elapses.
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.sink.chunk_sends(0), 1, "no resend before the backoff");
    advance(Duration::from_millis(1000)).await;
    assert_eq!(h.sink.chunk_sends(0), 2, "retry after 1000 ms backoff");

    h.feed_ack(&id, 0);
    settle().await;
    h.feed_ack(&id, 1);
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Completed));
    assert_eq!(h.sink.chunk_sends(0), 2, "exactly two frames for chunk 0");
    assert_eq!(h.sink.chunk_sends(1), 1, "exactly one frame for chunk 1");
    let _ = h.drain_events();
}

// ── Scenario: chunk checksum mismatch on download, retried then fatal ────

#[tokio::test(start_paused = true)]
async fn corrupt_download_chunk_fails_after_three_retries() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    let save_path = dir.path().join("incoming.bin");

    let id = h
        .engine
        .request_file_download("incoming.bin", "support-1", "tech-7", &save_path)
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;

    // The worker kicks the stream off by requesting chunk 0.
    assert_eq!(h.sink.chunk_requests().len(), 1);
    assert_eq!(h.sink.chunk_requests()[0].index, Some(0));

    // Peer claims one checksum but the payload hashes differently.
    let bad_chunk = FileChunk {
        transfer_id: id.clone(),
        chunk_index: 0,
        checksum: "0".repeat(64),
        is_last: true,
        data: b"corrupted payload".to_vec(),
    };

    // Initial delivery plus three retransmissions, each after backoff.
    h.feed_chunk(&bad_chunk);
    settle().await;
    advance(Duration::from_millis(1000)).await;
    assert_eq!(h.sink.chunk_requests().len(), 2);

    h.feed_chunk(&bad_chunk);
    settle().await;
    advance(Duration::from_millis(2000)).await;
    assert_eq!(h.sink.chunk_requests().len(), 3);

    h.feed_chunk(&bad_chunk);
    settle().await;
    advance(Duration::from_millis(4000)).await;
    assert_eq!(h.sink.chunk_requests().len(), 4);

    h.feed_chunk(&bad_chunk);
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Failed));
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::TransferFailed { error, .. } if error == "chunk 0 failed after 3 retries"
    )));
    assert!(!save_path.exists(), "partial download must be removed");
}

// ── Scenario: reconnection preserves in-flight state ─────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_upload_from_next_chunk() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    let data = patterned(10 * 1024); // ten chunks
    let path = write_file(dir.path(), "ten-chunks.txt", &data);

    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;

    for index in 0..5u32 {
        h.feed_ack(&id, index);
        settle().await;
    }
    assert_eq!(h.sink.chunk_sends(5), 1, "chunk 5 in flight");

    // Transport drops mid-transfer; the session stays InProgress.
    h.net_tx.send(TransportEvent::Disconnected).unwrap();
    settle().await;
    assert_eq!(
        h.engine.transfer_status(&id),
        Some(TransferStatus::InProgress)
    );

    // The ack window expires while disconnected; the worker suspends
    // instead of booking a chunk failure.
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.sink.chunk_sends(5), 1);

    // Reconnected (attempt 2 of the transport's loop): the worker resends
    // the in-flight chunk and the transfer finishes.
    h.net_tx
        .send(TransportEvent::Reconnecting { attempt: 2 })
        .unwrap();
    h.net_tx.send(TransportEvent::Connected).unwrap();
    settle().await;
    assert_eq!(h.sink.chunk_sends(5), 2, "chunk 5 resent after reconnect");

    for index in 5..10u32 {
        h.feed_ack(&id, index);
        settle().await;
    }
    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Completed));
    let progress = h.engine.transfer_progress(&id).unwrap();
    assert_eq!(progress.bytes_transferred, data.len() as u64);
    let _ = h.drain_events();
}

// ── Scenario: approval timeout ───────────────────────────────────────────

/// A UI that never answers.
struct SilentUi;

impl ApprovalUi for SilentUi {
    fn prompt(&self, _request: &TransferRequest, _high_risk: bool) -> ApprovalFuture {
        Box::pin(std::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompt_times_out_and_rejects() {
    let mut h = harness();
    h.engine.set_approval_ui(Arc::new(SilentUi));

    h.feed_text(
        ControlFrame::new(
            FrameKind::TransferRequest,
            &serde_json::json!({
                "id": "t-prompt",
                "session_id": "support-1",
                "filename": "notes.txt",
                "file_size": 1000,
                "checksum": "",
                "transfer_type": "upload",
                "technician": "tech-7",
            }),
        )
        .unwrap(),
    );
    settle().await;

    // The prompt is outstanding; nothing decided yet.
    assert!(h.sink.approvals().is_empty());
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::ApprovalRequested { .. })));

    advance(Duration::from_secs(30)).await;

    let approvals = h.sink.approvals();
    assert_eq!(approvals.len(), 1);
    assert!(!approvals[0].approved);
    assert_eq!(approvals[0].message, "timed out");
    assert_eq!(
        h.engine.transfer_status("t-prompt"),
        Some(TransferStatus::Rejected)
    );
}

// ── Inbound download with whole-file verification ────────────────────────

#[tokio::test(start_paused = true)]
async fn approved_inbound_download_verifies_and_completes() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_download_dir(dir.path());
    h.engine.set_chunk_size(1024);
    h.engine.set_auto_approval_enabled(true);

    let data = patterned(1536); // two chunks: 1024 + 512
    let file_hash = checksum_bytes(&data);

    h.feed_text(
        ControlFrame::new(
            FrameKind::TransferRequest,
            &serde_json::json!({
                "id": "t-inbound",
                "session_id": "support-1",
                "filename": "report.txt",
                "file_size": data.len(),
                "checksum": file_hash,
                "transfer_type": "upload",
                "technician": "tech-7",
            }),
        )
        .unwrap(),
    );
    settle().await;

    // Auto-approved and admitted.
    let approvals = h.sink.approvals();
    assert_eq!(approvals.len(), 1);
    assert!(approvals[0].approved);

    for (index, slice) in data.chunks(1024).enumerate() {
        let chunk = FileChunk {
            transfer_id: "t-inbound".into(),
            chunk_index: index as u32,
            checksum: checksum_bytes(slice),
            is_last: index == 1,
            data: slice.to_vec(),
        };
        h.feed_chunk(&chunk);
        settle().await;
    }

    assert_eq!(
        h.engine.transfer_status("t-inbound"),
        Some(TransferStatus::Completed)
    );
    let written = std::fs::read(dir.path().join("report.txt")).unwrap();
    assert_eq!(written, data);

    // Each stored chunk was acknowledged for backpressure.
    let acks = h.sink.chunk_acks();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].chunk_index, 0);
    assert_eq!(acks[1].chunk_index, 1);
    let _ = h.drain_events();
}

// ── Concurrency admission ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrency_limit_queues_approved_transfers() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    h.engine.set_max_concurrent_transfers(1);

    let first = write_file(dir.path(), "first.txt", &patterned(1024));
    let second = write_file(dir.path(), "second.txt", &patterned(1024));

    let id1 = h
        .engine
        .request_file_upload(&first, "support-1", "tech-7")
        .unwrap();
    let id2 = h
        .engine
        .request_file_upload(&second, "support-1", "tech-7")
        .unwrap();

    h.feed_response(&id1, TransferStatus::Approved, "");
    h.feed_response(&id2, TransferStatus::Approved, "");
    settle().await;

    // Only the first runs; the second waits in the queue.
    assert_eq!(
        h.engine.transfer_status(&id1),
        Some(TransferStatus::InProgress)
    );
    assert_eq!(h.engine.transfer_status(&id2), Some(TransferStatus::Approved));

    h.feed_ack(&id1, 0);
    settle().await;
    settle().await;

    assert_eq!(h.engine.transfer_status(&id1), Some(TransferStatus::Completed));
    assert_eq!(
        h.engine.transfer_status(&id2),
        Some(TransferStatus::InProgress)
    );

    h.feed_ack(&id2, 0);
    settle().await;
    assert_eq!(h.engine.transfer_status(&id2), Some(TransferStatus::Completed));
    let _ = h.drain_events();
}

// ── Pause / resume / cancel ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn pause_holds_chunks_and_resume_continues() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    let path = write_file(dir.path(), "pausable.txt", &patterned(3 * 1024));

    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;

    h.feed_ack(&id, 0);
    settle().await;
    h.engine.pause_transfer(&id);
    h.feed_ack(&id, 1);
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Paused));
    assert_eq!(h.sink.chunk_sends(2), 0, "no chunks issued while paused");

    h.engine.resume_transfer(&id);
    settle().await;
    assert_eq!(
        h.engine.transfer_status(&id),
        Some(TransferStatus::InProgress)
    );
    assert_eq!(h.sink.chunk_sends(2), 1, "resumes from the saved position");

    h.feed_ack(&id, 2);
    settle().await;
    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Completed));

    // The pause and resume were announced to the peer.
    let controls = h
        .sink
        .frames_of::<TransferControl>(FrameKind::TransferControl);
    assert!(controls.iter().any(|c| c.action == ControlAction::Pause));
    assert!(controls.iter().any(|c| c.action == ControlAction::Resume));
    let _ = h.drain_events();
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_transfer_reaches_terminal_state() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    let path = write_file(dir.path(), "cancel-me.txt", &patterned(8 * 1024));

    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;

    h.feed_ack(&id, 0);
    settle().await;
    h.engine.cancel_transfer(&id);
    settle().await;

    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Cancelled));
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCancelled { transfer_id } if *transfer_id == id)));

    // Once terminal, later frames cannot revive the session.
    h.feed_ack(&id, 1);
    settle().await;
    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Cancelled));
}

// ── Remembered decisions ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn remembered_deny_skips_the_prompt() {
    struct AlwaysApprove;
    impl ApprovalUi for AlwaysApprove {
        fn prompt(&self, _request: &TransferRequest, _high_risk: bool) -> ApprovalFuture {
            Box::pin(async {
                ApprovalDecision {
                    approved: true,
                    message: "sure".into(),
                    remember: false,
                }
            })
        }
    }

    // Pre-remembered deny for this request id.
    let settings = SettingsStore::in_memory();
    settings.remember_decision("t-denied", false);
    let sink = MockSink::new();
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let engine = FileTransferEngine::with_transport(sink.clone(), net_rx, settings);
    engine.set_approval_ui(Arc::new(AlwaysApprove));
    engine.start();
    net_tx.send(TransportEvent::Connected).unwrap();

    net_tx
        .send(TransportEvent::TextFrame(
            ControlFrame::new(
                FrameKind::TransferRequest,
                &serde_json::json!({
                    "id": "t-denied",
                    "session_id": "support-1",
                    "filename": "notes.txt",
                    "file_size": 1000,
                    "checksum": "",
                    "transfer_type": "upload",
                    "technician": "tech-7",
                }),
            )
            .unwrap()
            .encode(),
        ))
        .unwrap();
    settle().await;

    // The remembered deny wins even though the UI would have approved.
    let approvals = sink.approvals();
    assert_eq!(approvals.len(), 1);
    assert!(!approvals[0].approved);
    assert_eq!(approvals[0].message, "remembered");
    assert_eq!(
        engine.transfer_status("t-denied"),
        Some(TransferStatus::Rejected)
    );
}

// ── Malformed frames are discarded without closing the channel ───────────

#[tokio::test(start_paused = true)]
async fn malformed_frames_do_not_break_dispatch() {
    let mut h = harness();
    let dir = tempfile::tempdir().unwrap();
    h.engine.set_chunk_size(1024);
    let path = write_file(dir.path(), "sturdy.txt", &patterned(1024));

    // Garbage text, a frame without a type, and a truncated binary frame.
    h.net_tx
        .send(TransportEvent::TextFrame("not json {{{".into()))
        .unwrap();
    h.net_tx
        .send(TransportEvent::TextFrame(r#"{"timestamp":"now"}"#.into()))
        .unwrap();
    h.net_tx
        .send(TransportEvent::BinaryFrame(vec![0, 0]))
        .unwrap();
    settle().await;

    // Dispatch still works afterwards.
    let id = h
        .engine
        .request_file_upload(&path, "support-1", "tech-7")
        .unwrap();
    h.feed_response(&id, TransferStatus::Approved, "");
    settle().await;
    h.feed_ack(&id, 0);
    settle().await;
    assert_eq!(h.engine.transfer_status(&id), Some(TransferStatus::Completed));
    let _ = h.drain_events();
}
