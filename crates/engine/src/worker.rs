//! Per-transfer workers.
//!
//! One worker task drives each active transfer. Uploads send one chunk at
//! a time and await its acknowledgment within the 30-second window;
//! downloads verify and write chunks pushed by the peer. Both retry a
//! failed chunk up to three times with exponential backoff before the
//! session fails. Transport loss suspends a worker instead of failing it;
//! the chunk in flight is resent after reconnection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use remotedrop_protocol::messages::{ChunkAck, ControlAction, TransferControl};
use remotedrop_protocol::{
    chunk_span, total_chunks, ControlFrame, FileChunk, FrameKind, TransferDirection,
    TransferStatus, CHUNK_ACK_TIMEOUT, MAX_CHUNK_RETRIES, RETRY_DELAY_BASE,
};
use remotedrop_transfer::{checksum_bytes, TransferSession};
use remotedrop_transport::FrameSink;

use crate::events::EngineEvent;

/// Messages routed to a worker by the controller's dispatch loop.
#[derive(Debug)]
pub(crate) enum WorkerMsg {
    /// `chunk_ack` for an uploaded chunk.
    Ack(u32),
    /// Inbound chunk for a download.
    Chunk(FileChunk),
}

/// Controller-side handle to a running worker.
pub(crate) struct WorkerHandle {
    pub(crate) msg_tx: mpsc::UnboundedSender<WorkerMsg>,
    pub(crate) pause_tx: watch::Sender<bool>,
    pub(crate) cancel: CancellationToken,
}

/// Everything a worker task needs.
pub(crate) struct WorkerContext {
    pub(crate) session: Arc<TransferSession>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) events: mpsc::UnboundedSender<EngineEvent>,
    pub(crate) msg_rx: mpsc::UnboundedReceiver<WorkerMsg>,
    pub(crate) pause_rx: watch::Receiver<bool>,
    pub(crate) cancel: CancellationToken,
    pub(crate) connected_rx: watch::Receiver<bool>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Events the ack/chunk wait loops resolve to. Keeping the select arms
/// free of `self` borrows lets the follow-up run on `&mut self`.
enum Wait {
    Cancelled,
    Tick,
    Ack(u32),
    Chunk(FileChunk),
    Deadline,
    Closed,
}

pub(crate) async fn run(ctx: WorkerContext) {
    let WorkerContext {
        session,
        sink,
        events,
        msg_rx,
        pause_rx,
        cancel,
        connected_rx,
    } = ctx;

    let worker = Worker {
        id: session.transfer_id(),
        chunk_size: session.chunk_size(),
        session,
        sink,
        events,
        retries: HashMap::new(),
        failed: BTreeSet::new(),
    };

    match worker.session.direction() {
        TransferDirection::Upload => {
            worker.run_upload(msg_rx, pause_rx, cancel, connected_rx).await
        }
        TransferDirection::Download => {
            worker
                .run_download(msg_rx, pause_rx, cancel, connected_rx)
                .await
        }
    }
}

struct Worker {
    id: String,
    chunk_size: usize,
    session: Arc<TransferSession>,
    sink: Arc<dyn FrameSink>,
    events: mpsc::UnboundedSender<EngineEvent>,
    retries: HashMap<u32, u32>,
    /// Indices awaiting retransmission; served before fresh chunks.
    failed: BTreeSet<u32>,
}

impl Worker {
    // ── Upload ───────────────────────────────────────────────────────────

    async fn run_upload(
        mut self,
        mut msg_rx: mpsc::UnboundedReceiver<WorkerMsg>,
        mut pause_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
        mut connected_rx: watch::Receiver<bool>,
    ) {
        if self.session.set_status(TransferStatus::InProgress).is_err() {
            return;
        }
        self.emit(EngineEvent::TransferStarted {
            transfer_id: self.id.clone(),
        });
        if let Err(e) = self.session.open_file() {
            self.finish_failed(&e.to_string());
            return;
        }

        let total = self.session.total_chunks();
        let mut next_index: u32 = 0;
        let mut speed_tick = tokio::time::interval(Duration::from_secs(1));
        speed_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        'outer: loop {
            if self.session.acked_count() >= total {
                self.finish_completed();
                return;
            }

            if self.wait_unpaused(&mut pause_rx, &cancel).await == Flow::Stop {
                return;
            }

            // Selection discipline: retries precede fresh chunks; fresh
            // chunks go out in strictly increasing index order.
            let index = match self.failed.iter().next().copied() {
                Some(i) => {
                    self.failed.remove(&i);
                    i
                }
                None => {
                    while next_index < total && self.session.is_chunk_acked(next_index) {
                        next_index += 1;
                    }
                    if next_index >= total {
                        // Only stray acks outstanding; drain the inbox.
                        let wait = tokio::select! {
                            _ = cancel.cancelled() => Wait::Cancelled,
                            msg = msg_rx.recv() => inbox_wait(msg),
                        };
                        match wait {
                            Wait::Cancelled | Wait::Closed => {
                                self.finish_cancelled();
                                return;
                            }
                            Wait::Ack(i) => self.record_ack(i, total),
                            _ => {}
                        }
                        continue 'outer;
                    }
                    let i = next_index;
                    next_index += 1;
                    i
                }
            };
            if self.session.is_chunk_acked(index) {
                continue;
            }

            let data = match self.session.read_chunk(index) {
                Ok(data) => data,
                Err(e) => {
                    self.finish_failed(&e.to_string());
                    return;
                }
            };
            let frame = FileChunk {
                transfer_id: self.id.clone(),
                chunk_index: index,
                checksum: checksum_bytes(&data),
                is_last: index + 1 == total,
                data,
            }
            .encode();

            if self
                .send_with_reconnect(&frame, &mut connected_rx, &cancel)
                .await
                == Flow::Stop
            {
                return;
            }

            // Await this chunk's ack within the 30-second window. Acks
            // for other indices arriving meanwhile are honored too.
            let mut deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;
            loop {
                let wait = tokio::select! {
                    _ = cancel.cancelled() => Wait::Cancelled,
                    _ = speed_tick.tick() => Wait::Tick,
                    _ = tokio::time::sleep_until(deadline) => Wait::Deadline,
                    msg = msg_rx.recv() => inbox_wait(msg),
                };
                match wait {
                    Wait::Cancelled | Wait::Closed => {
                        self.finish_cancelled();
                        return;
                    }
                    Wait::Tick => self.sample_and_report(),
                    Wait::Chunk(_) => {}
                    Wait::Ack(i) => {
                        self.record_ack(i, total);
                        if i == index {
                            continue 'outer;
                        }
                    }
                    Wait::Deadline => {
                        if !*connected_rx.borrow() {
                            // Transport loss does not fail the chunk: wait
                            // for reconnection, then resend it.
                            if self.wait_connected(&mut connected_rx, &cancel).await == Flow::Stop
                            {
                                return;
                            }
                            if self
                                .send_with_reconnect(&frame, &mut connected_rx, &cancel)
                                .await
                                == Flow::Stop
                            {
                                return;
                            }
                            deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;
                            continue;
                        }
                        warn!(
                            transfer_id = %self.id,
                            chunk_index = index,
                            "chunk ack timeout"
                        );
                        if !self
                            .register_chunk_failure(index, total, &mut msg_rx, &cancel)
                            .await
                        {
                            return;
                        }
                        continue 'outer;
                    }
                }
            }
        }
    }

    // ── Download ─────────────────────────────────────────────────────────

    async fn run_download(
        mut self,
        mut msg_rx: mpsc::UnboundedReceiver<WorkerMsg>,
        mut pause_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
        mut connected_rx: watch::Receiver<bool>,
    ) {
        if self.session.set_status(TransferStatus::InProgress).is_err() {
            return;
        }
        self.emit(EngineEvent::TransferStarted {
            transfer_id: self.id.clone(),
        });
        if let Err(e) = self.session.open_file() {
            self.finish_failed(&e.to_string());
            return;
        }

        let mut total: Option<u32> = {
            let bytes = self.session.total_bytes();
            (bytes > 0).then(|| total_chunks(bytes, self.chunk_size))
        };

        // Initial kick. The peer may also push chunks spontaneously; both
        // paths land in the same inbox.
        self.request_chunk(0);
        let mut awaiting: Option<u32> = Some(0);
        let mut deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;

        let mut speed_tick = tokio::time::interval(Duration::from_secs(1));
        speed_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.wait_unpaused(&mut pause_rx, &cancel).await == Flow::Stop {
                return;
            }

            let wait = tokio::select! {
                _ = cancel.cancelled() => Wait::Cancelled,
                _ = speed_tick.tick() => Wait::Tick,
                _ = tokio::time::sleep_until(deadline), if awaiting.is_some() => Wait::Deadline,
                msg = msg_rx.recv() => inbox_wait(msg),
            };
            match wait {
                Wait::Cancelled | Wait::Closed => {
                    self.finish_cancelled();
                    return;
                }
                Wait::Tick => self.sample_and_report(),
                Wait::Ack(_) => {}
                Wait::Deadline => {
                    let index = awaiting.unwrap_or(0);
                    if !*connected_rx.borrow() {
                        if self.wait_connected(&mut connected_rx, &cancel).await == Flow::Stop {
                            return;
                        }
                        self.request_chunk(index);
                        deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;
                        continue;
                    }
                    warn!(
                        transfer_id = %self.id,
                        chunk_index = index,
                        "requested chunk did not arrive"
                    );
                    if !self.download_chunk_failure(index, &cancel).await {
                        return;
                    }
                    awaiting = Some(index);
                    deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;
                }
                Wait::Chunk(chunk) => {
                    let index = chunk.chunk_index;
                    match self.handle_download_chunk(chunk, &mut total, &cancel).await {
                        Step::Done => return,
                        Step::Failed => {
                            // Retransmission was requested; rearm the
                            // deadline for the failed index.
                            awaiting = Some(index);
                            deadline = tokio::time::Instant::now() + CHUNK_ACK_TIMEOUT;
                        }
                        Step::Stored => {
                            if awaiting == Some(index) {
                                awaiting = None;
                            }
                        }
                        Step::Ignored => {}
                    }
                }
            }
        }
    }

    /// Verifies, writes, and acknowledges one inbound chunk.
    async fn handle_download_chunk(
        &mut self,
        chunk: FileChunk,
        total: &mut Option<u32>,
        cancel: &CancellationToken,
    ) -> Step {
        let index = chunk.chunk_index;
        if self.session.is_chunk_acked(index) {
            debug!(transfer_id = %self.id, chunk_index = index, "duplicate chunk ignored");
            return Step::Ignored;
        }

        let computed = checksum_bytes(&chunk.data);
        if !computed.eq_ignore_ascii_case(&chunk.checksum) {
            warn!(
                transfer_id = %self.id,
                chunk_index = index,
                "chunk checksum mismatch, requesting retransmission"
            );
            return if self.download_chunk_failure(index, cancel).await {
                Step::Failed
            } else {
                Step::Done
            };
        }

        if let Err(e) = self.session.write_chunk(index, &chunk.data) {
            warn!(transfer_id = %self.id, chunk_index = index, error = %e, "chunk write failed");
            return if self.download_chunk_failure(index, cancel).await {
                Step::Failed
            } else {
                Step::Done
            };
        }

        self.session.mark_chunk_acked(index, chunk.data.len());
        self.retries.remove(&index);
        self.send_ack(index);

        if chunk.is_last {
            *total = Some(total.unwrap_or(0).max(index + 1));
        }

        if let Some(t) = *total {
            if self.session.acked_count() >= t {
                let expected = self.session.request().checksum;
                if !expected.is_empty() && self.session.verify_checksum(&expected).is_err() {
                    self.finish_failed("checksum mismatch");
                    return Step::Done;
                }
                if self.session.total_bytes() == 0 {
                    let received = self.session.progress().bytes_transferred;
                    self.session.set_total_bytes(received);
                }
                self.finish_completed();
                return Step::Done;
            }
        }
        Step::Stored
    }

    /// Books one failure for a download chunk: backoff, then re-request.
    /// Returns `false` when the retry budget is exhausted (session failed).
    async fn download_chunk_failure(&mut self, index: u32, cancel: &CancellationToken) -> bool {
        let count = {
            let c = self.retries.entry(index).or_insert(0);
            *c += 1;
            *c
        };
        if count > MAX_CHUNK_RETRIES {
            self.finish_failed(&format!(
                "chunk {index} failed after {MAX_CHUNK_RETRIES} retries"
            ));
            return false;
        }
        let delay = RETRY_DELAY_BASE * 2u32.saturating_pow(count - 1);
        debug!(
            transfer_id = %self.id,
            chunk_index = index,
            attempt = count,
            delay_ms = delay.as_millis() as u64,
            "scheduling chunk retransmission"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                self.finish_cancelled();
                return false;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        self.request_chunk(index);
        true
    }

    // ── Upload retry bookkeeping ─────────────────────────────────────────

    /// Books one failure for an uploaded chunk and sits out the backoff
    /// (late acks arriving during the backoff are honored). Returns
    /// `false` when the worker terminated.
    async fn register_chunk_failure(
        &mut self,
        index: u32,
        total: u32,
        msg_rx: &mut mpsc::UnboundedReceiver<WorkerMsg>,
        cancel: &CancellationToken,
    ) -> bool {
        let count = {
            let c = self.retries.entry(index).or_insert(0);
            *c += 1;
            *c
        };
        if count > MAX_CHUNK_RETRIES {
            self.finish_failed(&format!(
                "chunk {index} failed after {MAX_CHUNK_RETRIES} retries"
            ));
            return false;
        }

        self.failed.insert(index);
        let delay = RETRY_DELAY_BASE * 2u32.saturating_pow(count - 1);
        debug!(
            transfer_id = %self.id,
            chunk_index = index,
            attempt = count,
            delay_ms = delay.as_millis() as u64,
            "scheduling chunk retry"
        );

        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let wait = tokio::select! {
                _ = cancel.cancelled() => Wait::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wait::Deadline,
                msg = msg_rx.recv() => inbox_wait(msg),
            };
            match wait {
                Wait::Cancelled | Wait::Closed => {
                    self.finish_cancelled();
                    return false;
                }
                Wait::Deadline => return true,
                Wait::Ack(i) => self.record_ack(i, total),
                _ => {}
            }
        }
    }

    /// Records an acknowledged chunk; duplicate and out-of-range acks are
    /// ignored.
    fn record_ack(&mut self, index: u32, total: u32) {
        if index >= total {
            warn!(transfer_id = %self.id, chunk_index = index, "ack outside chunk range ignored");
            return;
        }
        let (_, len) = chunk_span(index, self.chunk_size, self.session.total_bytes());
        if self.session.mark_chunk_acked(index, len) {
            self.retries.remove(&index);
            self.failed.remove(&index);
        }
    }

    // ── Suspension helpers ───────────────────────────────────────────────

    /// Parks while paused. Sets `Paused` on entry and restores
    /// `InProgress` on resume. Returns `Stop` on cancellation.
    async fn wait_unpaused(
        &self,
        pause_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Flow {
        if !*pause_rx.borrow() {
            return Flow::Continue;
        }
        if self.session.status() == TransferStatus::InProgress {
            let _ = self.session.set_status(TransferStatus::Paused);
            self.emit(EngineEvent::TransferProgress {
                progress: self.session.progress(),
            });
        }
        loop {
            if !*pause_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish_cancelled();
                    return Flow::Stop;
                }
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        return Flow::Stop;
                    }
                }
            }
        }
        if self.session.status() == TransferStatus::Paused {
            let _ = self.session.set_status(TransferStatus::InProgress);
        }
        Flow::Continue
    }

    /// Parks until the transport reports connected.
    async fn wait_connected(
        &self,
        connected_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Flow {
        loop {
            if *connected_rx.borrow() {
                return Flow::Continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish_cancelled();
                    return Flow::Stop;
                }
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    /// Sends a binary frame, suspending across disconnects.
    async fn send_with_reconnect(
        &self,
        frame: &[u8],
        connected_rx: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Flow {
        loop {
            if self.wait_connected(connected_rx, cancel).await == Flow::Stop {
                return Flow::Stop;
            }
            match self.sink.send_binary(frame.to_vec()) {
                Ok(()) => return Flow::Continue,
                Err(e) => {
                    debug!(transfer_id = %self.id, error = %e, "send failed, waiting for reconnect");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.finish_cancelled();
                            return Flow::Stop;
                        }
                        changed = connected_rx.changed() => {
                            if changed.is_err() {
                                return Flow::Stop;
                            }
                        }
                    }
                }
            }
        }
    }

    // ── Frame emission ───────────────────────────────────────────────────

    fn request_chunk(&self, index: u32) {
        let control = TransferControl {
            transfer_id: self.id.clone(),
            action: ControlAction::RequestChunk,
            index: Some(index),
        };
        if let Ok(frame) = ControlFrame::new(FrameKind::TransferControl, &control) {
            let _ = self.sink.send_text(&frame);
        }
    }

    fn send_ack(&self, index: u32) {
        let ack = ChunkAck {
            transfer_id: self.id.clone(),
            chunk_index: index,
        };
        if let Ok(frame) = ControlFrame::new(FrameKind::ChunkAck, &ack) {
            let _ = self.sink.send_text(&frame);
        }
    }

    // ── Termination ──────────────────────────────────────────────────────

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn sample_and_report(&self) {
        self.session.sample_speed();
        self.emit(EngineEvent::TransferProgress {
            progress: self.session.progress(),
        });
    }

    fn finish_completed(&self) {
        if self.session.set_status(TransferStatus::Completed).is_ok() {
            self.emit(EngineEvent::TransferCompleted {
                transfer_id: self.id.clone(),
                local_path: self.session.request().local_path,
            });
        }
    }

    fn finish_failed(&self, reason: &str) {
        if self.session.fail(reason).is_ok() {
            self.emit(EngineEvent::TransferFailed {
                transfer_id: self.id.clone(),
                error: reason.to_string(),
            });
        }
    }

    fn finish_cancelled(&self) {
        if self.session.set_status(TransferStatus::Cancelled).is_ok() {
            self.emit(EngineEvent::TransferCancelled {
                transfer_id: self.id.clone(),
            });
        }
    }
}

/// Outcome of processing one inbound download chunk.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// Chunk verified and written.
    Stored,
    /// Chunk failed verification/write; a retransmission was requested.
    Failed,
    /// Duplicate chunk, nothing to do.
    Ignored,
    /// The transfer reached a terminal state.
    Done,
}

fn inbox_wait(msg: Option<WorkerMsg>) -> Wait {
    match msg {
        Some(WorkerMsg::Ack(i)) => Wait::Ack(i),
        Some(WorkerMsg::Chunk(chunk)) => Wait::Chunk(chunk),
        None => Wait::Closed,
    }
}
