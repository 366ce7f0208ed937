//! Transfer session: the single source of truth for one transfer.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use remotedrop_protocol::{chunk_span, total_chunks, TransferDirection, TransferStatus};

use crate::progress::{SpeedCalculator, TransferProgress};
use crate::request::TransferRequest;
use crate::TransferError;

/// Per-transfer state record (thread-safe).
///
/// The file handle is open exactly while the session is `InProgress` or
/// `Paused`; entering a terminal state closes it, and a failed or
/// cancelled download removes the partially written file.
pub struct TransferSession {
    inner: RwLock<Inner>,
}

struct Inner {
    request: TransferRequest,
    status: TransferStatus,
    chunk_size: usize,
    file: Option<File>,
    acked: HashSet<u32>,
    bytes_transferred: u64,
    total_bytes: u64,
    speed: SpeedCalculator,
    current_speed: u64,
    remaining_time: Option<Duration>,
    error: Option<String>,
    started_at: Option<Instant>,
    last_update: Instant,
}

impl TransferSession {
    /// Creates a session in `Pending` state.
    pub fn new(request: TransferRequest, chunk_size: usize) -> Self {
        let total_bytes = request.file_size;
        Self {
            inner: RwLock::new(Inner {
                request,
                status: TransferStatus::Pending,
                chunk_size,
                file: None,
                acked: HashSet::new(),
                bytes_transferred: 0,
                total_bytes,
                speed: SpeedCalculator::new(),
                current_speed: 0,
                remaining_time: None,
                error: None,
                started_at: None,
                last_update: Instant::now(),
            }),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn request(&self) -> TransferRequest {
        self.inner.read().unwrap().request.clone()
    }

    pub fn transfer_id(&self) -> String {
        self.inner.read().unwrap().request.id.clone()
    }

    pub fn direction(&self) -> TransferDirection {
        self.inner.read().unwrap().request.direction
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().status
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().unwrap().error.clone()
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.read().unwrap().chunk_size
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.read().unwrap().total_bytes
    }

    /// Total chunk count for the current known size.
    pub fn total_chunks(&self) -> u32 {
        let inner = self.inner.read().unwrap();
        total_chunks(inner.total_bytes, inner.chunk_size)
    }

    pub fn is_chunk_acked(&self, index: u32) -> bool {
        self.inner.read().unwrap().acked.contains(&index)
    }

    pub fn acked_count(&self) -> u32 {
        self.inner.read().unwrap().acked.len() as u32
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> TransferProgress {
        let inner = self.inner.read().unwrap();
        let percentage = if inner.total_bytes > 0 {
            100.0 * inner.bytes_transferred as f64 / inner.total_bytes as f64
        } else {
            0.0
        };
        TransferProgress {
            transfer_id: inner.request.id.clone(),
            bytes_transferred: inner.bytes_transferred,
            total_bytes: inner.total_bytes,
            percentage,
            speed: inner.current_speed,
            remaining_time: inner.remaining_time,
            status: inner.status,
            error: inner.error.clone(),
            started_at: inner.started_at,
            last_update: inner.last_update,
        }
    }

    // ── Status management ────────────────────────────────────────────────

    /// Moves the session to `next`, enforcing the state machine edges.
    ///
    /// Entering a terminal state closes the file handle; a failed or
    /// cancelled download also removes the partial file.
    pub fn set_status(&self, next: TransferStatus) -> Result<(), TransferError> {
        let mut inner = self.inner.write().unwrap();
        let from = inner.status;
        if !from.can_transition_to(next) {
            warn!(
                transfer_id = %inner.request.id,
                ?from,
                to = ?next,
                "rejected illegal status transition"
            );
            return Err(TransferError::InvalidTransition { from, to: next });
        }

        inner.status = next;
        inner.last_update = Instant::now();
        if next == TransferStatus::InProgress && inner.started_at.is_none() {
            inner.started_at = Some(Instant::now());
        }

        if next.is_terminal() {
            inner.file = None;
            let delete_partial = inner.request.direction == TransferDirection::Download
                && matches!(next, TransferStatus::Failed | TransferStatus::Cancelled);
            if delete_partial {
                let path = inner.request.local_path.clone();
                if std::fs::remove_file(&path).is_ok() {
                    debug!(transfer_id = %inner.request.id, path = %path.display(), "removed partial download");
                }
            }
        }
        Ok(())
    }

    /// Records `reason` and moves the session to `Failed`.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), TransferError> {
        let reason = reason.into();
        self.inner.write().unwrap().error = Some(reason);
        self.set_status(TransferStatus::Failed)
    }

    /// Updates the total size once the peer reports it (inbound download).
    pub fn set_total_bytes(&self, total: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.total_bytes = total;
        inner.last_update = Instant::now();
    }

    // ── File operations ──────────────────────────────────────────────────

    /// Opens the local file: read-only for uploads; created/truncated (with
    /// parent directories) for downloads.
    pub fn open_file(&self) -> Result<(), TransferError> {
        let mut inner = self.inner.write().unwrap();
        let path = inner.request.local_path.clone();
        let file = match inner.request.direction {
            TransferDirection::Upload => File::open(&path).map_err(|e| {
                TransferError::FileOpen(format!("{}: {e}", path.display()))
            })?,
            TransferDirection::Download => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        TransferError::FileOpen(format!("{}: {e}", parent.display()))
                    })?;
                }
                // Read access kept for the whole-file hash verification
                // that runs on this handle after the last chunk.
                OpenOptions::new()
                    .read(true)
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| TransferError::FileOpen(format!("{}: {e}", path.display())))?
            }
        };
        inner.file = Some(file);
        Ok(())
    }

    /// Reads chunk `index`. Returns fewer than `chunk_size` bytes only for
    /// the final chunk.
    pub fn read_chunk(&self, index: u32) -> Result<Vec<u8>, TransferError> {
        let mut inner = self.inner.write().unwrap();
        let (offset, len) = chunk_span(index, inner.chunk_size, inner.total_bytes);
        let file = inner.file.as_mut().ok_or(TransferError::FileNotOpen)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| TransferError::Read(format!("seek to chunk {index}: {e}")))?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|e| TransferError::Read(format!("chunk {index}: {e}")))?;
        Ok(data)
    }

    /// Writes `data` at chunk `index`'s offset and flushes.
    pub fn write_chunk(&self, index: u32, data: &[u8]) -> Result<(), TransferError> {
        let mut inner = self.inner.write().unwrap();
        let offset = index as u64 * inner.chunk_size as u64;
        let file = inner.file.as_mut().ok_or(TransferError::FileNotOpen)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| TransferError::Write(format!("seek to chunk {index}: {e}")))?;
        file.write_all(data)
            .map_err(|e| TransferError::Write(format!("chunk {index}: {e}")))?;
        file.flush()
            .map_err(|e| TransferError::Write(format!("flush chunk {index}: {e}")))?;
        Ok(())
    }

    /// SHA-256 over the whole file, lowercase hex. Restores the pre-call
    /// seek position when the session's handle is used.
    pub fn compute_file_hash(&self) -> Result<String, TransferError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(file) = inner.file.as_mut() {
            let saved = file
                .stream_position()
                .map_err(|e| TransferError::Read(e.to_string()))?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| TransferError::Read(e.to_string()))?;
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = file
                    .read(&mut buf)
                    .map_err(|e| TransferError::Read(e.to_string()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            file.seek(SeekFrom::Start(saved))
                .map_err(|e| TransferError::Read(e.to_string()))?;
            Ok(hex::encode(hasher.finalize()))
        } else {
            let path = inner.request.local_path.clone();
            drop(inner);
            crate::checksum::calculate_file_checksum(&path)
        }
    }

    /// Compares the whole-file hash against `expected`
    /// (case-insensitive). Records the error on mismatch.
    pub fn verify_checksum(&self, expected: &str) -> Result<(), TransferError> {
        let computed = self.compute_file_hash()?;
        if computed.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            self.inner.write().unwrap().error = Some("checksum mismatch".into());
            Err(TransferError::ChecksumMismatch)
        }
    }

    // ── Progress bookkeeping ─────────────────────────────────────────────

    /// Marks chunk `index` (of `len` bytes) as acknowledged. Returns
    /// whether the chunk was newly recorded; duplicates are ignored so
    /// `bytes_transferred` stays the sum of distinct acknowledged chunks.
    pub fn mark_chunk_acked(&self, index: u32, len: usize) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !inner.acked.insert(index) {
            return false;
        }
        inner.bytes_transferred += len as u64;
        inner.last_update = Instant::now();
        true
    }

    /// Sets progress from a completed-chunk count:
    /// `bytes = min(completed * chunk_size, total)`.
    pub fn update_chunk_progress(&self, completed: u32) {
        let mut inner = self.inner.write().unwrap();
        let bytes = (completed as u64 * inner.chunk_size as u64).min(inner.total_bytes);
        inner.bytes_transferred = bytes;
        inner.last_update = Instant::now();
    }

    /// Applies a server-authoritative progress override. Progress never
    /// moves backwards within a live session.
    pub fn apply_remote_progress(&self, bytes_transferred: u64, total_bytes: u64) {
        let mut inner = self.inner.write().unwrap();
        if total_bytes > 0 {
            inner.total_bytes = total_bytes;
        }
        let capped = bytes_transferred.min(inner.total_bytes);
        inner.bytes_transferred = inner.bytes_transferred.max(capped);
        inner.last_update = Instant::now();
    }

    /// Takes a one-second speed sample; called by the worker's ticker
    /// while the session is `InProgress`.
    pub fn sample_speed(&self) {
        let mut inner = self.inner.write().unwrap();
        let bytes = inner.bytes_transferred;
        let speed = inner.speed.record(bytes);
        inner.current_speed = speed;
        let remaining = inner.total_bytes.saturating_sub(bytes);
        inner.remaining_time = inner.speed.eta(remaining);
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("TransferSession")
            .field("id", &inner.request.id)
            .field("direction", &inner.request.direction)
            .field("status", &inner.status)
            .field("bytes", &inner.bytes_transferred)
            .field("total", &inner.total_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const CHUNK: usize = 8;

    fn upload_session(dir: &std::path::Path, data: &[u8]) -> TransferSession {
        let path = dir.join("source.bin");
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        let checksum = crate::checksum_bytes(data);
        let request = TransferRequest::upload(
            "t-up",
            "s-1",
            path,
            data.len() as u64,
            checksum,
            "tech",
        );
        TransferSession::new(request, CHUNK)
    }

    fn download_session(dir: &std::path::Path) -> TransferSession {
        let path = dir.join("incoming").join("dest.bin");
        let request = TransferRequest::download("t-down", "s-1", "dest.bin", path, "tech");
        TransferSession::new(request, CHUNK)
    }

    #[test]
    fn new_session_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"0123456789");
        assert_eq!(session.status(), TransferStatus::Pending);
        assert_eq!(session.total_bytes(), 10);
        assert_eq!(session.total_chunks(), 2);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"x");
        let result = session.set_status(TransferStatus::InProgress);
        assert!(matches!(
            result,
            Err(TransferError::InvalidTransition {
                from: TransferStatus::Pending,
                to: TransferStatus::InProgress,
            })
        ));
        assert_eq!(session.status(), TransferStatus::Pending);
    }

    #[test]
    fn terminal_state_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"x");
        session.set_status(TransferStatus::Rejected).unwrap();
        for next in [
            TransferStatus::Approved,
            TransferStatus::InProgress,
            TransferStatus::Cancelled,
        ] {
            assert!(session.set_status(next).is_err());
        }
    }

    #[test]
    fn read_chunks_cover_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"0123456789"); // 10 bytes, chunk 8
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();

        assert_eq!(session.read_chunk(0).unwrap(), b"01234567");
        assert_eq!(session.read_chunk(1).unwrap(), b"89"); // short final chunk
    }

    #[test]
    fn read_chunk_without_open_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"0123456789");
        assert!(matches!(
            session.read_chunk(0),
            Err(TransferError::FileNotOpen)
        ));
    }

    #[test]
    fn write_chunks_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let session = download_session(dir.path());
        session.set_total_bytes(10);
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();

        session.write_chunk(1, b"89").unwrap();
        session.write_chunk(0, b"01234567").unwrap();
        session.set_status(TransferStatus::Completed).unwrap();

        let path = session.request().local_path;
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn download_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let session = download_session(dir.path());
        session.open_file().unwrap();
        assert!(dir.path().join("incoming").is_dir());
    }

    #[test]
    fn open_missing_upload_source_fails() {
        let request =
            TransferRequest::upload("t", "s", "/nonexistent/file.bin", 1, "", "tech");
        let session = TransferSession::new(request, CHUNK);
        assert!(matches!(
            session.open_file(),
            Err(TransferError::FileOpen(_))
        ));
    }

    #[test]
    fn file_hash_restores_seek_position() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let session = upload_session(dir.path(), data);
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();

        let _ = session.read_chunk(0).unwrap();
        let hash = session.compute_file_hash().unwrap();
        assert_eq!(hash, crate::checksum_bytes(data));
        // The next sequential read still works from the saved position.
        assert_eq!(session.read_chunk(1).unwrap(), b"89");
    }

    #[test]
    fn verify_checksum_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"checksum me";
        let session = upload_session(dir.path(), data);
        let expected = crate::checksum_bytes(data).to_uppercase();
        session.verify_checksum(&expected).unwrap();
    }

    #[test]
    fn verify_checksum_mismatch_sets_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"checksum me");
        let wrong = "0".repeat(64);
        assert!(matches!(
            session.verify_checksum(&wrong),
            Err(TransferError::ChecksumMismatch)
        ));
        assert_eq!(session.error().unwrap(), "checksum mismatch");
    }

    #[test]
    fn acked_bytes_sum_distinct_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"0123456789");
        assert!(session.mark_chunk_acked(0, 8));
        assert!(!session.mark_chunk_acked(0, 8)); // duplicate ignored
        assert!(session.mark_chunk_acked(1, 2));
        assert_eq!(session.progress().bytes_transferred, 10);
        assert_eq!(session.acked_count(), 2);
    }

    #[test]
    fn update_chunk_progress_clamps_to_total() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"0123456789");
        session.update_chunk_progress(2); // 2 * 8 = 16, clamped to 10
        assert_eq!(session.progress().bytes_transferred, 10);
        assert!((session.progress().percentage - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = download_session(dir.path());
        session.set_total_bytes(10);
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();
        session.write_chunk(0, b"partial").unwrap();

        let path = session.request().local_path;
        assert!(path.exists());
        session.fail("chunk 0 failed after 3 retries").unwrap();
        assert!(!path.exists(), "partial download must be removed");
        assert_eq!(session.status(), TransferStatus::Failed);
    }

    #[test]
    fn cancelled_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = download_session(dir.path());
        session.set_total_bytes(4);
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();
        session.write_chunk(0, b"part").unwrap();

        let path = session.request().local_path;
        session.set_status(TransferStatus::Cancelled).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn completed_upload_keeps_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), b"keep me");
        session.set_status(TransferStatus::Approved).unwrap();
        session.set_status(TransferStatus::InProgress).unwrap();
        session.open_file().unwrap();
        session.set_status(TransferStatus::Completed).unwrap();
        assert!(session.request().local_path.exists());
    }

    #[test]
    fn remote_progress_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), &[0u8; 100]);
        session.apply_remote_progress(50, 100);
        assert_eq!(session.progress().bytes_transferred, 50);
        // A stale, lower server snapshot is ignored.
        session.apply_remote_progress(10, 100);
        assert_eq!(session.progress().bytes_transferred, 50);
        // Values past the total are capped.
        session.apply_remote_progress(500, 100);
        assert_eq!(session.progress().bytes_transferred, 100);
    }

    #[test]
    fn speed_sampling_updates_progress() {
        let dir = tempfile::tempdir().unwrap();
        let session = upload_session(dir.path(), &[0u8; 100]);
        session.mark_chunk_acked(0, 8);
        session.sample_speed();
        let progress = session.progress();
        assert_eq!(progress.speed, 8);
        assert!(progress.remaining_time.is_some());
    }
}
