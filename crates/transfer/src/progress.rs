//! Progress tracking and speed smoothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use remotedrop_protocol::TransferStatus;

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// `100 * bytes / total`; 0 while the total is unknown.
    pub percentage: f64,
    /// Smoothed transfer speed in bytes/second.
    pub speed: u64,
    /// Estimated time to completion; `None` while speed is zero.
    pub remaining_time: Option<Duration>,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub started_at: Option<Instant>,
    pub last_update: Instant,
}

/// Smooths transfer speed over a sliding window of one-second samples.
///
/// Call [`record`](Self::record) once per second with the current byte
/// total; the reported speed is the mean of the last
/// [`WINDOW`](Self::WINDOW) per-second deltas.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<u64>,
    last_total: u64,
}

impl SpeedCalculator {
    /// Number of one-second samples in the smoothing window.
    pub const WINDOW: usize = 10;

    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(Self::WINDOW),
            last_total: 0,
        }
    }

    /// Records a one-second sample from the current byte total and returns
    /// the smoothed speed.
    pub fn record(&mut self, total_bytes: u64) -> u64 {
        let delta = total_bytes.saturating_sub(self.last_total);
        self.last_total = total_bytes;
        if self.samples.len() == Self::WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(delta);
        self.bytes_per_second()
    }

    /// Mean of the sampled per-second deltas; 0 with no samples.
    pub fn bytes_per_second(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }

    /// Estimated time to transfer `remaining` bytes at the smoothed speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_total = 0;
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}
