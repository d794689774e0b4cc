//! Transfer statistics types.

use std::time::Duration;

use tokio::time::Instant;

use crate::transfer::TransferState;

/// Statistics for a single file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Time from start to the terminal state.
    pub elapsed: Duration,
    /// Average speed in bytes per second.
    pub average_speed: u64,
    /// Peak smoothed speed in bytes per second.
    pub peak_speed: u64,
}

/// Summary of a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    /// Items that reached `Completed`.
    pub completed: usize,
    /// Items that reached `Failed`.
    pub failed: usize,
    /// Items that were cancelled, in flight or before starting.
    pub cancelled: usize,
    /// Bytes written by completed items.
    pub total_bytes: u64,
    /// Wall time of the whole batch.
    pub elapsed: Duration,
    /// Highest per-item peak speed.
    pub peak_speed: u64,
}

impl BatchSummary {
    /// Number of items in the batch.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Returns true if every item completed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Returns the average speed in bytes per second.
    #[must_use]
    pub fn average_speed(&self) -> u64 {
        average(self.total_bytes, self.elapsed)
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn average(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}

/// Tracks one transfer while it runs. Owned by the transfer worker.
#[derive(Debug)]
pub struct TransferStatsTracker {
    start_time: Instant,
    bytes: u64,
    peak_speed: u64,
}

impl TransferStatsTracker {
    /// Starts tracking now.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Starts tracking from `start_time`.
    #[must_use]
    pub const fn starting_at(start_time: Instant) -> Self {
        Self {
            start_time,
            bytes: 0,
            peak_speed: 0,
        }
    }

    /// Records the cumulative byte count and the current smoothed speed.
    pub fn record(&mut self, cumulative: u64, speed: u64) {
        self.bytes = self.bytes.max(cumulative);
        self.peak_speed = self.peak_speed.max(speed);
    }

    /// Returns the elapsed time since the transfer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns the bytes recorded so far.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns the peak speed recorded.
    #[must_use]
    pub const fn peak_speed(&self) -> u64 {
        self.peak_speed
    }

    /// Converts this tracker into final statistics.
    #[must_use]
    pub fn finish(&self) -> TransferStats {
        let elapsed = self.elapsed();
        TransferStats {
            bytes: self.bytes,
            elapsed,
            average_speed: average(self.bytes, elapsed),
            peak_speed: self.peak_speed,
        }
    }
}

impl Default for TransferStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for accumulating a batch summary as items finish.
#[derive(Debug)]
pub struct BatchSummaryBuilder {
    summary: BatchSummary,
    start_time: Instant,
}

impl Default for BatchSummaryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSummaryBuilder {
    /// Creates a builder; the batch clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            summary: BatchSummary::default(),
            start_time: Instant::now(),
        }
    }

    /// Records an item that reached a terminal state.
    pub fn add(&mut self, state: &TransferState, stats: &TransferStats) {
        match state {
            TransferState::Completed => {
                self.summary.completed += 1;
                self.summary.total_bytes += stats.bytes;
            }
            TransferState::Failed(_) => self.summary.failed += 1,
            TransferState::Cancelled | TransferState::Pending | TransferState::InProgress => {
                self.summary.cancelled += 1;
            }
        }
        self.summary.peak_speed = self.summary.peak_speed.max(stats.peak_speed);
    }

    /// Records items that were cancelled before they started.
    pub const fn add_skipped(&mut self, count: usize) {
        self.summary.cancelled += count;
    }

    /// Builds the final summary.
    #[must_use]
    pub fn build(self) -> BatchSummary {
        BatchSummary {
            elapsed: self.start_time.elapsed(),
            ..self.summary
        }
    }
}
