//! Speed and ETA estimation over a sliding window of progress samples.

use std::collections::VecDeque;
use std::time::Duration;

/// Span of history the speed estimate averages over.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Upper bound on retained samples regardless of window length.
pub const MAX_SAMPLES: usize = 64;

/// Cumulative bytes observed at a point in time since the transfer started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Time since the transfer started.
    pub elapsed: Duration,
    /// Cumulative bytes transferred at `elapsed`.
    pub bytes: u64,
}

/// Estimated time remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eta {
    /// Not enough information yet, or no progress is being made.
    #[default]
    Unknown,
    /// Expected time until completion.
    Remaining(Duration),
}

impl Eta {
    /// Returns the remaining duration, if known.
    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Unknown => None,
            Self::Remaining(d) => Some(d),
        }
    }
}

/// Average speed in bytes per second between the first and last sample.
///
/// Returns 0 for fewer than two samples or a zero time span.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn speed(samples: &[Sample]) -> u64 {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return 0;
    };
    let span = last.elapsed.saturating_sub(first.elapsed).as_secs_f64();
    if span <= 0.0 {
        return 0;
    }
    let delta = last.bytes.saturating_sub(first.bytes);
    (delta as f64 / span).round() as u64
}

/// Time to move `remaining` bytes at `speed` bytes per second.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn eta(speed: u64, remaining: u64) -> Eta {
    if remaining == 0 {
        return Eta::Remaining(Duration::ZERO);
    }
    if speed == 0 {
        return Eta::Unknown;
    }
    let secs = remaining as f64 / speed as f64;
    Eta::Remaining(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

/// Rolling history of samples for one transfer (or one batch).
#[derive(Debug, Clone)]
pub struct SpeedWindow {
    window: Duration,
    samples: VecDeque<Sample>,
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SpeedWindow {
    /// Creates an empty window spanning `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
        }
    }

    /// Records cumulative progress. Samples older than the window are
    /// dropped, but the two most recent are always kept.
    pub fn record(&mut self, elapsed: Duration, bytes: u64) {
        self.samples.push_back(Sample { elapsed, bytes });
        let horizon = elapsed.saturating_sub(self.window);
        while self.samples.len() > 2
            && (self.samples.len() > MAX_SAMPLES
                || self.samples.front().is_some_and(|s| s.elapsed < horizon))
        {
            self.samples.pop_front();
        }
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Smoothed speed in bytes per second.
    #[must_use]
    pub fn speed(&self) -> u64 {
        let (front, back) = self.samples.as_slices();
        match (front.first(), back.last().or_else(|| front.last())) {
            (Some(first), Some(last)) => speed(&[*first, *last]),
            _ => 0,
        }
    }

    /// ETA to reach `total` bytes; unknown until two samples exist.
    #[must_use]
    pub fn eta(&self, total: u64) -> Eta {
        if self.samples.len() < 2 {
            return Eta::Unknown;
        }
        let done = self.samples.back().map_or(0, |s| s.bytes);
        eta(self.speed(), total.saturating_sub(done))
    }
}
