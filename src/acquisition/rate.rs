//! Measured sample rate and drift detection.
//!
//! Time is accumulated only while running, so pauses do not lower the
//! measured rate. The first block after start or resume only sets the clock;
//! a timer-driven loop delivers it immediately.

use std::time::Duration;
use tokio::time::Instant;

/// Relative deviation from nominal that counts as drift.
pub const DRIFT_TOLERANCE: f64 = 0.05;

/// Shortest measurement window before drift is judged.
pub const MIN_WARMUP: Duration = Duration::from_millis(500);

/// Result of [`RateMonitor::record_block`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateCheck {
    /// Not enough running time yet, or no change in drift state
    Steady,
    /// Rate left the tolerance band
    Drifted {
        /// Measured rate in Hz
        actual: f64,
    },
    /// Rate came back within tolerance
    Recovered {
        /// Measured rate in Hz
        actual: f64,
    },
}

/// Measures samples per second of running time.
#[derive(Debug)]
pub struct RateMonitor {
    nominal: f64,
    warmup: Duration,
    accumulated: Duration,
    anchor: Option<Instant>,
    samples: u64,
    drifting: bool,
}

impl RateMonitor {
    /// Monitor for `nominal` Hz with blocks of `block_size` samples.
    /// Judging starts after four block periods or [`MIN_WARMUP`], whichever
    /// is longer.
    pub fn new(nominal: f64, block_size: usize) -> Self {
        let period = Duration::from_secs_f64(block_size as f64 / nominal);
        Self {
            nominal,
            warmup: (period * 4).max(MIN_WARMUP),
            accumulated: Duration::ZERO,
            anchor: None,
            samples: 0,
            drifting: false,
        }
    }

    /// Measured rate, or `0.0` before any interval has been timed.
    pub fn actual_rate(&self) -> f64 {
        let elapsed = self.running_time();
        if elapsed.is_zero() {
            0.0
        } else {
            self.samples as f64 / elapsed.as_secs_f64()
        }
    }

    /// Whether the monitor currently reports drift.
    pub fn is_drifting(&self) -> bool {
        self.drifting
    }

    fn running_time(&self) -> Duration {
        self.accumulated + self.anchor.map_or(Duration::ZERO, |a| a.elapsed())
    }

    /// Account for one block of `samples` per channel.
    pub fn record_block(&mut self, samples: usize) -> RateCheck {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
            return RateCheck::Steady;
        }
        self.samples += samples as u64;
        if self.running_time() < self.warmup {
            return RateCheck::Steady;
        }

        let actual = self.actual_rate();
        let out_of_band = ((actual - self.nominal) / self.nominal).abs() > DRIFT_TOLERANCE;
        match (out_of_band, self.drifting) {
            (true, false) => {
                self.drifting = true;
                RateCheck::Drifted { actual }
            }
            (false, true) => {
                self.drifting = false;
                RateCheck::Recovered { actual }
            }
            _ => RateCheck::Steady,
        }
    }

    /// Stop the clock.
    pub fn pause(&mut self) {
        if let Some(anchor) = self.anchor.take() {
            self.accumulated += anchor.elapsed();
        }
    }

    /// Restart the clock; the next block only re-anchors it.
    pub fn resume(&mut self) {
        self.anchor = None;
    }
}
