//! Sample frames: the unit of data moved from the acquisition loop to consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One time-indexed, multi-channel block of samples.
///
/// Frames are immutable once constructed and are shared between the buffer,
/// the bus and the analysis worker as `Arc<SampleFrame>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleFrame {
    sequence: u64,
    timestamp: DateTime<Utc>,
    sample_rate: f64,
    channels: Vec<Vec<f64>>,
}

impl SampleFrame {
    /// Build a frame from per-channel sample vectors.
    ///
    /// `channels[i]` holds the samples of the i-th acquired channel; all
    /// channels are expected to carry the same number of samples.
    pub fn new(
        sequence: u64,
        timestamp: DateTime<Utc>,
        sample_rate: f64,
        channels: Vec<Vec<f64>>,
    ) -> Self {
        debug_assert!(
            channels.windows(2).all(|w| w[0].len() == w[1].len()),
            "channel payloads must have equal length"
        );
        Self {
            sequence,
            timestamp,
            sample_rate,
            channels,
        }
    }

    /// Monotonically increasing sequence number (first frame is 1).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time the block was read.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Per-channel sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Number of channels in the payload.
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn n_samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Samples of one channel, if present.
    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// All channel payloads in acquisition order.
    pub fn channels(&self) -> &[Vec<f64>] {
        &self.channels
    }
}

/// Inclusive range of frame sequence numbers that fed a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceRange {
    /// First contributing frame.
    pub first: u64,
    /// Last contributing frame.
    pub last: u64,
}

/// Gap detected between consecutive frames seen by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Last sequence seen before the gap.
    pub after: u64,
    /// First sequence seen after the gap.
    pub resumed_at: u64,
}

impl SequenceGap {
    /// Number of frames missing.
    pub fn missing(&self) -> u64 {
        self.resumed_at - self.after - 1
    }
}

/// Tracks sequence numbers on the consumer side to detect overwritten frames.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u64>,
    missing_total: u64,
}

impl SequenceTracker {
    /// Create a tracker that has seen no frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame sequence; returns the gap if frames were skipped.
    pub fn observe(&mut self, sequence: u64) -> Option<SequenceGap> {
        let gap = match self.last {
            Some(last) if sequence > last + 1 => Some(SequenceGap {
                after: last,
                resumed_at: sequence,
            }),
            _ => None,
        };
        if let Some(gap) = gap {
            self.missing_total += gap.missing();
        }
        self.last = Some(sequence);
        gap
    }

    /// Last sequence observed.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Frames missed since the tracker was created.
    pub fn missing_total(&self) -> u64 {
        self.missing_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = SampleFrame::new(
            7,
            Utc::now(),
            32.0,
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        );
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.n_channels(), 2);
        assert_eq!(frame.n_samples(), 3);
        assert_eq!(frame.channel(1), Some(&[4.0, 5.0, 6.0][..]));
        assert_eq!(frame.channel(2), None);
    }

    #[test]
    fn test_sequence_tracker_reports_gaps() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(1), None);
        assert_eq!(tracker.observe(2), None);
        let gap = tracker.observe(6).unwrap();
        assert_eq!(gap.after, 2);
        assert_eq!(gap.resumed_at, 6);
        assert_eq!(gap.missing(), 3);
        assert_eq!(tracker.observe(7), None);
        assert_eq!(tracker.missing_total(), 3);
        assert_eq!(tracker.last(), Some(7));
    }
}
