//! Bounded frame ring buffer between the acquisition loop and its consumers.
//!
//! One producer (the acquisition loop) pushes `SampleFrame`s; one or more
//! consumers pop them in order. A single `parking_lot::Mutex` guards a
//! pre-allocated `VecDeque` and a read cursor, so push and pop are O(1) and
//! hold the lock only for a pointer move. Counters live in atomics and can be
//! read without taking the lock.
//!
//! Popping only advances the cursor: a frame keeps its slot until a later
//! push needs it, so [`CircularBuffer::peek_latest`] sees the newest frames
//! even after consumers have taken them.
//!
//! # Full-buffer policy
//!
//! - **Overwrite** (default): the oldest frame is evicted and
//!   `dropped_frame_count` is incremented. Consumers see the loss as a gap in
//!   sequence numbers (see [`SequenceTracker`](super::frame::SequenceTracker)).
//! - **Reject**: the incoming frame is discarded and `dropped_frame_count` is
//!   incremented.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use wave_daq::data::{BufferConfig, CircularBuffer, SampleFrame};
//!
//! let buffer = CircularBuffer::new(BufferConfig::new(2, 1)).unwrap();
//! for seq in 1..=3 {
//!     buffer.push(Arc::new(SampleFrame::new(seq, Utc::now(), 10.0, vec![vec![0.0]])));
//! }
//! let frames = buffer.pop_batch(10);
//! assert_eq!(frames.iter().map(|f| f.sequence()).collect::<Vec<_>>(), vec![2, 3]);
//! assert_eq!(buffer.dropped_frame_count(), 1);
//! ```

use crate::data::frame::SampleFrame;
use crate::error::{AppResult, DaqError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Buffer sizing and full-buffer policy, fixed for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Capacity in frames.
    pub capacity: usize,
    /// Channels per frame.
    pub channels: usize,
    /// Evict the oldest frame when full (true) or reject the new one (false).
    pub overwrite_on_full: bool,
}

impl BufferConfig {
    /// Overwrite-oldest buffer of `capacity` frames with `channels` channels.
    pub fn new(capacity: usize, channels: usize) -> Self {
        Self {
            capacity,
            channels,
            overwrite_on_full: true,
        }
    }

    /// Switch to reject-on-full.
    pub fn rejecting(mut self) -> Self {
        self.overwrite_on_full = false;
        self
    }

    /// Check sizing invariants.
    pub fn validate(&self) -> AppResult<()> {
        if self.capacity == 0 {
            return Err(DaqError::Configuration(
                "buffer capacity must be greater than 0".into(),
            ));
        }
        if self.channels == 0 {
            return Err(DaqError::Configuration(
                "buffer channel count must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored without loss.
    Accepted,
    /// Stored; the oldest frame was evicted.
    Overwritten {
        /// Sequence number of the evicted frame.
        evicted_sequence: u64,
    },
    /// Buffer full under reject policy; the pushed frame was discarded.
    Rejected,
}

impl PushOutcome {
    /// Whether the pushed frame is now in the buffer.
    pub fn accepted(&self) -> bool {
        !matches!(self, PushOutcome::Rejected)
    }

    /// Whether a frame was lost by this push.
    pub fn lost_frame(&self) -> bool {
        !matches!(self, PushOutcome::Accepted)
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BufferStats {
    /// Capacity in frames.
    pub capacity: usize,
    /// Frames waiting to be popped.
    pub used: usize,
    /// Frames offered to `push`.
    pub pushed: u64,
    /// Frames lost to overwrite or reject.
    pub dropped: u64,
}

/// Retained frames, newest at the back. The last `unread` have not been
/// popped yet.
#[derive(Debug)]
struct Slots {
    frames: VecDeque<Arc<SampleFrame>>,
    unread: usize,
}

impl Slots {
    fn take_oldest(&mut self, n: usize) -> Vec<Arc<SampleFrame>> {
        let take = n.min(self.unread);
        let start = self.frames.len() - self.unread;
        self.unread -= take;
        self.frames.range(start..start + take).cloned().collect()
    }
}

/// Bounded concurrent ring buffer of sample frames.
pub struct CircularBuffer {
    config: BufferConfig,
    slots: Mutex<Slots>,
    not_empty: Condvar,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl CircularBuffer {
    /// Allocate a buffer sized per `config`.
    pub fn new(config: BufferConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            slots: Mutex::new(Slots {
                frames: VecDeque::with_capacity(config.capacity),
                unread: 0,
            }),
            not_empty: Condvar::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Buffer configuration.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Push a frame, applying the full-buffer policy.
    pub fn push(&self, frame: Arc<SampleFrame>) -> PushOutcome {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        let outcome = {
            let mut slots = self.slots.lock();
            if slots.unread < self.config.capacity {
                if slots.frames.len() == self.config.capacity {
                    slots.frames.pop_front();
                }
                slots.frames.push_back(frame);
                slots.unread += 1;
                PushOutcome::Accepted
            } else if self.config.overwrite_on_full {
                let evicted_sequence = slots.frames.pop_front().map_or(0, |f| f.sequence());
                slots.frames.push_back(frame);
                PushOutcome::Overwritten { evicted_sequence }
            } else {
                PushOutcome::Rejected
            }
        };
        if outcome.lost_frame() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.accepted() {
            self.not_empty.notify_one();
        }
        outcome
    }

    /// Remove and return up to `n` of the oldest frames, oldest first.
    ///
    /// An empty buffer yields an empty vector.
    pub fn pop_batch(&self, n: usize) -> Vec<Arc<SampleFrame>> {
        self.slots.lock().take_oldest(n)
    }

    /// Like [`pop_batch`](Self::pop_batch) but waits up to `timeout` for the
    /// buffer to become non-empty.
    pub fn pop_batch_wait(&self, n: usize, timeout: Duration) -> Vec<Arc<SampleFrame>> {
        let mut slots = self.slots.lock();
        if slots.unread == 0 {
            self.not_empty.wait_for(&mut slots, timeout);
        }
        slots.take_oldest(n)
    }

    /// Wake every consumer blocked in [`pop_batch_wait`](Self::pop_batch_wait).
    pub fn wake_consumers(&self) {
        self.not_empty.notify_all();
    }

    /// Newest `n` retained frames in sequence order, popped or not, without
    /// moving the read cursor.
    pub fn peek_latest(&self, n: usize) -> Vec<Arc<SampleFrame>> {
        let slots = self.slots.lock();
        let skip = slots.frames.len().saturating_sub(n);
        slots.frames.iter().skip(skip).cloned().collect()
    }

    /// Frames waiting to be popped.
    pub fn used(&self) -> usize {
        self.slots.lock().unread
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// True when nothing is waiting to be popped.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().unread == 0
    }

    /// Discard all stored frames. Counters are kept.
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.frames.clear();
        slots.unread = 0;
    }

    /// Frames lost to overwrite or reject since creation.
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity: self.config.capacity,
            used: self.used(),
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped_frame_count(),
        }
    }
}

impl std::fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::thread;
    use std::time::Instant;

    fn frame(seq: u64) -> Arc<SampleFrame> {
        Arc::new(SampleFrame::new(
            seq,
            Utc::now(),
            100.0,
            vec![vec![seq as f64; 4]; 4],
        ))
    }

    fn sequences(frames: &[Arc<SampleFrame>]) -> Vec<u64> {
        frames.iter().map(|f| f.sequence()).collect()
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(CircularBuffer::new(BufferConfig::new(0, 4)).is_err());
        assert!(CircularBuffer::new(BufferConfig::new(8, 0)).is_err());
    }

    #[test]
    fn test_pop_on_empty_returns_empty() {
        let buffer = CircularBuffer::new(BufferConfig::new(4, 1)).unwrap();
        assert!(buffer.pop_batch(10).is_empty());
        assert!(buffer.peek_latest(3).is_empty());
    }

    #[test]
    fn test_overwrite_keeps_most_recent() {
        let buffer = CircularBuffer::new(BufferConfig::new(1000, 4)).unwrap();
        for seq in 1..=1500 {
            buffer.push(frame(seq));
        }
        assert_eq!(buffer.used(), 1000);
        assert_eq!(buffer.dropped_frame_count(), 500);

        let frames = buffer.pop_batch(1000);
        assert_eq!(sequences(&frames), (501..=1500).collect::<Vec<_>>());
        assert_eq!(buffer.used(), 0);
    }

    #[test]
    fn test_overwrite_reports_evicted_sequence() {
        let buffer = CircularBuffer::new(BufferConfig::new(2, 1)).unwrap();
        assert_eq!(buffer.push(frame(1)), PushOutcome::Accepted);
        assert_eq!(buffer.push(frame(2)), PushOutcome::Accepted);
        assert_eq!(
            buffer.push(frame(3)),
            PushOutcome::Overwritten {
                evicted_sequence: 1
            }
        );
    }

    #[test]
    fn test_reject_policy_keeps_oldest() {
        let buffer = CircularBuffer::new(BufferConfig::new(3, 1).rejecting()).unwrap();
        for seq in 1..=5 {
            let outcome = buffer.push(frame(seq));
            assert_eq!(outcome.accepted(), seq <= 3);
        }
        assert_eq!(buffer.dropped_frame_count(), 2);
        assert_eq!(sequences(&buffer.pop_batch(10)), vec![1, 2, 3]);
    }

    #[test]
    fn test_pop_batch_shorter_than_requested() {
        let buffer = CircularBuffer::new(BufferConfig::new(10, 1)).unwrap();
        for seq in 1..=3 {
            buffer.push(frame(seq));
        }
        assert_eq!(sequences(&buffer.pop_batch(2)), vec![1, 2]);
        assert_eq!(sequences(&buffer.pop_batch(5)), vec![3]);
    }

    #[test]
    fn test_peek_latest_does_not_consume() {
        let buffer = CircularBuffer::new(BufferConfig::new(10, 1)).unwrap();
        for seq in 1..=6 {
            buffer.push(frame(seq));
        }
        assert_eq!(sequences(&buffer.peek_latest(3)), vec![4, 5, 6]);
        assert_eq!(buffer.used(), 6);
        assert_eq!(sequences(&buffer.peek_latest(50)).len(), 6);
    }

    #[test]
    fn test_popped_frames_stay_visible_until_reused() {
        let buffer = CircularBuffer::new(BufferConfig::new(3, 1)).unwrap();
        for seq in 1..=3 {
            buffer.push(frame(seq));
        }
        assert_eq!(sequences(&buffer.pop_batch(2)), vec![1, 2]);
        assert_eq!(buffer.used(), 1);
        assert_eq!(sequences(&buffer.peek_latest(3)), vec![1, 2, 3]);

        // Reuses the slot of frame 1 without loss.
        assert_eq!(buffer.push(frame(4)), PushOutcome::Accepted);
        assert_eq!(buffer.dropped_frame_count(), 0);
        assert_eq!(sequences(&buffer.peek_latest(3)), vec![2, 3, 4]);
        assert_eq!(sequences(&buffer.pop_batch(10)), vec![3, 4]);
        assert!(buffer.is_empty());
        assert_eq!(sequences(&buffer.peek_latest(2)), vec![3, 4]);
    }

    #[test]
    fn test_reject_after_consumer_catches_up() {
        let buffer = CircularBuffer::new(BufferConfig::new(2, 1).rejecting()).unwrap();
        buffer.push(frame(1));
        buffer.push(frame(2));
        assert_eq!(buffer.push(frame(3)), PushOutcome::Rejected);
        assert_eq!(sequences(&buffer.pop_batch(1)), vec![1]);
        assert_eq!(buffer.push(frame(4)), PushOutcome::Accepted);
        assert_eq!(sequences(&buffer.pop_batch(10)), vec![2, 4]);
    }

    #[test]
    fn test_clear_keeps_counters() {
        let buffer = CircularBuffer::new(BufferConfig::new(2, 1)).unwrap();
        for seq in 1..=4 {
            buffer.push(frame(seq));
        }
        buffer.clear();
        let stats = buffer.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.pushed, 4);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn test_pop_batch_wait_times_out_when_empty() {
        let buffer = CircularBuffer::new(BufferConfig::new(2, 1)).unwrap();
        let start = Instant::now();
        assert!(buffer.pop_batch_wait(1, Duration::from_millis(20)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_concurrent_push_pop_preserves_order() {
        let buffer = Arc::new(CircularBuffer::new(BufferConfig::new(64, 4)).unwrap());
        const TOTAL: u64 = 20_000;

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for seq in 1..=TOTAL {
                    buffer.push(frame(seq));
                }
            })
        };

        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut last = 0u64;
                let mut received = 0u64;
                while last < TOTAL {
                    for f in buffer.pop_batch_wait(32, Duration::from_millis(10)) {
                        assert!(f.sequence() > last, "frames out of order");
                        assert!(f.channels().iter().all(|c| c[0] == f.sequence() as f64));
                        last = f.sequence();
                        received += 1;
                    }
                }
                received
            })
        };

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received + buffer.dropped_frame_count(), TOTAL);
    }

    #[test]
    fn test_push_latency() {
        let buffer = CircularBuffer::new(BufferConfig::new(1024, 4)).unwrap();
        let frames: Vec<_> = (1..=10_000).map(frame).collect();

        let start = Instant::now();
        for f in frames {
            buffer.push(f);
        }
        let per_push = start.elapsed() / 10_000;
        assert!(
            per_push < Duration::from_millis(1),
            "push too slow: {:?}",
            per_push
        );
    }
}
