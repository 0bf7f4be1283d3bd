//! Analysis worker: buffer → spectra → reflection → bus.
//!
//! Runs on a blocking thread and consumes frames from the session's
//! `CircularBuffer`, assembling non-overlapping blocks of
//! `analysis.block_len` samples per channel. A gap in sequence numbers
//! (frames overwritten in the buffer) discards the partial block, so every
//! analysed block is contiguous in time.
//!
//! On stop the worker keeps popping until the buffer is empty.

use crate::acquisition::shared::SessionShared;
use crate::bus::{BusEvent, ErrorEvent};
use crate::config::SessionConfig;
use crate::data::fft::{
    ChannelSpectrum, SpectralOptions, SpectralProcessor, SpectralResult, Spectrum,
};
use crate::data::frame::{SampleFrame, SequenceRange, SequenceTracker};
use crate::data::reflection::{
    ProbeGeometry, ReflectionAnalyzer, ReflectionConfig, ReflectionResult,
};
use crate::data::ring_buffer::CircularBuffer;
use crate::error::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Frames popped per wake-up.
const POP_BATCH: usize = 64;

/// Longest wait for new frames before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Accumulates frames into fixed-length per-channel blocks.
#[derive(Debug)]
pub(crate) struct BlockAssembler {
    block_len: usize,
    channels: Vec<Vec<f64>>,
    first: Option<u64>,
    last: u64,
}

impl BlockAssembler {
    pub(crate) fn new(channels: usize, block_len: usize) -> Self {
        Self {
            block_len,
            channels: vec![Vec::with_capacity(block_len * 2); channels],
            first: None,
            last: 0,
        }
    }

    fn pending(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Drop the partial block.
    pub(crate) fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
        self.first = None;
    }

    /// Append a frame's samples.
    pub(crate) fn push(&mut self, frame: &SampleFrame) {
        if self.first.is_none() {
            self.first = Some(frame.sequence());
        }
        self.last = frame.sequence();
        for (i, channel) in self.channels.iter_mut().enumerate() {
            if let Some(samples) = frame.channel(i) {
                channel.extend_from_slice(samples);
            }
        }
    }

    /// Take the next complete block, if any. Leftover samples start the next
    /// block, which then begins at the last frame pushed.
    pub(crate) fn next_block(&mut self) -> Option<(SequenceRange, Vec<Vec<f64>>)> {
        if self.pending() < self.block_len {
            return None;
        }
        let range = SequenceRange {
            first: self.first.unwrap_or(self.last),
            last: self.last,
        };
        let len = self.block_len;
        let block = self
            .channels
            .iter_mut()
            .map(|channel| channel.drain(..len).collect())
            .collect();
        self.first = (self.pending() > 0).then_some(self.last);
        Some((range, block))
    }
}

/// Reports the first of consecutive blocks with ill-conditioned bins.
#[derive(Debug, Default)]
struct InstabilityEpisode {
    active: bool,
}

impl InstabilityEpisode {
    fn observe(&mut self, result: &ReflectionResult) -> Option<DaqError> {
        match (result.worst_unstable_bin(), self.active) {
            (Some(bin), false) => {
                self.active = true;
                Some(DaqError::NumericalInstability {
                    frequency: bin.frequency,
                    condition: bin.condition,
                })
            }
            (None, true) => {
                self.active = false;
                None
            }
            _ => None,
        }
    }
}

pub(crate) struct AnalysisWorker {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) buffer: Arc<CircularBuffer>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) spectral: Arc<SpectralProcessor>,
    pub(crate) reflection: Arc<ReflectionAnalyzer>,
    pub(crate) config: SessionConfig,
    pub(crate) geometry: Option<ProbeGeometry>,
}

impl AnalysisWorker {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(self) {
        let session_id = self.shared.id();
        let options = SpectralOptions::from(&self.config.analysis);
        let reflection_config = ReflectionConfig::from(&self.config.analysis);
        let mut tracker = SequenceTracker::new();
        let mut assembler =
            BlockAssembler::new(self.config.channels as usize, self.config.analysis.block_len);
        let mut blocks = 0u64;
        let mut instability = InstabilityEpisode::default();

        loop {
            let stopping = self.stop.load(Ordering::Acquire);
            let frames = self.buffer.pop_batch_wait(POP_BATCH, POLL_INTERVAL);
            if frames.is_empty() {
                if stopping {
                    break;
                }
                continue;
            }

            for frame in frames {
                self.shared.recorder().record_frame(Arc::clone(&frame));
                if let Some(gap) = tracker.observe(frame.sequence()) {
                    debug!(
                        session = %session_id,
                        after = gap.after,
                        missing = gap.missing(),
                        "sequence gap, restarting analysis block"
                    );
                    assembler.reset();
                }
                assembler.push(&frame);
                while let Some((range, block)) = assembler.next_block() {
                    match self.analyze(range, &block, &options, &reflection_config) {
                        Ok(Some(result)) => {
                            if let Some(e) = instability.observe(&result) {
                                debug!(session = %session_id, error = %e, "reflection solve unstable");
                                self.shared
                                    .publish_error(ErrorEvent::from_error(&e, Some(session_id)));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(session = %session_id, error = %e, "analysis block failed");
                            self.shared
                                .publish_error(ErrorEvent::from_error(&e, Some(session_id)));
                        }
                    }
                    blocks += 1;
                }
            }
        }
        debug!(
            session = %session_id,
            blocks,
            frames_missed = tracker.missing_total(),
            "analysis worker drained"
        );
    }

    fn analyze(
        &self,
        frames: SequenceRange,
        block: &[Vec<f64>],
        options: &SpectralOptions,
        reflection_config: &ReflectionConfig,
    ) -> AppResult<Option<Arc<ReflectionResult>>> {
        let session_id = self.shared.id();
        let sample_rate = self.config.sample_rate;
        let channels = block
            .iter()
            .enumerate()
            .map(|(i, samples)| {
                Ok(ChannelSpectrum {
                    channel: i as u32,
                    spectrum: self.spectral.spectrum(samples, sample_rate, options)?,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        let spectral = Arc::new(SpectralResult { channels });
        self.shared.recorder().record_spectral(Arc::clone(&spectral));
        self.shared.bus().publish(BusEvent::SpectralResult {
            session_id,
            frames,
            result: Arc::clone(&spectral),
        });

        let Some(geometry) = &self.geometry else {
            return Ok(None);
        };
        let probes: Vec<&Spectrum> = spectral
            .channels
            .iter()
            .take(geometry.len())
            .map(|c| &c.spectrum)
            .collect();
        let result = Arc::new(self.reflection.analyze(&probes, geometry, reflection_config)?);
        self.shared.recorder().record_reflection(Arc::clone(&result));
        self.shared.bus().publish(BusEvent::ReflectionResult {
            session_id,
            frames,
            result: Arc::clone(&result),
        });
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::reflection::{BinResult, BinStatus, WaveStatistics};
    use chrono::Utc;

    fn frame(sequence: u64, values: &[f64]) -> SampleFrame {
        SampleFrame::new(
            sequence,
            Utc::now(),
            32.0,
            vec![values.to_vec(), values.iter().map(|v| -v).collect()],
        )
    }

    #[test]
    fn test_assembler_emits_non_overlapping_blocks() {
        let mut assembler = BlockAssembler::new(2, 4);
        assembler.push(&frame(1, &[1.0, 2.0, 3.0]));
        assert!(assembler.next_block().is_none());
        assembler.push(&frame(2, &[4.0, 5.0, 6.0]));

        let (range, block) = assembler.next_block().unwrap();
        assert_eq!(range, SequenceRange { first: 1, last: 2 });
        assert_eq!(block[0], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(block[1], vec![-1.0, -2.0, -3.0, -4.0]);
        assert!(assembler.next_block().is_none());

        assembler.push(&frame(3, &[7.0, 8.0, 9.0]));
        let (range, block) = assembler.next_block().unwrap();
        assert_eq!(range, SequenceRange { first: 2, last: 3 });
        assert_eq!(block[0], vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_assembler_reset_discards_partial_block() {
        let mut assembler = BlockAssembler::new(2, 4);
        assembler.push(&frame(1, &[1.0, 2.0, 3.0]));
        assembler.reset();
        assembler.push(&frame(5, &[4.0, 5.0, 6.0, 7.0]));
        let (range, block) = assembler.next_block().unwrap();
        assert_eq!(range, SequenceRange { first: 5, last: 5 });
        assert_eq!(block[0], vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_large_frame_yields_several_blocks() {
        let mut assembler = BlockAssembler::new(2, 2);
        assembler.push(&frame(1, &[1.0, 2.0, 3.0, 4.0, 5.0]));
        assert!(assembler.next_block().is_some());
        assert!(assembler.next_block().is_some());
        assert!(assembler.next_block().is_none());
    }

    fn reflection_with(conditions: &[(f64, BinStatus)]) -> ReflectionResult {
        ReflectionResult {
            bins: conditions
                .iter()
                .enumerate()
                .map(|(i, &(condition, status))| BinResult {
                    frequency: i as f64 * 0.25,
                    wavenumber: 0.0,
                    condition,
                    status,
                    incident: None,
                    reflected: None,
                })
                .collect(),
            kr: None,
            incident: WaveStatistics::default(),
            reflected: WaveStatistics::default(),
            unstable_bins: conditions
                .iter()
                .filter(|(_, s)| *s == BinStatus::IllConditioned)
                .count(),
            water_depth: 1.0,
        }
    }

    #[test]
    fn test_instability_reported_once_per_episode() {
        let unstable = reflection_with(&[
            (2.0, BinStatus::Reliable),
            (40.0, BinStatus::IllConditioned),
            (900.0, BinStatus::IllConditioned),
            (5000.0, BinStatus::OutOfBand),
        ]);
        let stable = reflection_with(&[(2.0, BinStatus::Reliable)]);
        let mut episode = InstabilityEpisode::default();

        assert!(episode.observe(&stable).is_none());
        match episode.observe(&unstable) {
            Some(DaqError::NumericalInstability {
                frequency,
                condition,
            }) => {
                assert_eq!(frequency, 0.5);
                assert_eq!(condition, 900.0);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(episode.observe(&unstable).is_none());
        assert!(episode.observe(&stable).is_none());
        assert!(episode.observe(&unstable).is_some());
    }
}
