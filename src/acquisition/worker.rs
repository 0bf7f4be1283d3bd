//! Acquisition loop: backend → frame → buffer + `raw-frame`.
//!
//! Runs on its own tokio task. Cadence comes from a `tokio::time::interval`
//! with a period of `block_size / sample_rate` unless the backend paces
//! itself. The loop checks its command channel before every read and never
//! interrupts a read in flight; a read that exceeds its deadline faults the
//! session instead.
//!
//! When the loop exits (stop, requested duration reached, or fault) it stops
//! the analysis worker, waits for it to drain the buffer and releases the
//! backend.

use crate::acquisition::rate::{RateCheck, RateMonitor};
use crate::acquisition::shared::SessionShared;
use crate::bus::{BusEvent, ErrorEvent};
use crate::data::frame::SampleFrame;
use crate::data::ring_buffer::{CircularBuffer, PushOutcome};
use crate::error::{DaqError, ErrorKind};
use crate::hardware::{HardwareManager, ManagerState};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Controller → loop commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopCommand {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Stopped,
    Completed,
    Faulted,
}

/// Tracks runs of lossy pushes so each run is reported once.
#[derive(Debug, Default)]
struct OverrunEpisode {
    active: bool,
}

impl OverrunEpisode {
    /// `Some(BufferOverrun)` on the first lost frame of a run. A lossless
    /// push ends the run.
    fn observe(&mut self, outcome: PushOutcome, dropped_total: u64) -> Option<DaqError> {
        match (outcome.lost_frame(), self.active) {
            (true, false) => {
                self.active = true;
                Some(DaqError::BufferOverrun {
                    dropped: dropped_total,
                })
            }
            (false, true) => {
                self.active = false;
                None
            }
            _ => None,
        }
    }
}

/// Handle on a spawned analysis worker.
pub(crate) struct AnalysisHandle {
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) struct AcquisitionLoop {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) manager: Arc<HardwareManager>,
    pub(crate) buffer: Arc<CircularBuffer>,
    pub(crate) commands: watch::Receiver<LoopCommand>,
    pub(crate) analysis: AnalysisHandle,
    pub(crate) self_paced: bool,
}

impl AcquisitionLoop {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let exit = self.acquire().await;
        debug!(session = %self.shared.id(), exit = ?exit, "acquisition loop finished");
        self.teardown(exit).await;
    }

    fn fail(&self, err: DaqError) -> LoopExit {
        if self.manager.state() != ManagerState::Faulted {
            self.manager.report_fault(&err);
        }
        self.shared.fault(&err);
        LoopExit::Faulted
    }

    async fn acquire(&mut self) -> LoopExit {
        let config = self.shared.config();
        let session_id = self.shared.id();
        let block_size = config.block_size;
        let total = config.total_samples();

        let mut interval = tokio::time::interval(config.block_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut rate = RateMonitor::new(config.sample_rate, block_size);
        let mut sequence = 0u64;
        let mut acquired = 0u64;
        let mut paused = false;
        let mut overrun = OverrunEpisode::default();

        loop {
            let command = *self.commands.borrow_and_update();
            match command {
                LoopCommand::Stop => return LoopExit::Stopped,
                LoopCommand::Pause => {
                    if !paused {
                        paused = true;
                        rate.pause();
                        match self.manager.pause().await {
                            Ok(in_hardware) => debug!(in_hardware, "acquisition paused"),
                            Err(e) => return self.fail(e),
                        }
                    }
                    if self.commands.changed().await.is_err() {
                        return LoopExit::Stopped;
                    }
                    continue;
                }
                LoopCommand::Run if paused => {
                    paused = false;
                    if let Err(e) = self.manager.resume().await {
                        return self.fail(e);
                    }
                    rate.resume();
                    interval.reset();
                    debug!("acquisition resumed");
                }
                LoopCommand::Run => {}
            }

            if !self.self_paced {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = self.commands.changed() => {
                        if changed.is_err() {
                            return LoopExit::Stopped;
                        }
                        continue;
                    }
                }
            }

            let samples = match total {
                Some(total) => block_size.min((total - acquired) as usize),
                None => block_size,
            };
            let data = match self.manager.read_block(samples).await {
                Ok(data) => data,
                Err(e) => return self.fail(e),
            };

            sequence += 1;
            acquired += samples as u64;
            let frame = Arc::new(SampleFrame::new(
                sequence,
                Utc::now(),
                config.sample_rate,
                data,
            ));
            let outcome = self.buffer.push(Arc::clone(&frame));
            if let Some(err) = overrun.observe(outcome, self.buffer.dropped_frame_count()) {
                warn!(
                    session = %session_id,
                    capacity = self.buffer.capacity(),
                    "analysis fell behind, frames are being dropped"
                );
                self.shared
                    .publish_error(ErrorEvent::from_error(&err, Some(session_id)));
            }
            self.shared.bus().publish(BusEvent::RawFrame { session_id, frame });

            match rate.record_block(samples) {
                RateCheck::Drifted { actual } => {
                    warn!(nominal = config.sample_rate, actual, "sample rate drift");
                    self.shared.publish_error(ErrorEvent::new(
                        ErrorKind::RateDrift,
                        format!(
                            "measured {:.3} Hz against nominal {} Hz",
                            actual, config.sample_rate
                        ),
                        Some(session_id),
                    ));
                }
                RateCheck::Recovered { actual } => {
                    info!(nominal = config.sample_rate, actual, "sample rate back within tolerance");
                }
                RateCheck::Steady => {}
            }
            self.shared
                .record_frame(self.buffer.dropped_frame_count(), rate.actual_rate());

            if total.is_some_and(|total| acquired >= total) {
                info!(session = %session_id, samples = acquired, "requested duration acquired");
                return LoopExit::Completed;
            }
        }
    }

    async fn teardown(&mut self, exit: LoopExit) {
        self.analysis.stop.store(true, Ordering::Release);
        self.buffer.wake_consumers();
        if let Err(e) = (&mut self.analysis.task).await {
            error!(error = %e, "analysis worker panicked");
        }

        if let Err(e) = self.manager.release().await {
            warn!(error = %e, "backend release failed");
        }
        self.shared.set_backend(self.manager.descriptor());

        if exit != LoopExit::Faulted {
            self.shared.finish_stopped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrun_reported_once_per_episode() {
        let mut episode = OverrunEpisode::default();
        assert!(episode.observe(PushOutcome::Accepted, 0).is_none());

        let lost = PushOutcome::Overwritten { evicted_sequence: 1 };
        assert!(matches!(
            episode.observe(lost, 1),
            Some(DaqError::BufferOverrun { dropped: 1 })
        ));
        assert!(episode.observe(lost, 2).is_none());
        assert!(episode.observe(PushOutcome::Rejected, 3).is_none());

        assert!(episode.observe(PushOutcome::Accepted, 3).is_none());
        assert!(matches!(
            episode.observe(PushOutcome::Rejected, 4),
            Some(DaqError::BufferOverrun { dropped: 4 })
        ));
    }
}
