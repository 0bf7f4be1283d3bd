//! In-memory record of a session for downstream export.
//!
//! The analysis worker feeds an [`ArtifactRecorder`] as it consumes frames;
//! `AcquisitionController::take_artifact` packages the recording with the
//! session metadata into a [`SessionArtifact`]. Writing it anywhere is up to
//! the caller.

use crate::config::SessionConfig;
use crate::data::fft::SpectralResult;
use crate::data::frame::SampleFrame;
use crate::data::reflection::{ProbeGeometry, ReflectionResult};
use crate::hardware::BackendDescriptor;
use crate::session::{SessionId, SessionState};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Frames and latest results captured during a session.
#[derive(Debug, Default)]
pub struct ArtifactRecorder {
    limit: usize,
    frames: Vec<Arc<SampleFrame>>,
    frames_not_recorded: u64,
    spectral: Option<Arc<SpectralResult>>,
    reflection: Option<Arc<ReflectionResult>>,
    analysis_blocks: u64,
}

impl ArtifactRecorder {
    /// Recorder keeping at most `limit` frames (the first ones consumed).
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Keep `frame` if there is room.
    pub fn record_frame(&mut self, frame: Arc<SampleFrame>) {
        if self.frames.len() < self.limit {
            self.frames.push(frame);
        } else {
            self.frames_not_recorded += 1;
        }
    }

    /// Latest spectra.
    pub fn record_spectral(&mut self, result: Arc<SpectralResult>) {
        self.spectral = Some(result);
        self.analysis_blocks += 1;
    }

    /// Latest reflection analysis.
    pub fn record_reflection(&mut self, result: Arc<ReflectionResult>) {
        self.reflection = Some(result);
    }

    /// Frames recorded so far.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Analysis blocks processed so far.
    pub fn analysis_blocks(&self) -> u64 {
        self.analysis_blocks
    }

    /// Move the recording out, leaving an empty recorder with the same limit.
    pub fn take(&mut self) -> Recording {
        let taken = std::mem::replace(self, Self::new(self.limit));
        Recording {
            frames: taken.frames,
            frames_not_recorded: taken.frames_not_recorded,
            spectral: taken.spectral,
            reflection: taken.reflection,
            analysis_blocks: taken.analysis_blocks,
        }
    }
}

/// What an [`ArtifactRecorder`] captured.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    /// Frames in consumption order
    pub frames: Vec<Arc<SampleFrame>>,
    /// Frames consumed after the limit was reached
    pub frames_not_recorded: u64,
    /// Latest spectra
    pub spectral: Option<Arc<SpectralResult>>,
    /// Latest reflection analysis
    pub reflection: Option<Arc<ReflectionResult>>,
    /// Analysis blocks processed
    pub analysis_blocks: u64,
}

/// Everything an export or report needs about one session.
#[derive(Debug, Clone)]
pub struct SessionArtifact {
    /// Session identity
    pub session_id: SessionId,
    /// Configuration the session ran with
    pub config: SessionConfig,
    /// Probe geometry used for reflection analysis
    pub geometry: Option<ProbeGeometry>,
    /// Backend the data came from
    pub backend: Option<BackendDescriptor>,
    /// Data is synthetic
    pub simulated: bool,
    /// State when the artifact was taken
    pub state: SessionState,
    /// Requested rate in Hz
    pub nominal_rate: f64,
    /// Measured rate in Hz
    pub actual_rate: f64,
    /// Frames read from the backend
    pub frames_acquired: u64,
    /// Frames lost to buffer overrun
    pub dropped_frame_count: u64,
    /// Acquisition start
    pub started_at: Option<DateTime<Utc>>,
    /// Acquisition end
    pub ended_at: Option<DateTime<Utc>>,
    /// Recorded frames and results
    pub recording: Recording,
}
