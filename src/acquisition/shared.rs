//! Session record shared by the controller, the acquisition loop and the
//! analysis worker.
//!
//! All state transitions go through here so that each one is checked against
//! the current state under a single lock and announced on
//! `session-state-changed` exactly once.

use crate::artifact::ArtifactRecorder;
use crate::bus::{BusEvent, ErrorEvent, SignalBus, StateChange};
use crate::config::SessionConfig;
use crate::error::{AppResult, DaqError, SessionError};
use crate::hardware::{BackendDescriptor, Connection};
use crate::session::{AcquisitionSession, SessionId, SessionState, SessionStatus};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

pub(crate) struct SessionShared {
    id: SessionId,
    session: RwLock<AcquisitionSession>,
    bus: SignalBus,
    frames_acquired: AtomicU64,
    dropped_frames: AtomicU64,
    actual_rate_bits: AtomicU64,
    recorder: Mutex<ArtifactRecorder>,
}

impl SessionShared {
    pub(crate) fn new(session: AcquisitionSession, bus: SignalBus) -> Self {
        let limit = session.config.record_frames;
        Self {
            id: session.id,
            session: RwLock::new(session),
            bus,
            frames_acquired: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            actual_rate_bits: AtomicU64::new(0f64.to_bits()),
            recorder: Mutex::new(ArtifactRecorder::new(limit)),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub(crate) fn state(&self) -> SessionState {
        self.session.read().state
    }

    pub(crate) fn config(&self) -> SessionConfig {
        self.session.read().config.clone()
    }

    pub(crate) fn snapshot(&self) -> AcquisitionSession {
        self.session.read().clone()
    }

    pub(crate) fn recorder(&self) -> MutexGuard<'_, ArtifactRecorder> {
        self.recorder.lock()
    }

    fn announce(&self, old_state: SessionState, new_state: SessionState) {
        info!(session = %self.id, from = %old_state, to = %new_state, "session state changed");
        self.bus.publish(BusEvent::SessionStateChanged(StateChange {
            session_id: self.id,
            old_state,
            new_state,
        }));
    }

    /// Move to `to` if the current state is one of `allowed`.
    pub(crate) fn transition(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
        to: SessionState,
    ) -> AppResult<()> {
        let from = {
            let mut session = self.session.write();
            if !allowed.contains(&session.state) {
                return Err(DaqError::InvalidState {
                    operation,
                    state: session.state,
                });
            }
            let from = session.state;
            session.state = to;
            if matches!(to, SessionState::Stopped | SessionState::Faulted) {
                session.ended_at = Some(Utc::now());
            }
            from
        };
        self.announce(from, to);
        Ok(())
    }

    /// Enter `Stopping` unless the session is already stopping or stopped.
    pub(crate) fn begin_stop(&self) -> AppResult<()> {
        match self.transition(
            "stop",
            &[
                SessionState::Configuring,
                SessionState::Running,
                SessionState::Paused,
            ],
            SessionState::Stopping,
        ) {
            Err(DaqError::InvalidState {
                state: SessionState::Stopping | SessionState::Stopped,
                ..
            }) => Ok(()),
            other => other,
        }
    }

    /// Complete a stop. A session that faulted meanwhile stays `Faulted`.
    pub(crate) fn finish_stopped(&self) {
        if let Err(e) = self.transition(
            "stop",
            &[SessionState::Running, SessionState::Paused],
            SessionState::Stopping,
        ) {
            debug!(session = %self.id, error = %e, "session already left acquisition");
        }
        if let Err(e) = self.transition("stop", &[SessionState::Stopping], SessionState::Stopped) {
            debug!(session = %self.id, error = %e, "stop not completed");
        }
    }

    /// Record an unrecoverable error and move to `Faulted`. Returns `false`
    /// when the session was not acquiring.
    pub(crate) fn fault(&self, err: &DaqError) -> bool {
        let faulted = {
            let mut session = self.session.write();
            if matches!(
                session.state,
                SessionState::Running | SessionState::Paused | SessionState::Stopping
            ) {
                session.last_error = Some(SessionError::from(err));
                Some(session.state)
            } else {
                None
            }
        };
        let Some(from) = faulted else {
            return false;
        };
        error!(session = %self.id, error = %err, "acquisition faulted");
        if self
            .transition("fault", &[from], SessionState::Faulted)
            .is_ok()
        {
            self.publish_error(ErrorEvent::from_error(err, Some(self.id)));
        }
        true
    }

    /// Keep `err` as the session's last error without changing state.
    pub(crate) fn record_error(&self, err: &DaqError) {
        self.session.write().last_error = Some(SessionError::from(err));
    }

    pub(crate) fn publish_error(&self, event: ErrorEvent) {
        self.bus.publish(BusEvent::Error(event));
    }

    /// Bind the session to the backend it is about to run on.
    pub(crate) fn begin_run(&self, connection: &Connection) {
        let record_frames = {
            let mut session = self.session.write();
            session.simulated = connection.simulated;
            session.backend = Some(connection.descriptor.clone());
            session.started_at = Some(Utc::now());
            session.ended_at = None;
            session.last_error = None;
            session.config.record_frames
        };
        self.reset_counters();
        *self.recorder.lock() = ArtifactRecorder::new(record_frames);
    }

    pub(crate) fn set_backend(&self, descriptor: Option<BackendDescriptor>) {
        if descriptor.is_some() {
            self.session.write().backend = descriptor;
        }
    }

    /// Replace the configuration of an `Idle` session.
    pub(crate) fn replace_config(&self, config: SessionConfig) -> AppResult<()> {
        let mut session = self.session.write();
        if session.state != SessionState::Idle {
            return Err(DaqError::InvalidState {
                operation: "reconfigure",
                state: session.state,
            });
        }
        session.channels = (0..config.channels).collect();
        session.config = config;
        Ok(())
    }

    /// Back to `Idle`, forgetting the previous run.
    pub(crate) fn reset(&self) -> AppResult<()> {
        self.transition(
            "reset",
            &[SessionState::Stopped, SessionState::Faulted],
            SessionState::Idle,
        )?;
        let record_frames = {
            let mut session = self.session.write();
            session.started_at = None;
            session.ended_at = None;
            session.last_error = None;
            session.simulated = false;
            session.backend = None;
            session.config.record_frames
        };
        self.reset_counters();
        *self.recorder.lock() = ArtifactRecorder::new(record_frames);
        Ok(())
    }

    fn reset_counters(&self) {
        self.frames_acquired.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.actual_rate_bits.store(0f64.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self, dropped_total: u64, actual_rate: f64) {
        self.frames_acquired.fetch_add(1, Ordering::Relaxed);
        self.dropped_frames.store(dropped_total, Ordering::Relaxed);
        self.actual_rate_bits
            .store(actual_rate.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn frames_acquired(&self) -> u64 {
        self.frames_acquired.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn actual_rate(&self) -> f64 {
        f64::from_bits(self.actual_rate_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let session = self.session.read();
        SessionStatus {
            id: session.id,
            state: session.state,
            simulated: session.simulated,
            nominal_rate: session.config.sample_rate,
            actual_rate: self.actual_rate(),
            dropped_frame_count: self.dropped_frames(),
            frames_acquired: self.frames_acquired(),
            last_error: session.last_error.clone(),
            backend: session.backend.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use std::sync::mpsc;
    use std::time::Duration;

    fn shared_with_listener() -> (SessionShared, mpsc::Receiver<StateChange>) {
        let bus = SignalBus::new(64);
        let (tx, rx) = mpsc::channel();
        bus.subscribe(
            Topic::SessionStateChanged,
            "states",
            move |event| {
                if let BusEvent::SessionStateChanged(change) = event {
                    tx.send(*change)?;
                }
                Ok(())
            },
        )
        .unwrap();
        let session = AcquisitionSession::new(SessionConfig::default());
        (SessionShared::new(session, bus), rx)
    }

    #[test]
    fn test_transition_checks_and_announces() {
        let (shared, rx) = shared_with_listener();
        shared
            .transition("configure", &[SessionState::Idle], SessionState::Configuring)
            .unwrap();
        let err = shared
            .transition("pause", &[SessionState::Running], SessionState::Paused)
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::InvalidState {
                operation: "pause",
                state: SessionState::Configuring
            }
        ));
        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change.old_state, SessionState::Idle);
        assert_eq!(change.new_state, SessionState::Configuring);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_fault_only_while_acquiring() {
        let (shared, _rx) = shared_with_listener();
        let err = DaqError::HardwareFault("cable".into());
        assert!(!shared.fault(&err));
        assert_eq!(shared.state(), SessionState::Idle);

        shared
            .transition("start", &[SessionState::Idle], SessionState::Running)
            .unwrap();
        assert!(shared.fault(&err));
        let status = shared.status();
        assert_eq!(status.state, SessionState::Faulted);
        assert!(status.last_error.is_some());
        assert!(shared.snapshot().ended_at.is_some());
    }

    #[test]
    fn test_begin_stop_is_idempotent() {
        let (shared, _rx) = shared_with_listener();
        assert!(shared.begin_stop().is_err());
        shared
            .transition("configure", &[SessionState::Idle], SessionState::Configuring)
            .unwrap();
        shared.begin_stop().unwrap();
        shared.begin_stop().unwrap();
        shared.finish_stopped();
        assert_eq!(shared.state(), SessionState::Stopped);
        shared.begin_stop().unwrap();
        shared.reset().unwrap();
        assert_eq!(shared.state(), SessionState::Idle);
    }

    #[test]
    fn test_finish_stopped_keeps_fault() {
        let (shared, rx) = shared_with_listener();
        shared
            .transition("start", &[SessionState::Idle], SessionState::Running)
            .unwrap();
        assert!(shared.fault(&DaqError::HardwareFault("cable".into())));
        shared.finish_stopped();
        assert_eq!(shared.state(), SessionState::Faulted);

        let changes: Vec<StateChange> = rx.iter().take(2).collect();
        assert_eq!(changes[1].new_state, SessionState::Faulted);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_finish_stopped_from_running() {
        let (shared, _rx) = shared_with_listener();
        shared
            .transition("start", &[SessionState::Idle], SessionState::Running)
            .unwrap();
        shared.finish_stopped();
        assert_eq!(shared.state(), SessionState::Stopped);
        assert!(shared.snapshot().ended_at.is_some());
    }
}
