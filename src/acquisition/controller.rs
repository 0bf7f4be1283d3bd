//! Session control surface.
//!
//! `AcquisitionController` owns the sessions it creates, the bus they publish
//! on, and the spectral/reflection processors whose caches all sessions
//! share. There is no global instance; construct one per application.
//!
//! Each running session has one acquisition loop task and one analysis
//! worker. The controller talks to the loop only through a `watch` command
//! channel, and the loop and worker meet only at the session's
//! `CircularBuffer`.

use crate::acquisition::analysis::AnalysisWorker;
use crate::acquisition::shared::SessionShared;
use crate::acquisition::worker::{AcquisitionLoop, AnalysisHandle, LoopCommand};
use crate::artifact::SessionArtifact;
use crate::bus::SignalBus;
use crate::config::{AppConfig, HardwareConfig, SessionConfig};
use crate::data::fft::SpectralProcessor;
use crate::data::frame::SampleFrame;
use crate::data::reflection::ReflectionAnalyzer;
use crate::data::ring_buffer::CircularBuffer;
use crate::error::{AppResult, DaqError};
use crate::hardware::{BackendFactory, DefaultBackendFactory, HardwareManager};
use crate::session::{AcquisitionSession, SessionId, SessionState, SessionStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

struct SessionRuntime {
    commands: watch::Sender<LoopCommand>,
    task: JoinHandle<()>,
    manager: Arc<HardwareManager>,
    buffer: Arc<CircularBuffer>,
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    /// Present from `start` until the loop has been joined. The lock also
    /// serialises control operations on the session.
    runtime: Mutex<Option<SessionRuntime>>,
}

/// Creates and drives acquisition sessions.
pub struct AcquisitionController {
    hardware: HardwareConfig,
    factory: Arc<dyn BackendFactory>,
    bus: SignalBus,
    spectral: Arc<SpectralProcessor>,
    reflection: Arc<ReflectionAnalyzer>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl AcquisitionController {
    /// Controller using the built-in backends.
    pub fn new(config: &AppConfig) -> Self {
        let factory =
            DefaultBackendFactory::new(config.hardware.clone(), config.simulation.clone());
        Self::with_factory(config, Arc::new(factory))
    }

    /// Controller using a custom backend factory.
    pub fn with_factory(config: &AppConfig, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            hardware: config.hardware.clone(),
            factory,
            bus: SignalBus::new(config.bus.queue_capacity),
            spectral: Arc::new(SpectralProcessor::new()),
            reflection: Arc::new(ReflectionAnalyzer::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Bus every session publishes on.
    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    /// Shared spectral processor (plan cache).
    pub fn spectral_processor(&self) -> &Arc<SpectralProcessor> {
        &self.spectral
    }

    /// Shared reflection analyzer (geometry cache).
    pub fn reflection_analyzer(&self) -> &Arc<ReflectionAnalyzer> {
        &self.reflection
    }

    /// Ids of all registered sessions.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    fn handle(&self, id: SessionId) -> AppResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(DaqError::SessionNotFound(id))
    }

    /// Check a session config, including channel count and rate against the
    /// capabilities the chosen backend advertises.
    fn validate(&self, config: &SessionConfig) -> AppResult<()> {
        config.validate()?;
        self.factory
            .advertised_capabilities(config.backend)
            .negotiate(config.channels, config.sample_rate)
            .map_err(|reason| {
                DaqError::Configuration(format!("{} backend: {}", config.backend, reason))
            })
    }

    /// Register a new session and move it to `Configuring`.
    ///
    /// An invalid config registers nothing.
    #[instrument(skip_all, fields(backend = %config.backend))]
    pub fn configure(&self, config: SessionConfig) -> AppResult<SessionId> {
        if let Err(e) = self.validate(&config) {
            warn!(error = %e, "session configuration rejected");
            return Err(e);
        }
        let session = AcquisitionSession::new(config);
        let id = session.id;
        let shared = Arc::new(SessionShared::new(session, self.bus.clone()));
        self.sessions.write().insert(
            id,
            Arc::new(SessionHandle {
                shared: Arc::clone(&shared),
                runtime: Mutex::new(None),
            }),
        );
        shared.transition("configure", &[SessionState::Idle], SessionState::Configuring)?;
        Ok(id)
    }

    /// Give an `Idle` (reset) session a new config and move it to
    /// `Configuring`.
    pub async fn reconfigure(&self, id: SessionId, config: SessionConfig) -> AppResult<()> {
        let handle = self.handle(id)?;
        let _runtime = handle.runtime.lock().await;
        let state = handle.shared.state();
        if state != SessionState::Idle {
            return Err(DaqError::InvalidState {
                operation: "reconfigure",
                state,
            });
        }
        self.validate(&config)?;
        handle.shared.replace_config(config)?;
        handle
            .shared
            .transition("reconfigure", &[SessionState::Idle], SessionState::Configuring)
    }

    /// Open the backend and begin acquiring.
    ///
    /// On failure the session stays in `Configuring` and the error is kept
    /// as its `last_error`.
    #[instrument(skip(self), fields(session = %id))]
    pub async fn start(&self, id: SessionId) -> AppResult<()> {
        let handle = self.handle(id)?;
        let mut runtime = handle.runtime.lock().await;
        let shared = &handle.shared;
        let state = shared.state();
        if state != SessionState::Configuring {
            return Err(DaqError::InvalidState {
                operation: "start",
                state,
            });
        }

        let session = shared.snapshot();
        let config = session.config;
        let geometry = config.probe_geometry()?;
        let buffer = Arc::new(CircularBuffer::new(config.buffer_config())?);
        let manager = Arc::new(HardwareManager::new(
            Arc::clone(&self.factory),
            self.hardware.clone(),
        ));

        let connection = match manager.connect(&config).await {
            Ok(connection) => connection,
            Err(e) => {
                shared.record_error(&e);
                return Err(e);
            }
        };
        if let Err(e) = manager
            .negotiate_and_start(&session.channels, config.sample_rate)
            .await
        {
            if let Err(release_err) = manager.release().await {
                warn!(error = %release_err, "backend release after failed start");
            }
            shared.record_error(&e);
            return Err(e);
        }
        let self_paced = manager.capabilities().is_some_and(|c| c.self_paced);

        shared.begin_run(&connection);
        shared.transition("start", &[SessionState::Configuring], SessionState::Running)?;

        let stop = Arc::new(AtomicBool::new(false));
        let analysis = AnalysisWorker {
            shared: Arc::clone(shared),
            buffer: Arc::clone(&buffer),
            stop: Arc::clone(&stop),
            spectral: Arc::clone(&self.spectral),
            reflection: Arc::clone(&self.reflection),
            config: config.clone(),
            geometry,
        }
        .spawn();

        let (commands, receiver) = watch::channel(LoopCommand::Run);
        let task = AcquisitionLoop {
            shared: Arc::clone(shared),
            manager: Arc::clone(&manager),
            buffer: Arc::clone(&buffer),
            commands: receiver,
            analysis: AnalysisHandle {
                stop,
                task: analysis,
            },
            self_paced,
        }
        .spawn();

        *runtime = Some(SessionRuntime {
            commands,
            task,
            manager,
            buffer,
        });
        info!(
            channels = config.channels,
            sample_rate = config.sample_rate,
            simulated = connection.simulated,
            "acquisition started"
        );
        Ok(())
    }

    /// Suspend a running session. The buffer and counters are kept.
    pub async fn pause(&self, id: SessionId) -> AppResult<()> {
        let handle = self.handle(id)?;
        let runtime = handle.runtime.lock().await;
        handle
            .shared
            .transition("pause", &[SessionState::Running], SessionState::Paused)?;
        if let Some(runtime) = runtime.as_ref() {
            runtime.commands.send_replace(LoopCommand::Pause);
        }
        Ok(())
    }

    /// Continue a paused session.
    pub async fn resume(&self, id: SessionId) -> AppResult<()> {
        let handle = self.handle(id)?;
        let runtime = handle.runtime.lock().await;
        handle
            .shared
            .transition("resume", &[SessionState::Paused], SessionState::Running)?;
        if let Some(runtime) = runtime.as_ref() {
            runtime.commands.send_replace(LoopCommand::Run);
        }
        Ok(())
    }

    /// Stop acquiring, drain the analysis worker and close the backend.
    ///
    /// Stopping a session that already stopped on its own (requested
    /// duration reached) is not an error. If the loop does not finish within
    /// the stop timeout this returns `Timeout`; the session completes the
    /// stop in the background.
    #[instrument(skip(self), fields(session = %id))]
    pub async fn stop(&self, id: SessionId) -> AppResult<()> {
        let handle = self.handle(id)?;
        let mut runtime = handle.runtime.lock().await;
        let shared = &handle.shared;
        shared.begin_stop()?;

        let Some(mut current) = runtime.take() else {
            shared.finish_stopped();
            return Ok(());
        };
        current.commands.send_replace(LoopCommand::Stop);
        let after = self.hardware.stop_timeout();
        match tokio::time::timeout(after, &mut current.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "acquisition loop panicked");
                if let Err(e) = current.manager.release().await {
                    warn!(error = %e, "backend release failed");
                }
                shared.finish_stopped();
            }
            Err(_) => {
                *runtime = Some(current);
                return Err(DaqError::Timeout {
                    operation: "stop",
                    after,
                });
            }
        }
        info!(frames = shared.frames_acquired(), "acquisition stopped");
        Ok(())
    }

    /// Return a `Stopped` or `Faulted` session to `Idle`.
    pub async fn reset(&self, id: SessionId) -> AppResult<()> {
        let handle = self.handle(id)?;
        let mut runtime = handle.runtime.lock().await;
        let state = handle.shared.state();
        if !state.is_resettable() {
            return Err(DaqError::InvalidState {
                operation: "reset",
                state,
            });
        }
        if let Some(mut current) = runtime.take() {
            let after = self.hardware.stop_timeout();
            if tokio::time::timeout(after, &mut current.task).await.is_err() {
                *runtime = Some(current);
                return Err(DaqError::Timeout {
                    operation: "reset",
                    after,
                });
            }
        }
        handle.shared.reset()
    }

    /// Newest `n` frames still waiting in the session buffer, oldest first,
    /// without consuming them. Empty unless the session is `Running` or
    /// `Paused`.
    pub async fn peek_latest(&self, id: SessionId, n: usize) -> AppResult<Vec<Arc<SampleFrame>>> {
        let handle = self.handle(id)?;
        let runtime = handle.runtime.lock().await;
        if !matches!(
            handle.shared.state(),
            SessionState::Running | SessionState::Paused
        ) {
            return Ok(Vec::new());
        }
        Ok(runtime
            .as_ref()
            .map(|current| current.buffer.peek_latest(n))
            .unwrap_or_default())
    }

    /// Status snapshot.
    pub fn get_status(&self, id: SessionId) -> AppResult<SessionStatus> {
        Ok(self.handle(id)?.shared.status())
    }

    /// Hand over what the session recorded. Frames are moved out; a second
    /// call returns only what was recorded since.
    pub fn take_artifact(&self, id: SessionId) -> AppResult<SessionArtifact> {
        let handle = self.handle(id)?;
        let shared = &handle.shared;
        let session = shared.snapshot();
        if !matches!(session.state, SessionState::Stopped | SessionState::Faulted) {
            return Err(DaqError::InvalidState {
                operation: "take_artifact",
                state: session.state,
            });
        }
        let recording = shared.recorder().take();
        Ok(SessionArtifact {
            session_id: id,
            geometry: session.config.probe_geometry().ok().flatten(),
            backend: session.backend,
            simulated: session.simulated,
            state: session.state,
            nominal_rate: session.config.sample_rate,
            actual_rate: shared.actual_rate(),
            frames_acquired: shared.frames_acquired(),
            dropped_frame_count: shared.dropped_frames(),
            started_at: session.started_at,
            ended_at: session.ended_at,
            config: session.config,
            recording,
        })
    }

    /// Stop every active session and close all bus subscribers.
    pub async fn shutdown(&self) {
        for id in self.sessions() {
            let active = self
                .get_status(id)
                .map(|s| s.state.is_active())
                .unwrap_or(false);
            if active {
                if let Err(e) = self.stop(id).await {
                    warn!(session = %id, error = %e, "stop during shutdown failed");
                }
            }
        }
        self.bus.shutdown();
    }
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("sessions", &self.sessions.read().len())
            .field("bus", &self.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hardware::vendor_a::vendor_a_capabilities;
    use crate::hardware::{
        BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
        HardwareBackend,
    };
    use async_trait::async_trait;

    fn controller() -> AcquisitionController {
        AcquisitionController::new(&AppConfig::default())
    }

    #[tokio::test]
    async fn test_invalid_config_registers_nothing() {
        let controller = controller();
        let config = SessionConfig {
            sample_rate: 33.3,
            ..SessionConfig::default()
        };
        let err = controller.configure(config).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(controller.sessions().is_empty());

        let config = SessionConfig {
            channels: 2,
            ..SessionConfig::default()
        };
        assert!(controller.configure(config).is_err(), "4 probes on 2 channels");
    }

    #[tokio::test]
    async fn test_capabilities_checked_at_configure() {
        let controller = controller();
        let config = SessionConfig {
            backend: BackendKind::VendorA,
            channels: 12,
            probe_positions: vec![],
            ..SessionConfig::default()
        };
        assert!(matches!(
            controller.configure(config),
            Err(DaqError::Configuration(msg)) if msg.contains("vendor_a")
        ));
    }

    #[tokio::test]
    async fn test_operations_require_proper_state() {
        let controller = controller();
        let id = controller.configure(SessionConfig::default()).unwrap();
        assert!(matches!(
            controller.pause(id).await,
            Err(DaqError::InvalidState { operation: "pause", .. })
        ));
        assert!(matches!(
            controller.reset(id).await,
            Err(DaqError::InvalidState { operation: "reset", .. })
        ));
        assert!(matches!(
            controller.get_status(SessionId::new()),
            Err(DaqError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_from_configuring_and_reconfigure() {
        let controller = controller();
        let id = controller.configure(SessionConfig::default()).unwrap();
        controller.stop(id).await.unwrap();
        assert_eq!(controller.get_status(id).unwrap().state, SessionState::Stopped);

        assert!(controller
            .reconfigure(id, SessionConfig::default())
            .await
            .is_err());
        controller.reset(id).await.unwrap();
        let config = SessionConfig {
            channels: 3,
            probe_positions: vec![0.0, 0.4, 0.9],
            ..SessionConfig::default()
        };
        controller.reconfigure(id, config).await.unwrap();
        assert_eq!(
            controller.get_status(id).unwrap().state,
            SessionState::Configuring
        );
    }

    struct UnresponsiveBackend;

    #[async_trait]
    impl HardwareBackend for UnresponsiveBackend {
        fn descriptor(&self) -> BackendDescriptor {
            BackendDescriptor {
                kind: BackendKind::VendorA,
                model: "never answers".into(),
                capabilities: vendor_a_capabilities(),
                status: ConnectionStatus::Disconnected,
            }
        }
        async fn open(&mut self) -> Result<(), BackendError> {
            std::future::pending().await
        }
        async fn configure(&mut self, _: &[u32], _: f64) -> Result<(), BackendError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn read_block(&mut self, _: usize) -> Result<Vec<Vec<f64>>, BackendError> {
            Ok(Vec::new())
        }
        async fn stop(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct UnresponsiveFactory;

    impl BackendFactory for UnresponsiveFactory {
        fn advertised_capabilities(&self, _: BackendKind) -> BackendCapabilities {
            vendor_a_capabilities()
        }
        fn create(&self, _: BackendKind, _: &SessionConfig) -> Box<dyn HardwareBackend> {
            Box::new(UnresponsiveBackend)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_open_timeout_is_hardware_unavailable() {
        let mut config = AppConfig::default();
        config.hardware.open_timeout_ms = 50;
        let controller = AcquisitionController::with_factory(&config, Arc::new(UnresponsiveFactory));
        let id = controller
            .configure(SessionConfig {
                backend: BackendKind::VendorA,
                strict_hardware: true,
                ..SessionConfig::default()
            })
            .unwrap();

        let err = controller.start(id).await.unwrap_err();
        assert!(
            matches!(
                &err,
                DaqError::HardwareUnavailable { backend, reason }
                    if backend == "vendor_a" && reason.contains("timed out")
            ),
            "unexpected error: {}",
            err
        );
        let status = controller.get_status(id).unwrap();
        assert_eq!(status.state, SessionState::Configuring);
        assert!(!status.simulated);
        assert_eq!(
            status.last_error.unwrap().kind,
            ErrorKind::HardwareUnavailable
        );
        assert!(controller.peek_latest(id, 4).await.unwrap().is_empty());
    }
}
