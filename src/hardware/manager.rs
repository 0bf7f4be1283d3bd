//! Backend lifecycle with fail-closed fallback.
//!
//! ```text
//! Unconfigured ──connect──▶ Probing ──open ok──▶ Connected(kind)
//!       ▲                      │                       │
//!       │        strict & open fails                   │ report_fault
//!       ├──────────────────────┤                       ▼
//!       │                      └─ non-strict ──▶ Fallback ──▶ Faulted
//!       └──────────────── release ◀────────────────────────────┘
//! ```
//!
//! Under `strict_hardware` a failed open is an error and nothing is
//! substituted. Without it the manager opens the simulated backend instead
//! and reports the session as simulated.
//!
//! Every backend call is bounded by the deadlines in [`HardwareConfig`].

use crate::config::{HardwareConfig, SessionConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::backend::{
    BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
    HardwareBackend,
};
use crate::hardware::factory::BackendFactory;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    /// No backend held
    Unconfigured,
    /// Opening the requested backend
    Probing,
    /// Requested backend open
    Connected(BackendKind),
    /// Requested backend failed; simulated backend open instead
    Fallback,
    /// Backend reported an unrecoverable error
    Faulted,
}

/// Outcome of a successful [`HardwareManager::connect`].
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Backend actually in use
    pub descriptor: BackendDescriptor,
    /// Data is synthetic (simulated backend requested or fallen back to)
    pub simulated: bool,
}

/// Owns the backend of one session.
pub struct HardwareManager {
    factory: Arc<dyn BackendFactory>,
    timeouts: HardwareConfig,
    state: RwLock<ManagerState>,
    descriptor: RwLock<Option<BackendDescriptor>>,
    backend: Mutex<Option<Box<dyn HardwareBackend>>>,
}

async fn bounded<T, F>(operation: &'static str, after: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(DaqError::from),
        Err(_) => Err(DaqError::Timeout { operation, after }),
    }
}

impl HardwareManager {
    /// Manager building backends with `factory`, bounded by `timeouts`.
    pub fn new(factory: Arc<dyn BackendFactory>, timeouts: HardwareConfig) -> Self {
        Self {
            factory,
            timeouts,
            state: RwLock::new(ManagerState::Unconfigured),
            descriptor: RwLock::new(None),
            backend: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    /// Descriptor of the held backend.
    pub fn descriptor(&self) -> Option<BackendDescriptor> {
        self.descriptor.read().clone()
    }

    /// Capabilities of the held backend.
    pub fn capabilities(&self) -> Option<BackendCapabilities> {
        self.descriptor.read().as_ref().map(|d| d.capabilities.clone())
    }

    /// Whether the held backend is the simulated one.
    pub fn is_simulated(&self) -> bool {
        self.descriptor
            .read()
            .as_ref()
            .is_some_and(|d| d.kind == BackendKind::Simulated)
    }

    fn set_state(&self, state: ManagerState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "hardware manager transition");
            *current = state;
        }
    }

    async fn open(
        &self,
        kind: BackendKind,
        session: &SessionConfig,
    ) -> AppResult<Box<dyn HardwareBackend>> {
        let mut backend = self.factory.create(kind, session);
        bounded("open", self.timeouts.open_timeout(), backend.open()).await?;
        Ok(backend)
    }

    async fn install(&self, backend: Box<dyn HardwareBackend>, state: ManagerState) -> Connection {
        let descriptor = backend.descriptor();
        *self.descriptor.write() = Some(descriptor.clone());
        *self.backend.lock().await = Some(backend);
        self.set_state(state);
        Connection {
            simulated: descriptor.kind == BackendKind::Simulated,
            descriptor,
        }
    }

    /// Open the backend the session asks for, falling back to the simulated
    /// backend when allowed.
    ///
    /// Strict mode: an open failure, timeouts included, is
    /// `HardwareUnavailable` and the manager returns to `Unconfigured`.
    pub async fn connect(&self, session: &SessionConfig) -> AppResult<Connection> {
        if self.backend.lock().await.is_some() {
            return Err(DaqError::Configuration(
                "hardware manager already holds a backend".into(),
            ));
        }
        let kind = session.backend;
        self.set_state(ManagerState::Probing);
        info!(backend = %kind, strict = session.strict_hardware, "opening backend");

        let err = match self.open(kind, session).await {
            Ok(backend) => return Ok(self.install(backend, ManagerState::Connected(kind)).await),
            Err(err) => err,
        };

        if session.strict_hardware || kind == BackendKind::Simulated {
            self.set_state(ManagerState::Unconfigured);
            error!(backend = %kind, error = %err, "backend unavailable");
            let reason = match err {
                DaqError::Timeout { after, .. } => format!("open timed out after {:?}", after),
                other => other.to_string(),
            };
            return Err(DaqError::HardwareUnavailable {
                backend: kind.to_string(),
                reason,
            });
        }

        warn!(
            backend = %kind,
            error = %err,
            "backend unavailable, falling back to simulated data"
        );
        match self.open(BackendKind::Simulated, session).await {
            Ok(backend) => Ok(self.install(backend, ManagerState::Fallback).await),
            Err(fallback_err) => {
                self.set_state(ManagerState::Unconfigured);
                Err(DaqError::HardwareUnavailable {
                    backend: kind.to_string(),
                    reason: format!("{}; simulated fallback failed: {}", err, fallback_err),
                })
            }
        }
    }

    /// Validate channels and rate against the open backend, then configure
    /// and start streaming.
    pub async fn negotiate_and_start(&self, channels: &[u32], sample_rate: f64) -> AppResult<()> {
        let mut guard = self.backend.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| DaqError::Configuration("no backend connected".into()))?;
        backend
            .capabilities()
            .negotiate(channels.len() as u32, sample_rate)
            .map_err(DaqError::Configuration)?;
        let deadline = self.timeouts.open_timeout();
        bounded("configure", deadline, backend.configure(channels, sample_rate)).await?;
        bounded("start", deadline, backend.start()).await?;
        *self.descriptor.write() = Some(backend.descriptor());
        info!(channels = channels.len(), sample_rate, "backend streaming");
        Ok(())
    }

    /// Read one block within the read deadline. A failure moves the manager
    /// to `Faulted`.
    pub async fn read_block(&self, samples_per_channel: usize) -> AppResult<Vec<Vec<f64>>> {
        let mut guard = self.backend.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| DaqError::HardwareFault("no backend connected".into()))?;
        let result = bounded(
            "read_block",
            self.timeouts.read_timeout(),
            backend.read_block(samples_per_channel),
        )
        .await;
        if let Err(err) = &result {
            *self.descriptor.write() = Some(backend.descriptor());
            drop(guard);
            self.report_fault(err);
        }
        result
    }

    /// Suspend the stream. Returns `true` when the backend paused in
    /// hardware; otherwise partial scans are discarded and the caller simply
    /// stops reading.
    pub async fn pause(&self) -> AppResult<bool> {
        let mut guard = self.backend.lock().await;
        let Some(backend) = guard.as_mut() else {
            return Ok(false);
        };
        if backend.capabilities().supports_pause {
            bounded("pause", self.timeouts.read_timeout(), backend.pause()).await?;
            Ok(true)
        } else {
            backend.discard_pending();
            Ok(false)
        }
    }

    /// Undo [`pause`](Self::pause).
    pub async fn resume(&self) -> AppResult<()> {
        let mut guard = self.backend.lock().await;
        let Some(backend) = guard.as_mut() else {
            return Ok(());
        };
        if backend.capabilities().supports_pause {
            bounded("resume", self.timeouts.read_timeout(), backend.resume()).await?;
        } else {
            backend.discard_pending();
        }
        Ok(())
    }

    /// Record an unrecoverable backend error.
    pub fn report_fault(&self, err: &DaqError) {
        error!(error = %err, "backend fault");
        self.set_state(ManagerState::Faulted);
    }

    /// Stop and close the backend within the close deadline, then drop it.
    /// The manager is `Unconfigured` afterwards even if closing failed.
    pub async fn release(&self) -> AppResult<()> {
        let taken = self.backend.lock().await.take();
        let result = match taken {
            Some(mut backend) => {
                let close = async {
                    if let Err(e) = backend.stop().await {
                        warn!(error = %e, "backend stop failed");
                    }
                    backend.close().await
                };
                bounded("close", self.timeouts.close_timeout(), close).await
            }
            None => Ok(()),
        };
        if let Some(descriptor) = self.descriptor.write().as_mut() {
            descriptor.status = ConnectionStatus::Disconnected;
        }
        self.set_state(ManagerState::Unconfigured);
        result
    }
}

impl std::fmt::Debug for HardwareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareManager")
            .field("state", &self.state())
            .field("descriptor", &self.descriptor())
            .finish()
    }
}
