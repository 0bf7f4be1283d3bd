//! Acquisition session identity, state and status snapshots.
//!
//! A session is created by `AcquisitionController::configure` and lives until
//! the controller drops it. Its state follows
//!
//! ```text
//!  Idle ──configure──▶ Configuring ──start──▶ Running ◀──resume── Paused
//!   ▲                      │                    │  └──pause──────▶  │
//!   │                      └────────stop────────┼──────────────────┤
//!   │                                           ▼                  ▼
//!   ├───────reset──────── Stopped ◀────── Stopping ◀───────────────┘
//!   └───────reset──────── Faulted ◀── backend fault / timeout while Running
//! ```

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::hardware::BackendDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not configured (initial state, and after `reset`).
    Idle,
    /// Configuration accepted; backend not yet opened.
    Configuring,
    /// Acquisition loop reading blocks.
    Running,
    /// Loop suspended; buffer retained.
    Paused,
    /// Stop requested; draining and closing.
    Stopping,
    /// Stopped cleanly.
    Stopped,
    /// Unrecoverable backend error. Requires `reset`.
    Faulted,
}

impl SessionState {
    /// States from which `stop()` is accepted.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Configuring | SessionState::Running | SessionState::Paused
        )
    }

    /// States from which `reset()` is accepted.
    pub fn is_resettable(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Faulted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Faulted => "faulted",
        };
        write!(f, "{}", label)
    }
}

/// Record of one acquisition session.
#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    /// Session identity.
    pub id: SessionId,
    /// Channel indices acquired, in payload order.
    pub channels: Vec<u32>,
    /// Validated configuration.
    pub config: SessionConfig,
    /// Current state.
    pub state: SessionState,
    /// Set when acquisition started.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when acquisition stopped or faulted.
    pub ended_at: Option<DateTime<Utc>>,
    /// Most recent error, if any.
    pub last_error: Option<SessionError>,
    /// True when data comes from the simulated backend.
    pub simulated: bool,
    /// Backend the session is bound to, once started.
    pub backend: Option<BackendDescriptor>,
}

impl AcquisitionSession {
    /// Create a session in `Idle` for an already-validated config.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            channels: (0..config.channels).collect(),
            config,
            state: SessionState::Idle,
            started_at: None,
            ended_at: None,
            last_error: None,
            simulated: false,
            backend: None,
        }
    }
}

/// Point-in-time status returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Session identity.
    pub id: SessionId,
    /// Current state.
    pub state: SessionState,
    /// True when the simulated backend is in use.
    pub simulated: bool,
    /// Requested sample rate (Hz per channel).
    pub nominal_rate: f64,
    /// Measured sample rate over running time (Hz per channel).
    pub actual_rate: f64,
    /// Frames lost to buffer overwrite/reject.
    pub dropped_frame_count: u64,
    /// Frames read from the backend.
    pub frames_acquired: u64,
    /// Most recent error.
    pub last_error: Option<SessionError>,
    /// Bound backend.
    pub backend: Option<BackendDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Paused.is_active());
        assert!(SessionState::Configuring.is_active());
        assert!(!SessionState::Faulted.is_active());
        assert!(SessionState::Faulted.is_resettable());
        assert!(!SessionState::Running.is_resettable());
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
