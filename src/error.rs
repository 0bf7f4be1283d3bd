//! Custom error types for the acquisition core.
//!
//! `DaqError` is the single error type returned by the public control surface.
//! Using the `thiserror` crate it gives every failure a typed variant that the
//! presentation layer can match on; the core never formats user-facing text
//! beyond the `Display` impls below.
//!
//! ## Error Hierarchy
//!
//! 1. **Configuration errors** - `Configuration`, `Config`
//!    - Returned synchronously from `configure()`/`start()`
//!    - The attempted state transition is aborted
//!
//! 2. **Hardware errors** - `HardwareUnavailable`, `HardwareFault`, `Timeout`
//!    - `HardwareUnavailable` only occurs when `strict_hardware` is set
//!    - `HardwareFault`/`Timeout` inside the acquisition loop move the session
//!      to `Faulted` and are published on the `error` topic
//!
//! 3. **Non-fatal conditions** - `BufferOverrun`, `NumericalInstability`
//!    - Recorded as counters in session status or as per-bin flags
//!
//! 4. **Control-surface misuse** - `InvalidState`, `SessionNotFound`

use crate::session::{SessionId, SessionState};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Machine-readable error category carried by `error` topic events and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Geometry, rate or channel count incompatible with the backend.
    Configuration,
    /// Requested real backend could not be opened under strict mode.
    HardwareUnavailable,
    /// Runtime read error or disconnect.
    HardwareFault,
    /// Frames were overwritten or rejected because consumers fell behind.
    BufferOverrun,
    /// Ill-conditioned reflection solve at a frequency bin.
    NumericalInstability,
    /// Backend call exceeded its deadline.
    Timeout,
    /// Measured sample rate deviates from nominal beyond tolerance.
    RateDrift,
    /// A bus subscriber callback failed or panicked.
    SubscriberFailure,
    /// Operation not permitted in the current session state.
    InvalidState,
    /// Unknown session id.
    SessionNotFound,
    /// I/O failure outside a backend.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::HardwareUnavailable => "hardware_unavailable",
            ErrorKind::HardwareFault => "hardware_fault",
            ErrorKind::BufferOverrun => "buffer_overrun",
            ErrorKind::NumericalInstability => "numerical_instability",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateDrift => "rate_drift",
            ErrorKind::SubscriberFailure => "subscriber_failure",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Geometry/rate/channel count incompatible with backend capabilities, or
    /// otherwise invalid session configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The requested backend failed to open while `strict_hardware` was set.
    #[error("Hardware '{backend}' unavailable: {reason}")]
    HardwareUnavailable {
        /// Backend identity that was requested.
        backend: String,
        /// Reason reported by the backend.
        reason: String,
    },

    /// Runtime read error or disconnect during acquisition.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// Consumers fell behind and frames were lost.
    #[error("Buffer overrun: {dropped} frames dropped")]
    BufferOverrun {
        /// Total frames lost so far.
        dropped: u64,
    },

    /// Reflection solve is ill-conditioned at the given bin.
    #[error("Numerical instability at {frequency:.4} Hz (condition number {condition:.1})")]
    NumericalInstability {
        /// Bin centre frequency in Hz.
        frequency: f64,
        /// Matrix condition number at that bin.
        condition: f64,
    },

    /// A backend call did not complete within its deadline.
    #[error("Timeout after {after:?} during {operation}")]
    Timeout {
        /// Operation that timed out (e.g. "open", "read_block").
        operation: &'static str,
        /// Deadline that was exceeded.
        after: Duration,
    },

    /// Operation is not valid in the session's current state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// No session with this id is registered.
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Category of this error, used in bus payloads and status snapshots.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => ErrorKind::Configuration,
            DaqError::HardwareUnavailable { .. } => ErrorKind::HardwareUnavailable,
            DaqError::HardwareFault(_) => ErrorKind::HardwareFault,
            DaqError::BufferOverrun { .. } => ErrorKind::BufferOverrun,
            DaqError::NumericalInstability { .. } => ErrorKind::NumericalInstability,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::InvalidState { .. } => ErrorKind::InvalidState,
            DaqError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            DaqError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Cloneable summary of the last error a session hit, kept in its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    /// Error category.
    pub kind: ErrorKind,
    /// Diagnostic message (not intended for end users).
    pub message: String,
}

impl From<&DaqError> for SessionError {
    fn from(err: &DaqError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::HardwareUnavailable {
            backend: "vendor_a".into(),
            reason: "no such port".into(),
        };
        assert_eq!(
            err.to_string(),
            "Hardware 'vendor_a' unavailable: no such port"
        );
    }

    #[test]
    fn test_runtime_error_kinds() {
        let err = DaqError::Timeout {
            operation: "read_block",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Timeout after 250ms during read_block");

        let err = DaqError::BufferOverrun { dropped: 3 };
        assert_eq!(err.kind(), ErrorKind::BufferOverrun);
        assert_eq!(err.to_string(), "Buffer overrun: 3 frames dropped");

        let err = DaqError::NumericalInstability {
            frequency: 1.5,
            condition: 42.0,
        };
        assert_eq!(err.kind(), ErrorKind::NumericalInstability);
        assert_eq!(
            err.to_string(),
            "Numerical instability at 1.5000 Hz (condition number 42.0)"
        );
    }

    #[test]
    fn test_session_error_from_daq_error() {
        let err = DaqError::HardwareFault("probe cable disconnected".into());
        let summary = SessionError::from(&err);
        assert_eq!(summary.kind, ErrorKind::HardwareFault);
        assert!(summary.message.contains("probe cable"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NumericalInstability).unwrap();
        assert_eq!(json, "\"numerical_instability\"");
    }
}
