//! Backend capability trait and descriptors.
//!
//! Every acquisition source implements [`HardwareBackend`]. The contract is
//! deliberately small:
//!
//! - `open` connects and learns the device's capabilities
//! - `configure` selects channels and sample rate (validated by the caller
//!   against [`BackendCapabilities`] first)
//! - `start`/`stop` bracket streaming
//! - `read_block` returns exactly `samples_per_channel` samples for every
//!   configured channel, or an error
//! - `close` releases the transport
//!
//! Backends are driven by a single owner (the `HardwareManager`), hence the
//! `&mut self` receivers and the `Send`-only bound.

use crate::error::DaqError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Explicit backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Synthetic wave field, always available
    #[default]
    Simulated,
    /// Serial wave-gauge controller (ASCII line protocol)
    VendorA,
    /// Networked amplifier (TCP, binary scans)
    VendorB,
}

impl BackendKind {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Simulated => "simulated",
            BackendKind::VendorA => "vendor_a",
            BackendKind::VendorB => "vendor_b",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Highest channel count
    pub max_channels: u32,
    /// Accepted per-channel sample rates in Hz
    pub supported_rates: Vec<f64>,
    /// Hardware pause/resume without losing stream position
    pub supports_pause: bool,
    /// `read_block` blocks until the device has produced the data
    pub self_paced: bool,
}

impl BackendCapabilities {
    /// Whether `rate` is in the supported set.
    pub fn supports_rate(&self, rate: f64) -> bool {
        self.supported_rates
            .iter()
            .any(|r| (r - rate).abs() <= 1e-9 * r.abs().max(1.0))
    }

    /// Check a channel count and rate against these capabilities.
    pub fn negotiate(&self, channels: u32, rate: f64) -> Result<(), String> {
        if channels == 0 || channels > self.max_channels {
            return Err(format!(
                "{} channels requested, backend supports 1..={}",
                channels, self.max_channels
            ));
        }
        if !self.supports_rate(rate) {
            return Err(format!(
                "sample rate {} Hz not supported (supported: {:?})",
                rate, self.supported_rates
            ));
        }
        Ok(())
    }
}

/// Link state reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not opened, or closed
    #[default]
    Disconnected,
    /// Opened, not streaming
    Connected,
    /// Streaming samples
    Streaming,
    /// Transport failed
    Faulted,
}

/// Identity, capabilities and link state of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Variant
    pub kind: BackendKind,
    /// Model string (from the device when it reports one)
    pub model: String,
    /// Capabilities
    pub capabilities: BackendCapabilities,
    /// Link state
    pub status: ConnectionStatus,
}

/// Backend-level failures, mapped into [`DaqError`] by the manager.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Transport could not be opened
    #[error("Failed to open {target}: {message}")]
    OpenFailed {
        /// Port, address or device being opened
        target: String,
        /// Cause
        message: String,
    },
    /// Call requires an open backend
    #[error("Backend is not open")]
    NotOpen,
    /// Call requires a streaming backend
    #[error("Backend is not streaming")]
    NotStreaming,
    /// Operation not offered by this backend
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    /// Channel/rate rejected by the device
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Malformed or unexpected device response
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Device reported an error or a fault was injected
    #[error("Device error: {0}")]
    Device(String),
    /// Link closed by the peer
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for DaqError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidConfig(msg) => DaqError::Configuration(msg),
            BackendError::Unsupported(op) => {
                DaqError::Configuration(format!("operation not supported: {}", op))
            }
            other => DaqError::HardwareFault(other.to_string()),
        }
    }
}

/// Capability-set trait implemented by every acquisition source.
#[async_trait]
pub trait HardwareBackend: Send {
    /// Identity, capabilities and link state.
    fn descriptor(&self) -> BackendDescriptor;

    /// Current capabilities (may be refined by `open`).
    fn capabilities(&self) -> BackendCapabilities {
        self.descriptor().capabilities
    }

    /// Connect to the device.
    async fn open(&mut self) -> Result<(), BackendError>;

    /// Select channels `0..channels.len()` and the per-channel rate.
    async fn configure(&mut self, channels: &[u32], sample_rate: f64) -> Result<(), BackendError>;

    /// Begin streaming.
    async fn start(&mut self) -> Result<(), BackendError>;

    /// Read `samples_per_channel` samples for every configured channel.
    ///
    /// Returns one vector per channel in configuration order.
    async fn read_block(&mut self, samples_per_channel: usize)
        -> Result<Vec<Vec<f64>>, BackendError>;

    /// End streaming.
    async fn stop(&mut self) -> Result<(), BackendError>;

    /// Release the transport.
    async fn close(&mut self) -> Result<(), BackendError>;

    /// Suspend streaming in hardware.
    async fn pause(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("pause"))
    }

    /// Resume after [`pause`](Self::pause).
    async fn resume(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("resume"))
    }

    /// Drop any partially accumulated scans.
    fn discard_pending(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> BackendCapabilities {
        BackendCapabilities {
            max_channels: 8,
            supported_rates: vec![16.0, 32.0, 64.0],
            supports_pause: false,
            self_paced: true,
        }
    }

    #[test]
    fn test_negotiate_accepts_supported() {
        assert!(caps().negotiate(4, 32.0).is_ok());
        assert!(caps().negotiate(8, 64.0).is_ok());
    }

    #[test]
    fn test_negotiate_rejects_channels_and_rate() {
        assert!(caps().negotiate(9, 32.0).unwrap_err().contains("channels"));
        assert!(caps().negotiate(0, 32.0).is_err());
        assert!(caps().negotiate(4, 50.0).unwrap_err().contains("50"));
    }

    #[test]
    fn test_backend_error_mapping() {
        let err: DaqError = BackendError::InvalidConfig("rate".into()).into();
        assert!(matches!(err, DaqError::Configuration(_)));
        let err: DaqError = BackendError::Disconnected("eof".into()).into();
        assert!(matches!(err, DaqError::HardwareFault(_)));
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: BackendKind = serde_json::from_str("\"vendor_a\"").unwrap();
        assert_eq!(kind, BackendKind::VendorA);
        assert_eq!(BackendKind::VendorB.to_string(), "vendor_b");
    }
}
