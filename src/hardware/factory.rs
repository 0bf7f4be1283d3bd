//! Backend construction keyed by [`BackendKind`].
//!
//! Selection is always explicit: the session names a kind, the factory builds
//! that variant from the hardware section of the configuration. Nothing is
//! probed at runtime.

use crate::config::{HardwareConfig, SessionConfig, SimulationConfig};
use crate::hardware::backend::{BackendCapabilities, BackendKind, HardwareBackend};
use crate::hardware::simulated::{simulated_capabilities, SimulatedBackend, SimulatedFault};
use crate::hardware::vendor_a::{vendor_a_capabilities, VendorABackend};
use crate::hardware::vendor_b::{vendor_b_capabilities, VendorBBackend};

/// Builds backends for a session.
pub trait BackendFactory: Send + Sync {
    /// Capabilities a kind advertises before it is opened. Used to validate
    /// session configs without touching hardware.
    fn advertised_capabilities(&self, kind: BackendKind) -> BackendCapabilities;

    /// Construct an unopened backend of `kind` for `session`.
    fn create(&self, kind: BackendKind, session: &SessionConfig) -> Box<dyn HardwareBackend>;
}

/// Factory over the built-in variants.
#[derive(Debug, Clone, Default)]
pub struct DefaultBackendFactory {
    hardware: HardwareConfig,
    simulation: SimulationConfig,
    simulated_faults: Vec<SimulatedFault>,
}

impl DefaultBackendFactory {
    /// Factory for the given endpoints and wave model.
    pub fn new(hardware: HardwareConfig, simulation: SimulationConfig) -> Self {
        Self {
            hardware,
            simulation,
            simulated_faults: Vec::new(),
        }
    }

    /// Inject faults into every simulated backend this factory creates
    /// (including fallback instances).
    pub fn with_simulated_faults(mut self, faults: Vec<SimulatedFault>) -> Self {
        self.simulated_faults = faults;
        self
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn advertised_capabilities(&self, kind: BackendKind) -> BackendCapabilities {
        match kind {
            BackendKind::Simulated => simulated_capabilities(),
            BackendKind::VendorA => vendor_a_capabilities(),
            BackendKind::VendorB => vendor_b_capabilities(),
        }
    }

    fn create(&self, kind: BackendKind, session: &SessionConfig) -> Box<dyn HardwareBackend> {
        match kind {
            BackendKind::Simulated => Box::new(
                SimulatedBackend::new(self.simulation.clone(), session.probe_positions.clone())
                    .with_faults(self.simulated_faults.clone()),
            ),
            BackendKind::VendorA => Box::new(VendorABackend::serial(
                self.hardware.serial_port.clone(),
                self.hardware.baud_rate,
            )),
            BackendKind::VendorB => {
                Box::new(VendorBBackend::tcp(self.hardware.tcp_address.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_matches_kind() {
        let factory = DefaultBackendFactory::default();
        let session = SessionConfig::default();
        for kind in [BackendKind::Simulated, BackendKind::VendorA, BackendKind::VendorB] {
            let backend = factory.create(kind, &session);
            assert_eq!(backend.descriptor().kind, kind);
            assert_eq!(
                backend.capabilities().max_channels,
                factory.advertised_capabilities(kind).max_channels
            );
        }
    }

    #[tokio::test]
    async fn test_injected_faults_reach_simulated_backend() {
        let factory =
            DefaultBackendFactory::default().with_simulated_faults(vec![SimulatedFault::FailOpen]);
        let mut backend = factory.create(BackendKind::Simulated, &SessionConfig::default());
        assert!(backend.open().await.is_err());
    }
}
