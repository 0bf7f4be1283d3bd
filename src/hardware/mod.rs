//! Hardware backends.
//!
//! - [`backend`]: the [`HardwareBackend`] capability trait and descriptors
//! - [`simulated`], [`vendor_a`], [`vendor_b`]: the backend variants
//! - [`factory`]: explicit construction by [`BackendKind`]
//! - [`manager`]: open/negotiate/release with strict-mode fallback

pub mod backend;
pub mod factory;
pub mod line_link;
pub mod manager;
pub mod simulated;
pub mod vendor_a;
pub mod vendor_b;

pub use backend::{
    BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
    HardwareBackend,
};
pub use factory::{BackendFactory, DefaultBackendFactory};
pub use manager::{Connection, HardwareManager, ManagerState};
pub use simulated::{SimulatedBackend, SimulatedFault};
