//! # wave_daq
//!
//! Multi-channel wave-gauge acquisition with live spectral and reflection
//! analysis.
//!
//! A session reads fixed-size frames from a hardware backend (or the
//! built-in simulator), queues them in a bounded ring buffer and hands them
//! to an analysis worker that computes per-channel spectra and, when probe
//! positions are configured, separates incident from reflected waves. Every
//! stage publishes on a topic-based [`bus::SignalBus`].
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: `AcquisitionController` and the per-session
//!   acquisition loop and analysis worker.
//! - **`hardware`**: The `HardwareBackend` trait, the simulated and vendor
//!   backends, and the `HardwareManager` that opens them with timeouts and
//!   simulated fallback.
//! - **`data`**: Frames, the ring buffer, spectral processing, the
//!   dispersion relation and the reflection analyzer.
//! - **`bus`**: Topic-based publish/subscribe with isolated subscribers.
//! - **`session`**: Session identity, lifecycle states and status snapshots.
//! - **`artifact`**: In-memory session recording for export.
//! - **`config`**: Layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: `DaqError` and the crate-wide `AppResult`.

pub mod acquisition;
pub mod artifact;
pub mod bus;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod session;

pub use acquisition::AcquisitionController;
pub use config::{AppConfig, SessionConfig};
pub use error::{AppResult, DaqError};
pub use session::{SessionId, SessionState, SessionStatus};
