//! Session orchestration.
//!
//! [`AcquisitionController`] is the public entry point. The remaining
//! modules are the per-session machinery it spawns: the acquisition loop,
//! the analysis worker, the shared session record and the rate monitor.

mod analysis;
pub mod controller;
pub mod rate;
mod shared;
mod worker;

pub use controller::AcquisitionController;
pub use rate::{RateCheck, RateMonitor};
