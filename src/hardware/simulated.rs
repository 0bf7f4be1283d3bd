//! Simulated wave-probe backend.
//!
//! Synthesises a regular incident wave plus its reflection at every probe
//! position, using linear dispersion for the wavenumber, with optional
//! seeded Gaussian noise:
//!
//! ```text
//! η(x, t) = a cos(ωt − kx) + Kr·a cos(ωt + kx + φ) + ε
//! ```
//!
//! Time is derived from the running sample index, so the signal is
//! continuous across blocks and unaffected by pauses or scheduling jitter.
//! Faults can be injected for resilience tests.

use crate::config::SimulationConfig;
use crate::data::dispersion;
use crate::hardware::backend::{
    BackendCapabilities, BackendDescriptor, BackendError, BackendKind, ConnectionStatus,
    HardwareBackend,
};
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::time::Duration;

/// Rates the simulated backend accepts.
pub const SIMULATED_RATES: &[f64] = &[
    10.0, 16.0, 20.0, 25.0, 32.0, 50.0, 64.0, 100.0, 128.0, 200.0, 256.0, 500.0, 1000.0,
];

/// Channel limit of the simulated backend.
pub const SIMULATED_MAX_CHANNELS: u32 = 16;

/// Injected failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedFault {
    /// `open()` fails
    FailOpen,
    /// `read_block()` fails once this many blocks have been read
    FailReadAfter(u64),
    /// `read_block()` hangs for `stall` once `blocks` blocks have been read
    StallReadAfter {
        /// Blocks read normally first
        blocks: u64,
        /// How long the read hangs
        stall: Duration,
    },
    /// Every `read_block()` takes at least this long
    ReadDelay(Duration),
}

/// Advertised capabilities of the simulated backend.
pub fn simulated_capabilities() -> BackendCapabilities {
    BackendCapabilities {
        max_channels: SIMULATED_MAX_CHANNELS,
        supported_rates: SIMULATED_RATES.to_vec(),
        supports_pause: true,
        self_paced: false,
    }
}

/// Synthetic wave field source.
pub struct SimulatedBackend {
    model: SimulationConfig,
    positions: Vec<f64>,
    faults: Vec<SimulatedFault>,
    rng: ChaCha8Rng,
    status: ConnectionStatus,
    channels: usize,
    sample_rate: f64,
    omega: f64,
    wavenumber: f64,
    sample_index: u64,
    blocks_read: u64,
    paused: bool,
}

impl SimulatedBackend {
    /// Backend for the given wave model; `positions[i]` is the x coordinate
    /// of channel `i` (channels beyond the list sit at x = 0).
    pub fn new(model: SimulationConfig, positions: Vec<f64>) -> Self {
        let rng = match model.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let omega = 2.0 * PI / model.wave_period;
        let wavenumber = dispersion::wavenumber(omega, model.water_depth);
        Self {
            model,
            positions,
            faults: Vec::new(),
            rng,
            status: ConnectionStatus::Disconnected,
            channels: 0,
            sample_rate: 0.0,
            omega,
            wavenumber,
            sample_index: 0,
            blocks_read: 0,
            paused: false,
        }
    }

    /// Add injected faults.
    pub fn with_faults(mut self, faults: Vec<SimulatedFault>) -> Self {
        self.faults = faults;
        self
    }

    /// Samples per channel produced so far.
    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    fn position(&self, channel: usize) -> f64 {
        self.positions.get(channel).copied().unwrap_or(0.0)
    }

    fn gaussian(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    fn synthesize(&mut self, samples_per_channel: usize) -> Vec<Vec<f64>> {
        let a = self.model.incident_amplitude;
        let ar = self.model.reflection_coefficient * a;
        let phi = self.model.reflection_phase;
        let noise = self.model.noise_std;

        let mut block = Vec::with_capacity(self.channels);
        for channel in 0..self.channels {
            let kx = self.wavenumber * self.position(channel);
            let mut samples = Vec::with_capacity(samples_per_channel);
            for j in 0..samples_per_channel {
                let t = (self.sample_index + j as u64) as f64 / self.sample_rate;
                let wt = self.omega * t;
                let mut eta = a * (wt - kx).cos() + ar * (wt + kx + phi).cos();
                if noise > 0.0 {
                    eta += noise * self.gaussian();
                }
                samples.push(eta);
            }
            block.push(samples);
        }
        self.sample_index += samples_per_channel as u64;
        block
    }

    async fn apply_read_faults(&mut self) -> Result<(), BackendError> {
        for fault in self.faults.clone() {
            match fault {
                SimulatedFault::ReadDelay(delay) => tokio::time::sleep(delay).await,
                SimulatedFault::FailReadAfter(n) if self.blocks_read >= n => {
                    self.status = ConnectionStatus::Faulted;
                    return Err(BackendError::Device(format!(
                        "injected read failure after {} blocks",
                        n
                    )));
                }
                SimulatedFault::StallReadAfter { blocks, stall } if self.blocks_read >= blocks => {
                    tokio::time::sleep(stall).await;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareBackend for SimulatedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: BackendKind::Simulated,
            model: "simulated wave field".to_string(),
            capabilities: simulated_capabilities(),
            status: self.status,
        }
    }

    async fn open(&mut self) -> Result<(), BackendError> {
        if self.faults.contains(&SimulatedFault::FailOpen) {
            return Err(BackendError::OpenFailed {
                target: "simulated".into(),
                message: "injected open failure".into(),
            });
        }
        self.status = ConnectionStatus::Connected;
        Ok(())
    }

    async fn configure(&mut self, channels: &[u32], sample_rate: f64) -> Result<(), BackendError> {
        if self.status == ConnectionStatus::Disconnected {
            return Err(BackendError::NotOpen);
        }
        simulated_capabilities()
            .negotiate(channels.len() as u32, sample_rate)
            .map_err(BackendError::InvalidConfig)?;
        self.channels = channels.len();
        self.sample_rate = sample_rate;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        if self.channels == 0 {
            return Err(BackendError::InvalidConfig(
                "start before configure".into(),
            ));
        }
        self.sample_index = 0;
        self.blocks_read = 0;
        self.paused = false;
        self.status = ConnectionStatus::Streaming;
        Ok(())
    }

    async fn read_block(
        &mut self,
        samples_per_channel: usize,
    ) -> Result<Vec<Vec<f64>>, BackendError> {
        if self.status != ConnectionStatus::Streaming || self.paused {
            return Err(BackendError::NotStreaming);
        }
        self.apply_read_faults().await?;
        let block = self.synthesize(samples_per_channel);
        self.blocks_read += 1;
        Ok(block)
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        if self.status == ConnectionStatus::Streaming {
            self.status = ConnectionStatus::Connected;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.status = ConnectionStatus::Disconnected;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), BackendError> {
        self.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), BackendError> {
        self.paused = false;
        Ok(())
    }
}
