//! Configuration loading using Figment.
//!
//! Configuration is layered from:
//! 1. a TOML file (`config/wave_daq.toml` by default)
//! 2. environment variables prefixed with `WAVE_DAQ_`, nested keys separated
//!    by a double underscore (`WAVE_DAQ_SESSION__SAMPLE_RATE=64`)
//!
//! Every section has defaults, so a file only needs the keys it changes.
//!
//! # Example
//! ```no_run
//! use wave_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("{} channels at {} Hz", config.session.channels, config.session.sample_rate);
//! # Ok::<(), wave_daq::error::DaqError>(())
//! ```

use crate::data::fft::WindowKind;
use crate::data::reflection::ProbeGeometry;
use crate::data::ring_buffer::BufferConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::BackendKind;
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/wave_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "WAVE_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Hardware transport settings and timeouts
    pub hardware: HardwareConfig,
    /// Simulated wave field
    pub simulation: SimulationConfig,
    /// Signal bus settings
    pub bus: BusConfig,
    /// Default session parameters
    pub session: SessionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "wave_daq".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// Transport endpoints and backend call deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Serial device of the vendor A gauge controller
    pub serial_port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// `host:port` of the vendor B amplifier
    pub tcp_address: String,
    /// Deadline for `open()` in milliseconds
    pub open_timeout_ms: u64,
    /// Deadline for each `read_block()` in milliseconds
    pub read_timeout_ms: u64,
    /// Deadline for `stop()` + `close()` in milliseconds
    pub close_timeout_ms: u64,
    /// Deadline for joining the acquisition loop on stop, in milliseconds
    pub stop_timeout_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            tcp_address: "192.168.1.50:5025".to_string(),
            open_timeout_ms: 2000,
            read_timeout_ms: 1000,
            close_timeout_ms: 1000,
            stop_timeout_ms: 2000,
        }
    }
}

impl HardwareConfig {
    /// Open deadline.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Close deadline.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Loop join deadline.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Regular-wave field synthesised by the simulated backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Incident wave amplitude in metres
    pub incident_amplitude: f64,
    /// Ratio of reflected to incident amplitude
    pub reflection_coefficient: f64,
    /// Phase of the reflected wave at x = 0, radians
    pub reflection_phase: f64,
    /// Wave period in seconds
    pub wave_period: f64,
    /// Water depth in metres
    pub water_depth: f64,
    /// Standard deviation of Gaussian probe noise in metres
    pub noise_std: f64,
    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            incident_amplitude: 0.05,
            reflection_coefficient: 0.3,
            reflection_phase: 0.0,
            wave_period: 1.28,
            water_depth: 1.0,
            noise_std: 0.0005,
            seed: None,
        }
    }
}

/// Signal bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber queue depth
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Spectral and reflection analysis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Samples per channel in each analysis block
    pub block_len: usize,
    /// Taper applied before the transform
    pub window: WindowKind,
    /// Transform length when zero-padding; must be >= `block_len`
    pub zero_pad_to: Option<usize>,
    /// Subtract the block mean before windowing
    pub remove_mean: bool,
    /// Water depth in metres used by the dispersion relation
    pub water_depth: f64,
    /// Bins whose condition number exceeds this are flagged
    pub condition_threshold: f64,
    /// Lower edge of the reflection analysis band in Hz
    pub min_frequency: f64,
    /// Upper edge of the reflection analysis band in Hz (`None` = Nyquist)
    pub max_frequency: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            block_len: 1024,
            window: WindowKind::Hann,
            zero_pad_to: None,
            remove_mean: true,
            water_depth: 1.0,
            condition_threshold: 10.0,
            min_frequency: 0.05,
            max_frequency: None,
        }
    }
}

impl AnalysisConfig {
    /// Transform length after optional zero padding.
    pub fn transform_len(&self) -> usize {
        self.zero_pad_to.unwrap_or(self.block_len).max(self.block_len)
    }

    /// Check internal consistency.
    pub fn validate(&self, sample_rate: f64) -> AppResult<()> {
        if self.block_len < 2 {
            return Err(DaqError::Configuration(format!(
                "analysis block_len {} must be at least 2",
                self.block_len
            )));
        }
        if let Some(padded) = self.zero_pad_to {
            if padded < self.block_len {
                return Err(DaqError::Configuration(format!(
                    "zero_pad_to {} is shorter than block_len {}",
                    padded, self.block_len
                )));
            }
        }
        if !(self.water_depth.is_finite() && self.water_depth > 0.0) {
            return Err(DaqError::Configuration(format!(
                "water_depth {} must be positive",
                self.water_depth
            )));
        }
        if !(self.condition_threshold.is_finite() && self.condition_threshold >= 1.0) {
            return Err(DaqError::Configuration(format!(
                "condition_threshold {} must be >= 1",
                self.condition_threshold
            )));
        }
        let nyquist = sample_rate / 2.0;
        let upper = self.max_frequency.unwrap_or(nyquist);
        if !(self.min_frequency >= 0.0 && self.min_frequency < upper) {
            return Err(DaqError::Configuration(format!(
                "analysis band [{}, {}] Hz is empty",
                self.min_frequency, upper
            )));
        }
        Ok(())
    }
}

/// Parameters of one acquisition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of channels; channel indices are `0..channels`
    pub channels: u32,
    /// Per-channel sample rate in Hz
    pub sample_rate: f64,
    /// Backend variant to acquire from
    pub backend: BackendKind,
    /// Fail instead of falling back to the simulated backend
    pub strict_hardware: bool,
    /// Ring buffer capacity in frames
    pub buffer_capacity: usize,
    /// Probe positions in metres, one per leading channel; empty disables
    /// reflection analysis
    pub probe_positions: Vec<f64>,
    /// Samples per channel in each acquired frame
    pub block_size: usize,
    /// Stop acquiring after this many seconds
    pub duration_secs: Option<f64>,
    /// Evict oldest frames when the buffer is full (otherwise reject new ones)
    pub overwrite_on_full: bool,
    /// Frames kept for the session artifact (0 keeps none)
    pub record_frames: usize,
    /// Analysis parameters
    pub analysis: AnalysisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            sample_rate: 32.0,
            backend: BackendKind::Simulated,
            strict_hardware: false,
            buffer_capacity: 1024,
            probe_positions: vec![0.0, 0.3, 0.7, 1.2],
            block_size: 32,
            duration_secs: None,
            overwrite_on_full: true,
            record_frames: 4096,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Validate everything that does not depend on backend capabilities.
    pub fn validate(&self) -> AppResult<()> {
        if self.channels == 0 {
            return Err(DaqError::Configuration(
                "at least one channel is required".into(),
            ));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "sample_rate {} must be positive",
                self.sample_rate
            )));
        }
        if self.block_size == 0 {
            return Err(DaqError::Configuration(
                "block_size must be greater than 0".into(),
            ));
        }
        if let Some(duration) = self.duration_secs {
            if !(duration.is_finite() && duration > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "duration_secs {} must be positive",
                    duration
                )));
            }
        }
        self.buffer_config().validate()?;
        if let Some(geometry) = self.probe_geometry()? {
            if geometry.len() > self.channels as usize {
                return Err(DaqError::Configuration(format!(
                    "{} probe positions but only {} channels",
                    geometry.len(),
                    self.channels
                )));
            }
        }
        self.analysis.validate(self.sample_rate)
    }

    /// Buffer settings derived from this session.
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer_capacity,
            channels: self.channels as usize,
            overwrite_on_full: self.overwrite_on_full,
        }
    }

    /// Probe geometry, or `None` when reflection analysis is disabled.
    pub fn probe_geometry(&self) -> AppResult<Option<ProbeGeometry>> {
        if self.probe_positions.is_empty() {
            return Ok(None);
        }
        ProbeGeometry::new(self.probe_positions.clone()).map(Some)
    }

    /// Total samples per channel to acquire, if a duration was requested.
    pub fn total_samples(&self) -> Option<u64> {
        self.duration_secs
            .map(|secs| (secs * self.sample_rate).round().max(1.0) as u64)
    }

    /// Nominal time between frames.
    pub fn block_period(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate)
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `WAVE_DAQ_APPLICATION__LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bus.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "bus.queue_capacity must be greater than 0".into(),
            ));
        }

        let hw = &self.hardware;
        for (name, value) in [
            ("open_timeout_ms", hw.open_timeout_ms),
            ("read_timeout_ms", hw.read_timeout_ms),
            ("close_timeout_ms", hw.close_timeout_ms),
            ("stop_timeout_ms", hw.stop_timeout_ms),
        ] {
            if value == 0 {
                return Err(DaqError::Configuration(format!(
                    "hardware.{} must be greater than 0",
                    name
                )));
            }
        }

        let sim = &self.simulation;
        if !(sim.wave_period.is_finite() && sim.wave_period > 0.0) {
            return Err(DaqError::Configuration(format!(
                "simulation.wave_period {} must be positive",
                sim.wave_period
            )));
        }
        if !(sim.water_depth.is_finite() && sim.water_depth > 0.0) {
            return Err(DaqError::Configuration(format!(
                "simulation.water_depth {} must be positive",
                sim.water_depth
            )));
        }
        if !(sim.noise_std.is_finite() && sim.noise_std >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "simulation.noise_std {} must be non-negative",
                sim.noise_std
            )));
        }

        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
log_format = "json"

[session]
channels = 6
sample_rate = 64.0
backend = "vendor_b"
probe_positions = [0.0, 0.25, 0.6]

[session.analysis]
window = "blackman"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "wave_daq");
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert_eq!(config.session.channels, 6);
        assert_eq!(config.session.backend, BackendKind::VendorB);
        assert_eq!(config.session.analysis.window, WindowKind::Blackman);
        assert_eq!(config.session.analysis.block_len, 1024);
        assert_eq!(config.hardware.read_timeout_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_rejects_zero_capacity() {
        let config = SessionConfig {
            buffer_capacity: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_session_rejects_more_probes_than_channels() {
        let config = SessionConfig {
            channels: 3,
            probe_positions: vec![0.0, 0.2, 0.5, 0.9],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_rejects_duplicate_probes() {
        let config = SessionConfig {
            probe_positions: vec![0.0, 0.3, 0.3],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_probe_positions_disable_reflection() {
        let config = SessionConfig {
            probe_positions: Vec::new(),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.probe_geometry().unwrap().is_none());
    }

    #[test]
    fn test_zero_pad_shorter_than_block() {
        let mut config = SessionConfig::default();
        config.analysis.zero_pad_to = Some(512);
        assert!(config.validate().is_err());
        config.analysis.zero_pad_to = Some(2048);
        assert_eq!(config.analysis.transform_len(), 2048);
    }

    #[test]
    fn test_total_samples_from_duration() {
        let config = SessionConfig {
            duration_secs: Some(2.5),
            sample_rate: 32.0,
            ..SessionConfig::default()
        };
        assert_eq!(config.total_samples(), Some(80));
        assert_eq!(config.block_period(), Duration::from_secs(1));
    }
}
