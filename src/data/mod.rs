//! Sample frames, buffering and analysis.
pub mod dispersion;
pub mod fft;
pub mod frame;
pub mod reflection;
pub mod ring_buffer;

pub use fft::{SpectralProcessor, SpectralResult, Spectrum, WindowKind};
pub use frame::{SampleFrame, SequenceRange};
pub use reflection::{ProbeGeometry, ReflectionAnalyzer, ReflectionResult};
pub use ring_buffer::{BufferConfig, CircularBuffer, PushOutcome};
