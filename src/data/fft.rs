//! Windowed FFT spectra with a cached plan per transform length and window.
//!
//! `SpectralProcessor` turns a block of samples into a one-sided [`Spectrum`]:
//! the block is optionally de-meaned, tapered, zero-padded to the transform
//! length and transformed with `rustfft`. Plans (the `rustfft` plan plus the
//! window coefficients) are cached behind an `RwLock<HashMap<_, Arc<_>>>`;
//! a lookup that hits returns the very same `Arc`.
//!
//! Scaling:
//! - `amplitude[k]` is the amplitude of a cosine at bin `k`, corrected for the
//!   window's coherent gain (`2|X_k| / Σw`, `|X_k| / Σw` at DC and Nyquist).
//! - `psd[k]` is the one-sided power spectral density in units²/Hz,
//!   `|X_k|² / (fs · Σw²)`, doubled except at DC and Nyquist.
//! - `coefficients[k]` is the complex amplitude with the same scaling as
//!   `amplitude`, phase referenced to the first sample of the block.

use crate::error::{AppResult, DaqError};
use num_complex::Complex;
use parking_lot::{Mutex, RwLock};
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Taper applied to a block before the transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Hann (raised cosine)
    #[default]
    Hann,
    /// Hamming
    Hamming,
    /// Three-term Blackman
    Blackman,
    /// No taper
    Rectangular,
}

impl WindowKind {
    /// Symmetric window coefficients of length `len`.
    pub fn coefficients(self, len: usize) -> Vec<f64> {
        if len <= 1 {
            return vec![1.0; len];
        }
        let denom = (len - 1) as f64;
        (0..len)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / denom;
                match self {
                    WindowKind::Hann => 0.5 - 0.5 * x.cos(),
                    WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowKind::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                    WindowKind::Rectangular => 1.0,
                }
            })
            .collect()
    }
}

/// Per-call spectral options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectralOptions {
    /// Taper
    pub window: WindowKind,
    /// Subtract the block mean first
    pub remove_mean: bool,
    /// Transform length when zero-padding
    pub zero_pad_to: Option<usize>,
}

impl Default for SpectralOptions {
    fn default() -> Self {
        Self {
            window: WindowKind::Hann,
            remove_mean: true,
            zero_pad_to: None,
        }
    }
}

impl From<&crate::config::AnalysisConfig> for SpectralOptions {
    fn from(config: &crate::config::AnalysisConfig) -> Self {
        Self {
            window: config.window,
            remove_mean: config.remove_mean,
            zero_pad_to: config.zero_pad_to,
        }
    }
}

/// Cache key for a spectral plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Transform length (after zero padding)
    pub transform_len: usize,
    /// Samples covered by the window
    pub window_len: usize,
    /// Window shape
    pub window: WindowKind,
}

/// Cached FFT plan plus window coefficients and their sums.
pub struct SpectralPlan {
    key: PlanKey,
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    coherent_sum: f64,
    energy_sum: f64,
}

impl SpectralPlan {
    fn build(key: PlanKey, planner: &mut FftPlanner<f64>) -> Self {
        let window = key.window.coefficients(key.window_len);
        let coherent_sum = window.iter().sum();
        let energy_sum = window.iter().map(|w| w * w).sum();
        Self {
            key,
            fft: planner.plan_fft_forward(key.transform_len),
            window,
            coherent_sum,
            energy_sum,
        }
    }

    /// Key this plan was built for.
    pub fn key(&self) -> PlanKey {
        self.key
    }

    /// Window coefficients.
    pub fn window(&self) -> &[f64] {
        &self.window
    }
}

impl std::fmt::Debug for SpectralPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralPlan")
            .field("key", &self.key)
            .field("coherent_sum", &self.coherent_sum)
            .finish()
    }
}

/// One-sided spectrum of a single channel block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    /// Bin centre frequencies in Hz
    pub frequencies: Vec<f64>,
    /// Coherent-gain corrected amplitude
    pub amplitude: Vec<f64>,
    /// One-sided PSD in units²/Hz
    pub psd: Vec<f64>,
    /// Complex amplitude per bin
    pub coefficients: Vec<Complex<f64>>,
    /// Sample rate of the input block
    pub sample_rate: f64,
    /// Transform length
    pub transform_len: usize,
    /// Converts a squared interior-bin amplitude to PSD
    pub amplitude_to_psd: f64,
}

impl Spectrum {
    /// Number of bins (`L/2 + 1`).
    pub fn bin_count(&self) -> usize {
        self.frequencies.len()
    }

    /// Frequency resolution (`fs / L`).
    pub fn bin_spacing(&self) -> f64 {
        self.sample_rate / self.transform_len as f64
    }

    /// Bin index and frequency of the largest PSD value, DC excluded.
    pub fn peak(&self) -> Option<(usize, f64)> {
        self.psd
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| (k, self.frequencies[k]))
    }

    /// Zeroth spectral moment (variance) from the PSD.
    pub fn m0(&self) -> f64 {
        self.psd.iter().sum::<f64>() * self.bin_spacing()
    }
}

/// Spectrum of one acquired channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSpectrum {
    /// Channel index
    pub channel: u32,
    /// Spectrum of that channel's block
    pub spectrum: Spectrum,
}

/// Spectra for every channel of one analysis block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectralResult {
    /// Per-channel spectra in channel order
    pub channels: Vec<ChannelSpectrum>,
}

impl SpectralResult {
    /// Spectrum of a given channel index.
    pub fn channel(&self, channel: u32) -> Option<&Spectrum> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .map(|c| &c.spectrum)
    }
}

/// Plan cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently cached
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Entries built
    pub builds: u64,
    /// Entries invalidated
    pub evictions: u64,
}

/// Computes spectra and owns the plan cache.
pub struct SpectralProcessor {
    planner: Mutex<FftPlanner<f64>>,
    plans: RwLock<HashMap<PlanKey, Arc<SpectralPlan>>>,
    hits: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
}

impl Default for SpectralProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralProcessor {
    /// Create a processor with an empty plan cache.
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
            plans: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached plan for `key`, building it on first use.
    ///
    /// Requesting a new transform length drops the plans of every other
    /// length.
    pub fn plan(&self, key: PlanKey) -> AppResult<Arc<SpectralPlan>> {
        if key.window_len < 2 || key.transform_len < key.window_len {
            return Err(DaqError::Configuration(format!(
                "invalid spectral plan: window {} samples, transform {}",
                key.window_len, key.transform_len
            )));
        }

        if let Some(plan) = self.plans.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(plan));
        }

        let mut plans = self.plans.write();
        if let Some(plan) = plans.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(plan));
        }

        let before = plans.len();
        plans.retain(|k, _| k.transform_len == key.transform_len);
        let evicted = before - plans.len();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, transform_len = key.transform_len, "spectral plans invalidated");
        }

        let plan = Arc::new(SpectralPlan::build(key, &mut self.planner.lock()));
        plans.insert(key, Arc::clone(&plan));
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(?key, "spectral plan built");
        Ok(plan)
    }

    /// One-sided spectrum of `samples`.
    pub fn spectrum(
        &self,
        samples: &[f64],
        sample_rate: f64,
        options: &SpectralOptions,
    ) -> AppResult<Spectrum> {
        validate_block(samples, sample_rate)?;
        let transform_len = options.zero_pad_to.unwrap_or(samples.len());
        let plan = self.plan(PlanKey {
            transform_len,
            window_len: samples.len(),
            window: options.window,
        })?;
        Ok(transform(&plan, samples, sample_rate, options.remove_mean))
    }

    /// Welch-averaged spectrum over overlapping segments.
    ///
    /// Amplitude and PSD are averaged across segments; `coefficients` are
    /// left empty because segment phases do not share a reference.
    pub fn welch(
        &self,
        samples: &[f64],
        sample_rate: f64,
        segment_len: usize,
        overlap: usize,
        options: &SpectralOptions,
    ) -> AppResult<Spectrum> {
        if overlap >= segment_len {
            return Err(DaqError::Configuration(format!(
                "overlap {} must be less than segment length {}",
                overlap, segment_len
            )));
        }
        if samples.len() < segment_len {
            return Err(DaqError::Configuration(format!(
                "{} samples are fewer than one segment of {}",
                samples.len(),
                segment_len
            )));
        }
        validate_block(samples, sample_rate)?;

        let plan = self.plan(PlanKey {
            transform_len: options.zero_pad_to.unwrap_or(segment_len),
            window_len: segment_len,
            window: options.window,
        })?;

        let step = segment_len - overlap;
        let mut averaged: Option<Spectrum> = None;
        let mut segments = 0usize;
        for start in (0..=samples.len() - segment_len).step_by(step) {
            let segment = transform(
                &plan,
                &samples[start..start + segment_len],
                sample_rate,
                options.remove_mean,
            );
            segments += 1;
            match averaged.as_mut() {
                None => averaged = Some(segment),
                Some(acc) => {
                    for (a, s) in acc.amplitude.iter_mut().zip(&segment.amplitude) {
                        *a += s;
                    }
                    for (p, s) in acc.psd.iter_mut().zip(&segment.psd) {
                        *p += s;
                    }
                }
            }
        }

        let mut spectrum = averaged.ok_or_else(|| {
            DaqError::Configuration("Welch estimate produced no segments".into())
        })?;
        let n = segments as f64;
        spectrum.amplitude.iter_mut().for_each(|a| *a /= n);
        spectrum.psd.iter_mut().for_each(|p| *p /= n);
        spectrum.coefficients.clear();
        Ok(spectrum)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.plans.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

fn validate_block(samples: &[f64], sample_rate: f64) -> AppResult<()> {
    if samples.len() < 2 {
        return Err(DaqError::Configuration(format!(
            "spectral block needs at least 2 samples, got {}",
            samples.len()
        )));
    }
    if !(sample_rate.is_finite() && sample_rate > 0.0) {
        return Err(DaqError::Configuration(format!(
            "sample rate {} must be positive",
            sample_rate
        )));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(DaqError::Configuration(
            "spectral block contains non-finite samples".into(),
        ));
    }
    Ok(())
}

fn transform(plan: &SpectralPlan, samples: &[f64], sample_rate: f64, remove_mean: bool) -> Spectrum {
    let len = plan.key.transform_len;
    let mean = if remove_mean {
        samples.iter().sum::<f64>() / samples.len() as f64
    } else {
        0.0
    };

    let mut buffer: Vec<Complex<f64>> = Vec::with_capacity(len);
    buffer.extend(
        samples
            .iter()
            .zip(&plan.window)
            .map(|(&x, &w)| Complex::new((x - mean) * w, 0.0)),
    );
    buffer.resize(len, Complex::new(0.0, 0.0));
    plan.fft.process(&mut buffer);

    let bins = len / 2 + 1;
    let df = sample_rate / len as f64;
    let psd_scale = 1.0 / (sample_rate * plan.energy_sum);

    let mut frequencies = Vec::with_capacity(bins);
    let mut amplitude = Vec::with_capacity(bins);
    let mut psd = Vec::with_capacity(bins);
    let mut coefficients = Vec::with_capacity(bins);

    for (k, x) in buffer.iter().take(bins).enumerate() {
        let edge = k == 0 || (len % 2 == 0 && k == len / 2);
        let one_sided = if edge { 1.0 } else { 2.0 };
        let coefficient = x * (one_sided / plan.coherent_sum);
        frequencies.push(k as f64 * df);
        amplitude.push(coefficient.norm());
        psd.push(one_sided * x.norm_sqr() * psd_scale);
        coefficients.push(coefficient);
    }

    Spectrum {
        frequencies,
        amplitude,
        psd,
        coefficients,
        sample_rate,
        transform_len: len,
        amplitude_to_psd: plan.coherent_sum * plan.coherent_sum
            / (2.0 * sample_rate * plan.energy_sum),
    }
}
