//! Incident/reflected wave separation from a multi-probe array.
//!
//! At each frequency bin the complex amplitude measured at probe `n`
//! (position `x_n`) is modelled as
//!
//! ```text
//! B_n = Z_I · e^{-i k x_n} + Z_R · e^{+i k x_n}
//! ```
//!
//! with `k` from linear dispersion. The overdetermined `N × 2` system is
//! solved in the least-squares sense (Goda / Mansard–Funke) through an SVD
//! pseudo-inverse. The pseudo-inverses depend only on the probe positions,
//! the frequency grid and the water depth, so they are built once per key
//! and cached as a [`GeometryMatrix`].
//!
//! Bins where the matrix is ill-conditioned (probe spacing close to a
//! multiple of half a wavelength, and the DC bin) are flagged instead of
//! solved.

use crate::data::dispersion;
use crate::data::fft::{CacheStats, Spectrum};
use crate::error::{AppResult, DaqError};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Ordered probe positions in metres.
///
/// At least three probes, all finite and pairwise distinct. Equality and
/// hashing are bitwise so a geometry can key the matrix cache.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeGeometry {
    positions: Arc<[f64]>,
}

impl ProbeGeometry {
    /// Minimum number of probes for a least-squares separation.
    pub const MIN_PROBES: usize = 3;

    /// Validate and wrap probe positions.
    pub fn new(positions: Vec<f64>) -> AppResult<Self> {
        if positions.len() < Self::MIN_PROBES {
            return Err(DaqError::Configuration(format!(
                "reflection analysis needs at least {} probes, got {}",
                Self::MIN_PROBES,
                positions.len()
            )));
        }
        if let Some(bad) = positions.iter().find(|x| !x.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "probe position {} is not finite",
                bad
            )));
        }
        for (i, a) in positions.iter().enumerate() {
            if positions[i + 1..].iter().any(|b| a == b) {
                return Err(DaqError::Configuration(format!(
                    "probe position {} appears more than once",
                    a
                )));
            }
        }
        Ok(Self {
            positions: positions.into(),
        })
    }

    /// Positions in metres.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Number of probes.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Always false for a validated geometry.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl PartialEq for ProbeGeometry {
    fn eq(&self, other: &Self) -> bool {
        self.positions.len() == other.positions.len()
            && self
                .positions
                .iter()
                .zip(other.positions.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for ProbeGeometry {}

impl Hash for ProbeGeometry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for x in self.positions.iter() {
            x.to_bits().hash(state);
        }
    }
}

/// One-sided FFT bin grid.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrequencyGrid {
    /// Number of bins
    pub bin_count: usize,
    /// Bin spacing in Hz
    pub bin_spacing: f64,
}

impl FrequencyGrid {
    /// Grid of a computed spectrum.
    pub fn of(spectrum: &Spectrum) -> Self {
        Self {
            bin_count: spectrum.bin_count(),
            bin_spacing: spectrum.bin_spacing(),
        }
    }

    /// Centre frequency of bin `k`.
    pub fn frequency(&self, k: usize) -> f64 {
        k as f64 * self.bin_spacing
    }
}

impl PartialEq for FrequencyGrid {
    fn eq(&self, other: &Self) -> bool {
        self.bin_count == other.bin_count
            && self.bin_spacing.to_bits() == other.bin_spacing.to_bits()
    }
}

impl Eq for FrequencyGrid {}

impl Hash for FrequencyGrid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bin_count.hash(state);
        self.bin_spacing.to_bits().hash(state);
    }
}

/// Cache key of a [`GeometryMatrix`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeometryKey {
    /// Probe positions
    pub geometry: ProbeGeometry,
    /// Frequency grid
    pub grid: FrequencyGrid,
    depth_bits: u64,
}

impl GeometryKey {
    /// Key for a geometry, grid and water depth.
    pub fn new(geometry: ProbeGeometry, grid: FrequencyGrid, water_depth: f64) -> Self {
        Self {
            geometry,
            grid,
            depth_bits: water_depth.to_bits(),
        }
    }

    /// Water depth in metres.
    pub fn water_depth(&self) -> f64 {
        f64::from_bits(self.depth_bits)
    }
}

/// Least-squares solver for a single bin.
#[derive(Debug, Clone)]
pub struct BinSolver {
    /// Bin centre frequency in Hz
    pub frequency: f64,
    /// Wavenumber in rad/m
    pub wavenumber: f64,
    /// Ratio of largest to smallest singular value
    pub condition: f64,
    pseudo_inverse: Option<DMatrix<Complex<f64>>>,
}

impl BinSolver {
    fn build(frequency: f64, depth: f64, positions: &[f64]) -> Self {
        let wavenumber = dispersion::wavenumber_hz(frequency, depth);
        let design = DMatrix::from_fn(positions.len(), 2, |row, col| {
            let phase = wavenumber * positions[row];
            if col == 0 {
                Complex::from_polar(1.0, -phase)
            } else {
                Complex::from_polar(1.0, phase)
            }
        });

        let svd = design.svd(true, true);
        let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
        let smallest = svd
            .singular_values
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let tolerance = largest * 1e-10;

        let (condition, pseudo_inverse) = if smallest > tolerance {
            (largest / smallest, svd.pseudo_inverse(tolerance).ok())
        } else {
            (f64::INFINITY, None)
        };

        Self {
            frequency,
            wavenumber,
            condition,
            pseudo_inverse,
        }
    }

    /// Whether a pseudo-inverse exists for this bin.
    pub fn is_solvable(&self) -> bool {
        self.pseudo_inverse.is_some()
    }

    /// Incident and reflected complex amplitudes for measured coefficients.
    pub fn solve(&self, measured: &DVector<Complex<f64>>) -> Option<(Complex<f64>, Complex<f64>)> {
        let pinv = self.pseudo_inverse.as_ref()?;
        let z = pinv * measured;
        Some((z[0], z[1]))
    }
}

/// Per-bin pseudo-inverses for one geometry, grid and depth.
#[derive(Debug)]
pub struct GeometryMatrix {
    key: GeometryKey,
    bins: Vec<BinSolver>,
}

impl GeometryMatrix {
    /// Build solvers for every bin of the key's grid.
    pub fn build(key: GeometryKey) -> Self {
        let depth = key.water_depth();
        let bins = (0..key.grid.bin_count)
            .map(|k| BinSolver::build(key.grid.frequency(k), depth, key.geometry.positions()))
            .collect();
        Self { key, bins }
    }

    /// Key this matrix was built for.
    pub fn key(&self) -> &GeometryKey {
        &self.key
    }

    /// Solver of bin `k`.
    pub fn bin(&self, k: usize) -> Option<&BinSolver> {
        self.bins.get(k)
    }

    /// All bin solvers.
    pub fn bins(&self) -> &[BinSolver] {
        &self.bins
    }
}

/// Analysis band and stability settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionConfig {
    /// Water depth in metres
    pub water_depth: f64,
    /// Flag bins whose condition number exceeds this
    pub condition_threshold: f64,
    /// Lower band edge in Hz
    pub min_frequency: f64,
    /// Upper band edge in Hz (`None` = Nyquist)
    pub max_frequency: Option<f64>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            water_depth: 1.0,
            condition_threshold: 10.0,
            min_frequency: 0.0,
            max_frequency: None,
        }
    }
}

impl From<&crate::config::AnalysisConfig> for ReflectionConfig {
    fn from(config: &crate::config::AnalysisConfig) -> Self {
        Self {
            water_depth: config.water_depth,
            condition_threshold: config.condition_threshold,
            min_frequency: config.min_frequency,
            max_frequency: config.max_frequency,
        }
    }
}

/// Classification of a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinStatus {
    /// Solved
    Reliable,
    /// Condition number above threshold; no amplitudes reported
    IllConditioned,
    /// Outside the analysis band
    OutOfBand,
}

/// Amplitude and phase of one separated component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaveComponent {
    /// Amplitude in metres
    pub amplitude: f64,
    /// Phase in radians at x = 0
    pub phase: f64,
}

impl From<Complex<f64>> for WaveComponent {
    fn from(z: Complex<f64>) -> Self {
        Self {
            amplitude: z.norm(),
            phase: z.arg(),
        }
    }
}

/// Separation result at one bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinResult {
    /// Bin centre frequency in Hz
    pub frequency: f64,
    /// Wavenumber in rad/m
    pub wavenumber: f64,
    /// Condition number of the design matrix
    pub condition: f64,
    /// Classification
    pub status: BinStatus,
    /// Incident component (reliable bins only)
    pub incident: Option<WaveComponent>,
    /// Reflected component (reliable bins only)
    pub reflected: Option<WaveComponent>,
}

/// Integral wave parameters of one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WaveStatistics {
    /// Zeroth spectral moment in m²
    pub m0: f64,
    /// Spectral significant wave height `4√m0` in metres
    pub hm0: f64,
    /// Peak period in seconds
    pub tp: Option<f64>,
    /// Mean period `m0/m1` in seconds
    pub tm01: Option<f64>,
}

impl WaveStatistics {
    fn from_density(frequencies: &[f64], density: &[f64], df: f64) -> Self {
        let m0: f64 = density.iter().sum::<f64>() * df;
        let m1: f64 = frequencies
            .iter()
            .zip(density)
            .map(|(f, s)| f * s)
            .sum::<f64>()
            * df;
        let tp = frequencies
            .iter()
            .zip(density)
            .filter(|(f, s)| **f > 0.0 && **s > 0.0)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(f, _)| 1.0 / f);
        Self {
            m0,
            hm0: 4.0 * m0.max(0.0).sqrt(),
            tp,
            tm01: (m1 > 0.0).then(|| m0 / m1),
        }
    }
}

/// Output of one reflection analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectionResult {
    /// Per-bin separation
    pub bins: Vec<BinResult>,
    /// Bulk reflection coefficient `sqrt(E_R / E_I)` over reliable bins
    pub kr: Option<f64>,
    /// Incident wave parameters
    pub incident: WaveStatistics,
    /// Reflected wave parameters
    pub reflected: WaveStatistics,
    /// In-band bins flagged as ill-conditioned
    pub unstable_bins: usize,
    /// Water depth used
    pub water_depth: f64,
}

impl ReflectionResult {
    /// Iterator over reliable bins.
    pub fn reliable_bins(&self) -> impl Iterator<Item = &BinResult> {
        self.bins.iter().filter(|b| b.status == BinStatus::Reliable)
    }

    /// Ill-conditioned bin with the largest condition number.
    pub fn worst_unstable_bin(&self) -> Option<&BinResult> {
        self.bins
            .iter()
            .filter(|b| b.status == BinStatus::IllConditioned)
            .max_by(|a, b| a.condition.total_cmp(&b.condition))
    }
}

/// Solves the separation and owns the geometry-matrix cache.
pub struct ReflectionAnalyzer {
    matrices: RwLock<HashMap<GeometryKey, Arc<GeometryMatrix>>>,
    hits: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
}

impl Default for ReflectionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReflectionAnalyzer {
    /// Create an analyzer with an empty cache.
    pub fn new() -> Self {
        Self {
            matrices: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached matrix for `key`, building it on first use.
    ///
    /// Inserting a matrix for a new geometry drops the matrices of every
    /// other geometry.
    pub fn geometry_matrix(&self, key: &GeometryKey) -> Arc<GeometryMatrix> {
        if let Some(matrix) = self.matrices.read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(matrix);
        }

        let mut matrices = self.matrices.write();
        if let Some(matrix) = matrices.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(matrix);
        }

        let before = matrices.len();
        matrices.retain(|k, _| k.geometry == key.geometry);
        let evicted = before - matrices.len();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "geometry matrices invalidated");
        }

        let matrix = Arc::new(GeometryMatrix::build(key.clone()));
        matrices.insert(key.clone(), Arc::clone(&matrix));
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!(
            probes = key.geometry.len(),
            bins = key.grid.bin_count,
            depth = key.water_depth(),
            "geometry matrix built"
        );
        matrix
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.matrices.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Separate incident and reflected waves.
    ///
    /// `probes[n]` is the spectrum measured at `geometry.positions()[n]`; all
    /// spectra must share one frequency grid and carry complex coefficients.
    pub fn analyze(
        &self,
        probes: &[&Spectrum],
        geometry: &ProbeGeometry,
        config: &ReflectionConfig,
    ) -> AppResult<ReflectionResult> {
        if probes.len() != geometry.len() {
            return Err(DaqError::Configuration(format!(
                "{} probe spectra for a {}-probe geometry",
                probes.len(),
                geometry.len()
            )));
        }
        let reference = probes[0];
        let grid = FrequencyGrid::of(reference);
        for spectrum in probes {
            if FrequencyGrid::of(spectrum) != grid {
                return Err(DaqError::Configuration(
                    "probe spectra do not share a frequency grid".into(),
                ));
            }
            if spectrum.coefficients.len() != grid.bin_count {
                return Err(DaqError::Configuration(
                    "probe spectra carry no complex coefficients".into(),
                ));
            }
        }

        let matrix = self.geometry_matrix(&GeometryKey::new(
            geometry.clone(),
            grid,
            config.water_depth,
        ));

        let nyquist = reference.sample_rate / 2.0;
        let upper = config.max_frequency.unwrap_or(nyquist);
        let last_bin = grid.bin_count - 1;
        let has_nyquist_bin = reference.transform_len % 2 == 0;

        let mut bins = Vec::with_capacity(grid.bin_count);
        let mut reliable_freqs = Vec::new();
        let mut incident_density = Vec::new();
        let mut reflected_density = Vec::new();
        let mut unstable_bins = 0;

        for (k, solver) in matrix.bins().iter().enumerate() {
            let in_band = solver.frequency >= config.min_frequency && solver.frequency <= upper;
            let mut result = BinResult {
                frequency: solver.frequency,
                wavenumber: solver.wavenumber,
                condition: solver.condition,
                status: BinStatus::OutOfBand,
                incident: None,
                reflected: None,
            };

            if in_band {
                let measured =
                    DVector::from_iterator(probes.len(), probes.iter().map(|s| s.coefficients[k]));
                match solver.solve(&measured) {
                    Some((zi, zr)) if solver.condition <= config.condition_threshold => {
                        let edge = k == 0 || (has_nyquist_bin && k == last_bin);
                        let scale = if edge {
                            2.0 * reference.amplitude_to_psd
                        } else {
                            reference.amplitude_to_psd
                        };
                        reliable_freqs.push(solver.frequency);
                        incident_density.push(zi.norm_sqr() * scale);
                        reflected_density.push(zr.norm_sqr() * scale);
                        result.status = BinStatus::Reliable;
                        result.incident = Some(zi.into());
                        result.reflected = Some(zr.into());
                    }
                    _ => {
                        result.status = BinStatus::IllConditioned;
                        unstable_bins += 1;
                    }
                }
            }
            bins.push(result);
        }

        let df = grid.bin_spacing;
        let incident = WaveStatistics::from_density(&reliable_freqs, &incident_density, df);
        let reflected = WaveStatistics::from_density(&reliable_freqs, &reflected_density, df);
        let kr = (incident.m0 > 0.0).then(|| (reflected.m0 / incident.m0).sqrt());

        if unstable_bins > 0 {
            debug!(
                unstable_bins,
                threshold = config.condition_threshold,
                "ill-conditioned bins excluded from reflection analysis"
            );
        }

        Ok(ReflectionResult {
            bins,
            kr,
            incident,
            reflected,
            unstable_bins,
            water_depth: config.water_depth,
        })
    }
}

impl std::fmt::Debug for ReflectionAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectionAnalyzer")
            .field("cache", &self.cache_stats())
            .finish()
    }
}
