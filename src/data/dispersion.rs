//! Linear wave dispersion: `ω² = g k tanh(k h)`.

use std::f64::consts::PI;

/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.80665;

const MAX_ITERATIONS: usize = 50;
const TOLERANCE: f64 = 1e-12;

/// Wavenumber (rad/m) for angular frequency `omega` (rad/s) in water of
/// depth `depth` (m).
///
/// Solved in dimensionless form `x tanh x = ω²h/g` with Newton iteration,
/// starting from Eckart's approximation.
pub fn wavenumber(omega: f64, depth: f64) -> f64 {
    if omega <= 0.0 || depth <= 0.0 {
        return 0.0;
    }
    let y = omega * omega * depth / GRAVITY;
    let mut x = y / y.tanh().sqrt();
    for _ in 0..MAX_ITERATIONS {
        let t = x.tanh();
        let f = x * t - y;
        let df = t + x * (1.0 - t * t);
        let step = f / df;
        x -= step;
        if step.abs() <= TOLERANCE * x.max(1.0) {
            break;
        }
    }
    x / depth
}

/// Wavenumber for a frequency in Hz.
pub fn wavenumber_hz(frequency: f64, depth: f64) -> f64 {
    wavenumber(2.0 * PI * frequency, depth)
}

/// Wavelength (m) for a wave period (s).
pub fn wavelength(period: f64, depth: f64) -> f64 {
    let k = wavenumber(2.0 * PI / period, depth);
    if k > 0.0 {
        2.0 * PI / k
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_dispersion_relation() {
        for (freq, depth) in [(0.1, 0.5), (0.8, 1.0), (2.0, 0.3), (0.05, 20.0), (3.0, 5.0)] {
            let omega = 2.0 * PI * freq;
            let k = wavenumber(omega, depth);
            let lhs = omega * omega;
            let rhs = GRAVITY * k * (k * depth).tanh();
            assert!((lhs - rhs).abs() / lhs < 1e-10, "f={} h={}", freq, depth);
        }
    }

    #[test]
    fn test_deep_and_shallow_limits() {
        let omega = 2.0 * PI * 2.0;
        let deep = wavenumber(omega, 100.0);
        assert!((deep - omega * omega / GRAVITY).abs() / deep < 1e-9);

        let omega = 2.0 * PI * 0.01;
        let depth = 0.5;
        let shallow = wavenumber(omega, depth);
        let expected = omega / (GRAVITY * depth).sqrt();
        assert!((shallow - expected).abs() / expected < 1e-3);
    }

    #[test]
    fn test_zero_frequency() {
        assert_eq!(wavenumber(0.0, 1.0), 0.0);
        assert!(wavelength(0.0_f64.recip(), 1.0).is_infinite());
    }
}
