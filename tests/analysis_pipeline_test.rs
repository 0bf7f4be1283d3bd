//! Buffer → spectrum → reflection through the public data API.

use chrono::Utc;
use std::f64::consts::PI;
use std::sync::Arc;
use wave_daq::data::{
    dispersion,
    fft::{PlanKey, SpectralOptions},
    reflection::ReflectionConfig,
    BufferConfig, CircularBuffer, ProbeGeometry, PushOutcome, ReflectionAnalyzer, SampleFrame,
    SpectralProcessor, Spectrum, WindowKind,
};

const FS: f64 = 32.0;
const N: usize = 1024;
const FREQ: f64 = 25.0 / 32.0;
const POSITIONS: [f64; 4] = [0.0, 0.3, 0.7, 1.2];

fn frame(sequence: u64) -> Arc<SampleFrame> {
    Arc::new(SampleFrame::new(
        sequence,
        Utc::now(),
        FS,
        vec![vec![sequence as f64; 8]; 2],
    ))
}

fn wave_field(kr: f64) -> Vec<Spectrum> {
    let processor = SpectralProcessor::new();
    let options = SpectralOptions {
        window: WindowKind::Rectangular,
        remove_mean: false,
        zero_pad_to: None,
    };
    let omega = 2.0 * PI * FREQ;
    let k = dispersion::wavenumber(omega, 1.0);
    POSITIONS
        .iter()
        .map(|&x| {
            let samples: Vec<f64> = (0..N)
                .map(|i| {
                    let t = i as f64 / FS;
                    0.04 * (omega * t - k * x).cos() + kr * 0.04 * (omega * t + k * x).cos()
                })
                .collect();
            processor.spectrum(&samples, FS, &options).unwrap()
        })
        .collect()
}

fn reflection(kr: f64) -> Option<f64> {
    let spectra = wave_field(kr);
    let refs: Vec<&Spectrum> = spectra.iter().collect();
    let geometry = ProbeGeometry::new(POSITIONS.to_vec()).unwrap();
    let config = ReflectionConfig {
        min_frequency: 0.05,
        ..ReflectionConfig::default()
    };
    ReflectionAnalyzer::new()
        .analyze(&refs, &geometry, &config)
        .unwrap()
        .kr
}

#[test]
fn test_overwrite_buffer_keeps_latest_thousand() {
    let buffer = CircularBuffer::new(BufferConfig::new(1000, 2)).unwrap();
    for seq in 1..=1500 {
        buffer.push(frame(seq));
    }
    assert_eq!(buffer.used(), 1000);
    assert_eq!(buffer.dropped_frame_count(), 500);

    let frames = buffer.pop_batch(1000);
    assert_eq!(frames.first().unwrap().sequence(), 501);
    assert_eq!(frames.last().unwrap().sequence(), 1500);
    assert!(buffer.is_empty());
}

#[test]
fn test_rejecting_buffer_keeps_oldest_thousand() {
    let buffer = CircularBuffer::new(BufferConfig::new(1000, 2).rejecting()).unwrap();
    let mut rejected = 0;
    for seq in 1..=1500 {
        if buffer.push(frame(seq)) == PushOutcome::Rejected {
            rejected += 1;
        }
    }
    assert_eq!(rejected, 500);
    assert_eq!(buffer.dropped_frame_count(), 500);
    assert_eq!(buffer.pop_batch(1).first().unwrap().sequence(), 1);
}

#[test]
fn test_plan_cache_is_shared() {
    let processor = SpectralProcessor::new();
    let key = PlanKey {
        transform_len: N,
        window_len: N,
        window: WindowKind::Hann,
    };
    let first = processor.plan(key).unwrap();
    let second = processor.plan(key).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let stats = processor.cache_stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_hann_spectrum_grid() {
    let samples: Vec<f64> = (0..N)
        .map(|i| (2.0 * PI * FREQ * i as f64 / FS).sin())
        .collect();
    let spectrum = SpectralProcessor::new()
        .spectrum(&samples, FS, &SpectralOptions::default())
        .unwrap();
    assert_eq!(spectrum.bin_count(), N / 2 + 1);
    assert!((spectrum.bin_spacing() - FS / N as f64).abs() < 1e-12);
    let (bin, frequency) = spectrum.peak().unwrap();
    assert_eq!(bin, 25);
    assert!((frequency - FREQ).abs() < 1e-12);
}

#[test]
fn test_incident_only_field() {
    let kr = reflection(0.0).unwrap();
    assert!(kr < 0.01, "Kr = {}", kr);
}

#[test]
fn test_standing_wave_field() {
    let kr = reflection(1.0).unwrap();
    assert!((kr - 1.0).abs() < 0.05, "Kr = {}", kr);
}
