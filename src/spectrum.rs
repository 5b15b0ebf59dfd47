//! Frequency snapshots for visualisation
//!
//! The analyser runs on the render thread after each deck's effect chain and
//! publishes one dB value per bin into a shared [`SpectrumSnapshot`]. Readers
//! on any thread copy the bins out without locking.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::smoother::AtomicF32;

/// Temporal smoothing between successive frames
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
/// dB mapped to byte 0
pub const MIN_DECIBELS: f32 = -100.0;
/// dB mapped to byte 255
pub const MAX_DECIBELS: f32 = -30.0;
/// Reported for bins with no energy at all
const SILENCE_DB: f32 = -160.0;

/// Latest spectrum of one deck, in dB per bin
#[derive(Debug)]
pub struct SpectrumSnapshot {
  bins: Vec<AtomicF32>,
}

impl SpectrumSnapshot {
  pub fn new(bin_count: usize) -> Self {
    Self {
      bins: (0..bin_count).map(|_| AtomicF32::new(SILENCE_DB)).collect(),
    }
  }

  /// Smoothed magnitude of every bin in dB.
  ///
  /// Bins are published one by one, so a read that overlaps a frame update
  /// may mix bins from two adjacent frames. Each bin on its own is consistent.
  pub fn magnitudes(&self) -> Vec<f32> {
    self.bins.iter().map(AtomicF32::load).collect()
  }

  /// Bins scaled to `0..=255` over `[MIN_DECIBELS, MAX_DECIBELS]`
  pub fn byte_frequency_data(&self) -> Vec<u8> {
    self.bins.iter().map(|bin| db_to_byte(bin.load())).collect()
  }

  fn publish(&self, index: usize, db: f32) {
    if let Some(bin) = self.bins.get(index) {
      bin.store(db);
    }
  }
}

fn db_to_byte(db: f32) -> u8 {
  let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
  scaled.clamp(0.0, 255.0) as u8
}

/// Blackman window coefficients
fn blackman_window(size: usize) -> Vec<f32> {
  (0..size)
    .map(|i| {
      let phase = 2.0 * PI * i as f32 / size as f32;
      0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
    })
    .collect()
}

/// Render-side analyser. All buffers are allocated up front.
pub struct SpectrumAnalyzer {
  fft: Arc<dyn Fft<f32>>,
  window: Vec<f32>,
  /// Ring of the most recent mono samples
  history: Vec<f32>,
  write_pos: usize,
  buffer: Vec<Complex<f32>>,
  scratch: Vec<Complex<f32>>,
  smoothed: Vec<f32>,
  snapshot: Arc<SpectrumSnapshot>,
}

impl SpectrumAnalyzer {
  pub fn new(fft_size: usize, snapshot: Arc<SpectrumSnapshot>) -> Self {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_size);
    let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
    Self {
      window: blackman_window(fft_size),
      history: vec![0.0; fft_size],
      write_pos: 0,
      buffer: vec![Complex::new(0.0, 0.0); fft_size],
      scratch,
      smoothed: vec![0.0; fft_size / 2],
      fft,
      snapshot,
    }
  }

  /// Feed one interleaved stereo block and publish a new frame
  pub fn process(&mut self, block: &[f32]) {
    let size = self.history.len();
    for frame in block.chunks_exact(2) {
      self.history[self.write_pos] = (frame[0] + frame[1]) * 0.5;
      self.write_pos = (self.write_pos + 1) % size;
    }
    self.analyze();
  }

  fn analyze(&mut self) {
    let size = self.history.len();
    // Oldest sample first
    for (i, slot) in self.buffer.iter_mut().enumerate() {
      let sample = self.history[(self.write_pos + i) % size];
      *slot = Complex::new(sample * self.window[i], 0.0);
    }
    self
      .fft
      .process_with_scratch(&mut self.buffer, &mut self.scratch);

    let scale = 1.0 / size as f32;
    for (index, (smoothed, bin)) in self
      .smoothed
      .iter_mut()
      .zip(self.buffer.iter())
      .enumerate()
    {
      let magnitude = bin.norm() * scale;
      let mut value =
        SMOOTHING_TIME_CONSTANT * *smoothed + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
      if !value.is_finite() {
        value = 0.0;
      }
      *smoothed = value;
      let db = if value > 0.0 {
        (20.0 * value.log10()).max(SILENCE_DB)
      } else {
        SILENCE_DB
      };
      self.snapshot.publish(index, db);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SR: f32 = 44_100.0;

  fn analyzer() -> (Arc<SpectrumSnapshot>, SpectrumAnalyzer) {
    let snapshot = Arc::new(SpectrumSnapshot::new(128));
    (Arc::clone(&snapshot), SpectrumAnalyzer::new(256, snapshot))
  }

  fn feed_sine(analyzer: &mut SpectrumAnalyzer, freq: f32, blocks: usize) {
    for b in 0..blocks {
      let block: Vec<f32> = (0..128)
        .flat_map(|i| {
          let t = (b * 128 + i) as f32 / SR;
          let s = 0.5 * (2.0 * PI * freq * t).sin();
          [s, s]
        })
        .collect();
      analyzer.process(&block);
    }
  }

  #[test]
  fn test_silence_reads_as_zero_bytes() {
    let (snapshot, mut analyzer) = analyzer();
    analyzer.process(&[0.0; 256]);
    let bytes = snapshot.byte_frequency_data();
    assert_eq!(bytes.len(), 128);
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn test_sine_peaks_at_its_bin() {
    let (snapshot, mut analyzer) = analyzer();
    feed_sine(&mut analyzer, 1000.0, 40);
    let magnitudes = snapshot.magnitudes();
    let peak = magnitudes
      .iter()
      .enumerate()
      .max_by(|a, b| a.1.total_cmp(b.1))
      .map(|(i, _)| i)
      .unwrap();
    // 1 kHz at 172 Hz per bin
    assert!(peak == 5 || peak == 6, "peak bin {}", peak);
    assert!(magnitudes[peak] > magnitudes[40] + 40.0);
  }

  #[test]
  fn test_smoothing_decays_gradually() {
    let (snapshot, mut analyzer) = analyzer();
    feed_sine(&mut analyzer, 1000.0, 40);
    let loud = snapshot.magnitudes()[6];
    analyzer.process(&[0.0; 512]);
    let after_silence = snapshot.magnitudes()[6];
    assert!(after_silence < loud);
    // One frame of silence only removes 20% of the smoothed magnitude
    assert!(after_silence > loud - 3.0);
  }

  #[test]
  fn test_db_to_byte_range() {
    assert_eq!(db_to_byte(-120.0), 0);
    assert_eq!(db_to_byte(MIN_DECIBELS), 0);
    assert_eq!(db_to_byte(MAX_DECIBELS), 255);
    assert_eq!(db_to_byte(0.0), 255);
    assert_eq!(db_to_byte(-65.0), 127);
  }
}
