//! Crossfader and master bus

use std::f32::consts::PI;

use crate::config::SmoothingConfig;
use crate::smoother::{AtomicF32, ParameterSmoother};

pub const DEFAULT_CROSSFADER: f32 = 0.5;
pub const DEFAULT_MASTER_VOLUME: f32 = 1.0;

/// Constant power curve: `gainA² + gainB² = 1` at every position.
/// `0` is deck A only, `1` deck B only.
pub fn equal_power_gains(position: f32) -> (f32, f32) {
  let x = position.clamp(0.0, 1.0);
  ((x * PI / 2.0).cos(), ((1.0 - x) * PI / 2.0).cos())
}

/// Bus-level targets written by the control side
#[derive(Debug)]
pub struct MixerControls {
  crossfader: AtomicF32,
  master_volume: AtomicF32,
}

impl Default for MixerControls {
  fn default() -> Self {
    Self {
      crossfader: AtomicF32::new(DEFAULT_CROSSFADER),
      master_volume: AtomicF32::new(DEFAULT_MASTER_VOLUME),
    }
  }
}

impl MixerControls {
  pub fn set_crossfader(&self, position: f32) {
    if position.is_finite() {
      self.crossfader.store(position.clamp(0.0, 1.0));
    }
  }

  pub fn crossfader(&self) -> f32 {
    self.crossfader.load()
  }

  pub fn set_master_volume(&self, volume: f32) {
    if volume.is_finite() {
      self.master_volume.store(volume.clamp(0.0, 1.0));
    }
  }

  pub fn master_volume(&self) -> f32 {
    self.master_volume.load()
  }
}

/// Blends two deck blocks. Each derived gain is smoothed on its own so a
/// fast fader throw ramps instead of clicking.
pub struct CrossfadeBus {
  gain_a: ParameterSmoother,
  gain_b: ParameterSmoother,
}

impl CrossfadeBus {
  pub fn new(position: f32, smoothing: &SmoothingConfig) -> Self {
    let (a, b) = equal_power_gains(position);
    Self {
      gain_a: ParameterSmoother::new(a, smoothing.fast),
      gain_b: ParameterSmoother::new(b, smoothing.fast),
    }
  }

  /// `out = deck_a * gainA + deck_b * gainB`, all interleaved stereo
  pub fn mix(&mut self, position: f32, deck_a: &[f32], deck_b: &[f32], out: &mut [f32], dt: f32) {
    let (target_a, target_b) = equal_power_gains(position);
    self.gain_a.set_target(target_a);
    self.gain_b.set_target(target_b);
    let ramp_a = self.gain_a.step(dt);
    let ramp_b = self.gain_b.step(dt);

    let frames = out.len() / 2;
    for (i, ((frame, a), b)) in out
      .chunks_exact_mut(2)
      .zip(deck_a.chunks_exact(2))
      .zip(deck_b.chunks_exact(2))
      .enumerate()
    {
      let ga = ramp_a.at(i, frames);
      let gb = ramp_b.at(i, frames);
      frame[0] = a[0] * ga + b[0] * gb;
      frame[1] = a[1] * ga + b[1] * gb;
    }
  }

  #[cfg(test)]
  fn gains(&self) -> (f32, f32) {
    (self.gain_a.current(), self.gain_b.current())
  }
}

/// Final gain stage. The processed block is what both the device and the
/// recording tap receive.
pub struct MasterBus {
  volume: ParameterSmoother,
}

impl MasterBus {
  pub fn new(volume: f32, smoothing: &SmoothingConfig) -> Self {
    Self {
      volume: ParameterSmoother::new(volume, smoothing.fast),
    }
  }

  pub fn process(&mut self, volume: f32, block: &mut [f32], dt: f32) {
    self.volume.set_target(volume);
    let ramp = self.volume.step(dt);
    let frames = block.len() / 2;
    for (i, frame) in block.chunks_exact_mut(2).enumerate() {
      let gain = ramp.at(i, frames);
      // Clip output
      frame[0] = (frame[0] * gain).clamp(-1.0, 1.0);
      frame[1] = (frame[1] * gain).clamp(-1.0, 1.0);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_equal_power_sum_is_constant() {
    for step in 0..=100 {
      let (a, b) = equal_power_gains(step as f32 / 100.0);
      assert!((a * a + b * b - 1.0).abs() < 1e-5, "x = {}", step);
    }
  }

  #[test]
  fn test_equal_power_endpoints() {
    let (a, b) = equal_power_gains(0.0);
    assert!((a - 1.0).abs() < 1e-6 && b.abs() < 1e-6);
    let (a, b) = equal_power_gains(1.0);
    assert!(a.abs() < 1e-6 && (b - 1.0).abs() < 1e-6);
    let (a, b) = equal_power_gains(0.5);
    assert!((a - 0.70710677).abs() < 1e-5);
    assert!((b - 0.70710677).abs() < 1e-5);
  }

  #[test]
  fn test_crossfade_mix_ramps_to_target() {
    let smoothing = SmoothingConfig::default();
    let mut bus = CrossfadeBus::new(0.0, &smoothing);
    let a = vec![1.0f32; 256];
    let b = vec![0.5f32; 256];
    let mut out = vec![0.0f32; 256];

    bus.mix(1.0, &a, &b, &mut out, 128.0 / 44_100.0);
    // No jump on the first sample
    assert!((out[0] - 1.0).abs() < 0.01);

    for _ in 0..200 {
      bus.mix(1.0, &a, &b, &mut out, 128.0 / 44_100.0);
    }
    assert!((out[0] - 0.5).abs() < 1e-4);
    let (ga, gb) = bus.gains();
    assert!(ga.abs() < 1e-4 && (gb - 1.0).abs() < 1e-4);
  }

  #[test]
  fn test_master_bus_clamps() {
    let mut master = MasterBus::new(1.0, &SmoothingConfig::default());
    let mut block = vec![1.5, -2.0, 0.25, -0.25];
    master.process(1.0, &mut block, 2.0 / 44_100.0);
    assert_eq!(block, vec![1.0, -1.0, 0.25, -0.25]);
  }

  #[test]
  fn test_controls_clamp() {
    let controls = MixerControls::default();
    assert_eq!(controls.crossfader(), 0.5);
    assert_eq!(controls.master_volume(), 1.0);
    controls.set_crossfader(3.0);
    controls.set_master_volume(f32::NAN);
    assert_eq!(controls.crossfader(), 1.0);
    assert_eq!(controls.master_volume(), 1.0);
  }
}
