//! Parameter smoothing shared by every control in the engine
//!
//! Control threads publish targets through [`AtomicF32`]; the render thread
//! owns a [`ParameterSmoother`] per parameter and advances it once per
//! processing cycle. The smoother is a single-pole exponential approach, the
//! same curve as `setTargetAtTime` on a web audio param.

use std::sync::atomic::{AtomicU32, Ordering};

/// Differences smaller than this snap straight to the target
const SETTLE_EPSILON: f32 = 1e-6;

/// Lock-free f32 slot, stored as raw bits in an `AtomicU32`
#[derive(Debug)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
  pub fn new(value: f32) -> Self {
    Self(AtomicU32::new(value.to_bits()))
  }

  #[inline]
  pub fn load(&self) -> f32 {
    f32::from_bits(self.0.load(Ordering::Relaxed))
  }

  #[inline]
  pub fn store(&self, value: f32) {
    self.0.store(value.to_bits(), Ordering::Relaxed);
  }
}

impl Default for AtomicF32 {
  fn default() -> Self {
    Self::new(0.0)
  }
}

/// Start and end values of one processing cycle, for per-sample ramps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
  pub start: f32,
  pub end: f32,
}

impl Ramp {
  /// Value at sample `index` of a block of `len` samples.
  /// Reaches `end` on the last sample.
  #[inline]
  pub fn at(&self, index: usize, len: usize) -> f32 {
    if len == 0 || self.start == self.end {
      return self.end;
    }
    let t = (index + 1) as f32 / len as f32;
    self.start + (self.end - self.start) * t
  }

  pub fn is_flat(&self) -> bool {
    self.start == self.end
  }
}

/// Exponential approach toward a target with time constant τ.
///
/// A new target never resets the output: the approach continues from the
/// current value, so there is neither a jump nor an overshoot. Output stays
/// between the previous value and the target at every step.
#[derive(Debug, Clone)]
pub struct ParameterSmoother {
  current: f32,
  target: f32,
  /// Time constant in seconds; zero means instant
  time_constant: f32,
}

impl ParameterSmoother {
  pub fn new(initial: f32, time_constant: f32) -> Self {
    Self {
      current: initial,
      target: initial,
      time_constant: time_constant.max(0.0),
    }
  }

  /// Non-finite targets are ignored so a bad control value cannot poison the
  /// render path.
  #[inline]
  pub fn set_target(&mut self, target: f32) {
    if target.is_finite() {
      self.target = target;
    }
  }

  /// Advance by `dt` seconds and return the new current value
  pub fn advance(&mut self, dt: f32) -> f32 {
    if self.time_constant <= 0.0 {
      self.current = self.target;
      return self.current;
    }
    if dt > 0.0 {
      let alpha = 1.0 - (-dt / self.time_constant).exp();
      self.current += alpha * (self.target - self.current);
    }
    if (self.target - self.current).abs() < SETTLE_EPSILON {
      self.current = self.target;
    }
    self.current
  }

  /// Advance one cycle and report where it started and ended
  pub fn step(&mut self, dt: f32) -> Ramp {
    let start = self.current;
    let end = self.advance(dt);
    Ramp { start, end }
  }

  #[inline]
  pub fn current(&self) -> f32 {
    self.current
  }

  #[inline]
  pub fn target(&self) -> f32 {
    self.target
  }

  pub fn is_settled(&self) -> bool {
    self.current == self.target
  }

  /// Jump to the target without smoothing
  pub fn snap(&mut self) {
    self.current = self.target;
  }

  pub fn time_constant(&self) -> f32 {
    self.time_constant
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DT: f32 = 128.0 / 44_100.0;

  #[test]
  fn test_atomic_f32_roundtrip() {
    let slot = AtomicF32::new(0.25);
    assert_eq!(slot.load(), 0.25);
    slot.store(-3.5);
    assert_eq!(slot.load(), -3.5);
  }

  #[test]
  fn test_reaches_63_percent_after_one_time_constant() {
    let mut smoother = ParameterSmoother::new(0.0, 0.01);
    smoother.set_target(1.0);
    smoother.advance(0.01);
    assert!((smoother.current() - 0.632).abs() < 0.001);
  }

  #[test]
  fn test_cycle_steps_compose() {
    // Ten small steps equal one big step of the same total duration
    let mut a = ParameterSmoother::new(0.0, 0.05);
    let mut b = ParameterSmoother::new(0.0, 0.05);
    a.set_target(1.0);
    b.set_target(1.0);
    for _ in 0..10 {
      a.advance(DT);
    }
    b.advance(DT * 10.0);
    assert!((a.current() - b.current()).abs() < 1e-5);
  }

  #[test]
  fn test_never_overshoots() {
    let mut smoother = ParameterSmoother::new(0.0, 0.01);
    smoother.set_target(1.0);
    let mut previous = 0.0;
    for _ in 0..1000 {
      let value = smoother.advance(DT);
      assert!(value >= previous);
      assert!(value <= 1.0);
      previous = value;
    }
    assert!(smoother.is_settled());
  }

  #[test]
  fn test_retarget_continues_from_current_value() {
    let mut smoother = ParameterSmoother::new(0.0, 0.05);
    smoother.set_target(1.0);
    for _ in 0..5 {
      smoother.advance(DT);
    }
    let midway = smoother.current();
    assert!(midway > 0.0 && midway < 1.0);

    smoother.set_target(-1.0);
    // No reset: the very first value after retargeting is close to midway
    let next = smoother.advance(DT);
    assert!(next < midway);
    assert!((next - midway).abs() < 0.1);
  }

  #[test]
  fn test_output_bounded_by_targets() {
    let mut smoother = ParameterSmoother::new(0.5, 0.01);
    let targets = [1.0, 0.2, 0.9, 0.0, 0.7];
    for (i, &target) in targets.iter().enumerate() {
      smoother.set_target(target);
      for _ in 0..(i + 3) {
        let value = smoother.advance(DT);
        assert!((0.0..=1.0).contains(&value));
      }
    }
  }

  #[test]
  fn test_zero_time_constant_is_instant() {
    let mut smoother = ParameterSmoother::new(0.0, 0.0);
    smoother.set_target(0.8);
    assert_eq!(smoother.advance(DT), 0.8);
  }

  #[test]
  fn test_non_finite_target_ignored() {
    let mut smoother = ParameterSmoother::new(0.3, 0.01);
    smoother.set_target(f32::NAN);
    assert_eq!(smoother.target(), 0.3);
    smoother.set_target(f32::INFINITY);
    assert_eq!(smoother.target(), 0.3);
  }

  #[test]
  fn test_ramp_interpolates_to_end() {
    let ramp = Ramp { start: 0.0, end: 1.0 };
    assert_eq!(ramp.at(3, 4), 1.0);
    assert!((ramp.at(1, 4) - 0.5).abs() < 1e-6);
    assert!(!ramp.is_flat());
  }
}
