//! Biquad filter primitives
//!
//! Coefficients follow the Audio EQ Cookbook with the same conventions as
//! web audio `BiquadFilterNode`:
//! - lowpass/highpass Q is given in dB
//! - shelves use a fixed slope of 1
//! - peaking Q is linear
//!
//! Filters run in Direct Form I on interleaved stereo buffers.

use std::f64::consts::PI;

/// Lowest frequency a filter is designed for
const MIN_FREQUENCY: f64 = 10.0;
/// Keep designs clear of Nyquist where the cookbook formulas degenerate
const MAX_NYQUIST_FRACTION: f64 = 0.98;

/// Biquad filter coefficients (Direct Form I), normalised so a0 = 1
/// Transfer function: H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoefficients {
  b0: f32,
  b1: f32,
  b2: f32,
  a1: f32,
  a2: f32,
}

impl Default for BiquadCoefficients {
  fn default() -> Self {
    Self::identity()
  }
}

struct Design {
  cos_w0: f64,
  sin_w0: f64,
}

impl Design {
  fn new(frequency: f32, sample_rate: f32) -> Self {
    let sample_rate = sample_rate.max(1.0) as f64;
    let nyquist = sample_rate / 2.0;
    let frequency = (frequency as f64).clamp(MIN_FREQUENCY, nyquist * MAX_NYQUIST_FRACTION);
    let w0 = 2.0 * PI * frequency / sample_rate;
    Self {
      cos_w0: w0.cos(),
      sin_w0: w0.sin(),
    }
  }
}

impl BiquadCoefficients {
  fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
    Self {
      b0: (b0 / a0) as f32,
      b1: (b1 / a0) as f32,
      b2: (b2 / a0) as f32,
      a1: (a1 / a0) as f32,
      a2: (a2 / a0) as f32,
    }
  }

  /// Pass-through (unity gain, no filtering)
  pub fn identity() -> Self {
    Self {
      b0: 1.0,
      b1: 0.0,
      b2: 0.0,
      a1: 0.0,
      a2: 0.0,
    }
  }

  /// 2nd-order lowpass, resonance `q_db` in dB
  pub fn lowpass(frequency: f32, q_db: f32, sample_rate: f32) -> Self {
    let d = Design::new(frequency, sample_rate);
    let alpha = d.sin_w0 / (2.0 * 10f64.powf(q_db as f64 / 20.0));
    Self::normalized(
      (1.0 - d.cos_w0) / 2.0,
      1.0 - d.cos_w0,
      (1.0 - d.cos_w0) / 2.0,
      1.0 + alpha,
      -2.0 * d.cos_w0,
      1.0 - alpha,
    )
  }

  /// 2nd-order highpass, resonance `q_db` in dB
  pub fn highpass(frequency: f32, q_db: f32, sample_rate: f32) -> Self {
    let d = Design::new(frequency, sample_rate);
    let alpha = d.sin_w0 / (2.0 * 10f64.powf(q_db as f64 / 20.0));
    Self::normalized(
      (1.0 + d.cos_w0) / 2.0,
      -(1.0 + d.cos_w0),
      (1.0 + d.cos_w0) / 2.0,
      1.0 + alpha,
      -2.0 * d.cos_w0,
      1.0 - alpha,
    )
  }

  /// Low shelf boosting/cutting below `frequency` by `gain_db`
  pub fn low_shelf(frequency: f32, gain_db: f32, sample_rate: f32) -> Self {
    let d = Design::new(frequency, sample_rate);
    let a = 10f64.powf(gain_db as f64 / 40.0);
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * d.sin_w0 / 2.0 * 2f64.sqrt();
    Self::normalized(
      a * ((a + 1.0) - (a - 1.0) * d.cos_w0 + two_sqrt_a_alpha),
      2.0 * a * ((a - 1.0) - (a + 1.0) * d.cos_w0),
      a * ((a + 1.0) - (a - 1.0) * d.cos_w0 - two_sqrt_a_alpha),
      (a + 1.0) + (a - 1.0) * d.cos_w0 + two_sqrt_a_alpha,
      -2.0 * ((a - 1.0) + (a + 1.0) * d.cos_w0),
      (a + 1.0) + (a - 1.0) * d.cos_w0 - two_sqrt_a_alpha,
    )
  }

  /// High shelf boosting/cutting above `frequency` by `gain_db`
  pub fn high_shelf(frequency: f32, gain_db: f32, sample_rate: f32) -> Self {
    let d = Design::new(frequency, sample_rate);
    let a = 10f64.powf(gain_db as f64 / 40.0);
    let two_sqrt_a_alpha = 2.0 * a.sqrt() * d.sin_w0 / 2.0 * 2f64.sqrt();
    Self::normalized(
      a * ((a + 1.0) + (a - 1.0) * d.cos_w0 + two_sqrt_a_alpha),
      -2.0 * a * ((a - 1.0) + (a + 1.0) * d.cos_w0),
      a * ((a + 1.0) + (a - 1.0) * d.cos_w0 - two_sqrt_a_alpha),
      (a + 1.0) - (a - 1.0) * d.cos_w0 + two_sqrt_a_alpha,
      2.0 * ((a - 1.0) - (a + 1.0) * d.cos_w0),
      (a + 1.0) - (a - 1.0) * d.cos_w0 - two_sqrt_a_alpha,
    )
  }

  /// Peaking band around `frequency` with linear `q`
  pub fn peaking(frequency: f32, q: f32, gain_db: f32, sample_rate: f32) -> Self {
    let d = Design::new(frequency, sample_rate);
    let a = 10f64.powf(gain_db as f64 / 40.0);
    let alpha = d.sin_w0 / (2.0 * (q as f64).max(1e-3));
    Self::normalized(
      1.0 + alpha * a,
      -2.0 * d.cos_w0,
      1.0 - alpha * a,
      1.0 + alpha / a,
      -2.0 * d.cos_w0,
      1.0 - alpha / a,
    )
  }

  /// |H| at `frequency`, for analysis and tests
  pub fn magnitude_at(&self, frequency: f32, sample_rate: f32) -> f32 {
    let w = 2.0 * PI * frequency as f64 / sample_rate as f64;
    let (c1, s1) = (w.cos(), w.sin());
    let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());
    let (b0, b1, b2) = (self.b0 as f64, self.b1 as f64, self.b2 as f64);
    let (a1, a2) = (self.a1 as f64, self.a2 as f64);

    let num_re = b0 + b1 * c1 + b2 * c2;
    let num_im = -(b1 * s1 + b2 * s2);
    let den_re = 1.0 + a1 * c1 + a2 * c2;
    let den_im = -(a1 * s1 + a2 * s2);

    ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt() as f32
  }
}

/// Biquad filter state for one channel
#[derive(Default, Clone, Debug)]
struct BiquadFilterChannel {
  x1: f32, // Input delayed by 1 sample
  x2: f32, // Input delayed by 2 samples
  y1: f32, // Output delayed by 1 sample
  y2: f32, // Output delayed by 2 samples
}

impl BiquadFilterChannel {
  /// Process one sample through the biquad filter (Direct Form I)
  #[inline]
  fn process(&mut self, input: f32, coeffs: &BiquadCoefficients) -> f32 {
    let output = coeffs.b0 * input + coeffs.b1 * self.x1 + coeffs.b2 * self.x2
      - coeffs.a1 * self.y1
      - coeffs.a2 * self.y2;

    // Flush denormals so a silent tail does not stall the CPU
    let output = if output.abs() < 1e-20 { 0.0 } else { output };

    self.x2 = self.x1;
    self.x1 = input;
    self.y2 = self.y1;
    self.y1 = output;

    output
  }
}

/// Stereo biquad filter
#[derive(Default, Clone, Debug)]
pub struct BiquadFilter {
  left: BiquadFilterChannel,
  right: BiquadFilterChannel,
}

impl BiquadFilter {
  /// Process stereo interleaved buffer in-place
  pub fn process_interleaved(&mut self, buffer: &mut [f32], coeffs: &BiquadCoefficients) {
    for frame in buffer.chunks_exact_mut(2) {
      frame[0] = self.left.process(frame[0], coeffs);
      frame[1] = self.right.process(frame[1], coeffs);
    }
  }

  pub fn reset(&mut self) {
    *self = Self::default();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SR: f32 = 44_100.0;

  fn db(gain: f32) -> f32 {
    20.0 * gain.log10()
  }

  #[test]
  fn test_identity_is_flat() {
    let coeffs = BiquadCoefficients::identity();
    for freq in [20.0, 1000.0, 15_000.0] {
      assert!((coeffs.magnitude_at(freq, SR) - 1.0).abs() < 1e-6);
    }
  }

  #[test]
  fn test_lowpass_passes_lows_and_cuts_highs() {
    let coeffs = BiquadCoefficients::lowpass(500.0, 1.0, SR);
    assert!((coeffs.magnitude_at(50.0, SR) - 1.0).abs() < 0.02);
    assert!(db(coeffs.magnitude_at(5000.0, SR)) < -35.0);
  }

  #[test]
  fn test_highpass_passes_highs_and_cuts_lows() {
    let coeffs = BiquadCoefficients::highpass(8020.0, 1.0, SR);
    assert!(db(coeffs.magnitude_at(500.0, SR)) < -40.0);
    assert!((coeffs.magnitude_at(18_000.0, SR) - 1.0).abs() < 0.1);
  }

  #[test]
  fn test_shelves_reach_their_gain() {
    let low = BiquadCoefficients::low_shelf(320.0, 12.0, SR);
    assert!((db(low.magnitude_at(20.0, SR)) - 12.0).abs() < 0.5);
    assert!(db(low.magnitude_at(10_000.0, SR)).abs() < 0.5);

    let high = BiquadCoefficients::high_shelf(2500.0, -12.0, SR);
    assert!((db(high.magnitude_at(18_000.0, SR)) + 12.0).abs() < 0.7);
    assert!(db(high.magnitude_at(50.0, SR)).abs() < 0.5);
  }

  #[test]
  fn test_peaking_centre_gain() {
    let peak = BiquadCoefficients::peaking(1000.0, 1.0, 6.0, SR);
    assert!((db(peak.magnitude_at(1000.0, SR)) - 6.0).abs() < 0.1);
    assert!(db(peak.magnitude_at(40.0, SR)).abs() < 0.3);
  }

  #[test]
  fn test_zero_gain_shelf_is_transparent() {
    let coeffs = BiquadCoefficients::low_shelf(80.0, 0.0, SR);
    assert!((coeffs.magnitude_at(60.0, SR) - 1.0).abs() < 1e-3);
  }

  #[test]
  fn test_frequency_above_nyquist_is_clamped() {
    let coeffs = BiquadCoefficients::lowpass(40_000.0, 1.0, SR);
    assert!(coeffs.magnitude_at(1000.0, SR).is_finite());
  }

  #[test]
  fn test_filter_processes_interleaved_channels_independently() {
    let coeffs = BiquadCoefficients::lowpass(1000.0, 1.0, SR);
    let mut filter = BiquadFilter::default();
    let mut buffer = vec![0.0f32; 64];
    buffer[0] = 1.0; // impulse on the left only
    filter.process_interleaved(&mut buffer, &coeffs);
    assert!(buffer.iter().skip(1).step_by(2).all(|&s| s == 0.0));
    assert!(buffer.iter().step_by(2).any(|&s| s != 0.0));
  }
}
