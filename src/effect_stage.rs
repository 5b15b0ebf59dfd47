//! Per-deck effect chain
//!
//! Fixed topology, in this order:
//! 1. Drive (waveshaper)
//! 2. Sub-bass low shelf at 80 Hz
//! 3. 3-band EQ: low shelf 320 Hz, peak 1 kHz (Q 1), high shelf 2.5 kHz
//! 4. Sweepable filter (low-pass below zero, high-pass above)
//! 5. Volume
//!
//! [`EffectParameters`] is the control-thread side: one atomic target per
//! control plus the current drive curve. [`EffectStage`] is the render-thread
//! side that smooths those targets and runs the chain.

use std::f32::consts::PI;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::SmoothingConfig;
use crate::filters::{BiquadCoefficients, BiquadFilter};
use crate::retire::{RetireSender, Retired};
use crate::smoother::{AtomicF32, ParameterSmoother};

/// Drive amounts at or below this leave the signal untouched
pub const DRIVE_BYPASS_THRESHOLD: f32 = 0.1;
/// Lookup table resolution for the drive curve
pub const DRIVE_CURVE_LEN: usize = 44_100;
/// Small-angle scale of the drive transfer function (20 degrees)
const DRIVE_ANGLE: f32 = 20.0 * PI / 180.0;

const SUB_BASS_FREQ: f32 = 80.0;
/// dB of shelf gain per unit of sub-bass amount
const SUB_BASS_DB_PER_UNIT: f32 = 1.5;
const EQ_LOW_FREQ: f32 = 320.0;
const EQ_MID_FREQ: f32 = 1000.0;
const EQ_MID_Q: f32 = 1.0;
const EQ_HIGH_FREQ: f32 = 2500.0;
const EQ_RANGE_DB: f32 = 12.0;
/// Resonance of the sweep filter, dB
const FILTER_Q_DB: f32 = 1.0;
const FILTER_RANGE: f32 = 100.0;
const LOW_PASS_OPEN_HZ: f32 = 20_000.0;
const HIGH_PASS_OPEN_HZ: f32 = 20.0;

/// Coefficients are only redesigned when a smoothed value moves this much
const GAIN_RECALC_THRESHOLD_DB: f32 = 0.01;
const FREQ_RECALC_THRESHOLD_HZ: f32 = 0.5;

/// EQ band identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EqBand {
  Low,
  Mid,
  High,
}

impl FromStr for EqBand {
  type Err = String;

  fn from_str(band: &str) -> Result<Self, Self::Err> {
    match band {
      "low" => Ok(EqBand::Low),
      "mid" => Ok(EqBand::Mid),
      "high" => Ok(EqBand::High),
      _ => Err(format!("Invalid EQ band: {}", band)),
    }
  }
}

/// Saturating transfer function `(3 + k)·x·θ / (π + k·|x|)` with `k = amount·10`
pub fn drive_transfer(amount: f32, x: f32) -> f32 {
  let k = amount * 10.0;
  (3.0 + k) * x * DRIVE_ANGLE / (PI + k * x.abs())
}

/// Precomputed drive transfer curve spanning `[-1, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct DriveCurve {
  amount: f32,
  table: Vec<f32>,
}

impl DriveCurve {
  /// `None` when the amount is low enough to bypass the stage
  pub fn new(amount: f32) -> Option<Self> {
    if !(amount > DRIVE_BYPASS_THRESHOLD) {
      return None;
    }
    let last = (DRIVE_CURVE_LEN - 1) as f32;
    let table = (0..DRIVE_CURVE_LEN)
      .map(|i| drive_transfer(amount, i as f32 * 2.0 / last - 1.0))
      .collect();
    Some(Self { amount, table })
  }

  pub fn amount(&self) -> f32 {
    self.amount
  }

  /// Interpolated table lookup; input outside `[-1, 1]` is clamped
  #[inline]
  pub fn shape(&self, x: f32) -> f32 {
    let last = self.table.len() - 1;
    let position = (x.clamp(-1.0, 1.0) + 1.0) * 0.5 * last as f32;
    let index = (position as usize).min(last);
    let next = (index + 1).min(last);
    let frac = position - index as f32;
    self.table[index] + (self.table[next] - self.table[index]) * frac
  }
}

/// What the sweep filter does for a given amount
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterMode {
  Bypass,
  LowPass(f32),
  HighPass(f32),
}

impl FilterMode {
  /// `-100` is a 500 Hz low-pass, `0` neutral, `100` an 8020 Hz high-pass
  pub fn from_amount(amount: f32) -> Self {
    let amount = amount.clamp(-FILTER_RANGE, FILTER_RANGE);
    if amount > 0.0 {
      FilterMode::HighPass(HIGH_PASS_OPEN_HZ + (amount / FILTER_RANGE) * 8000.0)
    } else if amount < 0.0 {
      FilterMode::LowPass(LOW_PASS_OPEN_HZ - (amount.abs() / FILTER_RANGE) * 19_500.0)
    } else {
      FilterMode::Bypass
    }
  }

  pub fn cutoff(&self) -> Option<f32> {
    match *self {
      FilterMode::Bypass => None,
      FilterMode::LowPass(freq) | FilterMode::HighPass(freq) => Some(freq),
    }
  }

  fn same_kind(&self, other: &FilterMode) -> bool {
    std::mem::discriminant(self) == std::mem::discriminant(other)
  }
}

/// Plain copy of a deck's effect targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectSettings {
  pub volume: f32,
  pub eq_low: f32,
  pub eq_mid: f32,
  pub eq_high: f32,
  pub filter: f32,
  pub drive: f32,
  pub sub_bass: f32,
}

impl Default for EffectSettings {
  fn default() -> Self {
    Self {
      volume: 1.0,
      eq_low: 0.0,
      eq_mid: 0.0,
      eq_high: 0.0,
      filter: 0.0,
      drive: 0.0,
      sub_bass: 0.0,
    }
  }
}

/// Control-side targets, shared with the render thread.
///
/// Every setter clamps into range, ignores non-finite input and returns
/// immediately.
#[derive(Debug)]
pub struct EffectParameters {
  volume: AtomicF32,
  eq_low: AtomicF32,
  eq_mid: AtomicF32,
  eq_high: AtomicF32,
  filter: AtomicF32,
  drive: AtomicF32,
  sub_bass: AtomicF32,
  drive_curve: ArcSwapOption<DriveCurve>,
}

impl Default for EffectParameters {
  fn default() -> Self {
    let defaults = EffectSettings::default();
    Self {
      volume: AtomicF32::new(defaults.volume),
      eq_low: AtomicF32::new(defaults.eq_low),
      eq_mid: AtomicF32::new(defaults.eq_mid),
      eq_high: AtomicF32::new(defaults.eq_high),
      filter: AtomicF32::new(defaults.filter),
      drive: AtomicF32::new(defaults.drive),
      sub_bass: AtomicF32::new(defaults.sub_bass),
      drive_curve: ArcSwapOption::empty(),
    }
  }
}

fn store_clamped(slot: &AtomicF32, value: f32, min: f32, max: f32) {
  if value.is_finite() {
    slot.store(value.clamp(min, max));
  }
}

impl EffectParameters {
  pub fn set_volume(&self, volume: f32) {
    store_clamped(&self.volume, volume, 0.0, 1.0);
  }

  pub fn set_eq(&self, band: EqBand, gain_db: f32) {
    let slot = match band {
      EqBand::Low => &self.eq_low,
      EqBand::Mid => &self.eq_mid,
      EqBand::High => &self.eq_high,
    };
    store_clamped(slot, gain_db, -EQ_RANGE_DB, EQ_RANGE_DB);
  }

  pub fn set_filter(&self, amount: f32) {
    store_clamped(&self.filter, amount, -FILTER_RANGE, FILTER_RANGE);
  }

  /// Rebuilds the drive curve here, off the render thread
  pub fn set_drive(&self, amount: f32) {
    if !amount.is_finite() {
      return;
    }
    let amount = amount.clamp(0.0, 10.0);
    if amount == self.drive.load() {
      return;
    }
    self.drive.store(amount);
    self.drive_curve.store(DriveCurve::new(amount).map(Arc::new));
  }

  #[cfg(test)]
  pub(crate) fn drive_curve(&self) -> Option<Arc<DriveCurve>> {
    self.drive_curve.load_full()
  }

  pub fn set_sub_bass(&self, amount: f32) {
    store_clamped(&self.sub_bass, amount, 0.0, 10.0);
  }

  pub fn settings(&self) -> EffectSettings {
    EffectSettings {
      volume: self.volume.load(),
      eq_low: self.eq_low.load(),
      eq_mid: self.eq_mid.load(),
      eq_high: self.eq_high.load(),
      filter: self.filter.load(),
      drive: self.drive.load(),
      sub_bass: self.sub_bass.load(),
    }
  }
}

/// One shelf/peak band whose gain is smoothed in dB
struct SmoothedBand {
  gain: ParameterSmoother,
  designed_db: f32,
  coeffs: BiquadCoefficients,
  filter: BiquadFilter,
}

impl SmoothedBand {
  fn new(initial_db: f32, time_constant: f32) -> Self {
    Self {
      gain: ParameterSmoother::new(initial_db, time_constant),
      designed_db: 0.0,
      coeffs: BiquadCoefficients::identity(),
      filter: BiquadFilter::default(),
    }
  }

  fn process(
    &mut self,
    block: &mut [f32],
    target_db: f32,
    dt: f32,
    design: impl Fn(f32) -> BiquadCoefficients,
  ) {
    self.gain.set_target(target_db);
    let gain_db = self.gain.advance(dt);
    if (gain_db - self.designed_db).abs() > GAIN_RECALC_THRESHOLD_DB
      || (gain_db == 0.0 && self.designed_db != 0.0)
    {
      self.coeffs = if gain_db == 0.0 {
        BiquadCoefficients::identity()
      } else {
        design(gain_db)
      };
      self.designed_db = gain_db;
    }
    self.filter.process_interleaved(block, &self.coeffs);
  }
}

/// Render-side effect chain for one deck
pub struct EffectStage {
  params: Arc<EffectParameters>,
  sample_rate: f32,
  drive: Option<Arc<DriveCurve>>,
  sub_bass: SmoothedBand,
  eq_low: SmoothedBand,
  eq_mid: SmoothedBand,
  eq_high: SmoothedBand,
  filter_mode: FilterMode,
  filter_freq: ParameterSmoother,
  filter_designed: FilterMode,
  filter_coeffs: BiquadCoefficients,
  filter: BiquadFilter,
  volume: ParameterSmoother,
}

impl EffectStage {
  pub fn new(params: Arc<EffectParameters>, sample_rate: f32, smoothing: &SmoothingConfig) -> Self {
    let settings = params.settings();
    let filter_mode = FilterMode::from_amount(settings.filter);
    Self {
      drive: params.drive_curve.load_full(),
      sub_bass: SmoothedBand::new(settings.sub_bass * SUB_BASS_DB_PER_UNIT, smoothing.sub_bass),
      eq_low: SmoothedBand::new(settings.eq_low, smoothing.eq),
      eq_mid: SmoothedBand::new(settings.eq_mid, smoothing.eq),
      eq_high: SmoothedBand::new(settings.eq_high, smoothing.eq),
      filter_mode,
      filter_freq: ParameterSmoother::new(
        filter_mode.cutoff().unwrap_or(LOW_PASS_OPEN_HZ),
        smoothing.filter,
      ),
      filter_designed: FilterMode::Bypass,
      filter_coeffs: BiquadCoefficients::identity(),
      filter: BiquadFilter::default(),
      volume: ParameterSmoother::new(settings.volume, smoothing.fast),
      params,
      sample_rate,
    }
  }

  /// Run one processing cycle over an interleaved stereo block.
  ///
  /// All smoothed values advance by `dt` before the block is rendered.
  pub fn process(&mut self, block: &mut [f32], dt: f32, retire: &mut RetireSender) {
    let settings = self.params.settings();
    let sample_rate = self.sample_rate;

    // 1. Drive
    self.sync_drive_curve(retire);
    if let Some(curve) = &self.drive {
      for sample in block.iter_mut() {
        *sample = curve.shape(*sample);
      }
    }

    // 2. Sub-bass shelf
    self.sub_bass.process(
      block,
      settings.sub_bass * SUB_BASS_DB_PER_UNIT,
      dt,
      |db| BiquadCoefficients::low_shelf(SUB_BASS_FREQ, db, sample_rate),
    );

    // 3. EQ
    self.eq_low.process(block, settings.eq_low, dt, |db| {
      BiquadCoefficients::low_shelf(EQ_LOW_FREQ, db, sample_rate)
    });
    self.eq_mid.process(block, settings.eq_mid, dt, |db| {
      BiquadCoefficients::peaking(EQ_MID_FREQ, EQ_MID_Q, db, sample_rate)
    });
    self.eq_high.process(block, settings.eq_high, dt, |db| {
      BiquadCoefficients::high_shelf(EQ_HIGH_FREQ, db, sample_rate)
    });

    // 4. Sweep filter
    self.update_filter(FilterMode::from_amount(settings.filter), dt);
    if self.filter_mode != FilterMode::Bypass {
      self.filter.process_interleaved(block, &self.filter_coeffs);
    }

    // 5. Volume
    self.volume.set_target(settings.volume);
    let ramp = self.volume.step(dt);
    if ramp.is_flat() {
      if ramp.end != 1.0 {
        block.iter_mut().for_each(|s| *s *= ramp.end);
      }
    } else {
      let frames = block.len() / 2;
      for (i, frame) in block.chunks_exact_mut(2).enumerate() {
        let gain = ramp.at(i, frames);
        frame[0] *= gain;
        frame[1] *= gain;
      }
    }
  }

  fn sync_drive_curve(&mut self, retire: &mut RetireSender) {
    let published = self.params.drive_curve.load();
    let changed = match ((*published).as_ref(), self.drive.as_ref()) {
      (Some(new), Some(old)) => !Arc::ptr_eq(new, old),
      (None, None) => false,
      _ => true,
    };
    if changed {
      let incoming = (*published).as_ref().map(Arc::clone);
      drop(published);
      if let Some(old) = std::mem::replace(&mut self.drive, incoming) {
        retire.retire(Retired::Curve(old));
      }
    }
  }

  fn update_filter(&mut self, mode: FilterMode, dt: f32) {
    if !mode.same_kind(&self.filter_mode) {
      // Each branch sweeps away from its own neutral end
      let neutral = match mode {
        FilterMode::LowPass(_) => Some(LOW_PASS_OPEN_HZ),
        FilterMode::HighPass(_) => Some(HIGH_PASS_OPEN_HZ),
        FilterMode::Bypass => None,
      };
      if let Some(neutral) = neutral {
        self.filter_freq.set_target(neutral);
        self.filter_freq.snap();
      }
      if self.filter_mode == FilterMode::Bypass {
        self.filter.reset();
      }
    }
    self.filter_mode = mode;

    let Some(cutoff) = mode.cutoff() else {
      self.filter_designed = FilterMode::Bypass;
      return;
    };
    self.filter_freq.set_target(cutoff);
    let freq = self.filter_freq.advance(dt);

    let needs_design = match (self.filter_designed, mode) {
      (FilterMode::LowPass(f), FilterMode::LowPass(_))
      | (FilterMode::HighPass(f), FilterMode::HighPass(_)) => {
        (f - freq).abs() > FREQ_RECALC_THRESHOLD_HZ
      }
      _ => true,
    };
    if needs_design {
      let (coeffs, designed) = match mode {
        FilterMode::LowPass(_) => (
          BiquadCoefficients::lowpass(freq, FILTER_Q_DB, self.sample_rate),
          FilterMode::LowPass(freq),
        ),
        _ => (
          BiquadCoefficients::highpass(freq, FILTER_Q_DB, self.sample_rate),
          FilterMode::HighPass(freq),
        ),
      };
      self.filter_coeffs = coeffs;
      self.filter_designed = designed;
    }
  }

  /// Current smoothed sweep-filter cutoff, `None` when bypassed
  #[cfg(test)]
  fn filter_cutoff(&self) -> Option<f32> {
    self.filter_mode.cutoff().map(|_| self.filter_freq.current())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::retire::retire_queue;

  const SR: f32 = 44_100.0;
  const FRAMES: usize = 128;
  const DT: f32 = FRAMES as f32 / SR;

  fn sine_block(freq: f32, start_frame: usize) -> Vec<f32> {
    (0..FRAMES)
      .flat_map(|i| {
        let t = (start_frame + i) as f32 / SR;
        let s = 0.5 * (2.0 * PI * freq * t).sin();
        [s, s]
      })
      .collect()
  }

  fn rms(block: &[f32]) -> f32 {
    (block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32).sqrt()
  }

  /// Blocks measured at the end of a run; several periods of the lowest test tone
  const MEASURED: usize = 35;

  /// Run `cycles` blocks of a sine through the stage, return the RMS of the tail
  fn run_tone(stage: &mut EffectStage, freq: f32, cycles: usize) -> f32 {
    let (mut retire, _bin) = retire_queue();
    let mut tail = Vec::new();
    for c in 0..cycles {
      let mut block = sine_block(freq, c * FRAMES);
      stage.process(&mut block, DT, &mut retire);
      if c + MEASURED >= cycles {
        tail.extend_from_slice(&block);
      }
    }
    rms(&tail)
  }

  fn stage() -> (Arc<EffectParameters>, EffectStage) {
    let params = Arc::new(EffectParameters::default());
    let stage = EffectStage::new(Arc::clone(&params), SR, &SmoothingConfig::default());
    (params, stage)
  }

  #[test]
  fn test_drive_transfer_shape() {
    assert_eq!(drive_transfer(5.0, 0.0), 0.0);
    assert!((drive_transfer(5.0, 0.5) + drive_transfer(5.0, -0.5)).abs() < 1e-7);
    // Harder drive saturates more: full-scale output closer to small-signal slope
    let soft = drive_transfer(1.0, 1.0) / drive_transfer(1.0, 0.01);
    let hard = drive_transfer(10.0, 1.0) / drive_transfer(10.0, 0.01);
    assert!(hard < soft);
  }

  #[test]
  fn test_drive_curve_bypass_threshold() {
    assert!(DriveCurve::new(0.0).is_none());
    assert!(DriveCurve::new(0.1).is_none());
    assert!(DriveCurve::new(f32::NAN).is_none());
    assert!(DriveCurve::new(0.2).is_some());
  }

  #[test]
  fn test_drive_table_matches_formula() {
    let curve = DriveCurve::new(6.0).unwrap();
    for &x in &[-1.0, -0.73, -0.1, 0.0, 0.2, 0.5, 0.999, 1.0] {
      assert!((curve.shape(x) - drive_transfer(6.0, x)).abs() < 1e-4, "x = {}", x);
    }
    assert_eq!(curve.shape(3.0), curve.shape(1.0));
  }

  #[test]
  fn test_neutral_chain_is_bit_identical() {
    let (_params, mut stage) = stage();
    let (mut retire, _bin) = retire_queue();
    for c in 0..20 {
      let input = sine_block(440.0, c * FRAMES);
      let mut block = input.clone();
      stage.process(&mut block, DT, &mut retire);
      assert_eq!(block, input);
    }
  }

  #[test]
  fn test_drive_below_threshold_is_bit_identical() {
    let (params, mut stage) = stage();
    let (mut retire, _bin) = retire_queue();
    params.set_drive(0.05);
    let input = sine_block(220.0, 0);
    let mut block = input.clone();
    stage.process(&mut block, DT, &mut retire);
    assert_eq!(block, input);
  }

  #[test]
  fn test_drive_changes_signal_and_retires_old_curve() {
    let (params, mut stage) = stage();
    let (mut retire, mut bin) = retire_queue();
    params.set_drive(8.0);
    let input = sine_block(220.0, 0);
    let mut block = input.clone();
    stage.process(&mut block, DT, &mut retire);
    assert_ne!(block, input);

    params.set_drive(3.0);
    let mut block = input.clone();
    stage.process(&mut block, DT, &mut retire);
    assert_eq!(bin.empty(), 1);
  }

  #[test]
  fn test_filter_mapping() {
    assert_eq!(FilterMode::from_amount(0.0), FilterMode::Bypass);
    assert_eq!(FilterMode::from_amount(100.0), FilterMode::HighPass(8020.0));
    assert_eq!(FilterMode::from_amount(-100.0), FilterMode::LowPass(500.0));
    assert_eq!(FilterMode::from_amount(250.0), FilterMode::HighPass(8020.0));

    // Cutoff moves monotonically away from neutral as |amount| grows
    let mut previous_hp = 0.0;
    let mut previous_lp = f32::MAX;
    for step in 1..=100 {
      let amount = step as f32;
      let hp = FilterMode::from_amount(amount).cutoff().unwrap();
      let lp = FilterMode::from_amount(-amount).cutoff().unwrap();
      assert!(hp > previous_hp);
      assert!(lp < previous_lp);
      previous_hp = hp;
      previous_lp = lp;
    }
  }

  #[test]
  fn test_low_pass_sweep_suppresses_highs() {
    let (params, mut stage) = stage();
    let open = run_tone(&mut stage, 5000.0, 40);
    params.set_filter(-100.0);
    let closed = run_tone(&mut stage, 5000.0, 400);
    assert!(closed < open * 0.05, "open {} closed {}", open, closed);
    assert!((stage.filter_cutoff().unwrap() - 500.0).abs() < 1.0);

    params.set_filter(0.0);
    let reopened = run_tone(&mut stage, 5000.0, 40);
    assert!((reopened - open).abs() < open * 0.01);
    assert_eq!(stage.filter_cutoff(), None);
  }

  #[test]
  fn test_high_pass_suppresses_lows() {
    let (params, mut stage) = stage();
    let open = run_tone(&mut stage, 200.0, 40);
    params.set_filter(100.0);
    let closed = run_tone(&mut stage, 200.0, 200);
    assert!(closed < open * 0.01);
  }

  #[test]
  fn test_sub_bass_boosts_lows() {
    let (params, mut stage) = stage();
    let flat = run_tone(&mut stage, 40.0, 40);
    params.set_sub_bass(10.0);
    let boosted = run_tone(&mut stage, 40.0, 600);
    let gain_db = 20.0 * (boosted / flat).log10();
    assert!(gain_db > 10.0 && gain_db < 15.5, "gain {} dB", gain_db);
  }

  #[test]
  fn test_eq_cut_reduces_band() {
    let (params, mut stage) = stage();
    let flat = run_tone(&mut stage, 1000.0, 40);
    params.set_eq(EqBand::Mid, -12.0);
    let cut = run_tone(&mut stage, 1000.0, 300);
    let gain_db = 20.0 * (cut / flat).log10();
    assert!((gain_db + 12.0).abs() < 0.5, "gain {} dB", gain_db);
  }

  #[test]
  fn test_volume_ramps_without_jump() {
    let (params, mut stage) = stage();
    let (mut retire, _bin) = retire_queue();
    params.set_volume(0.0);
    let mut block = vec![1.0f32; FRAMES * 2];
    stage.process(&mut block, DT, &mut retire);
    // First sample still close to unity, gain falls across the block
    assert!(block[0] > 0.95);
    assert!(block[block.len() - 1] < block[0]);
    assert!(block[block.len() - 1] > 0.0);
  }

  #[test]
  fn test_setters_clamp_and_ignore_nan() {
    let params = EffectParameters::default();
    params.set_volume(2.0);
    params.set_eq(EqBand::High, -40.0);
    params.set_filter(f32::NAN);
    params.set_sub_bass(-1.0);
    let settings = params.settings();
    assert_eq!(settings.volume, 1.0);
    assert_eq!(settings.eq_high, -12.0);
    assert_eq!(settings.filter, 0.0);
    assert_eq!(settings.sub_bass, 0.0);
  }

  #[test]
  fn test_eq_band_from_str() {
    assert_eq!("low".parse::<EqBand>(), Ok(EqBand::Low));
    assert_eq!("high".parse::<EqBand>(), Ok(EqBand::High));
    assert!("treble".parse::<EqBand>().is_err());
  }
}
