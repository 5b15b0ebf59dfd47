//! Engine and device configuration

use crate::recorder::RecordingFormat;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// Frames per processing cycle
pub const DEFAULT_RENDER_QUANTUM: usize = 128;
pub const DEFAULT_FFT_SIZE: usize = 256;
pub const DEFAULT_PRODUCT_NAME: &str = "NexusDJ";
const DEFAULT_RECORDING_BUFFER_SECONDS: f32 = 4.0;
const MAX_RENDER_QUANTUM: usize = 4096;

/// Time constants (seconds) per parameter class
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SmoothingConfig {
  /// Deck volume, crossfader gains, master volume
  pub fast: f32,
  /// 3-band EQ gains
  pub eq: f32,
  /// Sweepable filter cutoff
  pub filter: f32,
  /// Sub-bass shelf gain
  pub sub_bass: f32,
  /// Playback rate
  pub rate: f32,
}

impl Default for SmoothingConfig {
  fn default() -> Self {
    Self {
      fast: 0.01,
      eq: 0.05,
      filter: 0.1,
      sub_bass: 0.1,
      rate: 0.05,
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
  pub sample_rate: u32,
  pub render_quantum: usize,
  /// Analyser FFT size; half of it is the number of spectrum bins
  pub spectrum_fft_size: usize,
  pub recording_format: RecordingFormat,
  /// Capacity of the recording tap ring
  pub recording_buffer_seconds: f32,
  /// Used in recording file names
  pub product_name: String,
  pub smoothing: SmoothingConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      sample_rate: DEFAULT_SAMPLE_RATE,
      render_quantum: DEFAULT_RENDER_QUANTUM,
      spectrum_fft_size: DEFAULT_FFT_SIZE,
      recording_format: RecordingFormat::default(),
      recording_buffer_seconds: DEFAULT_RECORDING_BUFFER_SECONDS,
      product_name: DEFAULT_PRODUCT_NAME.to_string(),
      smoothing: SmoothingConfig::default(),
    }
  }
}

impl EngineConfig {
  pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
    self.sample_rate = sample_rate;
    self
  }

  pub fn with_render_quantum(mut self, frames: usize) -> Self {
    self.render_quantum = frames;
    self
  }

  pub fn with_spectrum_fft_size(mut self, size: usize) -> Self {
    self.spectrum_fft_size = size;
    self
  }

  pub fn with_recording_format(mut self, format: RecordingFormat) -> Self {
    self.recording_format = format;
    self
  }

  pub fn with_product_name(mut self, name: impl Into<String>) -> Self {
    self.product_name = name.into();
    self
  }

  pub fn with_smoothing(mut self, smoothing: SmoothingConfig) -> Self {
    self.smoothing = smoothing;
    self
  }

  /// Replace out-of-range values with defaults
  pub fn sanitized(mut self) -> Self {
    let defaults = Self::default();
    if self.sample_rate == 0 {
      log::warn!("sample rate 0 is invalid, using {}", defaults.sample_rate);
      self.sample_rate = defaults.sample_rate;
    }
    if self.render_quantum == 0 || self.render_quantum > MAX_RENDER_QUANTUM {
      log::warn!(
        "render quantum {} is invalid, using {}",
        self.render_quantum,
        defaults.render_quantum
      );
      self.render_quantum = defaults.render_quantum;
    }
    if self.spectrum_fft_size < 32 || !self.spectrum_fft_size.is_power_of_two() {
      log::warn!(
        "FFT size {} is invalid, using {}",
        self.spectrum_fft_size,
        defaults.spectrum_fft_size
      );
      self.spectrum_fft_size = defaults.spectrum_fft_size;
    }
    if !(self.recording_buffer_seconds.is_finite() && self.recording_buffer_seconds > 0.0) {
      self.recording_buffer_seconds = defaults.recording_buffer_seconds;
    }
    if self.product_name.trim().is_empty() {
      self.product_name = defaults.product_name;
    }
    self
  }

  /// Tap ring capacity in interleaved stereo samples
  pub(crate) fn recording_buffer_samples(&self) -> usize {
    (self.recording_buffer_seconds * self.sample_rate as f32) as usize * 2
  }
}

/// Device configuration for `start_output()`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
  /// Device name (stable across restarts); `None` uses the default device
  pub device_id: Option<String>,
}
