//! Audio Engine - two decks, crossfader and master bus
//!
//! This module provides the composition root that handles:
//! - Two independent decks, each with its own effect chain
//! - Equal-power crossfader into a master bus
//! - Master fan-out to the output device and the recording tap
//! - Offline rendering for simulations and tests
//!
//! Every cycle of [`Renderer`] renders a fixed quantum: both decks, then the
//! crossfade, then the master gain, then the tap. The device callback only
//! copies frames out of the last rendered cycle.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use parking_lot::Mutex;

use crate::config::{DeviceConfig, EngineConfig};
use crate::deck::{DeckEngine, DeckId, DeckRenderer, DeckStatus};
use crate::error::{DeviceError, RecordingError};
use crate::mixer::{CrossfadeBus, MasterBus, MixerControls};
use crate::recorder::{Recorder, Recording, RecordingSession, RecordingStatus, RecordingTap};
use crate::transport::{Clock, SystemClock};

const CHANNELS: usize = 2;

// ============================================================================
// Render path
// ============================================================================

/// Everything the render context owns. Driven either by the device callback
/// or by [`EngineController::render_offline`].
pub(crate) struct Renderer {
  deck_a: DeckRenderer,
  deck_b: DeckRenderer,
  controls: Arc<MixerControls>,
  crossfade: CrossfadeBus,
  master: MasterBus,
  tap: RecordingTap,
  sample_rate: u32,
  buffer_a: Vec<f32>,
  buffer_b: Vec<f32>,
  /// Master output of the last cycle
  mix: Vec<f32>,
  /// Next unread frame of `mix`
  read_frame: usize,
}

impl Renderer {
  fn new(
    config: &EngineConfig,
    deck_a: DeckRenderer,
    deck_b: DeckRenderer,
    controls: Arc<MixerControls>,
    tap: RecordingTap,
  ) -> Self {
    let samples = config.render_quantum * CHANNELS;
    Self {
      crossfade: CrossfadeBus::new(controls.crossfader(), &config.smoothing),
      master: MasterBus::new(controls.master_volume(), &config.smoothing),
      deck_a,
      deck_b,
      controls,
      tap,
      sample_rate: config.sample_rate,
      buffer_a: vec![0.0; samples],
      buffer_b: vec![0.0; samples],
      mix: vec![0.0; samples],
      read_frame: config.render_quantum,
    }
  }

  /// Render one processing cycle into the internal mix buffer
  fn render_cycle(&mut self) {
    let frames = self.mix.len() / CHANNELS;
    let dt = frames as f32 / self.sample_rate as f32;

    self.deck_a.render(&mut self.buffer_a);
    self.deck_b.render(&mut self.buffer_b);

    self.crossfade.mix(
      self.controls.crossfader(),
      &self.buffer_a,
      &self.buffer_b,
      &mut self.mix,
      dt,
    );
    self
      .master
      .process(self.controls.master_volume(), &mut self.mix, dt);

    // Identical block to both sinks
    self.tap.capture(&self.mix);
    self.read_frame = 0;
  }

  #[inline]
  fn next_frame(&mut self) -> (f32, f32) {
    if self.read_frame * CHANNELS >= self.mix.len() {
      self.render_cycle();
    }
    let base = self.read_frame * CHANNELS;
    self.read_frame += 1;
    (self.mix[base], self.mix[base + 1])
  }

  /// Fill an interleaved stereo buffer of any length
  pub fn render(&mut self, out: &mut [f32]) {
    for frame in out.chunks_exact_mut(CHANNELS) {
      let (left, right) = self.next_frame();
      frame[0] = left;
      frame[1] = right;
    }
  }

  /// Fill a device buffer with `channels` interleaved channels. Mono devices
  /// get the average of both sides; extra channels stay silent.
  pub fn render_to_device(&mut self, data: &mut [f32], channels: usize) {
    if channels == 0 {
      return;
    }
    for frame in data.chunks_exact_mut(channels) {
      let (left, right) = self.next_frame();
      match frame {
        [mono] => *mono = (left + right) * 0.5,
        [l, r, rest @ ..] => {
          *l = left;
          *r = right;
          rest.fill(0.0);
        }
        [] => {}
      }
    }
  }
}

// ============================================================================
// Control surface
// ============================================================================

/// Device actually opened by [`EngineController::start_output`]
#[derive(Clone, Debug, PartialEq)]
pub struct OutputInfo {
  pub device_name: String,
  pub channels: u16,
  pub sample_rate: u32,
}

/// Whole-engine view for the UI layer
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
  pub deck_a: DeckStatus,
  pub deck_b: DeckStatus,
  pub crossfader: f32,
  pub master_volume: f32,
  pub recording: RecordingStatus,
}

/// One mixing engine: two decks, the buses and the recorder.
///
/// Constructed once by the host and passed to whoever needs it. Deck handles
/// returned by [`EngineController::deck`] can be cloned and moved to other
/// threads.
pub struct EngineController {
  config: EngineConfig,
  deck_a: DeckEngine,
  deck_b: DeckEngine,
  controls: Arc<MixerControls>,
  renderer: Arc<Mutex<Renderer>>,
  recorder: Recorder,
  stream: Mutex<Option<(cpal::Stream, OutputInfo)>>,
}

impl EngineController {
  pub fn new(config: EngineConfig) -> Self {
    Self::with_clock(config, Arc::new(SystemClock::new()))
  }

  /// Use `clock` for all transport bookkeeping
  pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
    let config = config.sanitized();
    let (deck_a, render_a) = DeckEngine::new(
      DeckId::A,
      Arc::clone(&clock),
      config.sample_rate,
      config.spectrum_fft_size,
      &config.smoothing,
    );
    let (deck_b, render_b) = DeckEngine::new(
      DeckId::B,
      clock,
      config.sample_rate,
      config.spectrum_fft_size,
      &config.smoothing,
    );
    let controls = Arc::new(MixerControls::default());
    let (recorder, tap) = Recorder::new(&config);
    let renderer = Renderer::new(&config, render_a, render_b, Arc::clone(&controls), tap);

    log::info!(
      "Engine ready: {} Hz, {} frames per cycle",
      config.sample_rate,
      config.render_quantum
    );

    Self {
      config,
      deck_a,
      deck_b,
      controls,
      renderer: Arc::new(Mutex::new(renderer)),
      recorder,
      stream: Mutex::new(None),
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn deck(&self, id: DeckId) -> &DeckEngine {
    match id {
      DeckId::A => &self.deck_a,
      DeckId::B => &self.deck_b,
    }
  }

  pub fn deck_a(&self) -> &DeckEngine {
    &self.deck_a
  }

  pub fn deck_b(&self) -> &DeckEngine {
    &self.deck_b
  }

  /// `0` is deck A only, `1` deck B only
  pub fn set_crossfader(&self, position: f32) {
    self.controls.set_crossfader(position);
  }

  pub fn crossfader(&self) -> f32 {
    self.controls.crossfader()
  }

  pub fn set_master_volume(&self, volume: f32) {
    self.controls.set_master_volume(volume);
  }

  pub fn master_volume(&self) -> f32 {
    self.controls.master_volume()
  }

  // ==========================================================================
  // Recording
  // ==========================================================================

  pub fn start_recording(&self) -> Result<RecordingSession, RecordingError> {
    self.recorder.start()
  }

  pub fn stop_recording(&self) -> Result<Option<Recording>, RecordingError> {
    self.recorder.stop()
  }

  pub fn is_recording(&self) -> bool {
    self.recorder.is_recording()
  }

  pub fn recording_status(&self) -> RecordingStatus {
    self.recorder.status()
  }

  // ==========================================================================
  // Output
  // ==========================================================================

  /// Open an output device and start rendering into it.
  /// Can be called again to switch devices without losing engine state.
  pub fn start_output(&self, config: DeviceConfig) -> Result<OutputInfo, DeviceError> {
    let device = get_device(config.device_id.as_deref())?;

    // Stop old stream explicitly before building the new one
    self.stop_output();

    let (stream, info) = build_output_stream(
      &device,
      self.config.sample_rate,
      Arc::clone(&self.renderer),
    )?;
    log::info!(
      "Device configured: {} ({} channels, {} Hz)",
      info.device_name,
      info.channels,
      info.sample_rate
    );
    *self.stream.lock() = Some((stream, info.clone()));
    Ok(info)
  }

  pub fn stop_output(&self) {
    let mut guard = self.stream.lock();
    if let Some((stream, info)) = guard.take() {
      if let Err(e) = stream.pause() {
        log::warn!("Failed to pause stream on {}: {}", info.device_name, e);
      }
      log::info!("Output stopped: {}", info.device_name);
    }
  }

  pub fn output_info(&self) -> Option<OutputInfo> {
    self.stream.lock().as_ref().map(|(_, info)| info.clone())
  }

  /// Render `frames` stereo frames without a device. Shares the render state
  /// with a running output stream, so it is meant for hosts without one.
  pub fn render_offline(&self, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames * CHANNELS];
    self.renderer.lock().render(&mut out);
    out
  }

  // ==========================================================================
  // Readers
  // ==========================================================================

  /// Informational labels of whatever is loaded, for the advice collaborator
  pub fn track_labels(&self) -> (Option<String>, Option<String>) {
    (self.deck_a.track_label(), self.deck_b.track_label())
  }

  pub fn status(&self) -> EngineStatus {
    EngineStatus {
      deck_a: self.deck_a.status(),
      deck_b: self.deck_b.status(),
      crossfader: self.crossfader(),
      master_volume: self.master_volume(),
      recording: self.recording_status(),
    }
  }
}

impl Drop for EngineController {
  fn drop(&mut self) {
    self.stop_output();
  }
}

/// Find an output device by name, or return the default output device
fn get_device(device_id: Option<&str>) -> Result<cpal::Device, DeviceError> {
  let host = cpal::default_host();

  if let Some(name) = device_id {
    // Find device by name (stable across restarts, unlike index)
    let devices = host
      .output_devices()
      .map_err(|e| DeviceError::Host(e.to_string()))?;
    for dev in devices {
      if dev.name().map(|n| n == name).unwrap_or(false) {
        return Ok(dev);
      }
    }
    log::warn!("Device '{}' not found, using default", name);
  }

  host.default_output_device().ok_or(DeviceError::NoDevice)
}

/// Pick an f32 configuration running at the engine rate
fn output_config(
  device: &cpal::Device,
  device_name: &str,
  sample_rate: u32,
) -> Result<cpal::StreamConfig, DeviceError> {
  let rate = cpal::SampleRate(sample_rate);
  if let Ok(default) = device.default_output_config() {
    if default.sample_format() == SampleFormat::F32 && default.sample_rate() == rate {
      return Ok(default.config());
    }
  }

  device
    .supported_output_configs()
    .map_err(|e| DeviceError::Build(format!("Device '{}' error: {}", device_name, e)))?
    .filter(|range| range.sample_format() == SampleFormat::F32)
    .find(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
    .map(|range| range.with_sample_rate(rate).config())
    .ok_or_else(|| DeviceError::UnsupportedFormat(device_name.to_string()))
}

/// Build and start an output stream whose callback drives the renderer
fn build_output_stream(
  device: &cpal::Device,
  sample_rate: u32,
  renderer: Arc<Mutex<Renderer>>,
) -> Result<(cpal::Stream, OutputInfo), DeviceError> {
  let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
  let config = output_config(device, &device_name, sample_rate)?;
  let channels = config.channels as usize;

  let stream = device
    .build_output_stream(
      &config,
      move |data: &mut [f32], _| {
        // Never wait on the control side; a busy lock costs one buffer of silence
        match renderer.try_lock() {
          Some(mut renderer) => renderer.render_to_device(data, channels),
          None => data.fill(0.0),
        }
      },
      move |err| log::error!("Output stream error: {}", err),
      None,
    )
    .map_err(|e| DeviceError::Build(e.to_string()))?;

  stream.play().map_err(|e| DeviceError::Play(e.to_string()))?;

  let info = OutputInfo {
    device_name,
    channels: config.channels,
    sample_rate: config.sample_rate.0,
  };
  Ok((stream, info))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decoder::AudioBuffer;
  use crate::transport::ManualClock;

  fn engine() -> (Arc<ManualClock>, EngineController) {
    let clock = Arc::new(ManualClock::new());
    let engine = EngineController::with_clock(EngineConfig::default(), clock.clone());
    (clock, engine)
  }

  fn constant(value: f32, seconds: f64) -> AudioBuffer {
    AudioBuffer::from_mono(&vec![value; (seconds * 44_100.0) as usize], 44_100).unwrap()
  }

  #[test]
  fn test_idle_engine_renders_silence() {
    let (_clock, engine) = engine();
    let out = engine.render_offline(1000);
    assert_eq!(out.len(), 2000);
    assert!(out.iter().all(|&s| s == 0.0));
  }

  #[test]
  fn test_crossfader_selects_deck() {
    let (_clock, engine) = engine();
    engine.deck_a().load_buffer(constant(0.5, 2.0), None).unwrap();
    engine.deck_b().load_buffer(constant(-0.25, 2.0), None).unwrap();
    engine.deck_a().play();
    engine.deck_b().play();

    engine.set_crossfader(0.0);
    engine.render_offline(4410);
    let out = engine.render_offline(128);
    assert!((out[0] - 0.5).abs() < 1e-3);

    engine.set_crossfader(1.0);
    engine.render_offline(4410);
    let out = engine.render_offline(128);
    assert!((out[0] + 0.25).abs() < 1e-3);
  }

  #[test]
  fn test_master_volume_scales_output() {
    let (_clock, engine) = engine();
    engine.deck_a().load_buffer(constant(0.8, 2.0), None).unwrap();
    engine.deck_a().play();
    engine.set_crossfader(0.0);
    engine.set_master_volume(0.5);
    engine.render_offline(4410);
    let out = engine.render_offline(128);
    assert!((out[0] - 0.4).abs() < 1e-3);
  }

  #[test]
  fn test_render_sizes_do_not_need_to_match_quantum() {
    let (_clock, engine) = engine();
    engine.deck_a().load_buffer(constant(0.5, 1.0), None).unwrap();
    engine.deck_a().play();
    let mut total = 0;
    for frames in [1, 7, 128, 300, 64] {
      total += engine.render_offline(frames).len();
    }
    assert_eq!(total, 500 * 2);
  }

  #[test]
  fn test_device_channel_mapping() {
    let (_clock, engine) = engine();
    engine.deck_a().load_buffer(constant(0.5, 1.0), None).unwrap();
    engine.deck_a().play();
    engine.set_crossfader(0.0);
    engine.render_offline(4410);

    let mut renderer = engine.renderer.lock();
    let mut quad = vec![9.0; 16];
    renderer.render_to_device(&mut quad, 4);
    assert!((quad[0] - 0.5).abs() < 1e-3);
    assert!((quad[1] - 0.5).abs() < 1e-3);
    assert_eq!(&quad[2..4], &[0.0, 0.0]);

    let mut mono = vec![9.0; 4];
    renderer.render_to_device(&mut mono, 1);
    assert!((mono[0] - 0.5).abs() < 1e-3);
  }

  #[test]
  fn test_recording_captures_master() {
    let (_clock, engine) = engine();
    let config = EngineConfig::default();
    assert_eq!(config.recording_format, crate::recorder::RecordingFormat::Ogg);

    engine.deck_a().load_buffer(constant(0.3, 1.0), Some("Loop")).unwrap();
    engine.deck_a().play();
    engine.start_recording().unwrap();
    assert!(engine.recording_status().active);
    engine.render_offline(44_100 / 2);
    let recording = engine.stop_recording().unwrap().unwrap();
    assert_eq!(recording.frames, (44_100 / 2) / 128 * 128 + 128);
    assert!(!engine.is_recording());
    assert_eq!(engine.track_labels(), (Some("Loop".to_string()), None));
  }

  #[test]
  fn test_status_reports_both_decks() {
    let (clock, engine) = engine();
    engine.deck_b().load_buffer(constant(0.1, 10.0), Some("B side")).unwrap();
    engine.deck_b().play();
    clock.advance(2.0);
    let status = engine.status();
    assert!(!status.deck_a.loaded);
    assert!(status.deck_b.playing);
    assert!((status.deck_b.position - 2.0).abs() < 1e-9);
    assert_eq!(status.crossfader, 0.5);
    assert!(!status.recording.active);
  }
}
