//! Deck - one playback unit: buffer, transport and effect chain
//!
//! A deck is split in two halves that share a [`DeckShared`]:
//! - [`DeckEngine`], the cloneable control handle (load, transport, effects)
//! - [`DeckRenderer`], owned by the render loop, which turns the published
//!   buffer/transport/parameters into samples
//!
//! The control side never touches render state directly. It publishes whole
//! snapshots; the renderer picks them up at the start of its next cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;

use crate::config::SmoothingConfig;
use crate::decoder::{decode_audio, extension_hint, fetch_audio, track_label, AudioBuffer};
use crate::effect_stage::{EffectParameters, EffectSettings, EffectStage, EqBand};
use crate::error::LoadError;
use crate::retire::{RetireBin, RetireSender, Retired};
use crate::smoother::ParameterSmoother;
use crate::spectrum::{SpectrumAnalyzer, SpectrumSnapshot};
use crate::transport::{Clock, TransportState};

pub const MIN_RATE: f64 = 0.25;
pub const MAX_RATE: f64 = 4.0;
/// No end-of-track recorded for any generation
const NOT_ENDED: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeckId {
  A,
  B,
}

impl fmt::Display for DeckId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DeckId::A => write!(f, "A"),
      DeckId::B => write!(f, "B"),
    }
  }
}

/// State shared between a deck's control handle and its renderer
pub(crate) struct DeckShared {
  id: DeckId,
  buffer: ArcSwapOption<AudioBuffer>,
  transport: ArcSwap<TransportState>,
  params: Arc<EffectParameters>,
  /// Cursor generation whose playback ran off the end of the buffer
  ended_generation: AtomicU64,
  spectrum: Arc<SpectrumSnapshot>,
}

impl DeckShared {
  fn new(id: DeckId, spectrum_bins: usize) -> Self {
    Self {
      id,
      buffer: ArcSwapOption::empty(),
      transport: ArcSwap::from_pointee(TransportState::default()),
      params: Arc::new(EffectParameters::default()),
      ended_generation: AtomicU64::new(NOT_ENDED),
      spectrum: Arc::new(SpectrumSnapshot::new(spectrum_bins)),
    }
  }
}

/// Control-side bookkeeping, guarded by the deck's own lock
struct DeckControl {
  track_label: Option<String>,
  retired: RetireBin,
}

/// Point-in-time view of a deck for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub struct DeckStatus {
  pub deck: DeckId,
  pub loaded: bool,
  pub playing: bool,
  pub ended: bool,
  /// Seconds
  pub position: f64,
  /// Seconds, zero when empty
  pub duration: f64,
  pub rate: f64,
  pub track_label: Option<String>,
  pub effects: EffectSettings,
}

/// Completion handle for an asynchronous load
pub struct PendingLoad {
  deck: DeckId,
  request: u64,
  receiver: Receiver<Result<f64, LoadError>>,
}

impl PendingLoad {
  pub fn deck(&self) -> DeckId {
    self.deck
  }

  pub fn request_id(&self) -> u64 {
    self.request
  }

  /// Block until the load finishes; yields the new duration in seconds
  pub fn wait(self) -> Result<f64, LoadError> {
    self.receiver.recv().unwrap_or(Err(LoadError::Cancelled))
  }

  /// `None` while the load is still running
  pub fn try_result(&self) -> Option<Result<f64, LoadError>> {
    match self.receiver.try_recv() {
      Ok(result) => Some(result),
      Err(TryRecvError::Empty) => None,
      Err(TryRecvError::Disconnected) => Some(Err(LoadError::Cancelled)),
    }
  }
}

/// Control handle for one deck. Cheap to clone; every clone drives the same
/// deck.
#[derive(Clone)]
pub struct DeckEngine {
  shared: Arc<DeckShared>,
  control: Arc<Mutex<DeckControl>>,
  load_requests: Arc<AtomicU64>,
  clock: Arc<dyn Clock>,
}

impl DeckEngine {
  /// Create the control handle and the matching renderer
  pub(crate) fn new(
    id: DeckId,
    clock: Arc<dyn Clock>,
    sample_rate: u32,
    fft_size: usize,
    smoothing: &SmoothingConfig,
  ) -> (Self, DeckRenderer) {
    let shared = Arc::new(DeckShared::new(id, fft_size / 2));
    let (retire_sender, retired) = crate::retire::retire_queue();
    let renderer = DeckRenderer::new(
      Arc::clone(&shared),
      sample_rate,
      fft_size,
      smoothing,
      retire_sender,
    );
    let engine = Self {
      shared,
      control: Arc::new(Mutex::new(DeckControl {
        track_label: None,
        retired,
      })),
      load_requests: Arc::new(AtomicU64::new(0)),
      clock,
    };
    (engine, renderer)
  }

  pub fn id(&self) -> DeckId {
    self.shared.id
  }

  // ==========================================================================
  // Loading
  // ==========================================================================

  /// Decode `bytes` on a worker thread and install the result.
  ///
  /// Only the most recent load on this deck is installed; older requests
  /// resolve to [`LoadError::Superseded`]. On failure the deck keeps whatever
  /// it was doing.
  pub fn load(&self, bytes: Vec<u8>, file_name: Option<&str>) -> PendingLoad {
    let label = file_name.map(track_label);
    let hint = file_name.and_then(extension_hint);
    self.spawn_load(label, move || {
      decode_audio(bytes, hint.as_deref()).map_err(LoadError::from)
    })
  }

  /// Fetch `url` and decode it, both off the calling thread
  pub fn load_url(&self, url: &str, label: Option<&str>) -> PendingLoad {
    let url = url.to_string();
    let label = Some(label.map(str::to_string).unwrap_or_else(|| track_label(&url)));
    let hint = extension_hint(&url);
    let requests = Arc::clone(&self.load_requests);
    let request = self.next_request();
    self.spawn_request(request, label, move || {
      let bytes = fetch_audio(&url)?;
      // Skip the decode entirely if a newer load already arrived
      if requests.load(Ordering::SeqCst) != request {
        return Err(LoadError::Superseded);
      }
      decode_audio(bytes, hint.as_deref()).map_err(LoadError::from)
    })
  }

  /// Install an already decoded buffer immediately. Supersedes any load in
  /// flight.
  pub fn load_buffer(&self, buffer: AudioBuffer, label: Option<&str>) -> Result<f64, LoadError> {
    let request = self.next_request();
    let label = label.map(str::to_string);
    install(
      &self.shared,
      &self.control,
      &self.load_requests,
      request,
      buffer,
      label,
    )
  }

  fn next_request(&self) -> u64 {
    self.load_requests.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn spawn_load<F>(&self, label: Option<String>, decode: F) -> PendingLoad
  where
    F: FnOnce() -> Result<AudioBuffer, LoadError> + Send + 'static,
  {
    let request = self.next_request();
    self.spawn_request(request, label, decode)
  }

  fn spawn_request<F>(&self, request: u64, label: Option<String>, decode: F) -> PendingLoad
  where
    F: FnOnce() -> Result<AudioBuffer, LoadError> + Send + 'static,
  {
    let (sender, receiver) = bounded(1);
    let shared = Arc::clone(&self.shared);
    let control = Arc::clone(&self.control);
    let requests = Arc::clone(&self.load_requests);
    let deck = self.shared.id;

    log::info!("[Deck {}] Load #{} started", deck, request);
    let spawned = thread::Builder::new()
      .name(format!("deck-{}-load", deck))
      .spawn(move || {
        let result = decode().and_then(|buffer| {
          install(&shared, &control, &requests, request, buffer, label)
        });
        match &result {
          Ok(duration) => log::info!("[Deck {}] Load #{} ready ({:.1}s)", deck, request, duration),
          Err(LoadError::Superseded) => {
            log::info!("[Deck {}] Load #{} superseded, result discarded", deck, request)
          }
          Err(e) => log::warn!("[Deck {}] Load #{} failed: {}", deck, request, e),
        }
        let _ = sender.send(result);
      });

    if let Err(e) = spawned {
      log::error!("[Deck {}] Could not start load worker: {}", deck, e);
    }

    PendingLoad {
      deck,
      request,
      receiver,
    }
  }

  // ==========================================================================
  // Transport
  // ==========================================================================

  /// Start playback from the current position. No-op when already playing or
  /// when nothing is loaded.
  pub fn play(&self) {
    let mut control = self.control.lock();
    control.retired.empty();
    if self.shared.buffer.load().is_none() {
      return;
    }
    let transport = self.shared.transport.load_full();
    if transport.playing && !self.ended_in(&transport) {
      return;
    }
    let now = self.clock.now();
    let duration = self.duration();
    // A deck that ran off the end restarts from where it stopped
    let from = transport.paused(now, duration);
    self.shared.transport.store(Arc::new(from.started(now)));
  }

  /// Freeze at the current position. No-op when not playing.
  pub fn pause(&self) {
    let mut control = self.control.lock();
    control.retired.empty();
    let transport = self.shared.transport.load_full();
    if !transport.playing {
      return;
    }
    let paused = transport.paused(self.clock.now(), self.duration());
    self.shared.transport.store(Arc::new(paused));
  }

  /// Jump to `time` seconds, clamped to the track. Seeking to or past the end
  /// leaves the deck paused at the end.
  pub fn seek(&self, time: f64) {
    if !time.is_finite() {
      return;
    }
    let mut control = self.control.lock();
    control.retired.empty();
    let duration = self.duration();
    if self.shared.buffer.load().is_none() {
      return;
    }
    let transport = self.shared.transport.load_full();
    let now = self.clock.now();
    let next = if time >= duration {
      TransportState {
        playing: false,
        ..transport.sought(duration, now)
      }
    } else {
      transport.sought(time.max(0.0), now)
    };
    self.shared.transport.store(Arc::new(next));
  }

  /// Playback rate; moves pitch along with speed
  pub fn set_rate(&self, rate: f64) {
    if !rate.is_finite() {
      return;
    }
    let mut control = self.control.lock();
    control.retired.empty();
    let transport = self.shared.transport.load_full();
    let next = transport.with_rate(rate.clamp(MIN_RATE, MAX_RATE), self.clock.now());
    self.shared.transport.store(Arc::new(next));
  }

  fn ended_in(&self, transport: &TransportState) -> bool {
    self.shared.ended_generation.load(Ordering::Acquire) == transport.cursor_generation
  }

  // ==========================================================================
  // Effects
  // ==========================================================================

  pub fn set_volume(&self, volume: f32) {
    self.shared.params.set_volume(volume);
  }

  pub fn set_eq(&self, band: EqBand, gain_db: f32) {
    self.shared.params.set_eq(band, gain_db);
  }

  pub fn set_filter(&self, amount: f32) {
    self.shared.params.set_filter(amount);
  }

  /// Every change builds a new curve, so the bin is emptied here as well
  pub fn set_drive(&self, amount: f32) {
    let mut control = self.control.lock();
    control.retired.empty();
    self.shared.params.set_drive(amount);
  }

  pub fn set_sub_bass(&self, amount: f32) {
    self.shared.params.set_sub_bass(amount);
  }

  pub fn effects(&self) -> EffectSettings {
    self.shared.params.settings()
  }

  // ==========================================================================
  // Readers
  // ==========================================================================

  /// Current position in seconds, within `[0, duration]`
  pub fn position(&self) -> f64 {
    let transport = self.shared.transport.load();
    let duration = self.duration();
    if transport.playing && self.ended_in(&transport) {
      return duration;
    }
    transport
      .position_at(self.clock.now())
      .clamp(0.0, duration)
  }

  pub fn duration(&self) -> f64 {
    self
      .shared
      .buffer
      .load()
      .as_ref()
      .map(|buffer| buffer.duration())
      .unwrap_or(0.0)
  }

  pub fn is_loaded(&self) -> bool {
    self.shared.buffer.load().is_some()
  }

  pub fn is_playing(&self) -> bool {
    let transport = self.shared.transport.load();
    transport.playing && !self.ended_in(&transport)
  }

  /// Playback ran off the end of the track
  pub fn has_ended(&self) -> bool {
    let transport = self.shared.transport.load();
    transport.playing && self.ended_in(&transport)
  }

  pub fn rate(&self) -> f64 {
    self.shared.transport.load().rate
  }

  pub fn track_label(&self) -> Option<String> {
    self.control.lock().track_label.clone()
  }

  /// Spectral magnitudes in dB of the post-chain signal. A paused deck keeps
  /// reporting its last rendered frame.
  pub fn frequency_snapshot(&self) -> Vec<f32> {
    self.shared.spectrum.magnitudes()
  }

  pub fn byte_frequency_data(&self) -> Vec<u8> {
    self.shared.spectrum.byte_frequency_data()
  }

  pub fn status(&self) -> DeckStatus {
    self.control.lock().retired.empty();
    DeckStatus {
      deck: self.id(),
      loaded: self.is_loaded(),
      playing: self.is_playing(),
      ended: self.has_ended(),
      position: self.position(),
      duration: self.duration(),
      rate: self.rate(),
      track_label: self.track_label(),
      effects: self.effects(),
    }
  }
}

/// Install a decoded buffer if `request` is still the latest one
fn install(
  shared: &DeckShared,
  control: &Mutex<DeckControl>,
  requests: &AtomicU64,
  request: u64,
  buffer: AudioBuffer,
  label: Option<String>,
) -> Result<f64, LoadError> {
  let mut control = control.lock();
  // Checked under the lock so two finishing loads cannot both install
  if requests.load(Ordering::SeqCst) != request {
    return Err(LoadError::Superseded);
  }
  control.retired.empty();
  let duration = buffer.duration();
  let transport = shared.transport.load_full().rewound();
  // Transport first: a renderer that picks up the new buffer must already see
  // it paused at zero
  shared.transport.store(Arc::new(transport));
  shared.buffer.store(Some(Arc::new(buffer)));
  control.track_label = label;
  Ok(duration)
}

// ============================================================================
// Render side
// ============================================================================

/// Render half of a deck, driven once per processing cycle
pub struct DeckRenderer {
  shared: Arc<DeckShared>,
  buffer: Option<Arc<AudioBuffer>>,
  transport: Arc<TransportState>,
  /// Read position in buffer frames
  cursor: f64,
  rate: ParameterSmoother,
  effects: EffectStage,
  analyzer: SpectrumAnalyzer,
  output_rate: f64,
  retire: RetireSender,
}

impl DeckRenderer {
  fn new(
    shared: Arc<DeckShared>,
    sample_rate: u32,
    fft_size: usize,
    smoothing: &SmoothingConfig,
    retire: RetireSender,
  ) -> Self {
    let transport = shared.transport.load_full();
    Self {
      buffer: None,
      cursor: 0.0,
      rate: ParameterSmoother::new(transport.rate as f32, smoothing.rate),
      transport,
      effects: EffectStage::new(Arc::clone(&shared.params), sample_rate as f32, smoothing),
      analyzer: SpectrumAnalyzer::new(fft_size, Arc::clone(&shared.spectrum)),
      output_rate: sample_rate as f64,
      shared,
      retire,
    }
  }

  /// Render one cycle into an interleaved stereo block
  pub fn render(&mut self, out: &mut [f32]) {
    let frames = out.len() / 2;
    let dt = frames as f32 / self.output_rate as f32;

    self.sync_buffer();
    self.sync_transport();

    let playing = self.transport.playing && self.buffer.is_some();
    if playing {
      self.fill(out);
    } else {
      out.fill(0.0);
      self.rate.advance(dt);
    }

    self.effects.process(out, dt, &mut self.retire);

    // Paused decks keep their last spectrum frame
    if playing {
      self.analyzer.process(out);
    }
  }

  fn sync_buffer(&mut self) {
    let published = self.shared.buffer.load();
    let changed = match ((*published).as_ref(), self.buffer.as_ref()) {
      (Some(new), Some(old)) => !Arc::ptr_eq(new, old),
      (None, None) => false,
      _ => true,
    };
    if changed {
      let incoming = (*published).as_ref().map(Arc::clone);
      drop(published);
      if let Some(old) = std::mem::replace(&mut self.buffer, incoming) {
        self.retire.retire(Retired::Buffer(old));
      }
      self.cursor = 0.0;
    }
  }

  fn sync_transport(&mut self) {
    let published = self.shared.transport.load();
    if Arc::ptr_eq(&*published, &self.transport) {
      return;
    }
    let incoming = Arc::clone(&*published);
    drop(published);

    let reseat = incoming.cursor_generation != self.transport.cursor_generation;
    let old = std::mem::replace(&mut self.transport, incoming);
    self.retire.retire(Retired::Transport(old));

    self.rate.set_target(self.transport.rate as f32);
    if reseat {
      let buffer_rate = self
        .buffer
        .as_ref()
        .map(|b| b.sample_rate() as f64)
        .unwrap_or(self.output_rate);
      self.cursor = self.transport.base_position * buffer_rate;
      // A fresh start plays at the requested rate from its first sample
      self.rate.snap();
    }
  }

  fn fill(&mut self, out: &mut [f32]) {
    let Some(buffer) = self.buffer.as_ref() else {
      out.fill(0.0);
      return;
    };
    let frames = out.len() / 2;
    let total = buffer.frames() as f64;
    let ratio = buffer.sample_rate() as f64 / self.output_rate;
    let ramp = self
      .rate
      .step(frames as f32 / self.output_rate as f32);

    let mut ran_off_end = false;
    for (i, frame) in out.chunks_exact_mut(2).enumerate() {
      if self.cursor >= total {
        frame[0] = 0.0;
        frame[1] = 0.0;
        ran_off_end = true;
        continue;
      }
      let index = self.cursor as usize;
      let frac = (self.cursor - index as f64) as f32;
      let (l0, r0) = buffer.frame(index);
      let (l1, r1) = buffer.frame(index + 1);
      frame[0] = l0 + (l1 - l0) * frac;
      frame[1] = r0 + (r1 - r0) * frac;
      self.cursor += ramp.at(i, frames) as f64 * ratio;
    }

    if ran_off_end || self.cursor >= total {
      self
        .shared
        .ended_generation
        .store(self.transport.cursor_generation, Ordering::Release);
    }
  }
}
