//! Recording of the master bus
//!
//! The render thread copies every master block into a lock-free ring through
//! [`RecordingTap`]. A long-lived worker thread drains the ring and encodes into
//! memory; [`Recorder::stop`] seals the stream and hands back the bytes.
//! Nothing on the live path waits on the worker: when the ring is full the
//! block is dropped and counted.

use std::cell::RefCell;
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::num::{NonZeroU32, NonZeroU8};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use vorbis_rs::{VorbisEncoder, VorbisEncoderBuilder};

use crate::config::EngineConfig;
use crate::error::RecordingError;

const CHANNELS: usize = 2;
/// How often the worker drains the ring when no command arrives
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordingFormat {
  #[default]
  Ogg,
  Wav,
}

impl RecordingFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      RecordingFormat::Ogg => "ogg",
      RecordingFormat::Wav => "wav",
    }
  }

  pub fn mime_type(&self) -> &'static str {
    match self {
      RecordingFormat::Ogg => "audio/ogg",
      RecordingFormat::Wav => "audio/wav",
    }
  }
}

/// Handle to the active capture
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSession {
  pub id: u64,
  pub format: RecordingFormat,
  pub sample_rate: u32,
  pub started_at: DateTime<Utc>,
}

/// A sealed recording
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
  pub bytes: Vec<u8>,
  /// `<product>-Set-<YYYY-MM-DD>.<ext>`
  pub file_name: String,
  pub mime_type: &'static str,
  pub format: RecordingFormat,
  pub frames: u64,
  /// Seconds
  pub duration: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordingStatus {
  pub active: bool,
  pub started_at: Option<DateTime<Utc>>,
  /// Frames encoded so far in the active session
  pub frames: u64,
  /// Samples lost to a full tap since the session started
  pub dropped_samples: u64,
}

pub fn recording_file_name(product: &str, date: DateTime<Utc>, format: RecordingFormat) -> String {
  format!(
    "{}-Set-{}.{}",
    product,
    date.format("%Y-%m-%d"),
    format.extension()
  )
}

// ============================================================================
// Render side
// ============================================================================

/// Passive tap on the master bus. Never blocks and never allocates.
pub struct RecordingTap {
  producer: Producer<f32>,
  armed: Arc<AtomicBool>,
  dropped: Arc<AtomicU64>,
}

impl RecordingTap {
  /// Copy one interleaved stereo block into the ring if a session is active
  pub fn capture(&mut self, block: &[f32]) {
    if !self.armed.load(Ordering::Acquire) {
      return;
    }
    // Whole frames only, so the ring never splits a frame
    let writable = (self.producer.slots().min(block.len()) / CHANNELS) * CHANNELS;
    if writable > 0 {
      if let Ok(chunk) = self.producer.write_chunk_uninit(writable) {
        chunk.fill_from_iter(block[..writable].iter().copied());
      }
    }
    let lost = block.len() - writable;
    if lost > 0 {
      self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
    }
  }
}

// ============================================================================
// Writers
// ============================================================================

trait AudioWriter {
  fn write_samples(&mut self, samples: &[f32]) -> Result<(), RecordingError>;
  fn finalize(self: Box<Self>) -> Result<Vec<u8>, RecordingError>;
}

/// In-memory, seekable sink that stays reachable after hound consumes its
/// writer
#[derive(Clone, Default)]
struct SharedCursor(Rc<RefCell<Cursor<Vec<u8>>>>);

impl Write for SharedCursor {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.0.borrow_mut().write(buf)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl Seek for SharedCursor {
  fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
    self.0.borrow_mut().seek(pos)
  }
}

struct WavWriter {
  writer: hound::WavWriter<SharedCursor>,
  sink: SharedCursor,
}

impl WavWriter {
  fn new(sample_rate: u32) -> Result<Self, RecordingError> {
    let spec = hound::WavSpec {
      channels: CHANNELS as u16,
      sample_rate,
      bits_per_sample: 16,
      sample_format: hound::SampleFormat::Int,
    };
    let sink = SharedCursor::default();
    let writer = hound::WavWriter::new(sink.clone(), spec)
      .map_err(|e| RecordingError::Unavailable(format!("Failed to create WAV writer: {}", e)))?;
    Ok(Self { writer, sink })
  }
}

impl AudioWriter for WavWriter {
  fn write_samples(&mut self, samples: &[f32]) -> Result<(), RecordingError> {
    for &sample in samples {
      let clamped = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
      self
        .writer
        .write_sample(clamped)
        .map_err(|e| RecordingError::Encode(format!("Failed to write WAV sample: {}", e)))?;
    }
    Ok(())
  }

  fn finalize(self: Box<Self>) -> Result<Vec<u8>, RecordingError> {
    let WavWriter { writer, sink } = *self;
    writer
      .finalize()
      .map_err(|e| RecordingError::Encode(format!("Failed to finalize WAV: {}", e)))?;
    let bytes = sink.0.borrow().get_ref().clone();
    Ok(bytes)
  }
}

struct OggWriter {
  encoder: VorbisEncoder<Vec<u8>>,
  left: Vec<f32>,
  right: Vec<f32>,
}

impl OggWriter {
  fn new(sample_rate: u32) -> Result<Self, RecordingError> {
    let sampling_frequency = NonZeroU32::new(sample_rate)
      .ok_or_else(|| RecordingError::Unavailable("Invalid sample rate".to_string()))?;
    let channels = NonZeroU8::new(CHANNELS as u8)
      .ok_or_else(|| RecordingError::Unavailable("Invalid channel count".to_string()))?;

    let mut builder =
      VorbisEncoderBuilder::new_with_serial(sampling_frequency, channels, Vec::new(), 0);
    let encoder = builder.build().map_err(|e| {
      RecordingError::Unavailable(format!("Failed to create Vorbis encoder: {}", e))
    })?;
    Ok(Self {
      encoder,
      left: Vec::new(),
      right: Vec::new(),
    })
  }
}

impl AudioWriter for OggWriter {
  fn write_samples(&mut self, samples: &[f32]) -> Result<(), RecordingError> {
    if samples.is_empty() {
      return Ok(());
    }
    // Interleaved stereo -> planar channels
    self.left.clear();
    self.right.clear();
    for frame in samples.chunks_exact(CHANNELS) {
      self.left.push(frame[0]);
      self.right.push(frame[1]);
    }
    let blocks: [&[f32]; 2] = [&self.left[..], &self.right[..]];
    self
      .encoder
      .encode_audio_block(&blocks)
      .map_err(|e| RecordingError::Encode(format!("Vorbis encode error: {}", e)))?;
    Ok(())
  }

  fn finalize(self: Box<Self>) -> Result<Vec<u8>, RecordingError> {
    self
      .encoder
      .finish()
      .map_err(|e| RecordingError::Encode(format!("Vorbis finalize error: {}", e)))
  }
}

fn create_writer(
  format: RecordingFormat,
  sample_rate: u32,
) -> Result<Box<dyn AudioWriter>, RecordingError> {
  Ok(match format {
    RecordingFormat::Wav => Box::new(WavWriter::new(sample_rate)?),
    RecordingFormat::Ogg => Box::new(OggWriter::new(sample_rate)?),
  })
}

// ============================================================================
// Capture worker
// ============================================================================

/// Encoded bytes and frame count of a finished session
type Sealed = (Vec<u8>, u64);

enum RecorderCommand {
  Start {
    format: RecordingFormat,
    reply: Sender<Result<(), RecordingError>>,
  },
  Stop {
    reply: Sender<Result<Sealed, RecordingError>>,
  },
  Shutdown,
}

struct CaptureWorker {
  commands: Receiver<RecorderCommand>,
  consumer: Consumer<f32>,
  sample_rate: u32,
  frames: Arc<AtomicU64>,
  writer: Option<Box<dyn AudioWriter>>,
  /// First encode failure of the session, reported on stop
  failure: Option<RecordingError>,
  scratch: Vec<f32>,
}

impl CaptureWorker {
  fn run(mut self) {
    loop {
      match self.commands.recv_timeout(DRAIN_INTERVAL) {
        Ok(RecorderCommand::Start { format, reply }) => {
          // Whatever is left in the ring predates this session
          self.drain(false);
          self.frames.store(0, Ordering::Relaxed);
          self.failure = None;
          let result = create_writer(format, self.sample_rate).map(|writer| {
            self.writer = Some(writer);
          });
          let _ = reply.send(result);
        }
        Ok(RecorderCommand::Stop { reply }) => {
          self.drain(true);
          let _ = reply.send(self.seal());
        }
        Ok(RecorderCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        Err(RecvTimeoutError::Timeout) => self.drain(true),
      }
    }
    log::debug!("Capture worker stopped");
  }

  fn drain(&mut self, keep: bool) {
    let available = self.consumer.slots();
    if available == 0 {
      return;
    }
    let Ok(chunk) = self.consumer.read_chunk(available) else {
      return;
    };
    self.scratch.clear();
    let (first, second) = chunk.as_slices();
    self.scratch.extend_from_slice(first);
    self.scratch.extend_from_slice(second);
    chunk.commit_all();

    if !keep || self.failure.is_some() {
      return;
    }
    if let Some(writer) = self.writer.as_mut() {
      match writer.write_samples(&self.scratch) {
        Ok(()) => {
          self
            .frames
            .fetch_add((self.scratch.len() / CHANNELS) as u64, Ordering::Relaxed);
        }
        Err(e) => {
          log::error!("Recording encode failed: {}", e);
          self.failure = Some(e);
        }
      }
    }
  }

  fn seal(&mut self) -> Result<Sealed, RecordingError> {
    let writer = self
      .writer
      .take()
      .ok_or_else(|| RecordingError::Encode("no recording in progress".to_string()))?;
    if let Some(failure) = self.failure.take() {
      return Err(failure);
    }
    let frames = self.frames.load(Ordering::Relaxed);
    writer.finalize().map(|bytes| (bytes, frames))
  }
}

// ============================================================================
// Control side
// ============================================================================

/// Control side of the recording tap: at most one session at a time
pub struct Recorder {
  commands: Sender<RecorderCommand>,
  worker: Option<JoinHandle<()>>,
  armed: Arc<AtomicBool>,
  dropped: Arc<AtomicU64>,
  frames: Arc<AtomicU64>,
  session: Mutex<Option<RecordingSession>>,
  next_id: AtomicU64,
  sample_rate: u32,
  format: RecordingFormat,
  product_name: String,
}

impl Recorder {
  /// Build the recorder and the tap the render loop writes into
  pub fn new(config: &EngineConfig) -> (Self, RecordingTap) {
    let (producer, consumer) = RingBuffer::new(config.recording_buffer_samples().max(CHANNELS));
    let (commands, command_receiver) = unbounded();
    let armed = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicU64::new(0));
    let frames = Arc::new(AtomicU64::new(0));

    let sample_rate = config.sample_rate;
    let worker_frames = Arc::clone(&frames);
    // Encoders are created and used on the worker thread only
    let worker = thread::Builder::new()
      .name("recorder".to_string())
      .spawn(move || {
        CaptureWorker {
          commands: command_receiver,
          consumer,
          sample_rate,
          frames: worker_frames,
          writer: None,
          failure: None,
          scratch: Vec::new(),
        }
        .run()
      })
      .map_err(|e| log::warn!("Could not start capture worker: {}", e))
      .ok();

    let tap = RecordingTap {
      producer,
      armed: Arc::clone(&armed),
      dropped: Arc::clone(&dropped),
    };
    let recorder = Self {
      commands,
      worker,
      armed,
      dropped,
      frames,
      session: Mutex::new(None),
      next_id: AtomicU64::new(1),
      sample_rate: config.sample_rate,
      format: config.recording_format,
      product_name: config.product_name.clone(),
    };
    (recorder, tap)
  }

  /// Start capturing. Returns the running session unchanged if one is active.
  pub fn start(&self) -> Result<RecordingSession, RecordingError> {
    let mut session = self.session.lock();
    if let Some(active) = session.as_ref() {
      return Ok(active.clone());
    }

    let (reply, response) = bounded(1);
    self
      .commands
      .send(RecorderCommand::Start {
        format: self.format,
        reply,
      })
      .map_err(|_| RecordingError::Unavailable("capture worker is not running".to_string()))?;
    response
      .recv_timeout(REPLY_TIMEOUT)
      .map_err(|_| RecordingError::Unavailable("capture worker did not respond".to_string()))??;

    self.dropped.store(0, Ordering::Relaxed);
    self.armed.store(true, Ordering::Release);

    let started = RecordingSession {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      format: self.format,
      sample_rate: self.sample_rate,
      started_at: Utc::now(),
    };
    log::info!(
      "Recording #{} started ({})",
      started.id,
      self.format.extension()
    );
    *session = Some(started.clone());
    Ok(started)
  }

  /// Seal the active session. `Ok(None)` when nothing was recording.
  pub fn stop(&self) -> Result<Option<Recording>, RecordingError> {
    let mut session = self.session.lock();
    let Some(active) = session.take() else {
      return Ok(None);
    };
    self.armed.store(false, Ordering::Release);

    let (reply, response) = bounded(1);
    self
      .commands
      .send(RecorderCommand::Stop { reply })
      .map_err(|_| RecordingError::Unavailable("capture worker is not running".to_string()))?;
    let (bytes, frames) = response
      .recv_timeout(REPLY_TIMEOUT)
      .map_err(|_| RecordingError::Unavailable("capture worker did not respond".to_string()))??;

    let dropped = self.dropped.load(Ordering::Relaxed);
    if dropped > 0 {
      log::warn!("Recording #{} dropped {} samples", active.id, dropped);
    }
    let recording = Recording {
      file_name: recording_file_name(&self.product_name, Utc::now(), active.format),
      mime_type: active.format.mime_type(),
      format: active.format,
      frames,
      duration: frames as f64 / active.sample_rate as f64,
      bytes,
    };
    log::info!(
      "Recording #{} stopped: {} frames, {} bytes",
      active.id,
      recording.frames,
      recording.bytes.len()
    );
    Ok(Some(recording))
  }

  pub fn is_recording(&self) -> bool {
    self.session.lock().is_some()
  }

  pub fn status(&self) -> RecordingStatus {
    let session = self.session.lock();
    match session.as_ref() {
      Some(active) => RecordingStatus {
        active: true,
        started_at: Some(active.started_at),
        frames: self.frames.load(Ordering::Relaxed),
        dropped_samples: self.dropped.load(Ordering::Relaxed),
      },
      None => RecordingStatus::default(),
    }
  }
}

impl Drop for Recorder {
  fn drop(&mut self) {
    self.armed.store(false, Ordering::Release);
    let _ = self.commands.send(RecorderCommand::Shutdown);
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        log::error!("Capture worker panicked");
      }
    }
  }
}
