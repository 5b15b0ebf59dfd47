//! Audio decoding using symphonia, plus fetch-by-URL
//!
//! This module provides:
//! - `AudioBuffer`, the immutable decoded PCM a deck plays from
//! - decoding any container/codec symphonia supports from an in-memory byte buffer
//! - fetching audio bytes over HTTP, with failures kept apart from decode failures

use std::io::{Cursor, Read};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{DecodeError, FetchError};

/// Upper bound for a single network fetch
const MAX_FETCH_BYTES: u64 = 512 * 1024 * 1024;

/// Decoded PCM samples, never mutated after construction
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
  /// Interleaved samples
  samples: Vec<f32>,
  sample_rate: u32,
  channels: u16,
}

impl AudioBuffer {
  pub fn from_interleaved(
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
  ) -> Result<Self, DecodeError> {
    if sample_rate == 0 || channels == 0 {
      return Err(DecodeError::Malformed(format!(
        "invalid format: {} Hz, {} channels",
        sample_rate, channels
      )));
    }
    if samples.is_empty() {
      return Err(DecodeError::Empty);
    }
    if samples.len() % channels as usize != 0 {
      return Err(DecodeError::Malformed(
        "sample count is not a multiple of the channel count".to_string(),
      ));
    }
    Ok(Self {
      samples,
      sample_rate,
      channels,
    })
  }

  /// Duplicate a mono signal into a stereo buffer
  pub fn from_mono(samples: &[f32], sample_rate: u32) -> Result<Self, DecodeError> {
    let stereo = samples.iter().flat_map(|&s| [s, s]).collect();
    Self::from_interleaved(stereo, sample_rate, 2)
  }

  pub fn frames(&self) -> usize {
    self.samples.len() / self.channels as usize
  }

  /// Duration in seconds
  pub fn duration(&self) -> f64 {
    self.frames() as f64 / self.sample_rate as f64
  }

  pub fn sample_rate(&self) -> u32 {
    self.sample_rate
  }

  pub fn channels(&self) -> u16 {
    self.channels
  }

  pub fn samples(&self) -> &[f32] {
    &self.samples
  }

  /// Stereo view of one frame: mono is duplicated, extra channels ignored
  #[inline]
  pub fn frame(&self, index: usize) -> (f32, f32) {
    let channels = self.channels as usize;
    let base = index * channels;
    match self.samples.get(base..base + channels) {
      Some(frame) if channels == 1 => (frame[0], frame[0]),
      Some(frame) => (frame[0], frame[1]),
      None => (0.0, 0.0),
    }
  }
}

/// Decode an in-memory audio file into PCM at its native rate and layout.
///
/// `extension` is only a probing hint; the container is detected from the
/// bytes themselves.
pub fn decode_audio(bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioBuffer, DecodeError> {
  let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

  let mut hint = Hint::new();
  if let Some(ext) = extension {
    hint.with_extension(ext);
  }

  // Probe the container
  let format_opts = FormatOptions::default();
  let metadata_opts = MetadataOptions::default();
  let probed = symphonia::default::get_probe()
    .format(&hint, mss, &format_opts, &metadata_opts)
    .map_err(|e| DecodeError::Probe(e.to_string()))?;

  let mut format = probed.format;

  // Find the audio track
  let track = format
    .tracks()
    .iter()
    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
    .ok_or(DecodeError::NoAudioTrack)?;

  let track_id = track.id;
  let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
  let mut channels = track
    .codec_params
    .channels
    .map(|c| c.count() as u16)
    .unwrap_or(0);

  let mut decoder = symphonia::default::get_codecs()
    .make(&track.codec_params, &DecoderOptions::default())
    .map_err(|e| DecodeError::UnsupportedCodec(e.to_string()))?;

  // Collect all decoded samples
  let mut all_samples: Vec<f32> = Vec::new();

  loop {
    let packet = match format.next_packet() {
      Ok(packet) => packet,
      Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
        break
      }
      Err(SymphoniaError::ResetRequired) => break,
      Err(e) => return Err(DecodeError::Malformed(e.to_string())),
    };

    if packet.track_id() != track_id {
      continue;
    }

    match decoder.decode(&packet) {
      Ok(audio_buf) => {
        let spec = *audio_buf.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;
        let mut sample_buf = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(audio_buf);
        all_samples.extend_from_slice(sample_buf.samples());
      }
      // Corrupt packets are skipped, the rest of the stream is still usable
      Err(SymphoniaError::DecodeError(e)) => {
        log::debug!("skipping undecodable packet: {}", e);
        continue;
      }
      Err(e) => return Err(DecodeError::Malformed(e.to_string())),
    }
  }

  if all_samples.is_empty() {
    return Err(DecodeError::Empty);
  }

  AudioBuffer::from_interleaved(all_samples, sample_rate, channels)
}

/// Fetch raw audio bytes from a URL
pub fn fetch_audio(url: &str) -> Result<Vec<u8>, FetchError> {
  log::info!("Fetching {}", url);

  let response = ureq::get(url).call().map_err(|e| match e {
    ureq::Error::Status(code, _) => FetchError::Status {
      url: url.to_string(),
      code,
    },
    ureq::Error::Transport(transport) => FetchError::Transport {
      url: url.to_string(),
      reason: transport.to_string(),
    },
  })?;

  let mut bytes = Vec::new();
  response
    .into_reader()
    .take(MAX_FETCH_BYTES)
    .read_to_end(&mut bytes)?;

  Ok(bytes)
}

/// File name without its extension, used as the deck's track label
pub fn track_label(file_name: &str) -> String {
  let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
  match base.rfind('.') {
    Some(dot) if dot > 0 => base[..dot].to_string(),
    _ => base.to_string(),
  }
}

/// Extension of a file name or URL path, lowercased, for probing hints
pub fn extension_hint(name: &str) -> Option<String> {
  let path = name.split(['?', '#']).next().unwrap_or(name);
  let base = path.rsplit('/').next().unwrap_or(path);
  base
    .rfind('.')
    .filter(|&dot| dot > 0 && dot + 1 < base.len())
    .map(|dot| base[dot + 1..].to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
      channels,
      sample_rate,
      bits_per_sample: 16,
      sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
      let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).unwrap();
      for &sample in samples {
        writer
          .write_sample((sample * i16::MAX as f32) as i16)
          .unwrap();
      }
      writer.finalize().unwrap();
    }
    bytes
  }

  #[test]
  fn test_decode_stereo_wav() {
    let frames = 4410;
    let samples: Vec<f32> = (0..frames * 2)
      .map(|i| if i % 2 == 0 { 0.5 } else { -0.25 })
      .collect();
    let buffer = decode_audio(wav_bytes(&samples, 44_100, 2), Some("wav")).unwrap();

    assert_eq!(buffer.channels(), 2);
    assert_eq!(buffer.sample_rate(), 44_100);
    assert_eq!(buffer.frames(), frames);
    assert!((buffer.duration() - 0.1).abs() < 1e-9);
    let (left, right) = buffer.frame(100);
    assert!((left - 0.5).abs() < 1e-3);
    assert!((right + 0.25).abs() < 1e-3);
  }

  #[test]
  fn test_decode_mono_wav_without_hint() {
    let samples = vec![0.1f32; 22_050];
    let buffer = decode_audio(wav_bytes(&samples, 22_050, 1), None).unwrap();
    assert_eq!(buffer.channels(), 1);
    assert!((buffer.duration() - 1.0).abs() < 1e-9);
    let (left, right) = buffer.frame(10);
    assert_eq!(left, right);
  }

  #[test]
  fn test_garbage_is_a_decode_error() {
    let garbage = b"definitely not an audio file, just some text bytes".to_vec();
    assert!(decode_audio(garbage, Some("mp3")).is_err());
    assert!(matches!(decode_audio(Vec::new(), None), Err(DecodeError::Probe(_))));
  }

  #[test]
  fn test_buffer_validation() {
    assert!(matches!(
      AudioBuffer::from_interleaved(vec![], 44_100, 2),
      Err(DecodeError::Empty)
    ));
    assert!(AudioBuffer::from_interleaved(vec![0.0; 3], 44_100, 2).is_err());
    assert!(AudioBuffer::from_interleaved(vec![0.0; 4], 0, 2).is_err());
  }

  #[test]
  fn test_frame_out_of_range_is_silence() {
    let buffer = AudioBuffer::from_mono(&[1.0, 1.0], 44_100).unwrap();
    assert_eq!(buffer.frame(2), (0.0, 0.0));
  }

  #[test]
  fn test_track_label_strips_extension() {
    assert_eq!(track_label("Deep Urban.mp3"), "Deep Urban");
    assert_eq!(track_label("/music/set.v2.flac"), "set.v2");
    assert_eq!(track_label(".hidden"), ".hidden");
    assert_eq!(track_label("noext"), "noext");
  }

  #[test]
  fn test_extension_hint() {
    assert_eq!(
      extension_hint("https://cdn.example.com/audio/track.MP3?x=1"),
      Some("mp3".to_string())
    );
    assert_eq!(extension_hint("https://example.com/stream"), None);
    assert_eq!(extension_hint("song.ogg"), Some("ogg".to_string()));
  }
}
