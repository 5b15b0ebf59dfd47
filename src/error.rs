//! Error taxonomy for the mixing engine
//!
//! Errors only ever travel on the control side. The render path has no
//! error channel: anything unexpected there degrades to silence.

use thiserror::Error;

/// Audio bytes could not be turned into PCM
#[derive(Debug, Error)]
pub enum DecodeError {
  #[error("unrecognised audio container: {0}")]
  Probe(String),
  #[error("no decodable audio track found")]
  NoAudioTrack,
  #[error("unsupported codec: {0}")]
  UnsupportedCodec(String),
  #[error("malformed audio data: {0}")]
  Malformed(String),
  #[error("no samples decoded")]
  Empty,
}

/// Network acquisition failed before any decoding happened
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("{url} answered with HTTP {code}")]
  Status { url: String, code: u16 },
  #[error("could not reach {url}: {reason}")]
  Transport { url: String, reason: String },
  #[error("failed to read response body: {0}")]
  Io(#[from] std::io::Error),
}

/// Outcome of a load request that did not install a buffer
#[derive(Debug, Error)]
pub enum LoadError {
  #[error(transparent)]
  Decode(#[from] DecodeError),
  #[error(transparent)]
  Fetch(#[from] FetchError),
  /// A newer load on the same deck finished or started after this one
  #[error("load superseded by a newer request")]
  Superseded,
  /// The worker went away without reporting
  #[error("load cancelled")]
  Cancelled,
}

#[derive(Debug, Error)]
pub enum RecordingError {
  #[error("recording unavailable: {0}")]
  Unavailable(String),
  #[error("recording encoder failed: {0}")]
  Encode(String),
}

/// Live output device problems
#[derive(Debug, Error)]
pub enum DeviceError {
  #[error("failed to query audio host: {0}")]
  Host(String),
  #[error("no output device available")]
  NoDevice,
  #[error("device '{0}' does not support f32 output")]
  UnsupportedFormat(String),
  #[error("failed to build audio stream: {0}")]
  Build(String),
  #[error("failed to start audio stream: {0}")]
  Play(String),
}

/// A collaborator reply that does not match the expected shape
#[derive(Debug, Error)]
pub enum AdviceError {
  #[error("invalid advice JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("expected exactly {expected} suggestions, got {actual}")]
  SuggestionCount { expected: usize, actual: usize },
  #[error("advice collaborator failed: {0}")]
  Collaborator(String),
}
