#![deny(clippy::all)]

//! Two-deck mixing engine: decks with per-deck effect chains, an equal-power
//! crossfader, a master bus and a recording tap.

use cpal::traits::{DeviceTrait, HostTrait};

pub mod advice;
pub mod config;
pub mod error;

mod audio_engine;
mod deck;
mod decoder;
mod effect_stage;
mod filters;
mod mixer;
mod recorder;
mod retire;
mod smoother;
mod spectrum;
mod transport;

#[cfg(feature = "node")]
mod node;

pub use audio_engine::{EngineController, EngineStatus, OutputInfo};
pub use config::{DeviceConfig, EngineConfig, SmoothingConfig};
pub use deck::{DeckEngine, DeckId, DeckStatus, PendingLoad, MAX_RATE, MIN_RATE};
pub use decoder::{decode_audio, fetch_audio, track_label, AudioBuffer};
pub use effect_stage::{
  drive_transfer, DriveCurve, EffectSettings, EqBand, FilterMode, DRIVE_BYPASS_THRESHOLD,
};
pub use error::{AdviceError, DecodeError, DeviceError, FetchError, LoadError, RecordingError};
pub use filters::BiquadCoefficients;
pub use mixer::equal_power_gains;
pub use recorder::{
  recording_file_name, Recording, RecordingFormat, RecordingSession, RecordingStatus,
};
pub use smoother::ParameterSmoother;
pub use spectrum::{MAX_DECIBELS, MIN_DECIBELS};
pub use transport::{Clock, ManualClock, SystemClock, TransportState};

#[derive(Clone, Debug, PartialEq)]
pub struct AudioDeviceInfo {
  pub name: String,
  pub max_output_channels: u16,
  pub default_sample_rate: Option<u32>,
  pub is_default: bool,
}

/// Crate version, so hosts can verify which engine build they loaded
pub fn version() -> &'static str {
  env!("CARGO_PKG_VERSION")
}

/// Output devices of the default host
pub fn list_audio_devices() -> Result<Vec<AudioDeviceInfo>, DeviceError> {
  let host = cpal::default_host();
  let default_name = host.default_output_device().and_then(|d| d.name().ok());

  let mut devices = Vec::new();
  for device in host
    .output_devices()
    .map_err(|e| DeviceError::Host(e.to_string()))?
  {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let max_output_channels = device
      .supported_output_configs()
      .ok()
      .and_then(|configs| configs.map(|cfg| cfg.channels()).max())
      .unwrap_or(0);

    let default_sample_rate = device
      .default_output_config()
      .map(|cfg| cfg.sample_rate().0)
      .ok();

    devices.push(AudioDeviceInfo {
      is_default: default_name.as_deref() == Some(name.as_str()),
      name,
      max_output_channels,
      default_sample_rate,
    });
  }

  Ok(devices)
}
