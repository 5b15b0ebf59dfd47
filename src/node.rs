//! JavaScript bindings for the UI layer
//!
//! Decks are addressed as `"A"` / `"B"`. Loads resolve as promises on the
//! libuv thread pool so the JS thread never waits on a decode.

use napi::bindgen_prelude::*;
use napi::{Env, Task};
use napi_derive::napi;

use crate::{
  list_audio_devices, DeckEngine, DeckId, DeckStatus, DeviceConfig, EngineConfig, EngineController,
  EqBand, LoadError, PendingLoad, RecordingFormat,
};

fn map_err<E: ToString>(err: E) -> Error {
  Error::from_reason(err.to_string())
}

fn parse_deck(deck: &str) -> Result<DeckId> {
  match deck {
    "A" | "a" => Ok(DeckId::A),
    "B" | "b" => Ok(DeckId::B),
    _ => Err(Error::from_reason(format!("Invalid deck: {}", deck))),
  }
}

#[napi(object)]
pub struct AudioDeviceInfoJs {
  pub name: String,
  pub max_output_channels: u32,
  pub default_sample_rate: Option<u32>,
  pub is_default: bool,
}

#[napi(object)]
pub struct DeckStatusJs {
  pub id: String,
  pub track_name: Option<String>,
  pub is_playing: bool,
  pub volume: f64,
  pub rate: f64,
  pub eq_high: f64,
  pub eq_mid: f64,
  pub eq_low: f64,
  pub filter: f64,
  pub drive: f64,
  pub sub_bass: f64,
  pub duration: f64,
  pub current_time: f64,
}

impl From<DeckStatus> for DeckStatusJs {
  fn from(status: DeckStatus) -> Self {
    Self {
      id: status.deck.to_string(),
      track_name: status.track_label,
      is_playing: status.playing,
      volume: status.effects.volume as f64,
      rate: status.rate,
      eq_high: status.effects.eq_high as f64,
      eq_mid: status.effects.eq_mid as f64,
      eq_low: status.effects.eq_low as f64,
      filter: status.effects.filter as f64,
      drive: status.effects.drive as f64,
      sub_bass: status.effects.sub_bass as f64,
      duration: status.duration,
      current_time: status.position,
    }
  }
}

#[napi(object)]
pub struct EngineStatusJs {
  pub deck_a: DeckStatusJs,
  pub deck_b: DeckStatusJs,
  pub crossfader: f64,
  pub master_volume: f64,
  pub is_recording: bool,
}

#[napi(object)]
pub struct RecordingJs {
  pub data: Buffer,
  pub file_name: String,
  pub mime_type: String,
  pub duration: f64,
}

#[napi]
pub fn addon_version() -> String {
  crate::version().to_string()
}

#[napi(js_name = "listAudioDevices")]
pub fn list_audio_devices_js() -> Result<Vec<AudioDeviceInfoJs>> {
  Ok(
    list_audio_devices()
      .map_err(map_err)?
      .into_iter()
      .map(|device| AudioDeviceInfoJs {
        name: device.name,
        max_output_channels: device.max_output_channels as u32,
        default_sample_rate: device.default_sample_rate,
        is_default: device.is_default,
      })
      .collect(),
  )
}

/// Waits for a deck load off the JS thread
pub struct LoadTask {
  pending: Option<PendingLoad>,
}

impl Task for LoadTask {
  type Output = f64;
  type JsValue = f64;

  fn compute(&mut self) -> Result<Self::Output> {
    let pending = self
      .pending
      .take()
      .ok_or_else(|| Error::from_reason("load already resolved"))?;
    pending.wait().map_err(|e| match e {
      LoadError::Fetch(_) => Error::new(Status::GenericFailure, format!("FetchError: {}", e)),
      LoadError::Decode(_) => Error::new(Status::InvalidArg, format!("DecodeError: {}", e)),
      other => map_err(other),
    })
  }

  fn resolve(&mut self, _env: Env, output: Self::Output) -> Result<Self::JsValue> {
    Ok(output)
  }
}

#[napi]
pub struct NexusEngine {
  engine: EngineController,
}

#[napi]
impl NexusEngine {
  #[napi(constructor)]
  pub fn new(sample_rate: Option<u32>, recording_format: Option<String>) -> Result<Self> {
    let mut config = EngineConfig::default();
    if let Some(rate) = sample_rate {
      config = config.with_sample_rate(rate);
    }
    if let Some(format) = recording_format.as_deref() {
      config = config.with_recording_format(match format {
        "wav" => RecordingFormat::Wav,
        "ogg" => RecordingFormat::Ogg,
        other => return Err(Error::from_reason(format!("Invalid recording format: {}", other))),
      });
    }
    Ok(Self {
      engine: EngineController::new(config),
    })
  }

  fn deck(&self, deck: String) -> Result<&DeckEngine> {
    Ok(self.engine.deck(parse_deck(&deck)?))
  }

  /// Open an output device by name, or the default one
  #[napi]
  pub fn start_output(&self, device_id: Option<String>) -> Result<()> {
    self
      .engine
      .start_output(DeviceConfig { device_id })
      .map(|_| ())
      .map_err(map_err)
  }

  #[napi]
  pub fn stop_output(&self) {
    self.engine.stop_output();
  }

  #[napi]
  pub fn load(&self, deck: String, data: Buffer, file_name: Option<String>) -> Result<AsyncTask<LoadTask>> {
    let pending = self.deck(deck)?.load(data.to_vec(), file_name.as_deref());
    Ok(AsyncTask::new(LoadTask {
      pending: Some(pending),
    }))
  }

  #[napi]
  pub fn load_url(&self, deck: String, url: String, label: Option<String>) -> Result<AsyncTask<LoadTask>> {
    let pending = self.deck(deck)?.load_url(&url, label.as_deref());
    Ok(AsyncTask::new(LoadTask {
      pending: Some(pending),
    }))
  }

  #[napi]
  pub fn play(&self, deck: String) -> Result<()> {
    self.deck(deck)?.play();
    Ok(())
  }

  #[napi]
  pub fn pause(&self, deck: String) -> Result<()> {
    self.deck(deck)?.pause();
    Ok(())
  }

  #[napi]
  pub fn seek(&self, deck: String, time: f64) -> Result<()> {
    self.deck(deck)?.seek(time);
    Ok(())
  }

  #[napi]
  pub fn set_rate(&self, deck: String, rate: f64) -> Result<()> {
    self.deck(deck)?.set_rate(rate);
    Ok(())
  }

  #[napi]
  pub fn set_volume(&self, deck: String, volume: f64) -> Result<()> {
    self.deck(deck)?.set_volume(volume as f32);
    Ok(())
  }

  #[napi(js_name = "setEQ")]
  pub fn set_eq(&self, deck: String, band: String, value: f64) -> Result<()> {
    let band: EqBand = band.parse().map_err(Error::from_reason)?;
    self.deck(deck)?.set_eq(band, value as f32);
    Ok(())
  }

  #[napi]
  pub fn set_filter(&self, deck: String, amount: f64) -> Result<()> {
    self.deck(deck)?.set_filter(amount as f32);
    Ok(())
  }

  #[napi]
  pub fn set_drive(&self, deck: String, amount: f64) -> Result<()> {
    self.deck(deck)?.set_drive(amount as f32);
    Ok(())
  }

  #[napi]
  pub fn set_sub_bass(&self, deck: String, amount: f64) -> Result<()> {
    self.deck(deck)?.set_sub_bass(amount as f32);
    Ok(())
  }

  #[napi]
  pub fn set_crossfader(&self, position: f64) {
    self.engine.set_crossfader(position as f32);
  }

  #[napi]
  pub fn set_master_volume(&self, volume: f64) {
    self.engine.set_master_volume(volume as f32);
  }

  #[napi]
  pub fn get_current_time(&self, deck: String) -> Result<f64> {
    Ok(self.deck(deck)?.position())
  }

  #[napi]
  pub fn get_duration(&self, deck: String) -> Result<f64> {
    Ok(self.deck(deck)?.duration())
  }

  /// Analyser bins scaled to 0..255 for spectrum bars
  #[napi]
  pub fn get_frequency_data(&self, deck: String) -> Result<Uint8Array> {
    Ok(Uint8Array::new(self.deck(deck)?.byte_frequency_data()))
  }

  #[napi]
  pub fn get_state(&self) -> EngineStatusJs {
    let status = self.engine.status();
    EngineStatusJs {
      deck_a: status.deck_a.into(),
      deck_b: status.deck_b.into(),
      crossfader: status.crossfader as f64,
      master_volume: status.master_volume as f64,
      is_recording: status.recording.active,
    }
  }

  #[napi]
  pub fn start_recording(&self) -> Result<()> {
    self.engine.start_recording().map(|_| ()).map_err(map_err)
  }

  #[napi]
  pub fn stop_recording(&self) -> Result<Option<RecordingJs>> {
    Ok(self.engine.stop_recording().map_err(map_err)?.map(|recording| RecordingJs {
      data: recording.bytes.into(),
      file_name: recording.file_name,
      mime_type: recording.mime_type.to_string(),
      duration: recording.duration,
    }))
  }
}
