//! Transport bookkeeping
//!
//! Position is never accumulated sample by sample on the control side. A
//! playing deck stores where it started and when, and the position at any
//! later instant is `base_position + (now - epoch) * rate`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source in seconds
pub trait Clock: Send + Sync {
  fn now(&self) -> f64;
}

/// Wall clock backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
  origin: Instant,
}

impl SystemClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
    }
  }
}

impl Default for SystemClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for SystemClock {
  fn now(&self) -> f64 {
    self.origin.elapsed().as_secs_f64()
  }
}

/// Clock that only moves when told to, for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
  seconds: AtomicU64,
}

impl ManualClock {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn advance(&self, seconds: f64) {
    self.set(self.now() + seconds);
  }

  pub fn set(&self, seconds: f64) {
    self.seconds.store(seconds.to_bits(), Ordering::Relaxed);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> f64 {
    f64::from_bits(self.seconds.load(Ordering::Relaxed))
  }
}

/// One consistent transport snapshot, published to the render thread as a
/// whole.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportState {
  pub playing: bool,
  /// Seconds into the buffer at `epoch`
  pub base_position: f64,
  /// Clock time of the last rebase
  pub epoch: f64,
  pub rate: f64,
  /// Bumped whenever the render cursor must be re-seated at `base_position`
  pub cursor_generation: u64,
}

impl Default for TransportState {
  fn default() -> Self {
    Self {
      playing: false,
      base_position: 0.0,
      epoch: 0.0,
      rate: 1.0,
      cursor_generation: 0,
    }
  }
}

impl TransportState {
  pub fn position_at(&self, now: f64) -> f64 {
    if self.playing {
      self.base_position + (now - self.epoch) * self.rate
    } else {
      self.base_position
    }
  }

  /// Paused at zero, keeping the current rate
  pub fn rewound(&self) -> Self {
    Self {
      playing: false,
      base_position: 0.0,
      epoch: 0.0,
      rate: self.rate,
      cursor_generation: self.cursor_generation + 1,
    }
  }

  /// Start playback from `base_position`
  pub fn started(&self, now: f64) -> Self {
    Self {
      playing: true,
      epoch: now,
      cursor_generation: self.cursor_generation + 1,
      ..*self
    }
  }

  /// Freeze at the current position, never past `duration`
  pub fn paused(&self, now: f64, duration: f64) -> Self {
    Self {
      playing: false,
      base_position: self.position_at(now).clamp(0.0, duration.max(0.0)),
      epoch: now,
      ..*self
    }
  }

  /// Jump to `position`, keeping the play state
  pub fn sought(&self, position: f64, now: f64) -> Self {
    Self {
      base_position: position,
      epoch: now,
      cursor_generation: self.cursor_generation + 1,
      ..*self
    }
  }

  /// Change rate; a playing transport is rebased first so positions already
  /// travelled keep their old rate.
  pub fn with_rate(&self, rate: f64, now: f64) -> Self {
    let base_position = self.position_at(now);
    Self {
      base_position,
      epoch: now,
      rate,
      ..*self
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_paused_position_is_frozen() {
    let state = TransportState {
      base_position: 12.5,
      ..TransportState::default()
    };
    assert_eq!(state.position_at(0.0), 12.5);
    assert_eq!(state.position_at(1000.0), 12.5);
  }

  #[test]
  fn test_playing_position_follows_formula() {
    let state = TransportState::default().sought(4.0, 0.0).started(10.0);
    assert!((state.position_at(12.0) - 6.0).abs() < 1e-9);

    let faster = TransportState {
      rate: 1.5,
      ..TransportState::default()
    }
    .started(0.0);
    assert!((faster.position_at(2.0) - 3.0).abs() < 1e-9);
  }

  #[test]
  fn test_pause_clamps_to_duration() {
    let state = TransportState::default().started(0.0);
    let paused = state.paused(500.0, 180.0);
    assert!(!paused.playing);
    assert_eq!(paused.base_position, 180.0);
  }

  #[test]
  fn test_rate_change_rebases() {
    let state = TransportState::default().started(0.0);
    let changed = state.with_rate(2.0, 10.0);
    assert!((changed.base_position - 10.0).abs() < 1e-9);
    // 10 s at 1x, then 5 s at 2x
    assert!((changed.position_at(15.0) - 20.0).abs() < 1e-9);
  }

  #[test]
  fn test_start_and_seek_bump_cursor_generation() {
    let state = TransportState::default();
    let started = state.started(0.0);
    let sought = started.sought(3.0, 1.0);
    assert_eq!(started.cursor_generation, 1);
    assert_eq!(sought.cursor_generation, 2);
    assert_eq!(sought.with_rate(1.2, 2.0).cursor_generation, 2);
  }

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::new();
    assert_eq!(clock.now(), 0.0);
    clock.advance(2.5);
    clock.advance(0.5);
    assert_eq!(clock.now(), 3.0);
    clock.set(10.0);
    assert_eq!(clock.now(), 10.0);
  }

  #[test]
  fn test_system_clock_is_monotonic() {
    let clock = SystemClock::new();
    let first = clock.now();
    let second = clock.now();
    assert!(second >= first);
  }
}
