//! Hand-back of shared objects the render thread stops using
//!
//! The render thread keeps its own `Arc` to every buffer, curve and
//! transport snapshot it reads. When it moves on to a newer one, the old
//! `Arc` may be the last reference; freeing it there would put the allocator
//! on the audio thread. Instead the old value is pushed back to the control
//! side, which drops it on its next call.

use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::decoder::AudioBuffer;
use crate::effect_stage::DriveCurve;
use crate::transport::TransportState;

const RETIRE_CAPACITY: usize = 64;

pub(crate) enum Retired {
  Buffer(Arc<AudioBuffer>),
  Curve(Arc<DriveCurve>),
  Transport(Arc<TransportState>),
}

/// Render side
pub(crate) struct RetireSender {
  producer: Producer<Retired>,
}

/// Control side
pub(crate) struct RetireBin {
  consumer: Consumer<Retired>,
}

pub(crate) fn retire_queue() -> (RetireSender, RetireBin) {
  let (producer, consumer) = RingBuffer::new(RETIRE_CAPACITY);
  (RetireSender { producer }, RetireBin { consumer })
}

impl RetireSender {
  /// Never blocks. If the control side has not emptied the bin for a long
  /// time the item is dropped in place.
  pub fn retire(&mut self, item: Retired) {
    if let Err(rtrb::PushError::Full(item)) = self.producer.push(item) {
      drop(item);
    }
  }
}

impl RetireBin {
  /// Drop everything handed back so far
  pub fn empty(&mut self) -> usize {
    let mut count = 0;
    while let Ok(item) = self.consumer.pop() {
      drop(item);
      count += 1;
    }
    count
  }
}
