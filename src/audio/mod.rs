//! Streaming audio pipeline
//!
//! PCM transport codec, spectrum analysis, and watermark-based playback
//! scheduling. Device I/O lives behind the substrate traits defined here;
//! `cpal` adapters are in [`crate::voice`].

pub mod analyser;
pub mod codec;
pub mod scheduler;

use std::cell::Cell;
use std::rc::Rc;

pub use analyser::{Analyser, BIN_COUNT, FFT_SIZE, SpectrumSource, SpectrumTap};
pub use codec::{AudioChunk, PlaybackUnit, Resampling};
pub use scheduler::{PlaybackScheduler, ScheduledUnit};

use crate::Result;

/// Sample rate for microphone capture (16kHz for speech)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech returned by the remote model
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Handle to a buffer scheduled on a playback sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VoiceId(pub u64);

/// Monotonic audio clock, in seconds
pub trait AudioClock {
    /// Current time on the playback timeline
    fn now(&self) -> f64;
}

/// Accepts decoded buffers at scheduled start times
pub trait PlaybackSink {
    /// Schedule `unit` to begin playing at `start` seconds on the sink clock
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot accept the buffer
    fn schedule(&mut self, start: f64, unit: &PlaybackUnit) -> Result<VoiceId>;

    /// Stop a scheduled or playing buffer immediately
    fn stop(&mut self, id: VoiceId);
}

/// Delivers fixed-size capture frames while started
pub trait CaptureDevice {
    /// Acquire the microphone and begin delivering frames
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Device`] if permission is denied or no input
    /// device is available
    fn start(&mut self) -> Result<()>;

    /// Release the microphone; no frames are delivered afterwards
    fn stop(&mut self);

    /// Whether the device is currently held
    fn is_capturing(&self) -> bool;
}

/// Hand-driven clock for simulation and tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<f64>>,
}

impl ManualClock {
    /// Create a clock reading zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the absolute time in seconds
    pub fn set(&self, seconds: f64) {
        self.now.set(seconds);
    }

    /// Advance the clock by `seconds`
    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }
}

/// Sink that accepts everything and plays nothing
#[derive(Debug, Default)]
pub struct NullSink {
    next_id: u64,
}

impl PlaybackSink for NullSink {
    fn schedule(&mut self, _start: f64, _unit: &PlaybackUnit) -> Result<VoiceId> {
        self.next_id += 1;
        Ok(VoiceId(self.next_id))
    }

    fn stop(&mut self, _id: VoiceId) {}
}
