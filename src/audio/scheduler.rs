//! Gapless playback scheduling
//!
//! Received chunks are decoded and placed back-to-back on the sink timeline.
//! A single watermark tracks the earliest start time of the next unit:
//! each unit starts at `max(watermark, now)` and advances the watermark by its
//! duration. A server barge-in stops everything and drops the watermark so
//! the next reply starts immediately.

use std::collections::BTreeMap;
use std::rc::Rc;

use super::codec::{self, AudioChunk, PlaybackUnit, Resampling};
use super::{AudioClock, PLAYBACK_SAMPLE_RATE, PlaybackSink, VoiceId};
use crate::Result;

/// Where a unit landed on the playback timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    /// Sink handle
    pub id: VoiceId,
    /// Start time in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

impl ScheduledUnit {
    /// End time in seconds
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules decoded chunks on a playback sink without gaps or overlaps
pub struct PlaybackScheduler {
    clock: Rc<dyn AudioClock>,
    sink: Box<dyn PlaybackSink>,
    resampling: Resampling,
    watermark: f64,
    active: BTreeMap<VoiceId, ScheduledUnit>,
    anchor: Option<f64>,
    scheduled_total: u64,
}

impl PlaybackScheduler {
    /// Create a scheduler anchored at the clock's current time
    pub fn new(clock: Rc<dyn AudioClock>, sink: Box<dyn PlaybackSink>) -> Self {
        let watermark = clock.now();
        Self {
            clock,
            sink,
            resampling: Resampling::default(),
            watermark,
            active: BTreeMap::new(),
            anchor: None,
            scheduled_total: 0,
        }
    }

    /// Use a different resampling strategy for chunks not at the playback rate
    #[must_use]
    pub const fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    /// Decode a chunk and schedule it right after whatever is already queued
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Decode`] for a malformed chunk, or the sink's
    /// error if it rejects the buffer. Neither changes the watermark.
    pub fn enqueue(&mut self, chunk: &AudioChunk) -> Result<ScheduledUnit> {
        let unit = codec::decode_with(chunk, PLAYBACK_SAMPLE_RATE, 1, self.resampling)?;
        self.schedule_unit(&unit)
    }

    /// Schedule an already-decoded unit after whatever is queued
    ///
    /// # Errors
    ///
    /// Returns the sink's error if it rejects the buffer
    pub fn schedule_unit(&mut self, unit: &PlaybackUnit) -> Result<ScheduledUnit> {
        let now = self.clock.now();
        let start = self.watermark.max(now);
        let duration = unit.duration();

        let id = self.sink.schedule(start, unit)?;
        self.watermark = start + duration;

        let scheduled = ScheduledUnit {
            id,
            start,
            duration,
        };
        self.active.insert(id, scheduled);
        self.anchor.get_or_insert(start);
        self.scheduled_total += 1;

        tracing::trace!(
            voice = id.0,
            start,
            duration,
            watermark = self.watermark,
            active = self.active.len(),
            "unit scheduled"
        );

        Ok(scheduled)
    }

    /// Play a unit immediately outside the speech timeline
    ///
    /// Used for UI sounds: the watermark and active set are untouched, so
    /// these are never cancelled by a barge-in.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if it rejects the buffer
    pub fn cue(&mut self, unit: &PlaybackUnit) -> Result<VoiceId> {
        self.sink.schedule(self.clock.now(), unit)
    }

    /// Natural completion of a unit
    ///
    /// Unknown or already-removed ids are ignored.
    pub fn on_ended(&mut self, id: VoiceId) {
        if self.active.remove(&id).is_some() {
            tracing::trace!(voice = id.0, active = self.active.len(), "unit ended");
        }
    }

    /// Retire units whose end time has passed
    ///
    /// For sinks that do not report completion.
    pub fn reap(&mut self) {
        let now = self.clock.now();
        self.active.retain(|_, unit| unit.end() > now);
    }

    /// Stop everything immediately and drop the watermark
    ///
    /// Nothing already scheduled is allowed to drain.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.sink.stop(id);
        }
        self.watermark = 0.0;

        if stopped > 0 {
            tracing::debug!(stopped, "playback interrupted");
        }
    }

    /// Interrupt and discard all session-scoped timing state
    pub fn reset(&mut self) {
        self.interrupt();
        self.watermark = self.clock.now();
        self.anchor = None;
        self.scheduled_total = 0;
        tracing::debug!(watermark = self.watermark, "scheduler reset");
    }

    /// Earliest start time of the next unit
    #[must_use]
    pub const fn watermark(&self) -> f64 {
        self.watermark
    }

    /// Number of scheduled or playing units
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Whether any unit is scheduled or playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    /// Start time of the first unit since the last reset
    #[must_use]
    pub const fn anchor(&self) -> Option<f64> {
        self.anchor
    }

    /// Units scheduled since the last reset
    #[must_use]
    pub const fn scheduled_total(&self) -> u64 {
        self.scheduled_total
    }

    /// Current time on the playback clock
    #[must_use]
    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}
