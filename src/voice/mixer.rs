//! Sample-accurate voice mixer
//!
//! The mixer is the playback timeline: its clock is the number of frames it
//! has rendered. Voices are placed at absolute start frames and summed into
//! each output block. The device callback and the event loop share it
//! through a [`MixerHandle`].

use std::sync::{Arc, Mutex};

use crate::audio::codec::resample_linear;
use crate::audio::{AudioClock, PlaybackSink, PlaybackUnit, SpectrumTap, VoiceId};
use crate::session::{EventSender, SessionEvent};
use crate::{Error, Result};

struct Voice {
    id: VoiceId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled mono voices into an interleaved output
pub struct Mixer {
    sample_rate: u32,
    channels: usize,
    frame: u64,
    voices: Vec<Voice>,
    next_id: u64,
    ended: Vec<VoiceId>,
    mono: Vec<f32>,
}

impl Mixer {
    /// Mixer producing `channels` interleaved channels at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: usize::from(channels.max(1)),
            frame: 0,
            voices: Vec::new(),
            next_id: 0,
            ended: Vec::new(),
            mono: Vec::new(),
        }
    }

    /// Output sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds rendered so far
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn now(&self) -> f64 {
        self.frame as f64 / f64::from(self.sample_rate)
    }

    /// Place `unit` at `start` seconds; a start in the past plays immediately
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn add(&mut self, start: f64, unit: &PlaybackUnit) -> VoiceId {
        let channels = usize::from(unit.channels.max(1));
        let mono: Vec<f32> = if channels == 1 {
            unit.samples.clone()
        } else {
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / channels as f32;
            unit.samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() * scale)
                .collect()
        };
        let samples = if unit.sample_rate == self.sample_rate {
            mono
        } else {
            resample_linear(&mono, 1, unit.sample_rate, self.sample_rate)
        };

        let start_frame = (start.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        self.next_id += 1;
        let id = VoiceId(self.next_id);
        self.voices.push(Voice {
            id,
            start_frame: start_frame.max(self.frame),
            samples,
        });
        id
    }

    /// Drop a voice; unknown ids are ignored
    pub fn stop(&mut self, id: VoiceId) {
        self.voices.retain(|v| v.id != id);
    }

    /// Number of voices not yet finished
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Fill `out` with the next block and advance the clock
    ///
    /// Returns the mono mix of the block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, out: &mut [f32]) -> &[f32] {
        let frames = out.len() / self.channels;
        let block_start = self.frame;
        let block_end = block_start + frames as u64;

        self.mono.clear();
        self.mono.resize(frames, 0.0);

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for f in from..to {
                self.mono[(f - block_start) as usize] += voice.samples[(f - voice.start_frame) as usize];
            }
        }

        for (frame, &sample) in out.chunks_exact_mut(self.channels).zip(&self.mono) {
            frame.fill(sample.clamp(-1.0, 1.0));
        }

        self.frame = block_end;
        let ended = &mut self.ended;
        self.voices.retain(|v| {
            let done = v.end_frame() <= block_end;
            if done {
                ended.push(v.id);
            }
            !done
        });

        &self.mono
    }

    /// Voices that finished since the last call
    pub fn take_ended(&mut self) -> Vec<VoiceId> {
        std::mem::take(&mut self.ended)
    }
}

/// Shared access to a [`Mixer`]
///
/// Acts as both the playback sink and the audio clock for the scheduler.
/// Rendering feeds the output spectrum tap and reports finished voices.
#[derive(Clone)]
pub struct MixerHandle {
    mixer: Arc<Mutex<Mixer>>,
    tap: SpectrumTap,
    events: Option<EventSender>,
}

impl MixerHandle {
    /// Share `mixer`, feeding `tap` with everything it renders
    #[must_use]
    pub fn new(mixer: Mixer, tap: SpectrumTap) -> Self {
        Self {
            mixer: Arc::new(Mutex::new(mixer)),
            tap,
            events: None,
        }
    }

    /// Report natural voice completion on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Render the next output block
    ///
    /// Writes silence if the mixer lock is poisoned.
    pub fn render(&self, out: &mut [f32]) {
        let Ok(mut mixer) = self.mixer.lock() else {
            out.fill(0.0);
            return;
        };

        let mono = mixer.render(out);
        self.tap.push(mono);
        let ended = mixer.take_ended();
        drop(mixer);

        if let Some(events) = &self.events {
            for id in ended {
                let _ = events.send(SessionEvent::PlaybackEnded(id));
            }
        }
    }

    /// Output sample rate
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.mixer.lock().map_or(0, |m| m.sample_rate())
    }

    /// Number of voices still scheduled or playing
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.mixer.lock().map_or(0, |m| m.voice_count())
    }
}

impl AudioClock for MixerHandle {
    fn now(&self) -> f64 {
        self.mixer.lock().map_or(0.0, |m| m.now())
    }
}

impl PlaybackSink for MixerHandle {
    fn schedule(&mut self, start: f64, unit: &PlaybackUnit) -> Result<VoiceId> {
        self.mixer
            .lock()
            .map(|mut m| m.add(start, unit))
            .map_err(|_| Error::Audio("mixer lock poisoned".to_string()))
    }

    fn stop(&mut self, id: VoiceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.stop(id);
        }
    }
}
