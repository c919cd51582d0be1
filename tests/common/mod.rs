//! Shared test utilities

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use live_orb::audio::codec::encode_at;
use live_orb::audio::{
    AudioChunk, CaptureDevice, ManualClock, PLAYBACK_SAMPLE_RATE, PlaybackSink, PlaybackUnit,
};
use live_orb::audio::VoiceId;
use live_orb::session::{EventReceiver, MemoryTransport, event_channel};
use live_orb::{Config, Result, SessionController, SessionEvent};

/// Generate sine wave audio samples
pub fn generate_sine_samples(
    frequency: f32,
    sample_rate: u32,
    duration_secs: f32,
    amplitude: f32,
) -> Vec<f32> {
    let num_samples = (sample_rate as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// A speech chunk of `millis` milliseconds at the playback rate
pub fn speech_chunk(millis: u32) -> AudioChunk {
    let samples =
        generate_sine_samples(300.0, PLAYBACK_SAMPLE_RATE, millis as f32 / 1000.0, 0.4);
    encode_at(&samples, PLAYBACK_SAMPLE_RATE)
}

/// What a [`RecordingSink`] saw
#[derive(Debug, Default)]
pub struct SinkLog {
    /// `(id, start, duration)` per scheduled buffer
    pub scheduled: Vec<(VoiceId, f64, f64)>,
    pub stopped: Vec<VoiceId>,
}

/// Playback sink that records every call
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Rc<RefCell<SinkLog>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> std::cell::Ref<'_, SinkLog> {
        self.log.borrow()
    }

    /// Start times in scheduling order
    pub fn starts(&self) -> Vec<f64> {
        self.log.borrow().scheduled.iter().map(|s| s.1).collect()
    }
}

impl PlaybackSink for RecordingSink {
    fn schedule(&mut self, start: f64, unit: &PlaybackUnit) -> Result<VoiceId> {
        let mut log = self.log.borrow_mut();
        let id = VoiceId(log.scheduled.len() as u64 + 1);
        log.scheduled.push((id, start, unit.duration()));
        Ok(id)
    }

    fn stop(&mut self, id: VoiceId) {
        self.log.borrow_mut().stopped.push(id);
    }
}

/// Microphone stand-in
#[derive(Clone, Default)]
pub struct FakeMic {
    pub capturing: Rc<Cell<bool>>,
    pub starts: Rc<Cell<u32>>,
}

impl CaptureDevice for FakeMic {
    fn start(&mut self) -> Result<()> {
        self.capturing.set(true);
        self.starts.set(self.starts.get() + 1);
        Ok(())
    }

    fn stop(&mut self) {
        self.capturing.set(false);
    }

    fn is_capturing(&self) -> bool {
        self.capturing.get()
    }
}

/// A controller wired to in-memory doubles
pub struct Session {
    pub controller: SessionController,
    pub transport: MemoryTransport,
    pub mic: FakeMic,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    pub rx: EventReceiver,
}

impl Session {
    /// Build a session with UI sounds off
    pub fn new() -> Self {
        let mut config = Config::default();
        config.audio.ui_sounds = false;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Self {
        let (tx, rx) = event_channel();
        let transport = MemoryTransport::new();
        let mic = FakeMic::default();
        let clock = ManualClock::new();
        let sink = RecordingSink::new();
        let controller = SessionController::new(
            config,
            Box::new(transport.clone()),
            Box::new(mic.clone()),
            Rc::new(clock.clone()),
            Box::new(sink.clone()),
            tx,
        );
        Self {
            controller,
            transport,
            mic,
            clock,
            sink,
            rx,
        }
    }

    /// Feed every queued event to the controller
    pub fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.controller.handle(event);
        }
    }

    /// Connect and have the transport report open
    pub fn open(&mut self) {
        self.controller.connect().expect("connect");
        assert!(self.transport.inject(SessionEvent::Opened));
        self.drain();
    }

    /// Deliver a server message on the current connection
    pub fn receive(&mut self, message: live_orb::session::ServerMessage) {
        assert!(
            self.transport
                .inject(|id| SessionEvent::Message(id, message))
        );
        self.drain();
    }
}
