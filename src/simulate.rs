//! Headless end-to-end run
//!
//! Drives the full pipeline without audio hardware: a synthetic microphone
//! feeds the capture path, the echo transport returns the audio as speech,
//! the scheduler places it on a [`Mixer`] timeline that is rendered block by
//! block, and both spectra drive the visualizer. Time is virtual, so a run
//! takes as long as the computation.

use std::cell::Cell;
use std::rc::Rc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::audio::{AudioClock, CAPTURE_SAMPLE_RATE, CaptureDevice, SpectrumTap};
use crate::config::Config;
use crate::session::{
    Command, EchoTransport, EventReceiver, EventSender, SessionController, SessionEvent,
    SessionState, SessionStats, event_channel,
};
use crate::visuals::{VisualSink, Visualizer};
use crate::voice::{Mixer, MixerHandle};
use crate::Result;

/// Output rate of the virtual speaker
const MIXER_RATE: u32 = 48_000;

/// Pitch of the synthetic voice
const TONE_HZ: f32 = 220.0;

/// Fraction of the run after which the microphone is switched off
const CAPTURE_SHARE: f64 = 0.75;

/// Outcome of a simulated session
#[derive(Debug, Clone, Copy)]
pub struct SimulationReport {
    pub ticks: u64,
    pub final_state: SessionState,
    pub stats: SessionStats,
    /// Playback watermark at the end of the run, in seconds
    pub watermark: f64,
    /// Seconds rendered by the mixer
    pub rendered: f64,
    pub peak_input_volume: f32,
    pub peak_output_volume: f32,
    pub peak_scale: f32,
}

/// Microphone stand-in that only tracks whether it is held
#[derive(Clone, Default)]
struct SyntheticMic {
    on: Rc<Cell<bool>>,
}

impl CaptureDevice for SyntheticMic {
    fn start(&mut self) -> Result<()> {
        self.on.set(true);
        Ok(())
    }

    fn stop(&mut self) {
        self.on.set(false);
    }

    fn is_capturing(&self) -> bool {
        self.on.get()
    }
}

/// Phase-continuous tone with a slow tremolo, cut into capture frames
struct ToneSource {
    phase: f32,
    elapsed: u64,
    carry: f64,
    pending: Vec<f32>,
}

impl ToneSource {
    const fn new() -> Self {
        Self {
            phase: 0.0,
            elapsed: 0,
            carry: 0.0,
            pending: Vec::new(),
        }
    }

    /// Produce `seconds` of audio and return any completed frames
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn advance(&mut self, seconds: f64, frame_size: usize) -> Vec<Vec<f32>> {
        let exact = seconds.mul_add(f64::from(CAPTURE_SAMPLE_RATE), self.carry);
        let count = exact.floor() as usize;
        self.carry = exact - count as f64;

        let rate = CAPTURE_SAMPLE_RATE as f32;
        for _ in 0..count {
            let t = self.elapsed as f32 / rate;
            let tremolo = (t * std::f32::consts::TAU * 0.5).sin().mul_add(0.25, 0.5);
            self.pending
                .push((self.phase * std::f32::consts::TAU).sin() * tremolo);
            self.phase = (self.phase + TONE_HZ / rate).fract();
            self.elapsed += 1;
        }

        let mut frames = Vec::new();
        while self.pending.len() >= frame_size {
            let rest = self.pending.split_off(frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

/// Run a simulated session for `seconds` of virtual time
///
/// Signals for every tick are presented to `sink`.
///
/// # Errors
///
/// Returns the sink's error, or `Error::Connection` if the echo transport
/// cannot open
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn run(config: &Config, seconds: f64, sink: &mut dyn VisualSink) -> Result<SimulationReport> {
    let (tx, mut rx) = event_channel();
    let input_tap = SpectrumTap::new();
    let output_tap = SpectrumTap::new();

    let speaker = MixerHandle::new(Mixer::new(MIXER_RATE, 1), output_tap.clone())
        .with_events(tx.clone());
    let mic = SyntheticMic::default();

    let mut controller = SessionController::new(
        config,
        Box::new(EchoTransport::new()),
        Box::new(mic.clone()),
        Rc::new(speaker.clone()),
        Box::new(speaker.clone()),
        tx.clone(),
    );

    let seed = config.visuals.seed.unwrap_or(0);
    let mut visualizer = Visualizer::new(
        input_tap.clone(),
        output_tap,
        config.visuals.particle_count,
        StdRng::seed_from_u64(seed),
    );

    let fps = f64::from(config.visuals.fps.max(1));
    let tick = 1.0 / fps;
    let ticks = (seconds.max(0.0) * fps).round() as u64;
    let capture_ticks = (ticks as f64 * CAPTURE_SHARE).round() as u64;
    let block = (f64::from(MIXER_RATE) / fps).round() as usize;
    let mut out = vec![0.0f32; block];
    let mut tone = ToneSource::new();

    controller.execute(Command::Connect)?;
    drain(&mut controller, &mut rx);
    command(&tx, Command::StartCapture);
    drain(&mut controller, &mut rx);

    tracing::info!(ticks, fps, state = %controller.state(), "simulation started");

    let mut report = SimulationReport {
        ticks,
        final_state: controller.state(),
        stats: SessionStats::default(),
        watermark: 0.0,
        rendered: 0.0,
        peak_input_volume: 0.0,
        peak_output_volume: 0.0,
        peak_scale: 0.0,
    };

    for n in 0..ticks {
        if n == capture_ticks {
            command(&tx, Command::StopCapture);
        }

        if mic.is_capturing() {
            for frame in tone.advance(tick, config.audio.capture_buffer_size) {
                input_tap.push(&frame);
                let _ = tx.send(SessionEvent::CaptureFrame(frame));
            }
        }

        drain(&mut controller, &mut rx);
        speaker.render(&mut out);
        controller.tick();

        let signals = visualizer.render(n as f64 * tick * 1000.0, sink)?;
        report.peak_input_volume = report.peak_input_volume.max(signals.input.volume);
        report.peak_output_volume = report.peak_output_volume.max(signals.output.volume);
        report.peak_scale = report.peak_scale.max(signals.scale);
    }

    drain(&mut controller, &mut rx);
    report.final_state = controller.state();
    report.stats = controller.stats();
    report.watermark = controller.scheduler().watermark();
    report.rendered = speaker.now();

    controller.shutdown();
    tracing::info!(?report, "simulation finished");
    Ok(report)
}

fn command(tx: &EventSender, command: Command) {
    let _ = tx.send(SessionEvent::Command(command));
}

fn drain(controller: &mut SessionController, rx: &mut EventReceiver) {
    while let Ok(event) = rx.try_recv() {
        controller.handle(event);
    }
}
