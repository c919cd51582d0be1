//! Audio-reactive control signals
//!
//! Once per animation tick the [`Visualizer`] pulls fresh spectra from the
//! input and output analysers, reduces them to band features, maps those to
//! bounded signals and hands the result to a [`VisualSink`]. Rendering itself
//! belongs to the sink.

mod features;
mod mapper;
mod math;
mod particles;

use std::io::Write;

use rand::Rng;
use serde::Serialize;

pub use features::{BASS_BINS, FeatureFrame, HIGH_BINS, MID_BINS, SummedFeatures};
pub use mapper::{Bloom, CameraSignals, ReactiveMapper, ReactiveSignals, ShaderUniforms};
pub use math::{Color, Vec3};
pub use particles::{BASE_COLOR, Particle, ParticleField};

use crate::Result;
use crate::audio::{Analyser, SpectrumSource};

/// Default number of particles in the shell
pub const DEFAULT_PARTICLE_COUNT: usize = 5000;

/// Receives the signals produced each tick
pub trait VisualSink {
    /// Consume one tick's signals and particle state
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot accept the frame
    fn present(&mut self, signals: &ReactiveSignals, particles: &ParticleField) -> Result<()>;
}

/// Drives feature extraction and mapping for the two live streams
pub struct Visualizer<S, R> {
    input: Analyser<S>,
    output: Analyser<S>,
    mapper: ReactiveMapper,
    rng: R,
}

impl<S: SpectrumSource, R: Rng> Visualizer<S, R> {
    /// Bind to the microphone and speech-output streams
    pub fn new(input: S, output: S, particle_count: usize, mut rng: R) -> Self {
        let field = ParticleField::new(particle_count, &mut rng);
        tracing::debug!(particle_count, "visualizer initialized");
        Self {
            input: Analyser::new(input),
            output: Analyser::new(output),
            mapper: ReactiveMapper::new(field),
            rng,
        }
    }

    /// Run one animation tick
    ///
    /// Each analyser is updated exactly once.
    pub fn tick(&mut self, now_ms: f64) -> ReactiveSignals {
        self.input.update();
        self.output.update();

        let input = FeatureFrame::from_spectrum(self.input.data());
        let output = FeatureFrame::from_spectrum(self.output.data());

        self.mapper.tick(now_ms, &input, &output, &mut self.rng)
    }

    /// Run one tick and present it
    ///
    /// # Errors
    ///
    /// Returns the sink's error
    pub fn render(&mut self, now_ms: f64, sink: &mut dyn VisualSink) -> Result<ReactiveSignals> {
        let signals = self.tick(now_ms);
        sink.present(&signals, self.mapper.particles())?;
        Ok(signals)
    }

    /// Particle arena after the latest tick
    #[must_use]
    pub fn particles(&self) -> &ParticleField {
        self.mapper.particles()
    }
}

/// Logs a summary of each tick at trace level
#[derive(Debug, Default)]
pub struct LogSink;

impl VisualSink for LogSink {
    fn present(&mut self, signals: &ReactiveSignals, particles: &ParticleField) -> Result<()> {
        tracing::trace!(
            bass = signals.summed.bass,
            mid = signals.summed.mid,
            high = signals.summed.high,
            volume = signals.summed.volume,
            scale = signals.scale,
            bloom = signals.bloom.strength,
            particles = particles.len(),
            "visual tick"
        );
        Ok(())
    }
}

/// Writes one JSON object per tick
///
/// Particles are summarized rather than dumped.
pub struct JsonSink<W> {
    writer: W,
}

#[derive(Serialize)]
struct JsonFrame<'a> {
    #[serde(flatten)]
    signals: &'a ReactiveSignals,
    particle_count: usize,
    particle_mean_offset: f32,
}

impl<W: Write> JsonSink<W> {
    /// Write frames to `writer`
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> VisualSink for JsonSink<W> {
    #[allow(clippy::cast_precision_loss)]
    fn present(&mut self, signals: &ReactiveSignals, particles: &ParticleField) -> Result<()> {
        let offset_sum: f32 = particles
            .particles()
            .iter()
            .map(|p| p.position.sub(p.rest).length())
            .sum();
        let frame = JsonFrame {
            signals,
            particle_count: particles.len(),
            particle_mean_offset: if particles.is_empty() {
                0.0
            } else {
                offset_sum / particles.len() as f32
            },
        };

        serde_json::to_writer(&mut self.writer, &frame)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}
