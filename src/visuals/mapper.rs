//! Feature-to-signal mapping
//!
//! Runs once per animation tick. Everything here is a function of the carried
//! smoothing state, the two feature frames, the tick time and the injected
//! random source.

use rand::Rng;
use serde::Serialize;

use super::features::{FeatureFrame, SummedFeatures};
use super::math::{Color, Vec3};
use super::particles::ParticleField;

/// Milliseconds per reference frame (60 fps)
const FRAME_MS: f64 = 1000.0 / 60.0;

/// Emissive color with no audio
const BASE_EMISSIVE: u32 = 0x0000_0010;

/// Per-tick blend of the emissive color toward its target
const EMISSIVE_BLEND: f32 = 0.1;

/// Combined raw volume below which the emissive target stays at base
const COLOR_VOLUME_FLOOR: f32 = 10.0;

/// Per-tick camera approach factor (scaled by `dt`)
const CAMERA_FOLLOW: f32 = 0.02;

/// Camera rest position
const CAMERA_START: Vec3 = Vec3::new(2.0, -2.0, 5.0);

/// Bloom post-process parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Bloom {
    pub strength: f32,
    pub radius: f32,
    pub threshold: f32,
}

/// Camera drift
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CameraSignals {
    /// Accumulated Euler rotation (XYZ)
    pub rotation: Vec3,
    /// Orbit distance
    pub zoom: f32,
    /// Where the camera is heading
    pub target: Vec3,
    /// Smoothed camera position
    pub position: Vec3,
}

/// Values for the sphere's vertex shader
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ShaderUniforms {
    pub time: f32,
    /// Input stream bass, mid, high, volume in `[0, 1]`
    pub input: [f32; 4],
    /// Output stream bass, mid, high, volume in `[0, 1]`
    pub output: [f32; 4],
}

/// Everything the visualization receives for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReactiveSignals {
    /// Clamped frame-equivalent delta
    pub dt: f32,
    pub input: FeatureFrame,
    pub output: FeatureFrame,
    pub summed: SummedFeatures,
    /// Sphere pulsation
    pub scale: f32,
    pub emissive_intensity: f32,
    pub emissive_color: Color,
    pub bloom: Bloom,
    pub camera: CameraSignals,
    pub shader: ShaderUniforms,
    /// Backdrop noise seed
    pub backdrop_seed: f32,
    /// Point size of the particle shell
    pub particle_size: f32,
}

/// Carries smoothing state between ticks
#[derive(Debug, Clone)]
pub struct ReactiveMapper {
    prev_time_ms: Option<f64>,
    emissive: Color,
    rotation: Vec3,
    camera: Vec3,
    shader_time: f32,
    particles: ParticleField,
}

impl ReactiveMapper {
    /// Start from rest with the given particle field
    #[must_use]
    pub fn new(particles: ParticleField) -> Self {
        Self {
            prev_time_ms: None,
            emissive: Color::from_hex(BASE_EMISSIVE),
            rotation: Vec3::ZERO,
            camera: CAMERA_START,
            shader_time: 0.0,
            particles,
        }
    }

    /// Map one tick's features to signals and advance the particle field
    #[allow(clippy::cast_possible_truncation)]
    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        now_ms: f64,
        input: &FeatureFrame,
        output: &FeatureFrame,
        rng: &mut R,
    ) -> ReactiveSignals {
        let dt = self.frame_delta(now_ms);
        let summed = SummedFeatures::combine(input, output);

        self.particles.step(summed.bass, summed.volume, dt, rng);

        let target = emissive_target(input, output);
        self.emissive = self.emissive.lerp(target, EMISSIVE_BLEND);

        self.rotation.y += dt.mul_add(0.0002, dt * 0.001 * summed.mid);
        self.rotation.x = ((now_ms * 0.0002).sin() as f32).mul_add(0.1, -0.1);

        let zoom = summed.bass.mul_add(-1.5, 5.0);
        let camera_target = Vec3::new(0.0, 0.0, zoom).rotate_xyz(self.rotation);
        self.camera = self.camera.lerp(camera_target, CAMERA_FOLLOW * dt);

        self.shader_time += dt * 0.05;

        ReactiveSignals {
            dt,
            input: *input,
            output: *output,
            summed,
            scale: summed.bass.mul_add(0.5, 1.0),
            emissive_intensity: summed.bass.mul_add(4.0, 1.0),
            emissive_color: self.emissive,
            bloom: Bloom {
                strength: summed.high.mul_add(2.5, 1.0),
                radius: summed.mid.mul_add(0.4, 0.4),
                threshold: summed.bass.mul_add(-0.6, 0.7).max(0.1),
            },
            camera: CameraSignals {
                rotation: self.rotation,
                zoom,
                target: camera_target,
                position: self.camera,
            },
            shader: ShaderUniforms {
                time: self.shader_time,
                input: input.normalized(),
                output: output.normalized(),
            },
            backdrop_seed: rng.gen_range(0.0..10_000.0),
            particle_size: summed.high.mul_add(0.1, 0.02),
        }
    }

    /// Particle arena after the latest tick
    #[must_use]
    pub fn particles(&self) -> &ParticleField {
        &self.particles
    }

    /// Elapsed time as a fraction of a reference frame, at most one frame
    #[allow(clippy::cast_possible_truncation)]
    fn frame_delta(&mut self, now_ms: f64) -> f32 {
        let dt = self
            .prev_time_ms
            .map_or(1.0, |prev| ((now_ms - prev) / FRAME_MS).clamp(0.0, 1.0));
        self.prev_time_ms = Some(now_ms);
        dt as f32
    }
}

/// Blend between output and input hues by who is louder
fn emissive_target(input: &FeatureFrame, output: &FeatureFrame) -> Color {
    let base = Color::from_hex(BASE_EMISSIVE);
    let total = input.volume + output.volume;
    if total <= COLOR_VOLUME_FLOOR {
        return base;
    }

    let input_ratio = input.volume / total;
    let input_color = Color::from_hsl(
        (input.high / 255.0).mul_add(0.2, 0.6),
        0.8,
        (input.mid / 255.0).mul_add(0.2, 0.5),
    );
    let output_color = Color::from_hsl(
        (output.high / 255.0).mul_add(-0.2, 0.8),
        0.8,
        (output.mid / 255.0).mul_add(0.2, 0.5),
    );

    base.lerp(output_color, 1.0 - input_ratio)
        .lerp(input_color, input_ratio)
}
