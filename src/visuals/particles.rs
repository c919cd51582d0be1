//! Bass-reactive particle shell
//!
//! Particles live in a flat arena indexed by position in the slice. Each tick
//! reads, updates and writes every slot in place.

use rand::Rng;

use super::math::{Color, Vec3};

/// Inner radius of the particle shell
const SHELL_MIN_RADIUS: f32 = 4.0;

/// Shell thickness
const SHELL_DEPTH: f32 = 4.0;

/// Spring pull toward the rest position per tick
const SPRING_FACTOR: f32 = 0.02;

/// Velocity retained per tick
const DAMPING: f32 = 0.97;

/// Bass energy to outward impulse gain
const BASS_BLAST_GAIN: f32 = 15.0;

/// Impulse is only applied above this blast strength
const BASS_BLAST_THRESHOLD: f32 = 0.1;

/// Volume to flash-color gain
const FLASH_GAIN: f32 = 2.5;

/// Resting particle color
pub const BASE_COLOR: u32 = 0x004d_d0e1;

/// One point mass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub rest: Vec3,
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: Color,
}

/// Fixed-size arena of point masses
#[derive(Debug, Clone)]
pub struct ParticleField {
    particles: Vec<Particle>,
    base_color: Color,
    flash_color: Color,
}

impl ParticleField {
    /// Seed `count` particles uniformly in a spherical shell
    pub fn new<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let base_color = Color::from_hex(BASE_COLOR);
        let particles = (0..count)
            .map(|_| {
                let r = rng.gen_range(0.0..1.0f32).mul_add(SHELL_DEPTH, SHELL_MIN_RADIUS);
                let phi = rng.gen_range(-1.0..1.0f32).acos();
                let theta = rng.gen_range(0.0..std::f32::consts::TAU);
                let rest = Vec3::new(
                    r * theta.cos() * phi.sin(),
                    r * theta.sin() * phi.sin(),
                    r * phi.cos(),
                );
                Particle {
                    rest,
                    position: rest,
                    velocity: Vec3::ZERO,
                    color: base_color,
                }
            })
            .collect();

        Self {
            particles,
            base_color,
            flash_color: Color::WHITE,
        }
    }

    /// Build a field from explicit rest positions
    #[must_use]
    pub fn from_rest_positions(positions: &[Vec3]) -> Self {
        let base_color = Color::from_hex(BASE_COLOR);
        Self {
            particles: positions
                .iter()
                .map(|&rest| Particle {
                    rest,
                    position: rest,
                    velocity: Vec3::ZERO,
                    color: base_color,
                })
                .collect(),
            base_color,
            flash_color: Color::WHITE,
        }
    }

    /// Advance every particle by one tick
    ///
    /// `bass` and `volume` are summed-normalized energies in `[0, 1]`; `dt` is
    /// the clamped frame-equivalent delta.
    pub fn step<R: Rng + ?Sized>(&mut self, bass: f32, volume: f32, dt: f32, rng: &mut R) {
        let blast = bass * BASS_BLAST_GAIN;
        let mix = (volume * FLASH_GAIN).min(1.0);
        let color = self.base_color.lerp(self.flash_color, mix);

        for particle in &mut self.particles {
            let mut p = particle.position;
            let mut v = particle.velocity;

            v = v.add(particle.rest.sub(p).scale(SPRING_FACTOR));

            if blast > BASS_BLAST_THRESHOLD {
                let jitter: f32 = rng.gen_range(0.0..1.0);
                v = v.add(p.normalize().scale(blast * dt * jitter));
            }

            v = v.scale(DAMPING);
            p = p.add(v.scale(dt));

            particle.position = p;
            particle.velocity = v;
            particle.color = color;
        }
    }

    /// All particles
    #[must_use]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Number of particles
    #[must_use]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// Whether the field is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}
