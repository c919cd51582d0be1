//! Short synthesized UI sounds

use crate::audio::PlaybackUnit;

/// Gain floor used at both ends of an envelope to avoid clicks
const GAIN_FLOOR: f32 = 0.0001;

/// Linear attack time in seconds
const ATTACK: f32 = 0.01;

/// Which UI sound to play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Earcon {
    /// Falling triangle blip on button presses
    Click,
    /// Two-note rising chime after a text message goes out
    Sent,
}

/// Pre-rendered earcons at one sample rate
#[derive(Debug, Clone)]
pub struct Earcons {
    click: PlaybackUnit,
    sent: PlaybackUnit,
}

impl Earcons {
    /// Render both sounds at `sample_rate`
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            click: synthesize(Earcon::Click, sample_rate),
            sent: synthesize(Earcon::Sent, sample_rate),
        }
    }

    /// Buffer for `earcon`
    #[must_use]
    pub const fn get(&self, earcon: Earcon) -> &PlaybackUnit {
        match earcon {
            Earcon::Click => &self.click,
            Earcon::Sent => &self.sent,
        }
    }
}

/// Render an earcon as a mono buffer
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn synthesize(earcon: Earcon, sample_rate: u32) -> PlaybackUnit {
    let rate = sample_rate as f32;
    let (length, peak, release_end) = match earcon {
        Earcon::Click => (0.1, 0.08, 0.1),
        Earcon::Sent => (0.15, 0.06, 0.2),
    };
    let frames = (length * rate).round() as usize;

    let mut phase = 0.0f32;
    let samples = (0..frames)
        .map(|i| {
            let t = i as f32 / rate;
            let (freq, wave) = match earcon {
                // 880 Hz falling exponentially to 440 Hz over the sound
                Earcon::Click => (880.0 * 0.5f32.powf(t / length), triangle(phase)),
                Earcon::Sent if t < 0.05 => (600.0, sine(phase)),
                Earcon::Sent => (900.0, sine(phase)),
            };
            let sample = wave * envelope(t, peak, release_end);
            phase = (phase + freq / rate).fract();
            sample
        })
        .collect();

    PlaybackUnit::mono(samples, sample_rate)
}

/// Linear attack to `peak`, then exponential decay to the floor at `release_end`
fn envelope(t: f32, peak: f32, release_end: f32) -> f32 {
    if t < ATTACK {
        (peak - GAIN_FLOOR).mul_add(t / ATTACK, GAIN_FLOOR)
    } else {
        peak * (GAIN_FLOOR / peak).powf((t - ATTACK) / (release_end - ATTACK))
    }
}

fn sine(phase: f32) -> f32 {
    (phase * std::f32::consts::TAU).sin()
}

fn triangle(phase: f32) -> f32 {
    4.0f32.mul_add((phase - 0.5).abs(), -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(unit: &PlaybackUnit) -> f32 {
        unit.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_lengths() {
        let earcons = Earcons::new(24_000);
        assert_eq!(earcons.get(Earcon::Click).frames(), 2400);
        assert_eq!(earcons.get(Earcon::Sent).frames(), 3600);
        assert!((earcons.get(Earcon::Sent).duration() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_quiet_and_bounded() {
        let click = synthesize(Earcon::Click, 48_000);
        let sent = synthesize(Earcon::Sent, 48_000);
        assert!(peak(&click) <= 0.08 + 1e-6);
        assert!(peak(&click) > 0.04);
        assert!(peak(&sent) <= 0.06 + 1e-6);
        assert!(click.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_envelope_shape() {
        assert!((envelope(0.0, 0.08, 0.1) - GAIN_FLOOR).abs() < 1e-7);
        assert!((envelope(ATTACK, 0.08, 0.1) - 0.08).abs() < 1e-6);
        assert!((envelope(0.1, 0.08, 0.1) - GAIN_FLOOR).abs() < 1e-6);
        assert!(envelope(0.05, 0.06, 0.2) < 0.06);
    }

    #[test]
    fn test_waveforms() {
        assert!((triangle(0.0) - 1.0).abs() < 1e-6);
        assert!((triangle(0.5) + 1.0).abs() < 1e-6);
        assert!(sine(0.25) > 0.999);
    }
}
