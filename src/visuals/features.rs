//! Band-energy features from byte spectra

use serde::{Deserialize, Serialize};

/// Bins averaged for bass energy
pub const BASS_BINS: std::ops::Range<usize> = 0..4;

/// Bins averaged for mid energy
pub const MID_BINS: std::ops::Range<usize> = 4..11;

/// Bins averaged for high energy
pub const HIGH_BINS: std::ops::Range<usize> = 11..16;

/// Per-stream summary of band energies, each in `[0, 255]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub bass: f32,
    pub mid: f32,
    pub high: f32,
    pub volume: f32,
}

impl FeatureFrame {
    /// Average the fixed band ranges and the whole buffer
    ///
    /// Bands that fall past the end of a short buffer average only the bins
    /// present, or read zero when none are.
    #[must_use]
    pub fn from_spectrum(data: &[u8]) -> Self {
        Self {
            bass: mean(band(data, BASS_BINS)),
            mid: mean(band(data, MID_BINS)),
            high: mean(band(data, HIGH_BINS)),
            volume: mean(data),
        }
    }

    /// The frame scaled to `[0, 1]`, ordered bass, mid, high, volume
    #[must_use]
    pub fn normalized(&self) -> [f32; 4] {
        [
            self.bass / 255.0,
            self.mid / 255.0,
            self.high / 255.0,
            self.volume / 255.0,
        ]
    }
}

/// Input and output features summed and scaled to `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SummedFeatures {
    pub bass: f32,
    pub mid: f32,
    pub high: f32,
    pub volume: f32,
}

impl SummedFeatures {
    /// Combine both streams, dividing by `255 * 2`
    #[must_use]
    pub fn combine(input: &FeatureFrame, output: &FeatureFrame) -> Self {
        const SCALE: f32 = 255.0 * 2.0;
        Self {
            bass: (input.bass + output.bass) / SCALE,
            mid: (input.mid + output.mid) / SCALE,
            high: (input.high + output.high) / SCALE,
            volume: (input.volume + output.volume) / SCALE,
        }
    }
}

fn band(data: &[u8], range: std::ops::Range<usize>) -> &[u8] {
    let end = range.end.min(data.len());
    let start = range.start.min(end);
    &data[start..end]
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[u8]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: u32 = values.iter().map(|&v| u32::from(v)).sum();
    sum as f32 / values.len() as f32
}
