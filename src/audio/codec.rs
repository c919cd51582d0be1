//! PCM transport codec
//!
//! Converts float samples to base64-wrapped 16-bit little-endian PCM for the
//! wire, and decodes received chunks back into playable buffers, resampling
//! to the output rate when needed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Bytes per encoded sample
const SAMPLE_WIDTH: usize = 2;

/// Quantization scale for 16-bit PCM
const I16_SCALE: f32 = 32768.0;

/// Input chunk size for the FFT resampler
const FFT_CHUNK: usize = 1024;

/// One discrete unit of encoded audio on the wire
///
/// Immutable once produced. `data` is base64 of 16-bit LE mono PCM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Base64 payload
    pub data: String,
    /// Sample rate the payload was recorded at
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Wrap an already-encoded payload
    #[must_use]
    pub const fn new(data: String, sample_rate: u32) -> Self {
        Self { data, sample_rate }
    }

    /// Build a chunk from a payload and its MIME type
    ///
    /// A MIME type without a `rate=` parameter means the playback rate.
    #[must_use]
    pub fn from_mime(data: String, mime_type: &str) -> Self {
        let sample_rate = parse_rate(mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
        Self { data, sample_rate }
    }

    /// MIME type of the payload, e.g. `audio/pcm;rate=16000`
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// A decoded, schedulable audio buffer
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    /// Interleaved samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Sample rate of `samples`
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
}

impl PlaybackUnit {
    /// Wrap mono samples
    #[must_use]
    pub const fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of sample frames
    #[must_use]
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    /// Duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// Resampling strategy used when a chunk's rate differs from the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// Linear interpolation between neighbouring frames
    #[default]
    Linear,
    /// Band-limited FFT resampling via `rubato`
    Fft,
}

/// Encode capture samples into a transport chunk at the capture rate
#[must_use]
pub fn encode(samples: &[f32]) -> AudioChunk {
    encode_at(samples, CAPTURE_SAMPLE_RATE)
}

/// Encode samples recorded at `sample_rate`
///
/// Out-of-range samples are clamped and non-finite samples become silence.
#[must_use]
pub fn encode_at(samples: &[f32], sample_rate: u32) -> AudioChunk {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    AudioChunk::new(STANDARD.encode(bytes), sample_rate)
}

/// Decode a chunk into a playable buffer using linear resampling
///
/// # Errors
///
/// Returns [`Error::Decode`] if the payload is not valid base64, its length is
/// not a whole number of samples, or the samples do not divide into
/// `channels`
pub fn decode(chunk: &AudioChunk, target_rate: u32, channels: u16) -> Result<PlaybackUnit> {
    decode_with(chunk, target_rate, channels, Resampling::Linear)
}

/// Decode a chunk with an explicit resampling strategy
///
/// # Errors
///
/// See [`decode`]; additionally returns [`Error::Audio`] if the FFT
/// resampler cannot be built for the rate pair
pub fn decode_with(
    chunk: &AudioChunk,
    target_rate: u32,
    channels: u16,
    resampling: Resampling,
) -> Result<PlaybackUnit> {
    if channels == 0 {
        return Err(Error::Decode("channel count must be at least 1".to_string()));
    }
    if chunk.sample_rate == 0 || target_rate == 0 {
        return Err(Error::Decode("sample rate must be non-zero".to_string()));
    }

    let bytes = STANDARD
        .decode(chunk.data.as_bytes())
        .map_err(|e| Error::Decode(format!("invalid base64 payload: {e}")))?;

    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(Error::Decode(format!(
            "payload length {} is not a multiple of {SAMPLE_WIDTH}",
            bytes.len()
        )));
    }

    let samples: Vec<f32> = bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / I16_SCALE)
        .collect();

    let channel_count = usize::from(channels);
    if samples.len() % channel_count != 0 {
        return Err(Error::Decode(format!(
            "{} samples do not divide into {channels} channels",
            samples.len()
        )));
    }

    let samples = if chunk.sample_rate == target_rate {
        samples
    } else {
        match resampling {
            Resampling::Linear => {
                resample_linear(&samples, channel_count, chunk.sample_rate, target_rate)
            }
            Resampling::Fft => {
                resample_fft(&samples, channel_count, chunk.sample_rate, target_rate)?
            }
        }
    };

    Ok(PlaybackUnit {
        samples,
        sample_rate: target_rate,
        channels,
    })
}

/// Extract the `rate=` parameter from a MIME type
#[must_use]
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Convert a float sample to 16-bit PCM
#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    (sample * I16_SCALE)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Frame count after resampling, rounded to the nearest frame
#[allow(clippy::cast_possible_truncation)]
fn output_frames(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    let from = u64::from(from_rate);
    let scaled = (frames as u64 * u64::from(to_rate) + from / 2) / from;
    scaled as usize
}

/// Linear-interpolation resampler over interleaved samples
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_linear(samples: &[f32], channels: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let frames = samples.len() / channels;
    if frames == 0 {
        return Vec::new();
    }

    let out_frames = output_frames(frames, from_rate, to_rate);
    let step = f64::from(from_rate) / f64::from(to_rate);
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = (pos.floor() as usize).min(frames - 1);
        let next = (idx + 1).min(frames - 1);
        let frac = (pos - idx as f64).clamp(0.0, 1.0) as f32;

        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            out.push((b - a).mul_add(frac, a));
        }
    }

    out
}

/// FFT resampler over interleaved samples using rubato
///
/// Compensates the resampler's output delay and trims to the same frame
/// count the linear path produces.
#[allow(clippy::cast_possible_truncation)]
fn resample_fft(
    samples: &[f32],
    channels: usize,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let frames = samples.len() / channels;
    let expected = output_frames(frames, from_rate, to_rate);
    if expected == 0 {
        return Ok(Vec::new());
    }

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, FFT_CHUNK, 2, channels)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let planar: Vec<Vec<f64>> = (0..channels)
        .map(|ch| {
            samples
                .iter()
                .skip(ch)
                .step_by(channels)
                .map(|&s| f64::from(s))
                .collect()
        })
        .collect();

    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f64>> = vec![Vec::new(); channels];
    let mut pos = 0;

    while output[0].len() < expected + delay {
        let block = if pos < frames {
            let needed = resampler.input_frames_next();
            let end = (pos + needed).min(frames);
            let input: Vec<&[f64]> = planar.iter().map(|c| &c[pos..end]).collect();
            let full = end - pos == needed;
            pos = end;
            if full {
                resampler.process(input.as_slice(), None)
            } else {
                resampler.process_partial(Some(input.as_slice()), None)
            }
        } else {
            resampler.process_partial::<Vec<f64>>(None, None)
        }
        .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

        for (dst, src) in output.iter_mut().zip(block) {
            dst.extend(src);
        }
    }

    let mut interleaved = Vec::with_capacity(expected * channels);
    for i in 0..expected {
        for channel in &output {
            interleaved.push(channel.get(delay + i).copied().unwrap_or(0.0) as f32);
        }
    }

    Ok(interleaved)
}
