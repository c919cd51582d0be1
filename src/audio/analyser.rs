//! Frequency-domain snapshots of a live audio stream
//!
//! A [`SpectrumTap`] is fed samples by whoever owns the stream (capture
//! callback, playback mixer). An [`Analyser`] bound to one tap pulls a byte
//! snapshot of the energy distribution once per animation tick.

use std::f32::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex};

use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};

/// Transform window length in samples
pub const FFT_SIZE: usize = 32;

/// Number of frequency bins exposed per snapshot
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Temporal smoothing between successive snapshots
const SMOOTHING: f32 = 0.8;

/// Decibel value mapped to byte 0
const MIN_DECIBELS: f32 = -100.0;

/// Decibel value mapped to byte 255
const MAX_DECIBELS: f32 = -30.0;

/// Live frequency-snapshot query for one bound stream
pub trait SpectrumSource {
    /// Write the current energy per bin, scaled to `0..=255`, into `out`
    fn frequency_data(&self, out: &mut [u8]);
}

/// Shared sample tap computing byte spectra on demand
///
/// Cheap to clone; all clones observe the same stream.
#[derive(Clone)]
pub struct SpectrumTap {
    inner: Arc<Mutex<TapState>>,
}

struct TapState {
    ring: [f32; FFT_SIZE],
    write: usize,
    smoothed: [f32; BIN_COUNT],
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl SpectrumTap {
    /// Create a tap holding silence
    #[must_use]
    pub fn new() -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let input = plan.make_input_vec();
        let spectrum = plan.make_output_vec();
        let scratch = plan.make_scratch_vec();

        Self {
            inner: Arc::new(Mutex::new(TapState {
                ring: [0.0; FFT_SIZE],
                write: 0,
                smoothed: [0.0; BIN_COUNT],
                plan,
                input,
                spectrum,
                scratch,
            })),
        }
    }

    /// Append samples from the stream
    ///
    /// Only the most recent [`FFT_SIZE`] samples are retained.
    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut state) = self.inner.lock() {
            let start = samples.len().saturating_sub(FFT_SIZE);
            for &sample in &samples[start..] {
                let idx = state.write;
                state.ring[idx] = if sample.is_finite() { sample } else { 0.0 };
                state.write = (idx + 1) % FFT_SIZE;
            }
        }
    }
}

impl Default for SpectrumTap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpectrumTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumTap")
            .field("fft_size", &FFT_SIZE)
            .finish_non_exhaustive()
    }
}

impl SpectrumSource for SpectrumTap {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn frequency_data(&self, out: &mut [u8]) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let state = &mut *guard;

        for i in 0..FFT_SIZE {
            let sample = state.ring[(state.write + i) % FFT_SIZE];
            state.input[i] = sample * blackman(i, FFT_SIZE);
        }

        if let Err(e) =
            state
                .plan
                .process_with_scratch(&mut state.input, &mut state.spectrum, &mut state.scratch)
        {
            tracing::warn!(error = %e, "spectrum transform failed");
            return;
        }

        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (bin, value) in out.iter_mut().enumerate().take(BIN_COUNT) {
            let magnitude = state.spectrum[bin].norm() / FFT_SIZE as f32;
            let smoothed = SMOOTHING.mul_add(state.smoothed[bin], (1.0 - SMOOTHING) * magnitude);
            state.smoothed[bin] = smoothed;

            let db = if smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                MIN_DECIBELS
            };
            *value = (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Snapshot reader bound to exactly one stream
#[derive(Debug)]
pub struct Analyser<S> {
    source: S,
    data: [u8; BIN_COUNT],
}

impl<S: SpectrumSource> Analyser<S> {
    /// Bind an analyser to a stream
    pub const fn new(source: S) -> Self {
        Self {
            source,
            data: [0; BIN_COUNT],
        }
    }

    /// Pull the latest snapshot into the internal buffer
    ///
    /// Call at most once per animation tick. Skipped calls leave the previous
    /// snapshot in place.
    pub fn update(&mut self) {
        self.source.frequency_data(&mut self.data);
    }

    /// Most recent snapshot
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bound stream
    pub const fn source(&self) -> &S {
        &self.source
    }
}

#[allow(clippy::cast_precision_loss)]
fn blackman(index: usize, len: usize) -> f32 {
    let x = 2.0 * PI * index as f32 / len as f32;
    0.08f32.mul_add((2.0 * x).cos(), 0.5f32.mul_add(-x.cos(), 0.42))
}
