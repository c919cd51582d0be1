//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::audio::{CAPTURE_SAMPLE_RATE, CaptureDevice, SpectrumTap};
use crate::session::{EventSender, SessionEvent};
use crate::{Error, Result};

/// Captures the default input device in fixed-size frames
///
/// The device is acquired on [`CaptureDevice::start`] and released on
/// [`CaptureDevice::stop`]. Each frame of `frame_size` mono samples at
/// [`CAPTURE_SAMPLE_RATE`] is pushed into the input spectrum tap and sent to
/// the event loop as [`SessionEvent::CaptureFrame`].
pub struct CpalCapture {
    frame_size: usize,
    events: EventSender,
    tap: SpectrumTap,
    stream: Option<Stream>,
}

impl CpalCapture {
    /// Create an idle capture that will emit `frame_size`-sample frames
    #[must_use]
    pub fn new(frame_size: usize, events: EventSender, tap: SpectrumTap) -> Self {
        Self {
            frame_size: frame_size.max(1),
            events,
            tap,
            stream: None,
        }
    }

    fn open_stream(&self) -> Result<Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let config = input_config(&device)?;
        let channels = usize::from(config.channels);
        let device_rate = config.sample_rate.0;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = device_rate,
            channels,
            frame_size = self.frame_size,
            "audio capture initialized"
        );

        let mut framer = Framer::new(self.frame_size, channels, device_rate);
        let events = self.events.clone();
        let tap = self.tap.clone();

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    framer.push(data, |frame| {
                        tap.push(&frame);
                        let _ = events.send(SessionEvent::CaptureFrame(frame));
                    });
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;
        Ok(stream)
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        self.stream = Some(self.open_stream()?);
        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

/// Prefer a native 16 kHz mono config, else the device default
fn input_config(device: &cpal::Device) -> Result<StreamConfig> {
    let native = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
        });

    if let Some(supported) = native {
        return Ok(supported
            .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
            .config());
    }

    device
        .default_input_config()
        .map(|c| c.config())
        .map_err(|e| Error::Device(e.to_string()))
}

/// Converts device blocks into fixed-size mono frames at the capture rate
struct Framer {
    frame_size: usize,
    channels: usize,
    resampler: Option<StreamResampler>,
    pending: Vec<f32>,
}

impl Framer {
    fn new(frame_size: usize, channels: usize, device_rate: u32) -> Self {
        Self {
            frame_size,
            channels: channels.max(1),
            resampler: (device_rate != CAPTURE_SAMPLE_RATE)
                .then(|| StreamResampler::new(device_rate, CAPTURE_SAMPLE_RATE)),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, data: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        let scale = 1.0 / self.channels as f32;
        let mono: Vec<f32> = data
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect();

        match &mut self.resampler {
            Some(resampler) => resampler.process(&mono, &mut self.pending),
            None => self.pending.extend_from_slice(&mono),
        }

        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            emit(std::mem::replace(&mut self.pending, rest));
        }
    }
}

/// Linear interpolation over an unbounded mono stream
///
/// The read position and the last input sample carry over between blocks, so
/// block boundaries neither repeat nor skip samples and the output rate does
/// not drift.
struct StreamResampler {
    step: f64,
    /// Read position, relative to `previous` when it is set
    position: f64,
    previous: Option<f32>,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: f64::from(from_rate) / f64::from(to_rate.max(1)),
            position: 0.0,
            previous: None,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let Some(&last) = input.last() else {
            return;
        };
        let offset = usize::from(self.previous.is_some());
        let len = input.len() + offset;
        let previous = self.previous.unwrap_or(input[0]);
        let sample = |i: usize| i.checked_sub(offset).map_or(previous, |j| input[j]);

        while self.position + 1.0 < len as f64 {
            let idx = self.position.floor() as usize;
            let frac = (self.position - idx as f64) as f32;
            let (a, b) = (sample(idx), sample(idx + 1));
            out.push((b - a).mul_add(frac, a));
            self.position += self.step;
        }

        // Rebase onto the last sample, which becomes index 0 of the next block
        self.position -= (len - 1) as f64;
        self.previous = Some(last);
    }
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
