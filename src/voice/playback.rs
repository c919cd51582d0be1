//! Audio playback to speakers

use cpal::Stream;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::mixer::{Mixer, MixerHandle};
use crate::audio::{PLAYBACK_SAMPLE_RATE, SpectrumTap};
use crate::session::EventSender;
use crate::{Error, Result};

/// Continuously running output stream driven by a [`Mixer`]
///
/// The stream starts immediately and renders silence until voices are
/// scheduled. Its rendered-frame counter is the scheduler's clock.
pub struct CpalPlayback {
    handle: MixerHandle,
    _stream: Stream,
}

impl CpalPlayback {
    /// Open the default output device
    ///
    /// Rendered audio is pushed into `tap`; finished voices are reported on
    /// `events` when given.
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available or the stream cannot
    /// be started
    pub fn new(tap: SpectrumTap, events: Option<EventSender>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let config = output_config(&device)?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        let mut handle = MixerHandle::new(Mixer::new(config.sample_rate.0, config.channels), tap);
        if let Some(events) = events {
            handle = handle.with_events(events);
        }

        let render = handle.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render.render(data);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            handle,
            _stream: stream,
        })
    }

    /// Clock and sink view of the output timeline
    #[must_use]
    pub fn handle(&self) -> MixerHandle {
        self.handle.clone()
    }
}

/// Prefer the speech rate if the device supports it, else the device default
fn output_config(device: &cpal::Device) -> Result<cpal::StreamConfig> {
    let rate = cpal::SampleRate(PLAYBACK_SAMPLE_RATE);
    let native = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(supported) = native {
        return Ok(supported.with_sample_rate(rate).config());
    }

    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(e.to_string()))
}
