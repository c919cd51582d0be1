//! Audio device substrate
//!
//! `cpal` adapters for microphone capture and speaker output, the mixer that
//! serves as the playback timeline, and locally synthesized UI sounds.

mod capture;
pub mod earcon;
mod mixer;
mod playback;

pub use capture::{CpalCapture, samples_to_wav};
pub use earcon::{Earcon, Earcons};
pub use mixer::{Mixer, MixerHandle};
pub use playback::CpalPlayback;
