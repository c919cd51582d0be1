//! Live Orb - real-time voice assistant client with an audio-reactive core
//!
//! This library provides the client side of a spoken conversation with a
//! remote model:
//! - Microphone capture, PCM encoding, and streaming to the remote session
//! - Gapless scheduling of returned speech, with immediate barge-in
//! - Spectrum analysis and reactive control signals for a visualization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Audio substrate (cpal)                │
//! │   CpalCapture  │  CpalPlayback / Mixer  │  Earcons   │
//! └──────┬─────────────────────▲───────────────┬────────┘
//!        │ CaptureFrame        │ schedule/stop │ SpectrumTap
//! ┌──────▼─────────────────────┴──────┐ ┌──────▼────────┐
//! │         SessionController          │ │   Visualizer  │
//! │  state machine │ PlaybackScheduler │ │ features, map │
//! └──────┬─────────────────────▲──────┘ └──────┬────────┘
//!        │ ClientMessage       │ ServerMessage  │ ReactiveSignals
//! ┌──────▼─────────────────────┴──────┐ ┌──────▼────────┐
//! │      Transport (remote model)      │ │  VisualSink   │
//! └────────────────────────────────────┘ └───────────────┘
//! ```
//!
//! The controller, scheduler and visualizer are driven from one task by
//! [`session::SessionRunner`]; device callbacks only enqueue events.

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod simulate;
pub mod visuals;
pub mod voice;

pub use audio::{AudioChunk, PlaybackScheduler, PlaybackUnit};
pub use config::Config;
pub use error::{Error, Result};
pub use session::{
    Command, ConfigChange, SessionController, SessionEvent, SessionRunner, SessionState, Status,
};
pub use visuals::{ReactiveSignals, Visualizer};
