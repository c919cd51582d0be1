//! Live session control
//!
//! The [`SessionController`] owns the remote connection, the microphone and
//! the playback scheduler, and moves between [`SessionState`]s in response to
//! [`SessionEvent`]s. Everything runs on one thread: device callbacks and the
//! transport only enqueue events, and the runner feeds them to
//! [`SessionController::handle`] in order.
//!
//! ```text
//!            connect               Opened
//!   Idle ──────────────▶ Connecting ──────▶ Open ◀─────────┐
//!                            │                │ start       │ stop
//!           Failed / timeout │                ▼             │
//!                            │            Streaming ────────┘
//!                            ▼                │
//!                         Errored ◀───────────┤ Failed / Closed(other)
//!                                             │
//!                          Closed ◀───────────┘ Closed(1000)
//!                            │
//!                            └──▶ Errored      Failed / Closed(other)
//!
//!   reset: any state except Idle ──▶ Connecting (fresh connection)
//! ```

pub mod protocol;
pub mod runner;
pub mod transport;
pub mod websocket;

use std::fmt;
use std::rc::Rc;

use tokio::sync::mpsc;

pub use protocol::{ClientMessage, CloseFrame, NORMAL_CLOSURE, ServerMessage, SessionSetup};
pub use runner::SessionRunner;
pub use transport::{EchoTransport, MemoryTransport, Transport};
pub use websocket::WebSocketTransport;

use crate::audio::{
    AudioClock, CaptureDevice, PLAYBACK_SAMPLE_RATE, PlaybackScheduler, PlaybackSink, VoiceId,
    codec,
};
use crate::config::{self, Config, InstructionTable, SessionConfig};
use crate::voice::{Earcon, Earcons};
use crate::{Error, Result};

/// Shown when the remote channel reports an error
const CONNECTION_ERROR: &str = "A connection error occurred. Please reset the session.";

/// Shown when a connection cannot be established
const CONNECT_FAILED: &str = "Failed to connect. Please check your network and reset the session.";

/// Shown when a text message cannot be delivered
const SEND_FAILED: &str = "Failed to send message.";

/// Generation number of a connection attempt
///
/// Every connect or reset allocates a fresh id. Events tagged with an older id
/// belong to a discarded connection and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

/// Sending half of the session event queue
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiving half of the session event queue
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the session event queue
#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection has been requested
    Idle,
    /// Waiting for the connection to open
    Connecting,
    /// Connected, microphone off
    Open,
    /// Connected and sending microphone audio
    Streaming,
    /// Closed cleanly
    Closed,
    /// Closed by an error; needs a reset
    Errored,
}

impl SessionState {
    /// Whether the connection is usable
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Open | Self::Streaming)
    }

    /// Whether the connection has ended
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// A settings change requested by the user
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Voice(String),
    Language(String),
    SpeakingRate(f32),
}

/// User intent
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    StartCapture,
    StopCapture,
    ToggleCapture,
    Reset,
    SendText(String),
    Configure(ConfigChange),
    Shutdown,
}

/// Everything the controller reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened(ConnectionId),
    Message(ConnectionId, ServerMessage),
    Failed(ConnectionId, String),
    Closed(ConnectionId, CloseFrame),
    ConnectTimeout(ConnectionId),
    /// One frame of microphone audio at the capture rate
    CaptureFrame(Vec<f32>),
    /// A scheduled unit finished playing on its own
    PlaybackEnded(VoiceId),
    Command(Command),
}

/// The one-line message shown to the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub message: String,
    pub is_error: bool,
}

impl Status {
    fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: true,
        }
    }
}

/// Counters for the current process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_received: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
    pub connections: u64,
}

/// Connection state machine and audio routing
pub struct SessionController {
    state: SessionState,
    config: SessionConfig,
    instructions: InstructionTable,
    transport: Box<dyn Transport>,
    capture: Box<dyn CaptureDevice>,
    scheduler: PlaybackScheduler,
    events: EventSender,
    connection: Option<ConnectionId>,
    next_connection: u64,
    status: Status,
    earcons: Option<Earcons>,
    stats: SessionStats,
    send_failing: bool,
    shutdown: bool,
}

impl SessionController {
    /// Assemble a controller in `Idle`
    ///
    /// `events` is handed to the transport on each connect so it can report
    /// back into the same queue the runner drains.
    pub fn new(
        config: &Config,
        transport: Box<dyn Transport>,
        capture: Box<dyn CaptureDevice>,
        clock: Rc<dyn AudioClock>,
        sink: Box<dyn PlaybackSink>,
        events: EventSender,
    ) -> Self {
        let scheduler =
            PlaybackScheduler::new(clock, sink).with_resampling(config.audio.resampling);
        Self {
            state: SessionState::Idle,
            config: config.session.clone(),
            instructions: config.instructions.clone(),
            transport,
            capture,
            scheduler,
            events,
            connection: None,
            next_connection: 0,
            status: Status::default(),
            earcons: config
                .audio
                .ui_sounds
                .then(|| Earcons::new(PLAYBACK_SAMPLE_RATE)),
            stats: SessionStats::default(),
            send_failing: false,
            shutdown: false,
        }
    }

    /// Process one event
    ///
    /// Failures are surfaced through [`Self::status`]; the controller never
    /// stops on its own except for [`Command::Shutdown`].
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened(id) => self.on_opened(id),
            SessionEvent::Message(id, message) => self.on_message(id, message),
            SessionEvent::Failed(id, reason) => self.on_failed(id, &reason),
            SessionEvent::Closed(id, frame) => self.on_closed(id, &frame),
            SessionEvent::ConnectTimeout(id) => self.on_connect_timeout(id),
            SessionEvent::CaptureFrame(samples) => self.on_capture_frame(&samples),
            SessionEvent::PlaybackEnded(voice) => self.scheduler.on_ended(voice),
            SessionEvent::Command(command) => {
                if let Err(e) = self.execute(command) {
                    self.surface(&e);
                }
            }
        }
    }

    /// Run a user command
    ///
    /// # Errors
    ///
    /// Returns the command's error; it has not been surfaced yet
    pub fn execute(&mut self, command: Command) -> Result<()> {
        tracing::debug!(?command, state = %self.state, "command");
        match command {
            Command::Connect => self.connect(),
            Command::StartCapture => self.start_capture(),
            Command::StopCapture => {
                self.stop_capture();
                Ok(())
            }
            Command::ToggleCapture => self.toggle_capture(),
            Command::Reset => self.reset(),
            Command::SendText(text) => self.send_text(&text),
            Command::Configure(change) => self.configure(change),
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Open the first connection
    ///
    /// Only acts from `Idle`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the transport cannot start connecting
    pub fn connect(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            tracing::debug!(state = %self.state, "connect ignored");
            return Ok(());
        }
        self.open_connection()
    }

    /// Acquire the microphone and begin streaming
    ///
    /// Only acts from `Open`. On device failure the session stays `Open`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the microphone cannot be acquired
    pub fn start_capture(&mut self) -> Result<()> {
        self.play(Earcon::Click);
        match self.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Open => {}
            state => {
                tracing::debug!(%state, "start capture ignored");
                return Ok(());
            }
        }

        self.set_status(Status::info("Requesting microphone access..."));
        if let Err(e) = self.capture.start() {
            self.capture.stop();
            return Err(match e {
                Error::Device(_) => e,
                other => Error::Device(other.to_string()),
            });
        }

        self.state = SessionState::Streaming;
        self.set_status(Status::info("🔴 Recording..."));
        tracing::info!("capture started");
        Ok(())
    }

    /// Release the microphone and return to `Open`
    pub fn stop_capture(&mut self) {
        self.play(Earcon::Click);
        if self.state != SessionState::Streaming {
            return;
        }

        self.capture.stop();
        self.state = SessionState::Open;
        self.set_status(Status::info("Recording stopped."));
        tracing::info!("capture stopped");
    }

    /// Start or stop capture depending on the current state
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if starting fails
    pub fn toggle_capture(&mut self) -> Result<()> {
        if self.state == SessionState::Streaming {
            self.stop_capture();
            Ok(())
        } else {
            self.start_capture()
        }
    }

    /// Tear down the current connection and open a fresh one
    ///
    /// Capture is released and queued speech is discarded before the new
    /// connection is requested. From `Idle` this is a plain connect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the new connection cannot be started
    pub fn reset(&mut self) -> Result<()> {
        self.play(Earcon::Click);
        if self.state == SessionState::Idle {
            return self.open_connection();
        }

        self.capture.stop();
        if self.connection.take().is_some() {
            self.transport.close(CloseFrame::normal());
        }
        self.scheduler.reset();

        self.open_connection()?;
        self.set_status(Status::info("Session cleared."));
        Ok(())
    }

    /// Send a typed message
    ///
    /// Whitespace-only input is ignored, as is input while not connected.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transmit` if the message cannot be sent
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() || !self.state.is_connected() {
            return Ok(());
        }

        self.play(Earcon::Click);
        self.transport
            .send(ClientMessage::Text(text.to_string()))
            .map_err(|e| {
                tracing::warn!(error = %e, "text send failed");
                Error::Transmit(SEND_FAILED.to_string())
            })?;

        self.clear_error();
        self.play(Earcon::Sent);
        Ok(())
    }

    /// Apply a settings change
    ///
    /// Rejected while streaming. Otherwise applied and, unless idle, the
    /// session is reset so the change reaches the remote model.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid value or while streaming
    pub fn configure(&mut self, change: ConfigChange) -> Result<()> {
        if self.state == SessionState::Streaming {
            return Err(Error::Config(
                "stop recording before changing settings".to_string(),
            ));
        }

        match change {
            ConfigChange::Voice(voice) => {
                config::validate_voice(&voice)?;
                self.config.voice = voice;
            }
            ConfigChange::Language(language) => {
                config::validate_language(&language)?;
                self.config.language = language;
            }
            ConfigChange::SpeakingRate(rate) => {
                config::validate_speaking_rate(rate)?;
                self.config.speaking_rate = rate;
            }
        }
        tracing::info!(
            voice = %self.config.voice,
            language = %self.config.language,
            speaking_rate = self.config.speaking_rate,
            "settings changed"
        );

        if self.state == SessionState::Idle {
            Ok(())
        } else {
            self.reset()
        }
    }

    /// Stop playback now and drop the playback watermark
    ///
    /// Honoured only while connected.
    pub fn interrupt(&mut self) {
        if self.state.is_connected() {
            self.scheduler.interrupt();
            self.stats.interruptions += 1;
        }
    }

    /// Release everything and mark the controller finished
    pub fn shutdown(&mut self) {
        self.capture.stop();
        self.scheduler.interrupt();
        if self.connection.take().is_some() {
            self.transport.close(CloseFrame::normal());
        }
        if !self.state.is_terminal() && self.state != SessionState::Idle {
            self.state = SessionState::Closed;
        }
        self.shutdown = true;
        tracing::info!(stats = ?self.stats, "session shut down");
    }

    /// Periodic housekeeping from the runner's animation tick
    pub fn tick(&mut self) {
        self.scheduler.reap();
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn status(&self) -> &Status {
        &self.status
    }

    /// Id of the current connection attempt
    #[must_use]
    pub const fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether [`Command::Shutdown`] has been processed
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    fn open_connection(&mut self) -> Result<()> {
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        self.connection = Some(id);
        self.state = SessionState::Connecting;
        self.send_failing = false;
        self.stats.connections += 1;

        let setup = SessionSetup::from_config(&self.config, &self.instructions);
        tracing::info!(connection = id.0, model = %setup.model, voice = %setup.voice, language = %setup.language, "connecting");

        if let Err(e) = self.transport.open(&setup, id, self.events.clone()) {
            tracing::error!(connection = id.0, error = %e, "connect failed");
            self.enter_terminal(SessionState::Errored);
            return Err(Error::Connection(CONNECT_FAILED.to_string()));
        }
        Ok(())
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        if self.connection == Some(id) {
            true
        } else {
            tracing::trace!(connection = id.0, current = ?self.connection, "stale event ignored");
            false
        }
    }

    fn on_opened(&mut self, id: ConnectionId) {
        if !self.is_current(id) || self.state != SessionState::Connecting {
            return;
        }
        self.state = SessionState::Open;
        self.set_status(Status::info("Opened"));
        tracing::info!(connection = id.0, "connection opened");
    }

    fn on_message(&mut self, id: ConnectionId, message: ServerMessage) {
        if !self.is_current(id) || !self.state.is_connected() {
            return;
        }

        match message {
            ServerMessage::Audio(chunk) => {
                self.stats.chunks_received += 1;
                if let Err(e) = self.scheduler.enqueue(&chunk) {
                    self.stats.chunks_rejected += 1;
                    tracing::warn!(error = %e, "dropped audio chunk");
                }
            }
            ServerMessage::Interrupted => self.interrupt(),
            ServerMessage::TurnComplete => tracing::debug!("turn complete"),
            ServerMessage::SetupComplete => tracing::debug!("setup complete"),
            ServerMessage::Ignored => {}
        }
    }

    fn on_failed(&mut self, id: ConnectionId, reason: &str) {
        if !self.is_current(id) || self.state == SessionState::Errored {
            return;
        }
        tracing::error!(connection = id.0, reason, "connection error");
        self.enter_terminal(SessionState::Errored);
        self.set_status(Status::error(CONNECTION_ERROR));
    }

    fn on_closed(&mut self, id: ConnectionId, frame: &CloseFrame) {
        // A closed session can still turn into an error, never the reverse
        let settled = match self.state {
            SessionState::Errored => true,
            SessionState::Closed => frame.is_normal(),
            _ => false,
        };
        if !self.is_current(id) || settled {
            return;
        }

        if frame.is_normal() {
            self.enter_terminal(SessionState::Closed);
            self.set_status(Status::info("Connection closed."));
        } else {
            let reason = if frame.reason.is_empty() {
                "Unknown reason"
            } else {
                frame.reason.as_str()
            };
            self.enter_terminal(SessionState::Errored);
            self.set_status(Status::error(format!(
                "Connection closed unexpectedly: {reason} (code: {})",
                frame.code
            )));
        }
        tracing::info!(connection = id.0, code = frame.code, state = %self.state, "connection closed");
    }

    fn on_connect_timeout(&mut self, id: ConnectionId) {
        if !self.is_current(id) || self.state != SessionState::Connecting {
            return;
        }
        tracing::warn!(connection = id.0, "connect timed out");
        if self.connection.take().is_some() {
            self.transport.close(CloseFrame::normal());
        }
        self.enter_terminal(SessionState::Errored);
        self.set_status(Status::error(CONNECT_FAILED));
    }

    fn on_capture_frame(&mut self, samples: &[f32]) {
        if self.state != SessionState::Streaming {
            self.stats.frames_dropped += 1;
            return;
        }

        let chunk = codec::encode(samples);
        match self.transport.send(ClientMessage::Audio(chunk)) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                if self.send_failing {
                    tracing::info!(
                        dropped = self.stats.frames_dropped,
                        "capture frames flowing again"
                    );
                    self.send_failing = false;
                }
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                // Frames arrive at device rate; report only the first of a run
                if !self.send_failing {
                    self.send_failing = true;
                    self.surface(&e);
                }
            }
        }
    }

    fn enter_terminal(&mut self, state: SessionState) {
        self.capture.stop();
        self.state = state;
    }

    fn play(&mut self, earcon: Earcon) {
        let Some(earcons) = &self.earcons else {
            return;
        };
        if let Err(e) = self.scheduler.cue(earcons.get(earcon)) {
            tracing::debug!(error = %e, ?earcon, "earcon not played");
        }
    }

    fn surface(&mut self, error: &Error) {
        if error.is_fatal() {
            tracing::error!(error = %error, state = %self.state, "session error");
        } else {
            tracing::warn!(error = %error, state = %self.state, "session error");
        }
        self.set_status(Status::error(error.user_message()));
    }

    fn set_status(&mut self, status: Status) {
        if status != self.status {
            tracing::info!(message = %status.message, is_error = status.is_error, "status");
        }
        self.status = status;
    }

    fn clear_error(&mut self) {
        if self.status.is_error {
            self.status = Status::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::audio::{ManualClock, NullSink};

    #[derive(Clone, Default)]
    struct FakeMic {
        capturing: Rc<Cell<bool>>,
        deny: Rc<Cell<bool>>,
    }

    impl CaptureDevice for FakeMic {
        fn start(&mut self) -> Result<()> {
            if self.deny.get() {
                return Err(Error::Device("permission denied".to_string()));
            }
            self.capturing.set(true);
            Ok(())
        }

        fn stop(&mut self) {
            self.capturing.set(false);
        }

        fn is_capturing(&self) -> bool {
            self.capturing.get()
        }
    }

    struct Harness {
        controller: SessionController,
        transport: MemoryTransport,
        mic: FakeMic,
        rx: EventReceiver,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = event_channel();
            let transport = MemoryTransport::new();
            let mic = FakeMic::default();
            let mut config = Config::default();
            config.audio.ui_sounds = false;
            let controller = SessionController::new(
                &config,
                Box::new(transport.clone()),
                Box::new(mic.clone()),
                Rc::new(ManualClock::new()),
                Box::new(NullSink::default()),
                tx,
            );
            Self {
                controller,
                transport,
                mic,
                rx,
            }
        }

        fn drain(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                self.controller.handle(event);
            }
        }

        fn open(&mut self) {
            self.controller.connect().unwrap();
            self.transport.inject(SessionEvent::Opened);
            self.drain();
            assert_eq!(self.controller.state(), SessionState::Open);
        }
    }

    #[test]
    fn test_connect_then_open() {
        let mut h = Harness::new();
        h.controller.connect().unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        assert_eq!(h.transport.log().opened, vec![ConnectionId(1)]);

        h.transport.inject(SessionEvent::Opened);
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Open);
        assert_eq!(h.controller.status().message, "Opened");
    }

    #[test]
    fn test_connect_failure_is_errored() {
        let mut h = Harness::new();
        h.transport.set_fail_open(true);
        let err = h.controller.connect().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(h.controller.state(), SessionState::Errored);
        assert!(err.user_message().starts_with("Failed to connect"));
    }

    #[test]
    fn test_capture_toggle() {
        let mut h = Harness::new();
        h.open();

        h.controller.toggle_capture().unwrap();
        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert!(h.mic.capturing.get());

        h.controller.toggle_capture().unwrap();
        assert_eq!(h.controller.state(), SessionState::Open);
        assert!(!h.mic.capturing.get());
        assert_eq!(h.controller.status().message, "Recording stopped.");
    }

    #[test]
    fn test_denied_microphone_stays_open() {
        let mut h = Harness::new();
        h.open();
        h.mic.deny.set(true);

        h.controller.handle(SessionEvent::Command(Command::StartCapture));
        assert_eq!(h.controller.state(), SessionState::Open);
        assert!(h.controller.status().is_error);
        assert!(h.controller.status().message.starts_with("Microphone error:"));
        assert!(!h.mic.capturing.get());
    }

    #[test]
    fn test_frames_sent_only_while_streaming() {
        let mut h = Harness::new();
        h.open();

        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        assert!(h.transport.sent_payloads().is_empty());

        h.controller.start_capture().unwrap();
        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        let sent = h.transport.sent_payloads();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ClientMessage::Audio(c) if c.sample_rate == 16_000));
        assert_eq!(h.controller.stats().frames_dropped, 1);
    }

    #[test]
    fn test_send_failure_keeps_streaming() {
        let mut h = Harness::new();
        h.open();
        h.controller.start_capture().unwrap();
        h.transport.set_fail_send(true);

        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert!(h.controller.status().is_error);
    }

    #[test]
    fn test_send_failures_surface_once_per_run() {
        let mut h = Harness::new();
        h.open();
        h.controller.start_capture().unwrap();
        h.transport.set_fail_send(true);

        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        assert!(h.controller.status().is_error);

        // Later failures in the same run are only counted
        h.controller.set_status(Status::info("Listening"));
        for _ in 0..59 {
            h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        }
        assert_eq!(h.controller.stats().frames_dropped, 60);
        assert_eq!(h.controller.status().message, "Listening");

        h.transport.set_fail_send(false);
        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        assert_eq!(h.controller.stats().frames_sent, 1);

        // A new run of failures is reported again
        h.transport.set_fail_send(true);
        h.controller.handle(SessionEvent::CaptureFrame(vec![0.1; 256]));
        assert!(h.controller.status().is_error);
        assert_eq!(h.controller.stats().frames_dropped, 61);
    }

    #[test]
    fn test_abnormal_close_releases_capture() {
        let mut h = Harness::new();
        h.open();
        h.controller.start_capture().unwrap();

        h.transport.inject(|id| {
            SessionEvent::Closed(
                id,
                CloseFrame {
                    code: 1006,
                    reason: String::new(),
                },
            )
        });
        h.drain();

        assert_eq!(h.controller.state(), SessionState::Errored);
        assert!(!h.mic.capturing.get());
        assert_eq!(
            h.controller.status().message,
            "Connection closed unexpectedly: Unknown reason (code: 1006)"
        );
    }

    #[test]
    fn test_normal_close() {
        let mut h = Harness::new();
        h.open();
        h.transport
            .inject(|id| SessionEvent::Closed(id, CloseFrame::normal()));
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(!h.controller.status().is_error);
    }

    #[test]
    fn test_stale_events_ignored_after_reset() {
        let mut h = Harness::new();
        h.open();
        let old = h.controller.connection().unwrap();

        h.controller.reset().unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        assert_eq!(h.controller.status().message, "Session cleared.");

        h.controller
            .handle(SessionEvent::Failed(old, "late".to_string()));
        h.controller.handle(SessionEvent::Opened(old));
        assert_eq!(h.controller.state(), SessionState::Connecting);

        h.transport.inject(SessionEvent::Opened);
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Open);
        assert_eq!(h.transport.log().closed.len(), 1);
    }

    #[test]
    fn test_connect_timeout() {
        let mut h = Harness::new();
        h.controller.connect().unwrap();
        let id = h.controller.connection().unwrap();

        h.controller.handle(SessionEvent::ConnectTimeout(id));
        assert_eq!(h.controller.state(), SessionState::Errored);
        assert!(h.controller.status().message.starts_with("Failed to connect"));
    }

    #[test]
    fn test_timed_out_connection_closed_once() {
        let mut h = Harness::new();
        h.controller.connect().unwrap();
        let id = h.controller.connection().unwrap();

        h.controller.handle(SessionEvent::ConnectTimeout(id));
        assert_eq!(h.controller.connection(), None);
        assert_eq!(h.transport.log().closed.len(), 1);

        h.controller.reset().unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        assert_eq!(h.transport.log().closed.len(), 1);
        assert_eq!(h.transport.log().opened, vec![ConnectionId(1), ConnectionId(2)]);
    }

    #[test]
    fn test_closed_session_can_still_error() {
        let mut h = Harness::new();
        h.open();
        h.transport
            .inject(|id| SessionEvent::Closed(id, CloseFrame::normal()));
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Closed);

        // A repeated clean close changes nothing
        h.transport
            .inject(|id| SessionEvent::Closed(id, CloseFrame::normal()));
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert!(!h.controller.status().is_error);

        h.transport
            .inject(|id| SessionEvent::Failed(id, "boom".to_string()));
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Errored);
        assert_eq!(h.controller.status().message, CONNECTION_ERROR);

        h.transport.inject(|id| {
            SessionEvent::Closed(
                id,
                CloseFrame {
                    code: 1006,
                    reason: String::new(),
                },
            )
        });
        h.drain();
        assert_eq!(h.controller.state(), SessionState::Errored);
        assert_eq!(h.controller.status().message, CONNECTION_ERROR);
    }

    #[test]
    fn test_abnormal_close_after_clean_close_is_errored() {
        let mut h = Harness::new();
        h.open();
        h.transport
            .inject(|id| SessionEvent::Closed(id, CloseFrame::normal()));
        h.transport.inject(|id| {
            SessionEvent::Closed(
                id,
                CloseFrame {
                    code: 1011,
                    reason: "internal".to_string(),
                },
            )
        });
        h.drain();

        assert_eq!(h.controller.state(), SessionState::Errored);
        assert_eq!(
            h.controller.status().message,
            "Connection closed unexpectedly: internal (code: 1011)"
        );
    }

    #[test]
    fn test_configure_rules() {
        let mut h = Harness::new();
        h.controller
            .configure(ConfigChange::Voice("Lyra".to_string()))
            .unwrap();
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(h.transport.log().opened.is_empty());

        h.open();
        h.controller
            .configure(ConfigChange::Language("fr-FR".to_string()))
            .unwrap();
        assert_eq!(h.controller.state(), SessionState::Connecting);
        match h.transport.log().sent.last() {
            Some(ClientMessage::Setup(setup)) => {
                assert_eq!(setup.voice, "Lyra");
                assert!(setup.system_instruction.contains("français"));
            }
            other => panic!("expected setup, got {other:?}"),
        }

        h.transport.inject(SessionEvent::Opened);
        h.drain();
        h.controller.start_capture().unwrap();
        let err = h
            .controller
            .configure(ConfigChange::SpeakingRate(1.5))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert!((h.controller.config().speaking_rate - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_text_message() {
        let mut h = Harness::new();
        h.controller.send_text("ignored while idle").unwrap();
        h.open();

        h.controller.send_text("   ").unwrap();
        assert!(h.transport.sent_payloads().is_empty());

        h.controller.send_text("  hola  ").unwrap();
        assert_eq!(
            h.transport.sent_payloads(),
            vec![ClientMessage::Text("hola".to_string())]
        );

        h.transport.set_fail_send(true);
        h.controller
            .handle(SessionEvent::Command(Command::SendText("again".to_string())));
        assert_eq!(h.controller.status().message, "Failed to send message.");
        assert_eq!(h.controller.state(), SessionState::Open);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut h = Harness::new();
        h.open();
        h.controller.start_capture().unwrap();
        h.controller.handle(SessionEvent::Command(Command::Shutdown));

        assert!(h.controller.is_shutdown());
        assert!(!h.mic.capturing.get());
        assert_eq!(h.controller.state(), SessionState::Closed);
        assert_eq!(h.transport.log().closed.len(), 1);
    }
}
