//! Remote channel abstraction
//!
//! A [`Transport`] is owned by the controller and carries one connection at a
//! time. Connection lifecycle and inbound messages are reported as
//! [`SessionEvent`]s tagged with the [`ConnectionId`] passed to `open`, so the
//! controller can discard callbacks that arrive after a reset.

use std::cell::RefCell;
use std::rc::Rc;

use super::protocol::{ClientMessage, CloseFrame, ServerMessage, SessionSetup};
use super::{ConnectionId, EventSender, SessionEvent};
use crate::audio::{PLAYBACK_SAMPLE_RATE, codec};
use crate::{Error, Result};

/// Bidirectional message channel to the remote model
pub trait Transport {
    /// Begin opening a connection
    ///
    /// Completion is reported later as `SessionEvent::Opened` or
    /// `SessionEvent::Failed` on `events`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the attempt cannot be started at all
    fn open(&mut self, setup: &SessionSetup, id: ConnectionId, events: EventSender) -> Result<()>;

    /// Send one message on the open connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Transmit` if there is no open connection or the send fails
    fn send(&mut self, message: ClientMessage) -> Result<()>;

    /// Close the current connection, if any
    fn close(&mut self, frame: CloseFrame);
}

/// Loopback transport that speaks captured audio straight back
///
/// Each inbound audio frame is resampled to the playback rate and returned as
/// a model turn, so the whole pipeline can run without a remote service.
#[derive(Default)]
pub struct EchoTransport {
    link: Option<(ConnectionId, EventSender)>,
}

impl EchoTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, make: impl FnOnce(ConnectionId) -> SessionEvent) -> Result<()> {
        let (id, events) = self
            .link
            .as_ref()
            .ok_or_else(|| Error::Transmit("No open connection.".to_string()))?;
        events
            .send(make(*id))
            .map_err(|_| Error::Transmit("Event loop has shut down.".to_string()))
    }
}

impl Transport for EchoTransport {
    fn open(&mut self, setup: &SessionSetup, id: ConnectionId, events: EventSender) -> Result<()> {
        tracing::debug!(connection = id.0, model = %setup.model, voice = %setup.voice, "echo transport opening");
        self.link = Some((id, events));
        self.emit(SessionEvent::Opened)?;
        self.emit(|id| SessionEvent::Message(id, ServerMessage::SetupComplete))
    }

    fn send(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Audio(chunk) => {
                let unit = codec::decode(&chunk, PLAYBACK_SAMPLE_RATE, 1)
                    .map_err(|e| Error::Transmit(e.to_string()))?;
                let reply = codec::encode_at(&unit.samples, PLAYBACK_SAMPLE_RATE);
                self.emit(|id| SessionEvent::Message(id, ServerMessage::Audio(reply)))
            }
            ClientMessage::Text(text) => {
                tracing::debug!(chars = text.chars().count(), "echo transport received text");
                self.emit(|id| SessionEvent::Message(id, ServerMessage::TurnComplete))
            }
            ClientMessage::Setup(_) => Ok(()),
        }
    }

    fn close(&mut self, frame: CloseFrame) {
        if let Some((id, events)) = self.link.take() {
            tracing::debug!(connection = id.0, code = frame.code, "echo transport closed");
            let _ = events.send(SessionEvent::Closed(id, frame));
        }
    }
}

/// Recorded transport activity
#[derive(Debug, Default)]
pub struct MemoryLog {
    /// Every message passed to `send`, plus the setup of each `open`
    pub sent: Vec<ClientMessage>,
    /// Connection ids in the order they were opened
    pub opened: Vec<ConnectionId>,
    /// Close frames in the order they were issued
    pub closed: Vec<CloseFrame>,
    /// Fail the next `open` calls
    pub fail_open: bool,
    /// Fail the next `send` calls
    pub fail_send: bool,
    link: Option<(ConnectionId, EventSender)>,
}

/// In-memory transport that records traffic and lets callers inject events
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    log: Rc<RefCell<MemoryLog>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the shared log
    #[must_use]
    pub fn log(&self) -> std::cell::Ref<'_, MemoryLog> {
        self.log.borrow()
    }

    /// Make subsequent `open` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.log.borrow_mut().fail_open = fail;
    }

    /// Make subsequent `send` calls fail
    pub fn set_fail_send(&self, fail: bool) {
        self.log.borrow_mut().fail_send = fail;
    }

    /// Id of the connection most recently opened
    #[must_use]
    pub fn current(&self) -> Option<ConnectionId> {
        self.log.borrow().link.as_ref().map(|(id, _)| *id)
    }

    /// Deliver an event built for the current connection
    ///
    /// Returns false when no connection is open.
    pub fn inject(&self, make: impl FnOnce(ConnectionId) -> SessionEvent) -> bool {
        let log = self.log.borrow();
        log.link
            .as_ref()
            .is_some_and(|(id, events)| events.send(make(*id)).is_ok())
    }

    /// Messages sent with `send`, excluding setups
    #[must_use]
    pub fn sent_payloads(&self) -> Vec<ClientMessage> {
        self.log
            .borrow()
            .sent
            .iter()
            .filter(|m| !matches!(m, ClientMessage::Setup(_)))
            .cloned()
            .collect()
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, setup: &SessionSetup, id: ConnectionId, events: EventSender) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_open {
            return Err(Error::Connection(
                "Failed to connect. Please check your network and reset the session.".to_string(),
            ));
        }
        log.opened.push(id);
        log.sent.push(ClientMessage::Setup(setup.clone()));
        log.link = Some((id, events));
        Ok(())
    }

    fn send(&mut self, message: ClientMessage) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if log.fail_send || log.link.is_none() {
            return Err(Error::Transmit("Failed to send message.".to_string()));
        }
        log.sent.push(message);
        Ok(())
    }

    fn close(&mut self, frame: CloseFrame) {
        let mut log = self.log.borrow_mut();
        if log.link.take().is_some() {
            log.closed.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::Config;

    fn setup() -> SessionSetup {
        let config = Config::default();
        SessionSetup::from_config(&config.session, &config.instructions)
    }

    #[test]
    fn test_echo_returns_audio_at_playback_rate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = EchoTransport::new();
        transport.open(&setup(), ConnectionId(1), tx).unwrap();

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Opened(ConnectionId(1)))));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Message(_, ServerMessage::SetupComplete))
        ));

        let frame = vec![0.25f32; 160];
        transport
            .send(ClientMessage::Audio(codec::encode(&frame)))
            .unwrap();

        match rx.try_recv() {
            Ok(SessionEvent::Message(ConnectionId(1), ServerMessage::Audio(chunk))) => {
                assert_eq!(chunk.sample_rate, PLAYBACK_SAMPLE_RATE);
                let unit = codec::decode(&chunk, PLAYBACK_SAMPLE_RATE, 1).unwrap();
                assert_eq!(unit.frames(), 240);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_echo_send_after_close_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = EchoTransport::new();
        transport.open(&setup(), ConnectionId(3), tx).unwrap();
        transport.close(CloseFrame::normal());

        let closed = std::iter::from_fn(|| rx.try_recv().ok()).last();
        assert!(matches!(closed, Some(SessionEvent::Closed(ConnectionId(3), f)) if f.is_normal()));
        assert!(matches!(
            transport.send(ClientMessage::Text("hi".to_string())),
            Err(Error::Transmit(_))
        ));
    }

    #[test]
    fn test_memory_records_and_injects() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MemoryTransport::new();
        let mut transport = handle.clone();

        transport.open(&setup(), ConnectionId(7), tx).unwrap();
        transport
            .send(ClientMessage::Text("hello".to_string()))
            .unwrap();
        assert_eq!(handle.log().opened, vec![ConnectionId(7)]);
        assert_eq!(handle.sent_payloads(), vec![ClientMessage::Text("hello".to_string())]);

        assert!(handle.inject(SessionEvent::Opened));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Opened(ConnectionId(7)))));

        handle.set_fail_send(true);
        assert!(transport.send(ClientMessage::Text("x".to_string())).is_err());

        transport.close(CloseFrame::normal());
        transport.close(CloseFrame::normal());
        assert_eq!(handle.log().closed.len(), 1);
        assert!(!handle.inject(SessionEvent::Opened));
    }
}
