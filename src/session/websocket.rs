//! Websocket transport to the hosted live API
//!
//! The socket lives in a spawned task on the current runtime. The controller
//! side only pushes serialized frames into a queue, and everything the task
//! observes comes back as [`SessionEvent`]s tagged with the connection id.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::protocol::{ClientMessage, CloseFrame, ServerMessage, SessionSetup};
use super::transport::Transport;
use super::{ConnectionId, EventSender, SessionEvent};
use crate::{Error, Result};

/// Bidirectional streaming endpoint of the hosted live API
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Close code reported when the socket drops without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported for a close frame that carries no status
const NO_STATUS: u16 = 1005;

/// Frames queued for the socket task
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close(CloseFrame),
}

struct Link {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// [`Transport`] over a websocket speaking the live API's JSON frames
///
/// Must be opened from inside a tokio runtime.
pub struct WebSocketTransport {
    url: String,
    link: Option<Link>,
}

impl WebSocketTransport {
    /// Transport for an explicit `ws://` or `wss://` URL
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        // Fails only when a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            url: url.into(),
            link: None,
        }
    }

    /// Transport for the hosted live API, authenticated with `api_key`
    #[must_use]
    pub fn live(api_key: &str) -> Self {
        Self::new(format!("{LIVE_ENDPOINT}?key={api_key}"))
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, setup: &SessionSetup, id: ConnectionId, events: EventSender) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Connection(format!("no async runtime: {e}")))?;
        let setup = ClientMessage::Setup(setup.clone())
            .to_json()
            .map_err(|e| Error::Connection(e.to_string()))?;

        if let Some(stale) = self.link.take() {
            stale.task.abort();
        }

        let (outbound, queue) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_link(self.url.clone(), id, setup, events, queue));
        tracing::debug!(connection = id.0, "websocket connecting");
        self.link = Some(Link { id, outbound, task });
        Ok(())
    }

    fn send(&mut self, message: ClientMessage) -> Result<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::Transmit("No open connection.".to_string()))?;
        let text = message
            .to_json()
            .map_err(|e| Error::Transmit(e.to_string()))?;
        link.outbound
            .send(Outbound::Text(text))
            .map_err(|_| Error::Transmit("Connection is closed.".to_string()))
    }

    fn close(&mut self, frame: CloseFrame) {
        if let Some(link) = self.link.take() {
            tracing::debug!(connection = link.id.0, code = frame.code, "websocket closing");
            if link.outbound.send(Outbound::Close(frame)).is_err() {
                link.task.abort();
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.task.abort();
        }
    }
}

/// Own one socket from connect to close
async fn run_link(
    url: String,
    id: ConnectionId,
    setup: String,
    events: EventSender,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    let connecting = tokio_tungstenite::connect_async(url.as_str());
    tokio::pin!(connecting);

    // Hold frames queued before the handshake finishes
    let mut early = Vec::new();
    let socket = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok((socket, _)) => break socket,
                Err(e) => {
                    tracing::warn!(connection = id.0, error = %e, "websocket connect failed");
                    let _ = events.send(SessionEvent::Failed(id, e.to_string()));
                    return;
                }
            },
            next = queue.recv() => match next {
                Some(Outbound::Text(text)) => early.push(text),
                Some(Outbound::Close(_)) | None => {
                    tracing::debug!(connection = id.0, "websocket abandoned while connecting");
                    return;
                }
            },
        }
    };

    let (mut write, mut read) = socket.split();
    for text in std::iter::once(setup).chain(early) {
        if let Err(e) = write.send(Message::Text(text.into())).await {
            let _ = events.send(SessionEvent::Failed(id, e.to_string()));
            return;
        }
    }
    if events.send(SessionEvent::Opened(id)).is_err() {
        return;
    }
    tracing::info!(connection = id.0, "websocket open");

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let _ = events.send(SessionEvent::Failed(id, e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close(frame)) => {
                    let frame = WsCloseFrame {
                        code: CloseCode::from(frame.code),
                        reason: frame.reason.into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !deliver(&events, id, text.as_str()) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if !deliver(&events, id, text) {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(connection = id.0, error = %e, "binary frame is not UTF-8"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let frame = frame.map_or_else(
                        || CloseFrame {
                            code: NO_STATUS,
                            reason: String::new(),
                        },
                        |f| CloseFrame {
                            code: u16::from(f.code),
                            reason: f.reason.as_str().to_string(),
                        },
                    );
                    let _ = events.send(SessionEvent::Closed(id, frame));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SessionEvent::Failed(id, e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(SessionEvent::Closed(
                        id,
                        CloseFrame {
                            code: ABNORMAL_CLOSURE,
                            reason: String::new(),
                        },
                    ));
                    break;
                }
            },
        }
    }

    tracing::debug!(connection = id.0, "websocket task finished");
}

/// Parse one server frame and forward its messages
///
/// Returns false once the event queue is gone.
fn deliver(events: &EventSender, id: ConnectionId, text: &str) -> bool {
    match ServerMessage::parse(text) {
        Ok(messages) => messages
            .into_iter()
            .all(|message| events.send(SessionEvent::Message(id, message)).is_ok()),
        Err(e) => {
            tracing::warn!(connection = id.0, error = %e, "unreadable server frame");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::audio::{PLAYBACK_SAMPLE_RATE, codec};
    use crate::config::Config;
    use crate::session::event_channel;

    fn setup() -> SessionSetup {
        let config = Config::default();
        SessionSetup::from_config(&config.session, &config.instructions)
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();

            let setup = socket.next().await.unwrap().unwrap().into_text().unwrap();
            let setup: serde_json::Value = serde_json::from_str(setup.as_str()).unwrap();

            socket
                .send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();
            let audio = r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"data":"AAABAA==","mimeType":"audio/pcm;rate=24000"}}
            ]},"turnComplete":true}}"#;
            socket
                .send(Message::Binary(audio.as_bytes().to_vec().into()))
                .await
                .unwrap();

            let text = socket.next().await.unwrap().unwrap().into_text().unwrap();
            let text: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();

            socket
                .send(Message::Close(Some(WsCloseFrame {
                    code: CloseCode::from(1011),
                    reason: "going away".into(),
                })))
                .await
                .unwrap();
            (setup, text)
        });

        let (tx, mut rx) = event_channel();
        let mut transport = WebSocketTransport::new(url);
        transport.open(&setup(), ConnectionId(4), tx).unwrap();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Opened(ConnectionId(4)))));
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Message(_, ServerMessage::SetupComplete))
        ));
        match rx.recv().await {
            Some(SessionEvent::Message(ConnectionId(4), ServerMessage::Audio(chunk))) => {
                assert_eq!(chunk.sample_rate, PLAYBACK_SAMPLE_RATE);
                let unit = codec::decode(&chunk, PLAYBACK_SAMPLE_RATE, 1).unwrap();
                assert_eq!(unit.frames(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::Message(_, ServerMessage::TurnComplete))
        ));

        transport
            .send(ClientMessage::Text("hola".to_string()))
            .unwrap();

        match rx.recv().await {
            Some(SessionEvent::Closed(ConnectionId(4), frame)) => {
                assert_eq!(frame.code, 1011);
                assert_eq!(frame.reason, "going away");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let (setup, text) = server.await.unwrap();
        assert!(setup["setup"]["model"].as_str().unwrap().starts_with("models/"));
        assert_eq!(text["realtimeInput"]["text"], "hola");
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        let (listener, url) = listener().await;
        drop(listener);

        let (tx, mut rx) = event_channel();
        let mut transport = WebSocketTransport::new(url);
        transport.open(&setup(), ConnectionId(9), tx).unwrap();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Failed(ConnectionId(9), _))));
    }

    #[tokio::test]
    async fn test_local_close_sends_close_frame() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            let _setup = socket.next().await.unwrap().unwrap();
            loop {
                match socket.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    _ => return None,
                }
            }
        });

        let (tx, mut rx) = event_channel();
        let mut transport = WebSocketTransport::new(url);
        transport.open(&setup(), ConnectionId(2), tx).unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Opened(ConnectionId(2)))));

        transport.close(CloseFrame::normal());
        assert_eq!(server.await.unwrap(), Some(1000));
        assert!(matches!(
            transport.send(ClientMessage::Text("late".to_string())),
            Err(Error::Transmit(_))
        ));
    }

    #[test]
    fn test_open_needs_runtime() {
        let (tx, _rx) = event_channel();
        let mut transport = WebSocketTransport::new("ws://127.0.0.1:9");
        assert!(matches!(
            transport.open(&setup(), ConnectionId(1), tx),
            Err(Error::Connection(_))
        ));
    }
}
