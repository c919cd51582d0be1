//! Session over a real websocket
//!
//! Runs a controller against a local server that speaks the live API's JSON
//! frames.

use std::rc::Rc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};

use live_orb::audio::{CAPTURE_SAMPLE_RATE, ManualClock};
use live_orb::session::{EventReceiver, WebSocketTransport, event_channel};
use live_orb::{Config, SessionController, SessionEvent, SessionState};

mod common;
use common::{FakeMic, RecordingSink, generate_sine_samples, speech_chunk};

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => {}
            other => panic!("socket ended: {other:?}"),
        }
    }
}

async fn pump_until(
    controller: &mut SessionController,
    rx: &mut EventReceiver,
    done: impl Fn(&SessionController) -> bool,
) {
    while !done(controller) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event before timeout")
            .expect("queue open");
        controller.handle(event);
    }
}

#[tokio::test]
async fn test_conversation_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let reply = speech_chunk(200).data;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();

        let setup = next_json(&mut socket).await;
        socket
            .send(Message::Text(r#"{"setupComplete":{}}"#.into()))
            .await
            .unwrap();

        let input = next_json(&mut socket).await;
        let turn = serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"data": reply, "mimeType": "audio/pcm;rate=24000"}}]
                }
            }
        });
        socket
            .send(Message::Text(turn.to_string().into()))
            .await
            .unwrap();
        socket
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "maintenance".into(),
            })))
            .await
            .unwrap();
        (setup, input)
    });

    let mut config = Config::default();
    config.audio.ui_sounds = false;
    let (tx, mut rx) = event_channel();
    let mic = FakeMic::default();
    let mut controller = SessionController::new(
        &config,
        Box::new(WebSocketTransport::new(url)),
        Box::new(mic.clone()),
        Rc::new(ManualClock::new()),
        Box::new(RecordingSink::new()),
        tx,
    );

    controller.connect().unwrap();
    pump_until(&mut controller, &mut rx, |c| c.state() == SessionState::Open).await;

    controller.start_capture().unwrap();
    controller.handle(SessionEvent::CaptureFrame(generate_sine_samples(
        440.0,
        CAPTURE_SAMPLE_RATE,
        0.016,
        0.5,
    )));
    assert_eq!(controller.stats().frames_sent, 1);

    pump_until(&mut controller, &mut rx, |c| c.state() == SessionState::Errored).await;
    assert_eq!(controller.stats().chunks_received, 1);
    assert_eq!(controller.stats().chunks_rejected, 0);
    assert!(!mic.capturing.get());
    assert_eq!(
        controller.status().message,
        "Connection closed unexpectedly: maintenance (code: 1001)"
    );

    let (setup, input) = server.await.unwrap();
    assert_eq!(
        setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Orus"
    );
    let chunk = &input["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    assert!(!chunk["data"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_errored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (tx, mut rx) = event_channel();
    let mut controller = SessionController::new(
        &Config::default(),
        Box::new(WebSocketTransport::new(url)),
        Box::new(FakeMic::default()),
        Rc::new(ManualClock::new()),
        Box::new(RecordingSink::new()),
        tx,
    );

    controller.connect().unwrap();
    pump_until(&mut controller, &mut rx, |c| c.state() == SessionState::Errored).await;
    assert_eq!(
        controller.status().message,
        "A connection error occurred. Please reset the session."
    );
}
