//! Single-threaded session event loop

use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior, Sleep};

use super::{ConnectionId, EventReceiver, SessionController, SessionEvent, SessionState};
use crate::audio::SpectrumSource;
use crate::config::Config;
use crate::visuals::{VisualSink, Visualizer};

/// Armed connect timer for one connection attempt
type Deadline = Option<(ConnectionId, Pin<Box<Sleep>>)>;

/// Drives a [`SessionController`] and a [`Visualizer`] from one task
///
/// Multiplexes the session event queue, the animation interval and the
/// connect timeout. Returns once the controller has shut down.
pub struct SessionRunner<S, R> {
    controller: SessionController,
    events: EventReceiver,
    visualizer: Visualizer<S, R>,
    sink: Box<dyn VisualSink>,
    frame_interval: Duration,
    connect_timeout: Duration,
}

impl<S: SpectrumSource, R: Rng> SessionRunner<S, R> {
    pub fn new(
        controller: SessionController,
        events: EventReceiver,
        visualizer: Visualizer<S, R>,
        sink: Box<dyn VisualSink>,
        config: &Config,
    ) -> Self {
        Self {
            controller,
            events,
            visualizer,
            sink,
            frame_interval: config.visuals.frame_interval(),
            connect_timeout: config.audio.connect_timeout,
        }
    }

    /// Run until shutdown and hand the controller back
    pub async fn run(mut self) -> SessionController {
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let started = Instant::now();
        let mut deadline: Deadline = None;

        tracing::debug!(
            frame_interval_ms = self.frame_interval.as_millis(),
            connect_timeout_s = self.connect_timeout.as_secs(),
            "session runner started"
        );

        loop {
            self.rearm(&mut deadline);

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.controller.handle(event),
                    None => {
                        tracing::debug!("event queue closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.controller.tick();
                    let now_ms = started.elapsed().as_secs_f64() * 1000.0;
                    if let Err(e) = self.visualizer.render(now_ms, self.sink.as_mut()) {
                        tracing::warn!(error = %e, "visual sink rejected frame");
                    }
                },
                id = expired(&mut deadline) => {
                    deadline = None;
                    self.controller.handle(SessionEvent::ConnectTimeout(id));
                },
            }

            if self.controller.is_shutdown() {
                break;
            }
        }

        tracing::debug!(state = %self.controller.state(), "session runner stopped");
        self.controller
    }

    /// Keep exactly one timer armed while a connection attempt is pending
    fn rearm(&self, deadline: &mut Deadline) {
        let pending = if self.controller.state() == SessionState::Connecting {
            self.controller.connection()
        } else {
            None
        };

        match (pending, deadline.as_ref().map(|(id, _)| *id)) {
            (Some(want), Some(have)) if want == have => {}
            (Some(want), _) => {
                *deadline = Some((want, Box::pin(tokio::time::sleep(self.connect_timeout))));
            }
            (None, _) => *deadline = None,
        }
    }
}

async fn expired(deadline: &mut Deadline) -> ConnectionId {
    match deadline {
        Some((id, sleep)) => {
            sleep.as_mut().await;
            *id
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::audio::{CaptureDevice, ManualClock, NullSink, SpectrumTap};
    use crate::session::{Command, EventSender, MemoryTransport, event_channel};
    use crate::visuals::LogSink;

    struct NoMic;

    impl CaptureDevice for NoMic {
        fn start(&mut self) -> crate::Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn is_capturing(&self) -> bool {
            false
        }
    }

    fn runner(transport: MemoryTransport) -> (SessionRunner<SpectrumTap, StdRng>, EventSender) {
        let (tx, rx) = event_channel();
        let mut config = Config::default();
        config.audio.ui_sounds = false;
        config.audio.connect_timeout = Duration::from_secs(10);

        let controller = SessionController::new(
            &config,
            Box::new(transport),
            Box::new(NoMic),
            Rc::new(ManualClock::new()),
            Box::new(NullSink::default()),
            tx.clone(),
        );
        let visualizer = Visualizer::new(
            SpectrumTap::new(),
            SpectrumTap::new(),
            16,
            StdRng::seed_from_u64(1),
        );
        (
            SessionRunner::new(controller, rx, visualizer, Box::new(LogSink), &config),
            tx,
        )
    }

    #[test]
    fn test_disarmed_deadline_never_fires() {
        let mut deadline: Deadline = None;
        let mut fut = tokio_test::task::spawn(expired(&mut deadline));
        tokio_test::assert_pending!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fires() {
        let (runner, tx) = runner(MemoryTransport::new());
        tx.send(SessionEvent::Command(Command::Connect)).unwrap();

        let driver = async {
            tokio::time::sleep(Duration::from_secs(11)).await;
            tx.send(SessionEvent::Command(Command::Shutdown)).unwrap();
        };

        let (controller, ()) = tokio::join!(runner.run(), driver);
        assert_eq!(controller.state(), SessionState::Errored);
        assert!(controller.status().message.starts_with("Failed to connect"));
        assert!(controller.status().is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_disarms_timeout() {
        let transport = MemoryTransport::new();
        let (runner, tx) = runner(transport.clone());
        tx.send(SessionEvent::Command(Command::Connect)).unwrap();

        let driver = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(transport.inject(SessionEvent::Opened));
            tokio::time::sleep(Duration::from_secs(20)).await;
            tx.send(SessionEvent::Command(Command::Shutdown)).unwrap();
        };

        let (controller, ()) = tokio::join!(runner.run(), driver);
        assert_eq!(controller.status().message, "Opened");
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(transport.log().closed.len(), 1);
    }
}
