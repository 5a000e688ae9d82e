//! Live session event loop.
//!
//! [`SessionRunner`] owns the socket and the turn coordinator for one
//! mounted session. The UI talks to it only through a [`SessionHandle`]:
//! intents go in, discrete [`SessionEvent`]s and read-only
//! [`SessionSnapshot`]s come out.
//!
//! ```text
//!  SessionHandle ──Intent──▸ ┌───────────────┐ ◂──SocketEvent── SessionSocket
//!                            │ SessionRunner │ ◂──TurnSignal─── watchdog / playback
//!  SessionHandle ◂─Snapshot─ └───────────────┘ ◂──frames─────── vision feed
//! ```
//!
//! Every input is handled to completion before the next one is taken, so
//! socket messages are processed in arrival order and a turn start can
//! never interleave with a pending turn stop.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::protocol::{InboundMessage, OutboundMessage, CLOSE_NORMAL};
use super::socket::{ConnectionState, SessionSocket, SocketEvent};
use super::turn::{
    InputMode, SpeechMetrics, TurnConfig, TurnCoordinator, TurnDevices, TurnError, TurnSignal,
    TurnState,
};
use crate::api::{ApiError, SessionMode};
use crate::config::ClientConfig;
use crate::vision::{VisionFeed, VisionFrameMetrics};

/// How long shutdown waits for the socket driver to finish its close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// REST side of ending a session.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn end_session(&self, session_id: &str) -> Result<(), ApiError>;
}

// ── UI contract ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Hold-to-talk pressed.
    Press,
    /// Hold-to-talk released.
    Release,
    /// Toggle-to-talk activated.
    Toggle,
    /// End the session. Mid-turn this needs `confirmed: true`.
    EndSession { confirmed: bool },
    /// Manual reconnect after the socket gave up.
    Retry,
    /// Navigate away without ending the session.
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConfirmEndRequired,
    CaptureFailed(TurnError),
    /// The REST end-session call failed. With `notified` the `end_session`
    /// frame reached the backend, which closes the session itself and
    /// answers with `session_ended`. Otherwise the session is still active
    /// server-side and ending can be retried.
    EndFailed { reason: String, notified: bool },
    Ended { by_server: bool },
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Ended { by_server: bool },
    Left,
}

/// Read-only view of the live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub mode: SessionMode,
    pub connection: ConnectionState,
    pub turn: TurnState,
    pub metrics: SpeechMetrics,
    pub last_ai_text: Option<String>,
    /// A network error was seen since the last successful open.
    pub socket_error: bool,
    pub server_notice: Option<String>,
    pub vision: Option<VisionFrameMetrics>,
}

impl SessionSnapshot {
    fn new(session_id: &str, mode: SessionMode) -> Self {
        Self {
            session_id: session_id.to_string(),
            mode,
            connection: ConnectionState::Idle,
            turn: TurnState::Idle,
            metrics: SpeechMetrics::default(),
            last_ai_text: None,
            socket_error: false,
            server_notice: None,
            vision: None,
        }
    }
}

/// UI-side endpoint of a [`SessionRunner`].
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<Intent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Queue an intent. Returns `false` once the runner has exited.
    pub fn send(&self, intent: Intent) -> bool {
        self.intents.send(intent).is_ok()
    }

    /// Sender for input tasks that outlive a borrow of the handle.
    pub fn intent_sender(&self) -> mpsc::UnboundedSender<Intent> {
        self.intents.clone()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}

// ── Runner ────────────────────────────────────────────────────────

enum Step {
    Intent(Intent),
    Socket(SocketEvent),
    Turn(TurnSignal),
    Vision { alive: bool },
}

pub struct SessionRunner {
    session_id: String,
    mode: SessionMode,
    socket: Arc<SessionSocket>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    turn: TurnCoordinator,
    backend: Arc<dyn SessionBackend>,
    intents: mpsc::UnboundedReceiver<Intent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    vision: Option<VisionFeed>,
    latest_vision: Option<VisionFrameMetrics>,
    socket_error: bool,
    server_notice: Option<String>,
}

impl SessionRunner {
    pub fn new(
        config: &ClientConfig,
        session_id: impl Into<String>,
        mode: SessionMode,
        devices: TurnDevices,
        backend: Arc<dyn SessionBackend>,
    ) -> (Self, SessionHandle) {
        let session_id = session_id.into();
        let (socket, socket_events) =
            SessionSocket::new(config.socket_origin(), config.reconnect.policy());
        let socket = Arc::new(socket);
        let turn = TurnCoordinator::new(TurnConfig::from(&config.turn), devices, socket.clone());

        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(&session_id, mode));

        let runner = Self {
            session_id,
            mode,
            socket,
            socket_events,
            turn,
            backend,
            intents: intents_rx,
            events: events_tx,
            snapshot: snapshot_tx,
            vision: None,
            latest_vision: None,
            socket_error: false,
            server_notice: None,
        };
        let handle = SessionHandle {
            intents: intents_tx,
            events: events_rx,
            snapshot: snapshot_rx,
        };
        (runner, handle)
    }

    /// Attach a camera-mode metrics feed.
    pub fn with_vision(mut self, feed: VisionFeed) -> Self {
        self.vision = Some(feed);
        self
    }

    /// Drive the session until it ends or the UI leaves.
    ///
    /// Dropping the [`SessionHandle`] counts as leaving.
    pub async fn run(mut self) -> anyhow::Result<SessionExit> {
        anyhow::ensure!(
            self.mode.is_live(),
            "{} sessions do not use the live socket",
            self.mode
        );

        tracing::info!(
            session_id = %self.session_id,
            mode = %self.mode,
            endpoint = %self.socket.endpoint(&self.session_id),
            "Session runner started"
        );
        self.socket.connect(&self.session_id);
        self.publish();

        let exit = loop {
            let step = tokio::select! {
                intent = self.intents.recv() => Step::Intent(intent.unwrap_or(Intent::Leave)),
                Some(event) = self.socket_events.recv() => Step::Socket(event),
                signal = self.turn.next_signal() => Step::Turn(signal),
                alive = next_vision(&mut self.vision) => Step::Vision { alive },
            };

            let exit = match step {
                Step::Intent(intent) => self.on_intent(intent).await,
                Step::Socket(event) => self.on_socket_event(event).await,
                Step::Turn(signal) => {
                    self.turn.handle_signal(signal).await;
                    None
                }
                Step::Vision { alive } => {
                    self.on_vision(alive);
                    None
                }
            };
            self.publish();
            if let Some(exit) = exit {
                break exit;
            }
        };

        tracing::info!(session_id = %self.session_id, ?exit, "Session runner finished");
        Ok(exit)
    }

    // ── Intents ───────────────────────────────────────────────────

    async fn on_intent(&mut self, intent: Intent) -> Option<SessionExit> {
        tracing::debug!(session_id = %self.session_id, ?intent, "Intent");
        match intent {
            Intent::Press => self.start_turn(InputMode::Hold).await,
            Intent::Release => {
                if self.turn.state() == (TurnState::Listening { mode: InputMode::Hold }) {
                    self.turn.stop_turn().await;
                }
            }
            Intent::Toggle => {
                if let TurnState::Listening { .. } = self.turn.state() {
                    self.turn.stop_turn().await;
                } else {
                    self.start_turn(InputMode::Toggle).await;
                }
            }
            Intent::EndSession { confirmed } => return self.end_session(confirmed).await,
            Intent::Retry => match self.socket.state() {
                ConnectionState::Failed | ConnectionState::Idle => {
                    tracing::info!(session_id = %self.session_id, "Manual reconnect");
                    self.socket.connect(&self.session_id);
                }
                state => {
                    tracing::debug!(state = state.label(), "Retry ignored, socket still active");
                }
            },
            Intent::Leave => {
                self.shutdown().await;
                self.emit(SessionEvent::Left);
                return Some(SessionExit::Left);
            }
        }
        None
    }

    async fn start_turn(&mut self, mode: InputMode) {
        match self.turn.start_turn(mode).await {
            Ok(()) => {}
            Err(TurnError::Busy) => {
                tracing::debug!(session_id = %self.session_id, "Turn start ignored, reply pending");
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Turn could not start");
                self.emit(SessionEvent::CaptureFailed(e));
            }
        }
    }

    async fn end_session(&mut self, confirmed: bool) -> Option<SessionExit> {
        if self.turn.state().is_turn_active() && !confirmed {
            self.emit(SessionEvent::ConfirmEndRequired);
            return None;
        }

        self.turn.teardown().await;
        let notified = self.socket.send(&OutboundMessage::EndSession);

        match self.backend.end_session(&self.session_id).await {
            Ok(()) => {
                self.close_socket().await;
                self.emit(SessionEvent::Ended { by_server: false });
                Some(SessionExit::Ended { by_server: false })
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    notified,
                    "Ending session over REST failed"
                );
                self.emit(SessionEvent::EndFailed {
                    reason: e.to_string(),
                    notified,
                });
                None
            }
        }
    }

    // ── Socket events ─────────────────────────────────────────────

    async fn on_socket_event(&mut self, event: SocketEvent) -> Option<SessionExit> {
        match event {
            SocketEvent::State(state) => {
                tracing::debug!(session_id = %self.session_id, state = state.label(), "Connection state");
                if state == ConnectionState::Failed {
                    tracing::warn!(
                        session_id = %self.session_id,
                        "Session socket failed, manual retry required"
                    );
                    self.turn.teardown().await;
                }
            }
            SocketEvent::Open => {
                self.socket_error = false;
                self.turn.on_reconnected();
            }
            SocketEvent::Error(error) => {
                tracing::debug!(session_id = %self.session_id, error = %error, "Socket error");
                self.socket_error = true;
            }
            SocketEvent::Close(code) => {
                tracing::debug!(session_id = %self.session_id, code, "Socket closed");
                self.turn.on_connection_lost();
            }
            SocketEvent::Message(InboundMessage::SessionEnded) => {
                tracing::info!(session_id = %self.session_id, "Session ended by server");
                self.shutdown().await;
                self.emit(SessionEvent::Ended { by_server: true });
                return Some(SessionExit::Ended { by_server: true });
            }
            SocketEvent::Message(InboundMessage::Error { message }) => {
                let notice = message.unwrap_or_else(|| "The server reported an error".to_string());
                tracing::warn!(session_id = %self.session_id, notice = %notice, "Server error notice");
                self.server_notice = Some(notice);
            }
            SocketEvent::Message(message) => self.turn.on_message(&message),
        }
        None
    }

    fn on_vision(&mut self, alive: bool) {
        match self.vision.as_mut() {
            Some(feed) if alive => {
                self.latest_vision = feed
                    .borrow_and_update()
                    .clone()
                    .map(VisionFrameMetrics::sanitized);
            }
            _ => {
                tracing::debug!(session_id = %self.session_id, "Vision feed closed");
                self.vision = None;
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        self.turn.teardown().await;
        self.close_socket().await;
    }

    /// Normal-closure the socket and wait briefly for the driver to settle.
    async fn close_socket(&self) {
        self.socket.close(CLOSE_NORMAL);
        let mut state = self.socket.subscribe();
        let timed_out = tokio::time::timeout(
            CLOSE_GRACE,
            state.wait_for(|s| matches!(s, ConnectionState::Idle | ConnectionState::Failed)),
        )
        .await
        .is_err();
        if timed_out {
            tracing::debug!(session_id = %self.session_id, "Socket close still pending");
        }
    }

    // ── Publishing ────────────────────────────────────────────────

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let next = SessionSnapshot {
            session_id: self.session_id.clone(),
            mode: self.mode,
            connection: self.socket.state(),
            turn: self.turn.state(),
            metrics: self.turn.metrics().clone(),
            last_ai_text: self.turn.last_ai_text().map(str::to_string),
            socket_error: self.socket_error,
            server_notice: self.server_notice.clone(),
            vision: self.latest_vision.clone(),
        };
        self.snapshot.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Resolve on the next vision frame; `false` once the producer is gone.
async fn next_vision(feed: &mut Option<VisionFeed>) -> bool {
    match feed {
        Some(feed) => feed.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
