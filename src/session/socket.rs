//! Session WebSocket with automatic recovery.
//!
//! [`SessionSocket`] owns at most one live WebSocket per session. A
//! background driver task performs the connect → pump → close cycle and,
//! after an abnormal close, schedules the next attempt with
//! [`ReconnectPolicy`] backoff. Everything the owner needs to know arrives
//! in order on a single [`SocketEvent`] channel.
//!
//! ## Lifecycle
//!
//! ```text
//! connect() ─▸ Connecting ─▸ Connected ──close(1000)──▸ Idle
//!                  ▲              │
//!                  │       abnormal close
//!                  │              ▼
//!                  └──delay── Reconnecting ──retries exhausted──▸ Failed
//! ```
//!
//! A new `connect()` always abandons the previous driver first; events
//! from an abandoned driver are never delivered.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::backoff::{ReconnectAttempt, ReconnectPolicy};
use super::protocol::{
    parse_inbound, socket_path, InboundMessage, OutboundMessage, CLOSE_ABNORMAL, CLOSE_NORMAL,
    CLOSE_NO_STATUS,
};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// ── Public types ──────────────────────────────────────────────────

/// State of the session socket. Driven exclusively by the socket driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, or intentionally closed.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Open and able to send.
    Connected,
    /// Waiting `delay_ms` before retry number `attempt`.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Automatic retries exhausted; only a manual `connect` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Events delivered to the socket owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    State(ConnectionState),
    Open,
    Message(InboundMessage),
    /// Non-fatal network error; a `Close` follows when the connection is lost.
    Error(String),
    Close(u16),
}

/// Outbound half of the socket, as seen by the turn coordinator.
pub trait MessageSink: Send + Sync {
    /// Transmit if open. Returns `false` when the message was dropped.
    fn send(&self, message: &OutboundMessage) -> bool;
}

enum Command {
    Send(String),
    Close(u16),
}

struct Link {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

// ── SessionSocket ─────────────────────────────────────────────────

pub struct SessionSocket {
    origin: String,
    policy: ReconnectPolicy,
    generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<SocketEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: Mutex<Option<Link>>,
}

impl SessionSocket {
    /// Create an idle socket for the given WebSocket origin (`ws://host:port`).
    pub fn new(
        origin: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Idle);
        let socket = Self {
            origin: origin.into().trim_end_matches('/').to_string(),
            policy,
            generation: Arc::new(AtomicU64::new(0)),
            events,
            state: Arc::new(state),
            link: Mutex::new(None),
        };
        (socket, events_rx)
    }

    /// Endpoint URL for `session_id`.
    pub fn endpoint(&self, session_id: &str) -> String {
        format!("{}{}", self.origin, socket_path(session_id))
    }

    /// Open a socket for `session_id`, abandoning any previous one.
    ///
    /// Starts a fresh attempt sequence. Must be called inside a Tokio runtime.
    pub fn connect(&self, session_id: &str) {
        let mine = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut link = self.link.lock();
        if let Some(previous) = link.take() {
            tracing::debug!(
                session_id = %previous.session_id,
                "Abandoning previous session socket"
            );
            previous.task.abort();
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let emitter = Emitter {
            generation: Arc::clone(&self.generation),
            mine,
            events: self.events.clone(),
            state: Arc::clone(&self.state),
        };
        let driver = Driver {
            url: self.endpoint(session_id),
            session_id: session_id.to_string(),
            policy: self.policy,
            emitter,
        };
        let task = tokio::spawn(driver.run(commands_rx));

        *link = Some(Link {
            session_id: session_id.to_string(),
            commands,
            task,
        });
    }

    /// Serialize and transmit `message` if the socket is open; otherwise drop it.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if !self.state().is_open() {
            tracing::debug!(
                kind = message.kind(),
                state = self.state().label(),
                "Socket not open, dropping outbound message"
            );
            return false;
        }
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };
        match self.link.lock().as_ref() {
            Some(link) => link.commands.send(Command::Send(json)).is_ok(),
            None => false,
        }
    }

    /// Close the socket. [`CLOSE_NORMAL`] also cancels any pending reconnect.
    pub fn close(&self, code: u16) {
        if let Some(link) = self.link.lock().as_ref() {
            tracing::debug!(session_id = %link.session_id, code, "Closing session socket");
            let _ = link.commands.send(Command::Close(code));
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.link.lock().as_ref().map(|link| link.session_id.clone())
    }
}

impl MessageSink for SessionSocket {
    fn send(&self, message: &OutboundMessage) -> bool {
        SessionSocket::send(self, message)
    }
}

impl Drop for SessionSocket {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(link) = self.link.get_mut().take() {
            link.task.abort();
        }
    }
}

// ── Driver ────────────────────────────────────────────────────────

/// Publishes events and state on behalf of one driver generation.
struct Emitter {
    generation: Arc<AtomicU64>,
    mine: u64,
    events: mpsc::UnboundedSender<SocketEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Emitter {
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.mine
    }

    fn emit(&self, event: SocketEvent) {
        if self.is_current() {
            let _ = self.events.send(event);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if self.is_current() {
            self.state.send_replace(state);
            let _ = self.events.send(SocketEvent::State(state));
        }
    }
}

struct Driver {
    url: String,
    session_id: String,
    policy: ReconnectPolicy,
    emitter: Emitter,
}

impl Driver {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt = ReconnectAttempt::default();

        loop {
            self.emitter.set_state(ConnectionState::Connecting);
            tracing::info!(
                session_id = %self.session_id,
                url = %self.url,
                retry = attempt.count(),
                "Connecting session socket"
            );

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
                () = next_normal_close(&mut commands) => {
                    self.finish_normally();
                    return;
                }
            };

            let code = match connected {
                Ok((stream, _response)) => {
                    attempt.reset();
                    self.emitter.set_state(ConnectionState::Connected);
                    self.emitter.emit(SocketEvent::Open);
                    tracing::info!(session_id = %self.session_id, "Session socket open");
                    match self.pump(stream, &mut commands).await {
                        Some(code) => code,
                        None => {
                            tracing::debug!(session_id = %self.session_id, "Socket owner gone");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Session socket connect failed"
                    );
                    self.emitter
                        .emit(SocketEvent::Error(format!("connect failed: {e}")));
                    CLOSE_ABNORMAL
                }
            };

            self.emitter.emit(SocketEvent::Close(code));
            if code == CLOSE_NORMAL {
                tracing::info!(session_id = %self.session_id, "Session socket closed normally");
                self.emitter.set_state(ConnectionState::Idle);
                return;
            }

            let Some(delay) = attempt.schedule(&self.policy) else {
                tracing::warn!(
                    session_id = %self.session_id,
                    retries = self.policy.max_retries,
                    "Reconnect attempts exhausted"
                );
                self.emitter.set_state(ConnectionState::Failed);
                return;
            };

            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::info!(
                session_id = %self.session_id,
                code,
                attempt = attempt.count(),
                delay_ms,
                "Session socket closed abnormally, reconnect scheduled"
            );
            self.emitter.set_state(ConnectionState::Reconnecting {
                attempt: attempt.count(),
                delay_ms,
            });

            if !wait_for_retry(delay, &mut commands).await {
                self.finish_normally();
                return;
            }
        }
    }

    fn finish_normally(&self) {
        tracing::info!(session_id = %self.session_id, "Session socket closed before reconnect");
        self.emitter.emit(SocketEvent::Close(CLOSE_NORMAL));
        self.emitter.set_state(ConnectionState::Idle);
    }

    /// Shuttle frames until the connection ends. Returns the close code, or
    /// `None` when the owner dropped the command channel.
    async fn pump(
        &self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<u16> {
        let (mut sink, mut source) = stream.split();
        let session_id = self.session_id.as_str();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(json)) => {
                        tracing::debug!(session_id = %session_id, len = json.len(), "Sending frame");
                        if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                            tracing::warn!(session_id = %session_id, error = %e, "WebSocket send failed");
                            self.emitter.emit(SocketEvent::Error(format!("send failed: {e}")));
                            return Some(CLOSE_ABNORMAL);
                        }
                    }
                    Some(Command::Close(code)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                            tracing::debug!(session_id = %session_id, error = %e, "Close frame not delivered");
                        }
                        return Some(code);
                    }
                    None => return None,
                },
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match parse_inbound(text.as_str()) {
                        Ok(message) => {
                            tracing::debug!(session_id = %session_id, kind = message.kind(), "Inbound message");
                            self.emitter.emit(SocketEvent::Message(message));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Dropping unparsable payload");
                        }
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                        tracing::info!(session_id = %session_id, code, "Server closed session socket");
                        let _ = sink.flush().await;
                        return Some(code);
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::debug!(session_id = %session_id, len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong handled by tungstenite
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session_id, error = %e, "WebSocket error");
                        self.emitter.emit(SocketEvent::Error(e.to_string()));
                        return Some(CLOSE_ABNORMAL);
                    }
                    None => return Some(CLOSE_ABNORMAL),
                },
            }
        }
    }
}

/// Resolve once a normal close is requested (or the owner is gone).
/// Other commands are dropped: nothing can be sent while disconnected.
async fn next_normal_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Close(code)) if code == CLOSE_NORMAL => return,
            Some(Command::Close(code)) => {
                tracing::debug!(code, "Ignoring non-normal close while disconnected");
            }
            Some(Command::Send(_)) => {
                tracing::debug!("Dropping outbound message while disconnected");
            }
            None => return,
        }
    }
}

/// Sleep out the backoff delay. Returns `false` if a normal close arrived first.
async fn wait_for_retry(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = next_normal_close(commands) => false,
    }
}
