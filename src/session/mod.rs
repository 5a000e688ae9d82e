//! Live practice session core.
//!
//! ## Architecture
//!
//! ```text
//! UI ──Intent──▸ SessionRunner ──▸ TurnCoordinator ──user_audio_transcript──┐
//!    ◂─Snapshot─       │              │   ▲                                  ▼
//!                      │              │   └──ai_response / welcome──── SessionSocket ◂──▸ backend
//!                      │              ▼
//!                      │     capture · recognizer · watchdog · playback
//!                      └──end_session (REST)──▸ SessionBackend
//! ```
//!
//! - [`protocol`]: typed JSON frames and close codes
//! - [`backoff`]: reconnect delay policy and attempt counter
//! - [`socket`]: one WebSocket per session with automatic recovery
//! - [`turn`]: the listening / processing / speaking state machine
//! - [`runner`]: event loop binding all of the above to UI intents

pub mod backoff;
pub mod protocol;
pub mod runner;
pub mod socket;
pub mod turn;

pub use backoff::{ReconnectAttempt, ReconnectPolicy};
pub use protocol::{Analysis, InboundMessage, OutboundMessage};
pub use runner::{
    Intent, SessionBackend, SessionEvent, SessionExit, SessionHandle, SessionRunner,
    SessionSnapshot,
};
pub use socket::{ConnectionState, MessageSink, SessionSocket, SocketEvent};
pub use turn::{
    InputMode, SpeechMetrics, TurnConfig, TurnCoordinator, TurnDevices, TurnError, TurnState,
};
