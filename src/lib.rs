//! Articulotor realtime session client.
//!
//! A practice session is a conversation with an AI persona over a single
//! WebSocket. This crate owns the parts of the client that have to be right
//! under load and flaky networks:
//!
//! - [`session::SessionSocket`] keeps exactly one live socket per session and
//!   recovers from abnormal closes with bounded exponential backoff.
//! - [`session::TurnCoordinator`] sequences a conversational turn
//!   (capture → transcript → submit → reply → playback) and keeps microphone
//!   capture and speech playback mutually exclusive.
//! - [`session::SessionRunner`] is the event loop that glues both to UI
//!   intents and publishes read-only snapshots.
//!
//! Audio hardware, speech recognition and synthesis are collaborators behind
//! the traits in [`audio`]; the REST backend lives behind [`api::ApiClient`].

pub mod api;
pub mod audio;
pub mod config;
pub mod session;
pub mod vision;

pub use api::{ApiClient, ApiError};
pub use config::ClientConfig;
pub use session::{
    ConnectionState, InputMode, Intent, SessionEvent, SessionHandle, SessionRunner,
    SessionSnapshot, SessionSocket, TurnCoordinator, TurnState,
};
