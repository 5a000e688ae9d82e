//! WebSocket message schema for a live practice session.
//!
//! All frames are JSON text tagged by a `type` discriminator.
//!
//! ```text
//! client ──user_audio_transcript / end_session──▸ backend
//!        ◂──welcome / ai_response / session_ended / error──
//! ```

use serde::{Deserialize, Serialize};

/// Close code for an intentional shutdown. Suppresses reconnection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close frame arrived without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame (also used for failed connects).
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Opening line the backend uses when a scenario has none.
pub const DEFAULT_OPENING: &str = "Hello. Let's begin.";

/// Server resource path template; `{session_id}` is substituted percent-encoded.
pub const SOCKET_PATH_TEMPLATE: &str = "/ws/voice/{session_id}";

/// Derive the socket path for a session.
pub fn socket_path(session_id: &str) -> String {
    SOCKET_PATH_TEMPLATE.replace("{session_id}", &urlencoding::encode(session_id))
}

// ── Server → Client messages ──────────────────────────────────────

/// Messages sent from the backend to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Opening prompt, sent once per connection.
    Welcome {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scenario: Option<WelcomeScenario>,
    },

    /// The persona's reply to a submitted turn.
    AiResponse {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        analysis: Option<Analysis>,
    },

    /// The backend considers the session closed.
    SessionEnded,

    /// Backend-side failure notice (unknown session, invalid payload...).
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

impl InboundMessage {
    /// Text to speak for a `welcome`: the explicit message, else the
    /// scenario's opening, else the backend default.
    pub fn opening_line(&self) -> Option<&str> {
        match self {
            Self::Welcome { message, scenario } => Some(
                message
                    .as_deref()
                    .filter(|m| !m.trim().is_empty())
                    .or_else(|| scenario.as_ref().and_then(|s| s.opening.as_deref()))
                    .unwrap_or(DEFAULT_OPENING),
            ),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::AiResponse { .. } => "ai_response",
            Self::SessionEnded => "session_ended",
            Self::Error { .. } => "error",
        }
    }
}

/// Subset of the scenario record embedded in `welcome`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WelcomeScenario {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub opening: Option<String>,
}

/// Hidden per-turn analysis attached to `ai_response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default)]
    pub turn_number: u32,
    #[serde(default)]
    pub clarity_score: Option<f64>,
    #[serde(default)]
    pub structure_score: Option<f64>,
    #[serde(default)]
    pub persuasiveness_score: Option<f64>,
    #[serde(default)]
    pub vocabulary_score: Option<f64>,
    #[serde(default)]
    pub filler_words: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub areas_to_improve: Vec<String>,
    #[serde(default)]
    pub tone_analysis: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

// ── Client → Server messages ──────────────────────────────────────

/// Messages sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Finalized turn text. Never empty.
    UserAudioTranscript { text: String },
    /// Explicit termination notice, sent before the REST end-session call.
    EndSession,
}

impl OutboundMessage {
    /// Build a transcript message, substituting `fallback` for blank input.
    pub fn transcript(raw: &str, fallback: &str) -> Self {
        let trimmed = raw.trim();
        let text = if trimmed.is_empty() { fallback } else { trimmed };
        Self::UserAudioTranscript {
            text: text.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserAudioTranscript { .. } => "user_audio_transcript",
            Self::EndSession => "end_session",
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unrecognized message (type {kind:?}): {source}")]
    Unrecognized {
        kind: Option<String>,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    serde_json::from_value(value).map_err(|source| ProtocolError::Unrecognized { kind, source })
}
