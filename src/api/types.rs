//! REST payloads exchanged with the practice backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::session::protocol::Analysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Chat,
    Voice,
    Camera,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Voice => "voice",
            Self::Camera => "camera",
        }
    }

    /// Voice and camera sessions run over the live socket.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Voice | Self::Camera)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prebuilt (or generated) practice scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Role the persona plays, e.g. "Friendly Recruiter".
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub opening: Option<String>,
    #[serde(default)]
    pub evaluation_focus: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct GenerateScenarioRequest<'a> {
    pub prompt: &'a str,
}

/// Generation answers 200 even on failure: a placeholder scenario plus
/// `error`, which the backend does not store.
#[derive(Debug, Deserialize)]
pub(crate) struct GeneratedScenario {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub scenario: Scenario,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub vocabulary: Vec<String>,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateSessionRequest {
    pub scenario_id: String,
    pub mode: SessionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub scenario: Scenario,
    #[serde(default)]
    pub session: Option<SessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Stored session with its transcript and per-turn analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub scenario_id: String,
    pub mode: SessionMode,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub analyses: Vec<Analysis>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub session_id: &'a str,
    pub message: &'a str,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub analysis: Option<Analysis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndSessionResponse {
    pub status: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubScores {
    pub clarity: u32,
    pub structure: u32,
    pub persuasiveness: u32,
    pub vocabulary: u32,
}

/// End-of-session report aggregated over all analysed turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub overall_score: u32,
    pub sub_scores: SubScores,
    #[serde(default)]
    pub filler_words: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub closing_message: String,
}

/// The feedback endpoint answers 200 with `{"error": ...}` when nothing was analysed.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum FeedbackBody {
    Unavailable { error: String },
    Report(FeedbackReport),
}

// ── Dashboard ─────────────────────────────────────────────────────

/// Progress aggregated over every ended session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dashboard {
    /// Consecutive days with a session, counting today or yesterday.
    pub current_streak: u32,
    pub avg_score: u32,
    pub total_sessions: u32,
    pub total_hours_spoken: f64,
    /// Percent change in filler words, recent sessions against older ones.
    pub filler_word_trend: i32,
    pub skill_progression: SubScores,
    pub crutch_words: BTreeMap<String, u32>,
    /// At most ten, in the order the backend stores them.
    pub recent_sessions: Vec<SessionSummary>,
}

impl Dashboard {
    /// Crutch words by descending count, ties alphabetical.
    pub fn top_crutch_words(&self, limit: usize) -> Vec<(&str, u32)> {
        let mut words: Vec<_> = self
            .crutch_words
            .iter()
            .map(|(word, count)| (word.as_str(), *count))
            .collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        words.truncate(limit);
        words
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSummary {
    pub id: String,
    pub scenario_id: String,
    pub mode: Option<SessionMode>,
    pub score: u32,
    pub turns: u32,
    pub duration_minutes: f64,
    pub created_at: Option<String>,
}
