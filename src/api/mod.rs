//! REST client for the practice backend.
//!
//! Scenario and persona catalogue (including generated scenarios), session
//! lifecycle, text chat, the end-of-session feedback report and the
//! progress dashboard. Every request carries the configured
//! deadline; failures map onto [`ApiError`] with the uniform
//! `"<message> (status: <code>)"` rendering for non-2xx answers.

pub mod types;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::session::runner::SessionBackend;
pub use types::{
    ChatMessage, ChatReply, CreateSessionRequest, CreateSessionResponse, Dashboard,
    EndSessionResponse, FeedbackReport, Persona, Scenario, SessionMode, SessionRecord,
    SessionSummary, SubScores,
};
use types::{ChatRequest, FeedbackBody, GenerateScenarioRequest, GeneratedScenario};

/// Message used when an error body carries no `detail`.
const GENERIC_FAILURE: &str = "Request failed";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message} (status: {status})")]
    Status { message: String, status: u16 },
    #[error("request timed out after {} s", after.as_secs_f32())]
    Timeout { after: Duration },
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

// ── Client ────────────────────────────────────────────────────────

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        Self::with_timeout(config.api_origin(), config.request_timeout())
    }

    pub fn with_timeout(api_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Transport)?;
        Ok(Self {
            base: api_url.trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    // ── Scenarios & personas ─────────────────────────────────────

    pub async fn list_scenarios(
        &self,
        category: Option<&str>,
        difficulty: Option<&str>,
    ) -> Result<Vec<Scenario>, ApiError> {
        let mut query = Vec::new();
        if let Some(category) = category {
            query.push(("category", category));
        }
        if let Some(difficulty) = difficulty {
            query.push(("difficulty", difficulty));
        }
        self.execute(self.http.get(self.url("/api/scenarios")).query(&query))
            .await
    }

    pub async fn get_scenario(&self, scenario_id: &str) -> Result<Scenario, ApiError> {
        let path = format!("/api/scenarios/{}", urlencoding::encode(scenario_id));
        self.execute(self.http.get(self.url(&path))).await
    }

    /// Have the backend write a custom scenario from a free-text description
    /// and add it to the catalogue.
    pub async fn generate_scenario(&self, prompt: &str) -> Result<Scenario, ApiError> {
        let body = GenerateScenarioRequest {
            prompt: prompt.trim(),
        };
        let generated: GeneratedScenario = self
            .execute(self.http.post(self.url("/api/scenarios/generate")).json(&body))
            .await?;
        if let Some(error) = generated.error {
            tracing::warn!(error = %error, "Scenario generation failed");
            return Err(ApiError::Unavailable(error));
        }
        tracing::info!(scenario_id = %generated.scenario.id, "Scenario generated");
        Ok(generated.scenario)
    }

    /// Personas keyed by persona key.
    pub async fn list_personas(&self) -> Result<BTreeMap<String, Persona>, ApiError> {
        self.execute(self.http.get(self.url("/api/personas"))).await
    }

    pub async fn get_persona(&self, key: &str) -> Result<Persona, ApiError> {
        let path = format!("/api/personas/{}", urlencoding::encode(key));
        self.execute(self.http.get(self.url(&path))).await
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, ApiError> {
        let created: CreateSessionResponse = self
            .execute(self.http.post(self.url("/api/sessions")).json(request))
            .await?;
        tracing::info!(
            session_id = %created.session_id,
            scenario_id = %request.scenario_id,
            mode = %request.mode,
            "Session created"
        );
        Ok(created)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, ApiError> {
        let path = format!("/api/sessions/{}", urlencoding::encode(session_id));
        self.execute(self.http.get(self.url(&path))).await
    }

    /// Text-mode turn.
    pub async fn send_chat_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<ChatReply, ApiError> {
        let body = ChatRequest {
            session_id,
            message,
        };
        self.execute(self.http.post(self.url("/api/chat")).json(&body))
            .await
    }

    pub async fn end_session(&self, session_id: &str) -> Result<EndSessionResponse, ApiError> {
        let path = format!("/api/sessions/{}/end", urlencoding::encode(session_id));
        let ended: EndSessionResponse = self.execute(self.http.post(self.url(&path))).await?;
        tracing::info!(session_id = %session_id, status = %ended.status, "Session ended");
        Ok(ended)
    }

    pub async fn get_feedback(&self, session_id: &str) -> Result<FeedbackReport, ApiError> {
        let path = format!("/api/sessions/{}/feedback", urlencoding::encode(session_id));
        match self.execute(self.http.get(self.url(&path))).await? {
            FeedbackBody::Report(report) => Ok(report),
            FeedbackBody::Unavailable { error } => Err(ApiError::Unavailable(error)),
        }
    }

    // ── Progress ─────────────────────────────────────────────────

    pub async fn get_dashboard(&self) -> Result<Dashboard, ApiError> {
        self.execute(self.http.get(self.url("/api/dashboard"))).await
    }

    // ── Transport ────────────────────────────────────────────────

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let resp = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let message = error_message(&body);
            tracing::warn!(status = status.as_u16(), message = %message, "API request failed");
            return Err(ApiError::Status {
                message,
                status: status.as_u16(),
            });
        }

        serde_json::from_slice(&body).map_err(ApiError::Decode)
    }

    fn transport_error(&self, error: reqwest::Error) -> ApiError {
        if error.is_timeout() {
            let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(timeout_ms, "API request timed out");
            ApiError::Timeout {
                after: self.timeout,
            }
        } else {
            ApiError::Transport(error)
        }
    }
}

/// Pull a human message out of an error body (`{"detail": ...}`).
fn error_message(body: &[u8]) -> String {
    let value: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
    let message = match value.get("detail") {
        Some(serde_json::Value::String(detail)) => detail.trim().to_string(),
        // Validation errors: [{"msg": ...}, ...]
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
            .collect::<Vec<_>>()
            .join("; "),
        _ => value
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .trim()
            .to_string(),
    };
    if message.is_empty() {
        GENERIC_FAILURE.to_string()
    } else {
        message
    }
}

#[async_trait]
impl SessionBackend for ApiClient {
    async fn end_session(&self, session_id: &str) -> Result<(), ApiError> {
        ApiClient::end_session(self, session_id).await.map(|_| ())
    }
}
