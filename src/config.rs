//! Client configuration.
//!
//! Defaults are compiled in; an optional TOML file and the
//! `ARTICULOTOR_API_URL` environment variable are layered on top.
//!
//! ```toml
//! api_url = "https://api.articulotor.app"
//! request_timeout_secs = 10
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 16000
//! max_retries = 5
//!
//! [turn]
//! silence_threshold = 0.04
//! silence_duration_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::backoff::ReconnectPolicy;

/// Local development backend.
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Environment variable that overrides [`ClientConfig::api_url`].
pub const API_URL_ENV: &str = "ARTICULOTOR_API_URL";

/// Sent in place of an empty transcript so the backend always receives user input.
pub const DEFAULT_FALLBACK_TRANSCRIPT: &str = "(The user stayed silent.)";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid API origin {0:?}: expected an http:// or https:// URL with a host")]
    InvalidOrigin(String),
}

// ── Settings ──────────────────────────────────────────────────────

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base API origin, e.g. `http://localhost:8000`.
    pub api_url: String,
    /// Deadline for each REST request.
    pub request_timeout_secs: u64,
    pub reconnect: ReconnectSettings,
    pub turn: TurnSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: 10,
            reconnect: ReconnectSettings::default(),
            turn: TurnSettings::default(),
        }
    }
}

/// Socket reconnection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
            max_retries: 5,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            cap: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Turn-taking tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// Normalized energy in `[0, 1]` below which input counts as silence.
    pub silence_threshold: f32,
    /// How long silence must last before a hold-mode turn auto-submits.
    pub silence_duration_ms: u64,
    /// Level sampling cadence (one animation frame).
    pub sample_interval_ms: u64,
    /// Upper bound on waiting for the capture device to finalize.
    pub capture_stop_timeout_ms: u64,
    pub fallback_transcript: String,
    /// Also auto-submit toggle-mode turns on silence.
    pub toggle_auto_stop: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            silence_threshold: 0.04,
            silence_duration_ms: 2000,
            sample_interval_ms: 16,
            capture_stop_timeout_ms: 5000,
            fallback_transcript: DEFAULT_FALLBACK_TRANSCRIPT.to_string(),
            toggle_auto_stop: false,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl ClientConfig {
    /// Load configuration: defaults, then the TOML file, then the environment.
    ///
    /// With `path == None` the per-user config file is used when it exists;
    /// an explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<config_dir>/articulotor/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "articulotor", "articulotor")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.api_url = url.to_string();
            }
        }
    }

    /// The REST client needs an `http(s)` origin; the socket origin is derived from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = self.api_origin();
        let host = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"));
        match host {
            Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
            _ => Err(ConfigError::InvalidOrigin(self.api_url.clone())),
        }
    }

    /// API origin without trailing slashes.
    pub fn api_origin(&self) -> &str {
        self.api_url.trim().trim_end_matches('/')
    }

    /// WebSocket origin derived from the API origin (`http` → `ws`, `https` → `wss`).
    pub fn socket_origin(&self) -> String {
        let origin = self.api_origin();
        match origin.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!("ws://{}", origin.strip_prefix("http://").unwrap_or(origin)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
