//! Audio collaborators of the turn coordinator.
//!
//! Hardware capture, speech recognition and speech synthesis are platform
//! concerns, so the coordinator only sees the traits below. The terminal
//! client plugs in [`console`] adapters; tests plug in fakes.
//!
//! ```text
//!            ┌──────────────┐   level()   ┌─────────────────┐
//! mic ──────▸│ AudioCapture │────────────▸│ SilenceWatchdog │──▸ on_silence
//!            └──────┬───────┘             └─────────────────┘
//!                   │ stop() → AudioClip
//!            ┌──────▼───────┐  push_final / set_interim
//!            │ SpeechToText │────────────▸ SharedTranscript
//!            └──────────────┘
//! ```

pub mod console;
pub mod silence;
pub mod transcript;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use silence::{SilenceConfig, SilenceWatchdog};
pub use transcript::{SharedTranscript, TranscriptBuffer};

// ── Levels ────────────────────────────────────────────────────────

/// Instantaneous signal energy, normalized to `[0, 1]`.
pub trait LevelSource: Send + Sync {
    fn level(&self) -> f32;
}

/// Lock-free level cell written by a producer and sampled by meters.
#[derive(Debug, Clone, Default)]
pub struct MeterLevel(Arc<AtomicU32>);

impl MeterLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        let clamped = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        self.0.store(clamped.to_bits(), Ordering::Relaxed);
    }
}

impl LevelSource for MeterLevel {
    fn level(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

// ── Capture ───────────────────────────────────────────────────────

/// Finalized recording of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Microphone capture session.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Acquire the microphone and begin buffering.
    /// Returns `false` on permission denial or device error.
    async fn start(&self) -> bool;

    /// Release the microphone and finalize buffered audio.
    ///
    /// Implementations may never resolve if the device never acknowledges;
    /// callers go through [`stop_capture`] to bound the wait.
    async fn stop(&self) -> Option<AudioClip>;

    /// Live analyser handle for the watchdog and visualizers.
    fn level_source(&self) -> Arc<dyn LevelSource>;
}

/// Stop `capture`, resolving with `None` if it does not finish within `timeout`.
pub async fn stop_capture(capture: &dyn AudioCapture, timeout: Duration) -> Option<AudioClip> {
    match tokio::time::timeout(timeout, capture.stop()).await {
        Ok(clip) => clip,
        Err(_) => {
            tracing::warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Capture stop not acknowledged, continuing without clip"
            );
            None
        }
    }
}

// ── Recognition ───────────────────────────────────────────────────

/// Continuous background transcription into a shared transcript buffer.
pub trait SpeechToText: Send + Sync {
    /// Begin transcribing into `transcript`. Returns `false` if unavailable.
    fn start(&self, transcript: SharedTranscript) -> bool;
    /// Stop transcribing. Safe to call when not started.
    fn stop(&self);
}

// ── Playback ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Cancelled,
    Failed(String),
}

/// Speech synthesis for persona replies.
#[async_trait]
pub trait SpeechPlayback: Send + Sync {
    /// Speak `text`, resolving on natural end, error, or [`cancel`](Self::cancel).
    async fn speak(&self, text: &str) -> PlaybackOutcome;

    /// Interrupt any active utterance. Must not fail when idle.
    fn cancel(&self);

    /// Synthetic level while speaking, for visualizers.
    fn level_source(&self) -> Option<Arc<dyn LevelSource>> {
        None
    }
}
