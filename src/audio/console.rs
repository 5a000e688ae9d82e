//! Terminal stand-ins for the audio devices.
//!
//! The practice CLI has no microphone: a typed line plays the part of a
//! spoken turn and persona replies are printed at speaking pace.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    AudioCapture, AudioClip, LevelSource, MeterLevel, PlaybackOutcome, SharedTranscript,
    SpeechPlayback, SpeechToText,
};

// ── Capture ───────────────────────────────────────────────────────

/// Always-available capture device whose level stays at zero.
#[derive(Debug, Default)]
pub struct ConsoleCapture {
    level: MeterLevel,
}

impl ConsoleCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioCapture for ConsoleCapture {
    async fn start(&self) -> bool {
        self.level.set(0.0);
        true
    }

    async fn stop(&self) -> Option<AudioClip> {
        None
    }

    fn level_source(&self) -> Arc<dyn LevelSource> {
        Arc::new(self.level.clone())
    }
}

// ── Recognition ───────────────────────────────────────────────────

/// Recognizer fed from typed input.
///
/// Text queued with [`TypedSpeech::queue`] is delivered as a final result
/// when the next turn starts, or immediately if a turn is already live.
#[derive(Debug, Default)]
pub struct TypedSpeech {
    inner: Mutex<TypedInner>,
}

#[derive(Debug, Default)]
struct TypedInner {
    pending: Vec<String>,
    active: Option<SharedTranscript>,
}

impl TypedSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, text: &str) {
        let mut inner = self.inner.lock();
        match inner.active.as_ref() {
            Some(transcript) => transcript.lock().push_final(text),
            None => inner.pending.push(text.to_string()),
        }
    }
}

impl SpeechToText for TypedSpeech {
    fn start(&self, transcript: SharedTranscript) -> bool {
        let mut inner = self.inner.lock();
        {
            let mut buffer = transcript.lock();
            for text in inner.pending.drain(..) {
                buffer.push_final(&text);
            }
        }
        inner.active = Some(transcript);
        true
    }

    fn stop(&self) {
        self.inner.lock().active = None;
    }
}

// ── Playback ──────────────────────────────────────────────────────

/// Prints replies and holds the "speaking" state for a reading-pace delay.
pub struct ConsolePlayback {
    words_per_second: f32,
    level: MeterLevel,
    current: Mutex<CancellationToken>,
}

impl ConsolePlayback {
    pub fn new(words_per_second: f32) -> Self {
        Self {
            words_per_second: words_per_second.max(0.1),
            level: MeterLevel::new(),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    fn duration_for(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count().max(1) as f32;
        Duration::from_secs_f32(words / self.words_per_second)
    }
}

struct SilenceOnDrop<'a>(&'a MeterLevel);

impl Drop for SilenceOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(0.0);
    }
}

impl Default for ConsolePlayback {
    fn default() -> Self {
        Self::new(3.0)
    }
}

#[async_trait]
impl SpeechPlayback for ConsolePlayback {
    async fn speak(&self, text: &str) -> PlaybackOutcome {
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();

        println!("\n  persona> {text}\n");

        // Also runs when the caller drops this future mid-utterance.
        let _silenced = SilenceOnDrop(&self.level);
        let deadline = tokio::time::Instant::now() + self.duration_for(text);
        let mut meter = tokio::time::interval(Duration::from_millis(50));
        let started = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => break PlaybackOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break PlaybackOutcome::Finished,
                _ = meter.tick() => {
                    let t = started.elapsed().as_secs_f32();
                    self.level.set(0.3 + 0.2 * (t * 12.0).sin().abs());
                }
            }
        }
    }

    fn cancel(&self) {
        self.current.lock().cancel();
    }

    fn level_source(&self) -> Option<Arc<dyn LevelSource>> {
        Some(Arc::new(self.level.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::TranscriptBuffer;

    #[test]
    fn queued_text_lands_in_next_turn() {
        let speech = TypedSpeech::new();
        speech.queue("I shipped the migration");

        let transcript = TranscriptBuffer::shared();
        assert!(speech.start(Arc::clone(&transcript)));
        assert_eq!(transcript.lock().text(), "I shipped the migration");

        speech.queue("on time");
        assert_eq!(transcript.lock().text(), "I shipped the migration on time");

        speech.stop();
        speech.queue("later");
        assert_eq!(transcript.lock().text(), "I shipped the migration on time");
    }

    #[tokio::test(start_paused = true)]
    async fn playback_runs_for_reading_time() {
        let playback = ConsolePlayback::new(2.0);
        let started = tokio::time::Instant::now();
        let outcome = playback.speak("one two three four").await;
        assert_eq!(outcome, PlaybackOutcome::Finished);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(playback.level_source().unwrap().level(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_playback() {
        let playback = Arc::new(ConsolePlayback::new(1.0));
        let speaking = {
            let playback = Arc::clone(&playback);
            tokio::spawn(async move { playback.speak("a long long long reply").await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        playback.cancel();
        assert_eq!(speaking.await.unwrap(), PlaybackOutcome::Cancelled);

        // Cancelling while idle is harmless.
        playback.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_playback_resets_level() {
        let playback = Arc::new(ConsolePlayback::new(1.0));
        let level = playback.level_source().unwrap();
        let token = CancellationToken::new();
        let speaking = {
            let playback = Arc::clone(&playback);
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => PlaybackOutcome::Cancelled,
                    outcome = playback.speak("a long long long reply") => outcome,
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(level.level() > 0.0);

        token.cancel();
        assert_eq!(speaking.await.unwrap(), PlaybackOutcome::Cancelled);
        assert_eq!(level.level(), 0.0);
    }
}
