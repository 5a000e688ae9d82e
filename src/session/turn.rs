//! Turn coordinator: one conversational turn from user input to AI reply.
//!
//! ```text
//!  Idle ──start──▸ Listening ──stop / silence──▸ Processing ──ai_response──▸ Speaking
//!   ▲                  ▲                                                       │
//!   │                  └──────────────────start (interrupts playback)──────────┤
//!   └──────────────────────────────playback done───────────────────────────────┘
//! ```
//!
//! A socket close while `Processing` returns to `Idle`: the reply can
//! only arrive on the connection that took the transcript.
//!
//! The coordinator owns every device handle, so microphone capture and
//! speech playback can never overlap: capture is open only in `Listening`,
//! playback runs only in `Speaking`.
//!
//! Timer and playback completions come back as [`TurnSignal`]s that the
//! owning event loop feeds into [`TurnCoordinator::handle_signal`], keeping
//! all state changes on one task.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{Analysis, InboundMessage, OutboundMessage};
use super::socket::MessageSink;
use crate::audio::{
    stop_capture, AudioCapture, PlaybackOutcome, SharedTranscript, SilenceConfig,
    SilenceWatchdog, SpeechPlayback, SpeechToText, TranscriptBuffer,
};
use crate::config::{TurnSettings, DEFAULT_FALLBACK_TRANSCRIPT};

// ── States ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Capture while pressed; release or sustained silence submits.
    Hold,
    /// First activation starts, second submits.
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening { mode: InputMode },
    /// Waiting for the reply. `delivered` is false when the transcript was
    /// dropped because the socket was not open.
    Processing { delivered: bool },
    Speaking,
}

impl TurnState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening { .. } => "listening",
            Self::Processing { .. } => "processing",
            Self::Speaking => "speaking",
        }
    }

    /// A user turn is in flight (ending the session needs confirmation).
    pub fn is_turn_active(&self) -> bool {
        matches!(self, Self::Listening { .. } | Self::Processing { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("microphone unavailable (permission denied or device error)")]
    CaptureUnavailable,
    #[error("speech recognition unavailable")]
    RecognizerUnavailable,
    #[error("a reply is still pending")]
    Busy,
}

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TurnConfig {
    pub silence: SilenceConfig,
    pub capture_stop_timeout: Duration,
    pub fallback_transcript: String,
    pub toggle_auto_stop: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self::from(&TurnSettings::default())
    }
}

impl From<&TurnSettings> for TurnConfig {
    fn from(settings: &TurnSettings) -> Self {
        let fallback = settings.fallback_transcript.trim();
        Self {
            silence: SilenceConfig::from(settings),
            capture_stop_timeout: Duration::from_millis(settings.capture_stop_timeout_ms),
            fallback_transcript: if fallback.is_empty() {
                DEFAULT_FALLBACK_TRANSCRIPT.to_string()
            } else {
                fallback.to_string()
            },
            toggle_auto_stop: settings.toggle_auto_stop,
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// Running speech metrics accumulated from per-turn analyses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeechMetrics {
    pub filler_word_count: usize,
    pub last_clarity: Option<f64>,
    pub average_clarity: Option<f64>,
    pub clarity_samples: u32,
    pub analyzed_turns: u32,
}

impl SpeechMetrics {
    pub fn record(&mut self, analysis: &Analysis) {
        self.analyzed_turns += 1;
        self.filler_word_count += analysis.filler_words.len();
        if let Some(clarity) = analysis.clarity_score {
            self.clarity_samples += 1;
            let previous = self.average_clarity.unwrap_or(0.0);
            let n = f64::from(self.clarity_samples);
            self.average_clarity = Some(previous + (clarity - previous) / n);
            self.last_clarity = Some(clarity);
        }
    }
}

// ── Devices and signals ───────────────────────────────────────────

#[derive(Clone)]
pub struct TurnDevices {
    pub capture: Arc<dyn AudioCapture>,
    pub recognizer: Arc<dyn SpeechToText>,
    pub playback: Arc<dyn SpeechPlayback>,
}

/// Completion notice from a watchdog or playback task.
#[derive(Debug)]
pub struct TurnSignal(Signal);

#[derive(Debug)]
enum Signal {
    Silence { turn: u64 },
    PlaybackDone { ticket: u64, outcome: PlaybackOutcome },
}

// ── Coordinator ───────────────────────────────────────────────────

pub struct TurnCoordinator {
    config: TurnConfig,
    devices: TurnDevices,
    sink: Arc<dyn MessageSink>,
    state: TurnState,
    transcript: SharedTranscript,
    watchdog: SilenceWatchdog,
    metrics: SpeechMetrics,
    last_ai_text: Option<String>,
    welcome_played: bool,
    /// Opening line held back while the microphone is open.
    pending_welcome: Option<String>,
    /// Incremented per started turn; stale silence signals are ignored.
    turn: u64,
    /// Incremented per utterance; stale playback completions are ignored.
    playback_ticket: u64,
    playback_cancel: Option<CancellationToken>,
    playback_task: Option<JoinHandle<()>>,
    signals_tx: mpsc::UnboundedSender<TurnSignal>,
    signals_rx: mpsc::UnboundedReceiver<TurnSignal>,
}

impl TurnCoordinator {
    pub fn new(config: TurnConfig, devices: TurnDevices, sink: Arc<dyn MessageSink>) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            watchdog: SilenceWatchdog::new(config.silence),
            config,
            devices,
            sink,
            state: TurnState::Idle,
            transcript: TranscriptBuffer::shared(),
            metrics: SpeechMetrics::default(),
            last_ai_text: None,
            welcome_played: false,
            pending_welcome: None,
            turn: 0,
            playback_ticket: 0,
            playback_cancel: None,
            playback_task: None,
            signals_tx,
            signals_rx,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn metrics(&self) -> &SpeechMetrics {
        &self.metrics
    }

    pub fn last_ai_text(&self) -> Option<&str> {
        self.last_ai_text.as_deref()
    }

    pub fn welcome_played(&self) -> bool {
        self.welcome_played
    }

    /// Next watchdog or playback completion. Pending forever if none is due.
    pub async fn next_signal(&mut self) -> TurnSignal {
        match self.signals_rx.recv().await {
            Some(signal) => signal,
            // The coordinator holds a sender, so the channel cannot close.
            None => std::future::pending().await,
        }
    }

    pub async fn handle_signal(&mut self, signal: TurnSignal) {
        match signal.0 {
            Signal::Silence { turn } => {
                if turn == self.turn && matches!(self.state, TurnState::Listening { .. }) {
                    tracing::info!(turn, "Silence detected, submitting turn");
                    self.stop_turn().await;
                } else {
                    tracing::debug!(turn, current = self.turn, "Ignoring stale silence signal");
                }
            }
            Signal::PlaybackDone { ticket, outcome } => {
                if ticket != self.playback_ticket {
                    return;
                }
                self.playback_cancel = None;
                self.playback_task = None;
                if let PlaybackOutcome::Failed(reason) = &outcome {
                    tracing::warn!(reason = %reason, "Speech playback failed");
                }
                if self.state == TurnState::Speaking {
                    tracing::debug!(?outcome, "Playback finished");
                    self.state = TurnState::Idle;
                }
            }
        }
    }

    // ── Turn lifecycle ────────────────────────────────────────────

    /// Begin capturing a user turn.
    ///
    /// Allowed from `Idle` and `Speaking` (interrupting playback). A second
    /// start while listening is a no-op.
    pub async fn start_turn(&mut self, mode: InputMode) -> Result<(), TurnError> {
        match self.state {
            TurnState::Listening { .. } => {
                tracing::debug!("Turn already listening");
                return Ok(());
            }
            TurnState::Processing { .. } => return Err(TurnError::Busy),
            TurnState::Idle | TurnState::Speaking => {}
        }

        // Playback must be silenced before the microphone opens.
        self.cancel_playback();
        self.watchdog.detach();
        self.transcript.lock().clear();

        if !self.devices.capture.start().await {
            tracing::warn!("Microphone capture could not start");
            self.state = TurnState::Idle;
            return Err(TurnError::CaptureUnavailable);
        }
        if !self.devices.recognizer.start(Arc::clone(&self.transcript)) {
            tracing::warn!("Speech recognition could not start");
            stop_capture(&*self.devices.capture, self.config.capture_stop_timeout).await;
            self.state = TurnState::Idle;
            return Err(TurnError::RecognizerUnavailable);
        }

        self.turn += 1;
        if mode == InputMode::Hold || self.config.toggle_auto_stop {
            let signals = self.signals_tx.clone();
            let turn = self.turn;
            self.watchdog
                .attach(self.devices.capture.level_source(), move || {
                    let _ = signals.send(TurnSignal(Signal::Silence { turn }));
                });
        }

        self.state = TurnState::Listening { mode };
        tracing::info!(turn = self.turn, ?mode, "Turn started");
        Ok(())
    }

    /// Finish the current turn and submit its transcript.
    ///
    /// Returns `false` when no turn was listening.
    pub async fn stop_turn(&mut self) -> bool {
        if !matches!(self.state, TurnState::Listening { .. }) {
            tracing::debug!(state = self.state.label(), "No turn to stop");
            return false;
        }

        self.watchdog.detach();
        let clip = stop_capture(&*self.devices.capture, self.config.capture_stop_timeout).await;
        self.devices.recognizer.stop();

        let text = self.transcript.lock().take();
        let message = OutboundMessage::transcript(&text, &self.config.fallback_transcript);
        let delivered = self.sink.send(&message);
        if delivered {
            tracing::info!(
                turn = self.turn,
                chars = text.len(),
                clip_bytes = clip.as_ref().map_or(0, |c| c.bytes.len()),
                "Turn submitted"
            );
        } else {
            tracing::warn!(turn = self.turn, "Socket not open, transcript dropped");
        }

        self.state = TurnState::Processing { delivered };
        if let Some(text) = self.pending_welcome.take() {
            tracing::debug!("Voicing welcome held during the turn");
            self.play_welcome(text);
        }
        true
    }

    // ── Inbound messages ──────────────────────────────────────────

    pub fn on_message(&mut self, message: &InboundMessage) {
        match message {
            InboundMessage::Welcome { .. } => {
                if self.welcome_played || self.pending_welcome.is_some() {
                    tracing::debug!("Welcome already played for this session");
                    return;
                }
                let text = message.opening_line().unwrap_or_default().to_string();
                self.last_ai_text = Some(text.clone());
                if let TurnState::Listening { .. } = self.state {
                    tracing::debug!("Welcome arrived while listening, held until submission");
                    self.pending_welcome = Some(text);
                } else {
                    self.play_welcome(text);
                }
            }
            InboundMessage::AiResponse { text, analysis } => {
                if let Some(analysis) = analysis {
                    self.metrics.record(analysis);
                }
                self.last_ai_text = Some(text.clone());
                if let TurnState::Listening { .. } = self.state {
                    tracing::debug!("Reply arrived while listening, not voiced");
                    return;
                }
                if text.trim().is_empty() {
                    self.cancel_playback();
                    self.state = TurnState::Idle;
                } else {
                    self.begin_playback(text.clone());
                }
            }
            InboundMessage::SessionEnded | InboundMessage::Error { .. } => {}
        }
    }

    /// The socket reopened. A dropped submission can never be answered.
    pub fn on_reconnected(&mut self) {
        if self.state == (TurnState::Processing { delivered: false }) {
            tracing::info!("Socket reopened after a dropped transcript, returning to idle");
            self.state = TurnState::Idle;
        }
    }

    /// The socket closed. Replies only arrive on the connection that took
    /// the transcript, so a pending reply is lost with it.
    pub fn on_connection_lost(&mut self) {
        if let TurnState::Processing { delivered } = self.state {
            tracing::info!(delivered, "Connection lost while awaiting a reply, returning to idle");
            self.state = TurnState::Idle;
        }
    }

    /// Release every resource and return to `Idle`.
    pub async fn teardown(&mut self) {
        self.watchdog.detach();
        self.cancel_playback();
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
        if let TurnState::Listening { .. } = self.state {
            self.devices.recognizer.stop();
            stop_capture(&*self.devices.capture, self.config.capture_stop_timeout).await;
        }
        self.transcript.lock().clear();
        // Unvoiced, so a later welcome may still play.
        self.pending_welcome = None;
        self.state = TurnState::Idle;
    }

    // ── Playback ──────────────────────────────────────────────────

    fn play_welcome(&mut self, text: String) {
        self.welcome_played = true;
        self.begin_playback(text);
    }

    fn begin_playback(&mut self, text: String) {
        self.cancel_playback();
        self.playback_ticket += 1;
        let ticket = self.playback_ticket;

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let playback = Arc::clone(&self.devices.playback);
        let signals = self.signals_tx.clone();
        self.playback_task = Some(tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancelled.cancelled() => PlaybackOutcome::Cancelled,
                outcome = playback.speak(&text) => outcome,
            };
            let _ = signals.send(TurnSignal(Signal::PlaybackDone { ticket, outcome }));
        }));
        self.playback_cancel = Some(token);
        self.state = TurnState::Speaking;
    }

    /// Fire-and-forget interruption of the active utterance.
    fn cancel_playback(&mut self) {
        if let Some(token) = self.playback_cancel.take() {
            token.cancel();
            self.devices.playback.cancel();
        }
    }
}

impl Drop for TurnCoordinator {
    fn drop(&mut self) {
        if let Some(token) = self.playback_cancel.take() {
            token.cancel();
        }
        if let Some(task) = self.playback_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::{AudioClip, LevelSource, MeterLevel};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    pub(crate) type Log = Arc<Mutex<Vec<String>>>;

    pub(crate) struct FakeCapture {
        pub log: Log,
        pub level: MeterLevel,
        pub available: AtomicBool,
        pub hang_on_stop: AtomicBool,
    }

    #[async_trait]
    impl AudioCapture for FakeCapture {
        async fn start(&self) -> bool {
            self.log.lock().push("capture.start".into());
            self.available.load(Ordering::SeqCst)
        }
        async fn stop(&self) -> Option<AudioClip> {
            self.log.lock().push("capture.stop".into());
            if self.hang_on_stop.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            None
        }
        fn level_source(&self) -> Arc<dyn LevelSource> {
            Arc::new(self.level.clone())
        }
    }

    pub(crate) struct FakeRecognizer {
        pub log: Log,
        pub utterance: Mutex<Option<String>>,
    }

    impl SpeechToText for FakeRecognizer {
        fn start(&self, transcript: SharedTranscript) -> bool {
            self.log.lock().push("stt.start".into());
            if let Some(text) = self.utterance.lock().take() {
                transcript.lock().push_final(&text);
            }
            true
        }
        fn stop(&self) {
            self.log.lock().push("stt.stop".into());
        }
    }

    pub(crate) struct FakePlayback {
        pub log: Log,
        pub finish: Notify,
    }

    #[async_trait]
    impl SpeechPlayback for FakePlayback {
        async fn speak(&self, text: &str) -> PlaybackOutcome {
            self.log.lock().push(format!("speak:{text}"));
            self.finish.notified().await;
            PlaybackOutcome::Finished
        }
        fn cancel(&self) {
            self.log.lock().push("playback.cancel".into());
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSink {
        pub closed: AtomicBool,
        pub sent: Mutex<Vec<OutboundMessage>>,
    }

    impl MessageSink for FakeSink {
        fn send(&self, message: &OutboundMessage) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().push(message.clone());
            true
        }
    }

    pub(crate) struct Rig {
        pub log: Log,
        pub capture: Arc<FakeCapture>,
        pub recognizer: Arc<FakeRecognizer>,
        pub playback: Arc<FakePlayback>,
    }

    impl Rig {
        pub fn new() -> Self {
            let log: Log = Arc::default();
            Self {
                capture: Arc::new(FakeCapture {
                    log: Arc::clone(&log),
                    level: MeterLevel::new(),
                    available: AtomicBool::new(true),
                    hang_on_stop: AtomicBool::new(false),
                }),
                recognizer: Arc::new(FakeRecognizer {
                    log: Arc::clone(&log),
                    utterance: Mutex::new(None),
                }),
                playback: Arc::new(FakePlayback {
                    log: Arc::clone(&log),
                    finish: Notify::new(),
                }),
                log,
            }
        }

        pub fn devices(&self) -> TurnDevices {
            TurnDevices {
                capture: self.capture.clone(),
                recognizer: self.recognizer.clone(),
                playback: self.playback.clone(),
            }
        }

        pub fn say(&self, text: &str) {
            *self.recognizer.utterance.lock() = Some(text.to_string());
        }

        pub fn position(&self, entry: &str) -> Option<usize> {
            self.log.lock().iter().position(|e| e == entry)
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    fn coordinator(rig: &Rig) -> (TurnCoordinator, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        let turn = TurnCoordinator::new(TurnConfig::default(), rig.devices(), sink.clone());
        (turn, sink)
    }

    fn reply(text: &str) -> InboundMessage {
        InboundMessage::AiResponse {
            text: text.into(),
            analysis: None,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test]
    async fn hold_turn_submits_trimmed_transcript() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);
        rig.say("  I led the launch. ");

        turn.start_turn(InputMode::Hold).await.unwrap();
        assert_eq!(
            turn.state(),
            TurnState::Listening {
                mode: InputMode::Hold
            }
        );

        assert!(turn.stop_turn().await);
        assert_eq!(turn.state(), TurnState::Processing { delivered: true });
        assert_eq!(
            sink.sent.lock().as_slice(),
            &[OutboundMessage::UserAudioTranscript {
                text: "I led the launch.".into()
            }]
        );
        assert!(turn.transcript.lock().is_empty());
        assert!(rig.position("capture.stop").unwrap() < rig.position("stt.stop").unwrap());
    }

    #[tokio::test]
    async fn empty_transcript_sends_fallback_verbatim() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);

        turn.start_turn(InputMode::Toggle).await.unwrap();
        turn.stop_turn().await;

        assert_eq!(
            sink.sent.lock().as_slice(),
            &[OutboundMessage::UserAudioTranscript {
                text: DEFAULT_FALLBACK_TRANSCRIPT.into()
            }]
        );
    }

    #[tokio::test]
    async fn starting_a_turn_cancels_playback_before_capture() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);

        turn.on_message(&reply("Tell me more."));
        assert_eq!(turn.state(), TurnState::Speaking);
        settle().await;
        assert_eq!(rig.count("speak:"), 1);

        turn.start_turn(InputMode::Hold).await.unwrap();
        let cancel = rig.position("playback.cancel").unwrap();
        let capture = rig.position("capture.start").unwrap();
        assert!(cancel < capture);

        // The interrupted utterance's completion does not disturb the new turn.
        let signal = turn.next_signal().await;
        turn.handle_signal(signal).await;
        assert!(matches!(turn.state(), TurnState::Listening { .. }));
    }

    #[tokio::test]
    async fn reply_is_spoken_then_returns_to_idle() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);
        turn.start_turn(InputMode::Toggle).await.unwrap();
        turn.stop_turn().await;

        turn.on_message(&InboundMessage::AiResponse {
            text: "Why did you leave?".into(),
            analysis: Some(Analysis {
                clarity_score: Some(80.0),
                filler_words: vec!["um".into(), "uh".into()],
                ..Analysis::default()
            }),
        });
        assert_eq!(turn.state(), TurnState::Speaking);
        assert_eq!(turn.last_ai_text(), Some("Why did you leave?"));
        assert_eq!(turn.metrics().filler_word_count, 2);
        assert_eq!(turn.metrics().last_clarity, Some(80.0));

        settle().await;
        rig.playback.finish.notify_one();
        let signal = turn.next_signal().await;
        turn.handle_signal(signal).await;
        assert_eq!(turn.state(), TurnState::Idle);
        assert_eq!(rig.count("speak:Why did you leave?"), 1);
    }

    #[tokio::test]
    async fn welcome_plays_once() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);
        let welcome = InboundMessage::Welcome {
            message: Some("Thanks for coming in.".into()),
            scenario: None,
        };

        turn.on_message(&welcome);
        settle().await;
        rig.playback.finish.notify_one();
        let signal = turn.next_signal().await;
        turn.handle_signal(signal).await;

        turn.on_reconnected();
        turn.on_message(&welcome);
        settle().await;

        assert!(turn.welcome_played());
        assert_eq!(rig.count("speak:"), 1);
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn welcome_after_submission_is_voiced() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);
        turn.start_turn(InputMode::Toggle).await.unwrap();
        turn.stop_turn().await;

        turn.on_message(&InboundMessage::Welcome {
            message: Some("Welcome aboard.".into()),
            scenario: None,
        });
        assert!(turn.welcome_played());
        assert_eq!(turn.state(), TurnState::Speaking);
        settle().await;
        assert_eq!(rig.count("speak:Welcome aboard."), 1);

        // The pending reply still takes over the speaker.
        turn.on_message(&reply("So, tell me about yourself."));
        settle().await;
        assert_eq!(rig.count("speak:So, tell me about yourself."), 1);
    }

    #[tokio::test]
    async fn welcome_while_listening_waits_for_submission() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);
        let welcome = InboundMessage::Welcome {
            message: Some("Thanks for coming in.".into()),
            scenario: None,
        };

        turn.start_turn(InputMode::Hold).await.unwrap();
        turn.on_message(&welcome);
        turn.on_message(&welcome);
        settle().await;
        assert!(!turn.welcome_played());
        assert_eq!(rig.count("speak:"), 0);
        assert!(matches!(turn.state(), TurnState::Listening { .. }));

        turn.stop_turn().await;
        settle().await;
        assert!(turn.welcome_played());
        assert_eq!(sink.sent.lock().len(), 1);
        assert_eq!(rig.count("speak:Thanks for coming in."), 1);
        let spoken = rig.position("speak:Thanks for coming in.").unwrap();
        assert!(rig.position("capture.stop").unwrap() < spoken);
    }

    #[tokio::test]
    async fn held_welcome_is_dropped_on_teardown() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);
        let welcome = InboundMessage::Welcome {
            message: None,
            scenario: None,
        };

        turn.start_turn(InputMode::Hold).await.unwrap();
        turn.on_message(&welcome);
        turn.teardown().await;
        settle().await;
        assert_eq!(rig.count("speak:"), 0);
        assert!(!turn.welcome_played());

        // The next connection's welcome is still voiced.
        turn.on_message(&welcome);
        settle().await;
        assert_eq!(rig.count("speak:Hello. Let's begin."), 1);
    }

    #[tokio::test]
    async fn lost_connection_releases_pending_reply() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);

        turn.start_turn(InputMode::Toggle).await.unwrap();
        turn.stop_turn().await;
        assert_eq!(turn.state(), TurnState::Processing { delivered: true });
        assert_eq!(turn.start_turn(InputMode::Toggle).await, Err(TurnError::Busy));

        turn.on_connection_lost();
        assert_eq!(turn.state(), TurnState::Idle);

        turn.start_turn(InputMode::Toggle).await.unwrap();
        turn.stop_turn().await;
        assert_eq!(sink.sent.lock().len(), 2);
        assert_eq!(rig.count("capture.start"), 2);
    }

    #[tokio::test]
    async fn lost_connection_leaves_other_states_alone() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);

        turn.start_turn(InputMode::Hold).await.unwrap();
        turn.on_connection_lost();
        assert!(matches!(turn.state(), TurnState::Listening { .. }));

        turn.stop_turn().await;
        turn.on_message(&reply("Go on."));
        turn.on_connection_lost();
        assert_eq!(turn.state(), TurnState::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_mode_auto_submits_after_silence() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);

        let started = tokio::time::Instant::now();
        turn.start_turn(InputMode::Hold).await.unwrap();
        let signal = turn.next_signal().await;
        assert!(started.elapsed() >= Duration::from_millis(2000));
        turn.handle_signal(signal).await;

        assert_eq!(turn.state(), TurnState::Processing { delivered: true });
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mode_has_no_silence_stop_by_default() {
        let rig = Rig::new();
        let (mut turn, _sink) = coordinator(&rig);

        turn.start_turn(InputMode::Toggle).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(10), turn.next_signal()).await;
        assert!(waited.is_err());
        assert!(matches!(turn.state(), TurnState::Listening { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_auto_stop_can_be_enabled() {
        let rig = Rig::new();
        let sink = Arc::new(FakeSink::default());
        let config = TurnConfig {
            toggle_auto_stop: true,
            ..TurnConfig::default()
        };
        let mut turn = TurnCoordinator::new(config, rig.devices(), sink.clone());

        turn.start_turn(InputMode::Toggle).await.unwrap();
        let signal = turn.next_signal().await;
        turn.handle_signal(signal).await;
        assert_eq!(turn.state(), TurnState::Processing { delivered: true });
    }

    #[tokio::test]
    async fn capture_failure_returns_to_idle() {
        let rig = Rig::new();
        rig.capture.available.store(false, Ordering::SeqCst);
        let (mut turn, _sink) = coordinator(&rig);

        assert_eq!(
            turn.start_turn(InputMode::Hold).await,
            Err(TurnError::CaptureUnavailable)
        );
        assert_eq!(turn.state(), TurnState::Idle);
        assert_eq!(rig.count("stt.start"), 0);
    }

    #[tokio::test]
    async fn closed_socket_drops_transcript_but_still_processes() {
        let rig = Rig::new();
        let (mut turn, sink) = coordinator(&rig);
        sink.closed.store(true, Ordering::SeqCst);
        rig.say("hello");

        turn.start_turn(InputMode::Hold).await.unwrap();
        turn.stop_turn().await;
        assert_eq!(turn.state(), TurnState::Processing { delivered: false });
        assert!(turn.transcript.lock().is_empty());
        assert!(sink.sent.lock().is_empty());

        assert_eq!(turn.start_turn(InputMode::Hold).await, Err(TurnError::Busy));

        turn.on_reconnected();
        assert_eq!(turn.state(), TurnState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_capture_stop_is_bounded() {
        let rig = Rig::new();
        rig.capture.hang_on_stop.store(true, Ordering::SeqCst);
        let (mut turn, sink) = coordinator(&rig);

        turn.start_turn(InputMode::Toggle).await.unwrap();
        let started = tokio::time::Instant::now();
        turn.stop_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert!(started.elapsed() < Duration::from_millis(5100));
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[test]
    fn metrics_keep_running_average() {
        let mut metrics = SpeechMetrics::default();
        for clarity in [60.0, 80.0, 100.0] {
            metrics.record(&Analysis {
                clarity_score: Some(clarity),
                filler_words: vec!["like".into()],
                ..Analysis::default()
            });
        }
        metrics.record(&Analysis::default());

        assert_eq!(metrics.analyzed_turns, 4);
        assert_eq!(metrics.filler_word_count, 3);
        assert_eq!(metrics.last_clarity, Some(100.0));
        assert_eq!(metrics.average_clarity, Some(80.0));
    }
}
