//! Silence watchdog.
//!
//! Samples a [`LevelSource`] at frame cadence and fires a callback once
//! the level has stayed below a threshold for a continuous duration.
//! One callback per attachment; a new [`SilenceWatchdog::attach`] re-arms.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::LevelSource;
use crate::config::TurnSettings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceConfig {
    /// Normalized energy below which a sample counts as silent.
    pub threshold: f32,
    /// Continuous quiet required before firing.
    pub duration: Duration,
    pub sample_interval: Duration,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.04,
            duration: Duration::from_millis(2000),
            sample_interval: Duration::from_millis(16),
        }
    }
}

impl From<&TurnSettings> for SilenceConfig {
    fn from(settings: &TurnSettings) -> Self {
        Self {
            threshold: settings.silence_threshold,
            duration: Duration::from_millis(settings.silence_duration_ms),
            sample_interval: Duration::from_millis(settings.sample_interval_ms.max(1)),
        }
    }
}

pub struct SilenceWatchdog {
    config: SilenceConfig,
    task: Option<JoinHandle<()>>,
}

impl SilenceWatchdog {
    pub fn new(config: SilenceConfig) -> Self {
        Self { config, task: None }
    }

    /// Whether a sampling loop is live (attached and not yet fired).
    pub fn is_attached(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start sampling `source`. No-op returning `false` while a loop is live.
    pub fn attach<F>(&mut self, source: Arc<dyn LevelSource>, on_silence: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_attached() {
            tracing::debug!("Silence watchdog already attached");
            return false;
        }
        let config = self.config;
        self.task = Some(tokio::spawn(sample_until_silent(source, config, on_silence)));
        true
    }

    /// Stop sampling. Safe when not attached.
    pub fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SilenceWatchdog {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn sample_until_silent<F>(source: Arc<dyn LevelSource>, config: SilenceConfig, on_silence: F)
where
    F: FnOnce(),
{
    let mut interval = tokio::time::interval(config.sample_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut quiet_since: Option<Instant> = None;

    loop {
        interval.tick().await;
        if source.level() >= config.threshold {
            quiet_since = None;
            continue;
        }
        let since = *quiet_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= config.duration {
            tracing::debug!(
                quiet_ms = u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Sustained silence detected"
            );
            on_silence();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MeterLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        let make = move || {
            let fired = Arc::clone(&handle);
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_sustained_silence() {
        let level = MeterLevel::new();
        let (fired, callback) = counter();
        let mut watchdog = SilenceWatchdog::new(SilenceConfig::default());

        assert!(watchdog.attach(Arc::new(level.clone()), callback()));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Dips after firing do not fire again without a new attach.
        level.set(0.5);
        tokio::time::sleep(Duration::from_millis(100)).await;
        level.set(0.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_attached());
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_while_attached_is_noop() {
        let level = MeterLevel::new();
        let (fired, callback) = counter();
        let mut watchdog = SilenceWatchdog::new(SilenceConfig::default());

        assert!(watchdog.attach(Arc::new(level.clone()), callback()));
        assert!(!watchdog.attach(Arc::new(level.clone()), callback()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn speech_resets_the_quiet_window() {
        let level = MeterLevel::new();
        let (fired, callback) = counter();
        let mut watchdog = SilenceWatchdog::new(SilenceConfig::default());
        watchdog.attach(Arc::new(level.clone()), callback());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            level.set(0.3);
            tokio::time::sleep(Duration::from_millis(50)).await;
            level.set(0.01);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_prevents_fire_and_attach_rearms() {
        let level = MeterLevel::new();
        let (fired, callback) = counter();
        let mut watchdog = SilenceWatchdog::new(SilenceConfig::default());

        watchdog.attach(Arc::new(level.clone()), callback());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        watchdog.detach();
        watchdog.detach();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(watchdog.attach(Arc::new(level.clone()), callback()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(watchdog.attach(Arc::new(level), callback()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
