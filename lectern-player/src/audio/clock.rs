//! Headless audio sink
//!
//! Tracks position against the tokio clock without producing sound: loading
//! probes the real duration of the audio, playing schedules the `Ended` event
//! for when the source would finish at the current rate. Used for servers
//! without an audio device and in tests (works with paused tokio time).

use super::{decode, AudioSink, SinkError, SinkEvent, SourceId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct LoadedSource {
    id: SourceId,
    duration: Duration,
}

#[derive(Debug)]
struct ClockState {
    last_source: SourceId,
    source: Option<LoadedSource>,
    rate: f32,
    /// Position when playback last started, paused or seeked
    anchor: Duration,
    /// Set while playing
    started_at: Option<Instant>,
    /// Bumped on every transition; stale end timers compare against it
    epoch: u64,
}

impl ClockState {
    fn position(&self) -> Duration {
        let Some(source) = self.source else {
            return Duration::ZERO;
        };
        let elapsed = self
            .started_at
            .map(|at| at.elapsed().mul_f64(self.rate as f64))
            .unwrap_or_default();
        (self.anchor + elapsed).min(source.duration)
    }
}

pub struct ClockSink {
    state: Arc<Mutex<ClockState>>,
    events: broadcast::Sender<SinkEvent>,
}

impl Default for ClockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(ClockState {
                last_source: 0,
                source: None,
                rate: 1.0,
                anchor: Duration::ZERO,
                started_at: None,
                epoch: 0,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_playing(&self) -> bool {
        self.lock().started_at.is_some()
    }

    /// Arm the end timer for the current epoch
    fn schedule_end(&self, state: &ClockState) {
        let Some(source) = state.source else {
            return;
        };
        let remaining = source
            .duration
            .saturating_sub(state.anchor)
            .div_f64(state.rate.max(f32::EPSILON) as f64);
        let epoch = state.epoch;
        let shared = Arc::clone(&self.state);
        let events = self.events.clone();

        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let ended = {
                let mut state = shared.lock().unwrap_or_else(|p| p.into_inner());
                if state.epoch != epoch || state.started_at.is_none() {
                    return;
                }
                state.anchor = source.duration;
                state.started_at = None;
                state.epoch += 1;
                source.id
            };
            debug!(source = ended, "Clock sink source ended");
            let _ = events.send(SinkEvent::Ended { source: ended });
        });
    }
}

#[async_trait]
impl AudioSink for ClockSink {
    async fn load(&self, audio: Bytes) -> Result<SourceId, SinkError> {
        let duration = decode::probe_duration(&audio)?;
        let mut state = self.lock();
        state.last_source += 1;
        state.source = Some(LoadedSource {
            id: state.last_source,
            duration,
        });
        state.anchor = Duration::ZERO;
        state.started_at = None;
        state.epoch += 1;
        Ok(state.last_source)
    }

    async fn play(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.source.is_none() {
            return Err(SinkError::Rejected("no source loaded".to_string()));
        }
        if state.started_at.is_some() {
            return Ok(());
        }
        state.anchor = state.position();
        state.started_at = Some(Instant::now());
        state.epoch += 1;
        self.schedule_end(&state);
        Ok(())
    }

    async fn pause(&self) {
        let mut state = self.lock();
        if state.started_at.is_some() {
            state.anchor = state.position();
            state.started_at = None;
            state.epoch += 1;
        }
    }

    async fn seek(&self, position: Duration) {
        let mut state = self.lock();
        let Some(source) = state.source else {
            return;
        };
        state.anchor = position.min(source.duration);
        state.epoch += 1;
        if state.started_at.is_some() {
            state.started_at = Some(Instant::now());
            self.schedule_end(&state);
        }
    }

    async fn set_rate(&self, rate: f32) {
        let mut state = self.lock();
        if state.started_at.is_some() {
            state.anchor = state.position();
            state.started_at = Some(Instant::now());
            state.rate = rate;
            state.epoch += 1;
            self.schedule_end(&state);
        } else {
            state.rate = rate;
        }
    }

    async fn position(&self) -> Duration {
        self.lock().position()
    }

    async fn duration(&self) -> Option<Duration> {
        self.lock().source.map(|s| s.duration)
    }

    async fn unload(&self) {
        let mut state = self.lock();
        state.source = None;
        state.anchor = Duration::ZERO;
        state.started_at = None;
        state.epoch += 1;
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for ClockSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSink")
            .field("playing", &self.is_playing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decode::tests::wav_bytes;

    #[tokio::test(start_paused = true)]
    async fn test_play_to_end_emits_ended() {
        let sink = ClockSink::new();
        let mut events = sink.subscribe();

        let source = sink.load(wav_bytes(2000, 8000)).await.unwrap();
        sink.play().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let pos = sink.position().await;
        assert!((pos.as_secs_f64() - 1.0).abs() < 0.01);

        assert_eq!(events.recv().await.unwrap(), SinkEvent::Ended { source });
        assert_eq!(sink.position().await, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_position() {
        let sink = ClockSink::new();
        sink.load(wav_bytes(5000, 8000)).await.unwrap();
        sink.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        sink.pause().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let pos = sink.position().await;
        assert!((pos.as_secs_f64() - 1.5).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_speeds_up_and_seek_clamps() {
        let sink = ClockSink::new();
        let mut events = sink.subscribe();
        let source = sink.load(wav_bytes(4000, 8000)).await.unwrap();

        sink.set_rate(2.0).await;
        sink.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((sink.position().await.as_secs_f64() - 1.0).abs() < 0.01);

        sink.seek(Duration::from_secs(60)).await;
        assert_eq!(sink.position().await, Duration::from_secs(4));
        assert_eq!(events.recv().await.unwrap(), SinkEvent::Ended { source });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_invalidates_old_end_timer() {
        let sink = ClockSink::new();
        let mut events = sink.subscribe();

        sink.load(wav_bytes(500, 8000)).await.unwrap();
        sink.play().await.unwrap();
        let second = sink.load(wav_bytes(3000, 8000)).await.unwrap();
        sink.play().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err(), "first source must not report end");

        assert_eq!(events.recv().await.unwrap(), SinkEvent::Ended { source: second });
    }

    #[tokio::test]
    async fn test_play_without_source_rejected() {
        let sink = ClockSink::new();
        assert!(matches!(sink.play().await, Err(SinkError::Rejected(_))));
        assert_eq!(sink.duration().await, None);
    }
}
