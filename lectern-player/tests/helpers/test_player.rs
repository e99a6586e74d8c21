//! Running controller wired to fakes
//!
//! Uses the headless clock sink, so tests run on paused tokio time.

use super::fakes::{DelayedCache, FakeNativeEngine, RecordingProgressStore, ScriptedSynthesizer};
use lectern_common::events::{PlayerEvent, ProgressRecord};
use lectern_common::{ChapterId, VoiceId};
use lectern_player::audio::ClockSink;
use lectern_player::playback::{
    EngineConfig, EngineDeps, HandleStore, PlaybackEngine, PlayerHandle, SessionRequest,
};
use lectern_player::state::PlayerStatus;
use lectern_player::synthesis::Connectivity;
use lectern_player::SharedState;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const BOOK: &str = "book-1";
pub const CHAPTER: &str = "chapter-1";
pub const VOICE: &str = "vi-VN-HoaiMyNeural";

/// `sentences` sentences, each long enough to be its own chunk
pub fn chapter_text(sentences: usize) -> String {
    (0..sentences)
        .map(|i| format!("Sentence {:02} keeps going for long enough to stand as its own chunk.", i))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct TestPlayerBuilder {
    config: EngineConfig,
    synth_delay: Duration,
    audio_millis: u32,
    cache_delay: Duration,
    stored_progress: Option<ProgressRecord>,
    progress_delay: Duration,
    native_utterance: Duration,
    online: bool,
}

impl TestPlayerBuilder {
    pub fn synth_delay(mut self, delay: Duration) -> Self {
        self.synth_delay = delay;
        self
    }

    /// Length of every synthesized chunk
    pub fn audio_millis(mut self, millis: u32) -> Self {
        self.audio_millis = millis;
        self
    }

    pub fn cache_delay(mut self, delay: Duration) -> Self {
        self.cache_delay = delay;
        self
    }

    pub fn stored_progress(mut self, record: ProgressRecord, load_delay: Duration) -> Self {
        self.stored_progress = Some(record);
        self.progress_delay = load_delay;
        self
    }

    pub fn native_utterance(mut self, length: Duration) -> Self {
        self.native_utterance = length;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn build(self) -> TestPlayer {
        let state = Arc::new(SharedState::new());
        let events = state.subscribe_events();
        let synth = ScriptedSynthesizer::new(self.synth_delay, self.audio_millis);
        let cache = DelayedCache::new(self.cache_delay);
        let progress = RecordingProgressStore::new(self.stored_progress, self.progress_delay);
        let native = FakeNativeEngine::new(self.native_utterance);
        let handles = HandleStore::new();
        let connectivity = Connectivity::new(self.online);
        let ended = Arc::new(Mutex::new(Vec::new()));

        let deps = EngineDeps {
            synthesizer: synth.clone(),
            cache: cache.clone(),
            sink: Arc::new(ClockSink::new()),
            native: Some(native.clone()),
            progress: Some(progress.clone()),
            connectivity: connectivity.clone(),
            handles: Arc::clone(&handles),
            state: Arc::clone(&state),
        };
        let hook_log = Arc::clone(&ended);
        let player = PlaybackEngine::new(self.config, deps)
            .on_ended(Arc::new(move |chapter: ChapterId| {
                hook_log.lock().unwrap().push(chapter);
            }))
            .spawn();

        TestPlayer {
            player,
            state,
            events,
            synth,
            cache,
            progress,
            native,
            handles,
            connectivity,
            ended,
        }
    }
}

pub struct TestPlayer {
    pub player: PlayerHandle,
    pub state: Arc<SharedState>,
    pub events: broadcast::Receiver<PlayerEvent>,
    pub synth: Arc<ScriptedSynthesizer>,
    pub cache: Arc<DelayedCache>,
    pub progress: Arc<RecordingProgressStore>,
    pub native: Arc<FakeNativeEngine>,
    pub handles: Arc<HandleStore>,
    pub connectivity: Connectivity,
    /// Chapters reported by the ended hook
    pub ended: Arc<Mutex<Vec<ChapterId>>>,
}

impl TestPlayer {
    pub fn builder() -> TestPlayerBuilder {
        TestPlayerBuilder {
            config: EngineConfig::default(),
            synth_delay: Duration::from_millis(100),
            audio_millis: 1000,
            cache_delay: Duration::ZERO,
            stored_progress: None,
            progress_delay: Duration::ZERO,
            native_utterance: Duration::from_millis(500),
            online: true,
        }
    }

    pub fn request(text: String, auto_play: bool, initial_position: Option<f64>) -> SessionRequest {
        SessionRequest {
            book_id: BOOK.into(),
            chapter_id: CHAPTER.into(),
            text,
            voice: VoiceId::from(VOICE),
            auto_play,
            initial_position,
        }
    }

    pub fn start(&self, request: SessionRequest) {
        self.player.start(request).unwrap();
    }

    pub async fn status(&self) -> PlayerStatus {
        self.player.status().await
    }

    /// Poll the published status until `condition` holds
    pub async fn wait_for_status(
        &self,
        what: &str,
        condition: impl Fn(&PlayerStatus) -> bool,
    ) -> PlayerStatus {
        within(Duration::from_secs(120), what, async {
            loop {
                let status = self.player.status().await;
                if condition(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    /// Next event matching `condition`, skipping others
    pub async fn wait_for_event(
        &mut self,
        what: &str,
        condition: impl Fn(&PlayerEvent) -> bool,
    ) -> PlayerEvent {
        let events = &mut self.events;
        within(Duration::from_secs(120), what, async {
            loop {
                match events.recv().await {
                    Ok(event) if condition(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
    }

    /// Poll the progress store until a save matches `condition`
    pub async fn wait_for_save(
        &self,
        what: &str,
        condition: impl Fn(&ProgressRecord) -> bool,
    ) -> ProgressRecord {
        within(Duration::from_secs(120), what, async {
            loop {
                if let Some(record) = self.progress.saved().into_iter().find(|r| condition(r)) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }
}

async fn within<T>(limit: Duration, what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}
