//! Playback controller
//!
//! **Module Structure:**
//! - `mod.rs`: public handle, configuration and dependencies
//! - `session.rs`: the single owned session and its position math
//! - `controller.rs`: the controller task (command/event loop)
//!
//! The controller runs as one task that owns the live [`Session`]. Commands
//! from [`PlayerHandle`] and results of spawned async work (cache lookup, chunk
//! fetch, native speech, progress load) arrive on mpsc channels. Async results
//! carry a `(generation, seq)` ticket and are dropped when the ticket is stale,
//! so a slow fetch for a superseded chapter can never touch the new session.
//!
//! [`Session`]: session::Session

mod controller;
mod session;

use crate::audio::AudioSink;
use crate::cache::BlobCache;
use crate::config::PlayerConfig;
use crate::error::{Error, Result};
use crate::native::NativeSpeechEngine;
use crate::playback::chunker::ChunkerConfig;
use crate::playback::handles::HandleStore;
use crate::progress::ProgressStore;
use crate::state::{PlayerStatus, SharedState};
use crate::synthesis::{ChunkSynthesizer, Connectivity};
use lectern_common::events::PlayerEvent;
use lectern_common::{BookId, ChapterId, VoiceId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Called with the chapter id whenever a chapter plays to its end
pub type EndedHook = Arc<dyn Fn(ChapterId) + Send + Sync>;

/// Everything needed to start playing a chapter
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    pub text: String,
    pub voice: VoiceId,
    /// Start playing as soon as the mode is resolved
    #[serde(default)]
    pub auto_play: bool,
    /// Position as a fraction of the chapter; when absent the stored
    /// listening progress is loaded instead
    #[serde(default)]
    pub initial_position: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunking: ChunkerConfig,
    /// Chunks fetched ahead, counting the current one
    pub prefetch_window: usize,
    pub seek_divisions: f64,
    pub end_guard: Duration,
    pub position_interval: Duration,
    pub progress_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&PlayerConfig::default())
    }
}

impl From<&PlayerConfig> for EngineConfig {
    fn from(config: &PlayerConfig) -> Self {
        Self {
            chunking: ChunkerConfig::from(&config.chunking),
            prefetch_window: config.playback.prefetch_window.max(1),
            seek_divisions: config.playback.seek_divisions,
            end_guard: Duration::from_millis(config.playback.end_guard_ms),
            position_interval: Duration::from_millis(config.playback.position_interval_ms.max(50)),
            progress_debounce: Duration::from_millis(config.progress.debounce_ms),
        }
    }
}

/// Collaborators of the controller
#[derive(Clone)]
pub struct EngineDeps {
    pub synthesizer: Arc<dyn ChunkSynthesizer>,
    pub cache: Arc<dyn BlobCache>,
    pub sink: Arc<dyn AudioSink>,
    /// On-device engine for `native:` voices
    pub native: Option<Arc<dyn NativeSpeechEngine>>,
    /// Remote progress store; `None` disables progress sync
    pub progress: Option<Arc<dyn ProgressStore>>,
    pub connectivity: Connectivity,
    pub handles: Arc<HandleStore>,
    pub state: Arc<SharedState>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Start(Box<SessionRequest>),
    Toggle,
    Play,
    Pause,
    Seek(i64),
    SetRate(f32),
    ChangeVoice(VoiceId),
    RestartChunk,
    Stop,
    Shutdown(oneshot::Sender<()>),
}

/// Builder for the controller task
pub struct PlaybackEngine {
    config: EngineConfig,
    deps: EngineDeps,
    on_ended: Option<EndedHook>,
}

impl PlaybackEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        Self {
            config,
            deps,
            on_ended: None,
        }
    }

    /// Hook run after `ChapterEnded`, e.g. to advance to the next chapter
    pub fn on_ended(mut self, hook: EndedHook) -> Self {
        self.on_ended = Some(hook);
        self
    }

    /// Spawn the controller task
    pub fn spawn(self) -> PlayerHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = Arc::clone(&self.deps.state);
        let controller = controller::Controller::new(self.config, self.deps, self.on_ended);
        let task = tokio::spawn(controller.run(command_rx));

        PlayerHandle {
            commands,
            state,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

/// Cloneable control surface of a running controller
///
/// Commands are queued and applied in order by the controller task; the
/// effect is visible through [`PlayerHandle::status`] and player events.
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PlayerHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Playback("player task has stopped".to_string()))
    }

    /// Supersede the current session with a new chapter/voice session
    pub fn start(&self, request: SessionRequest) -> Result<()> {
        self.send(Command::Start(Box::new(request)))
    }

    pub fn toggle(&self) -> Result<()> {
        self.send(Command::Toggle)
    }

    pub fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Streaming: `delta` chunks. Full: `delta` steps of duration/20.
    pub fn seek(&self, delta: i64) -> Result<()> {
        self.send(Command::Seek(delta))
    }

    pub fn change_rate(&self, rate: f32) -> Result<()> {
        self.send(Command::SetRate(rate))
    }

    pub fn change_voice(&self, voice: VoiceId) -> Result<()> {
        self.send(Command::ChangeVoice(voice))
    }

    /// Re-resolve the current session under the same voice
    pub fn restart_chunk(&self) -> Result<()> {
        self.send(Command::RestartChunk)
    }

    /// Tear down the session and go idle
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub async fn status(&self) -> PlayerStatus {
        self.state.get_status().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.state.subscribe_events()
    }

    /// Tear down, flush pending progress and stop the controller task
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown(ack))?;
        done.await
            .map_err(|_| Error::Playback("player task ended before acknowledging shutdown".to_string()))?;

        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("player task failed: {}", e)))?;
        }
        Ok(())
    }
}
