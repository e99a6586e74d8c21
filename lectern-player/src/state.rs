//! Shared player state
//!
//! Read side of the playback controller: the controller task is the only
//! writer of the status snapshot, API handlers and tests read it. Also owns
//! the event broadcaster used for SSE.

use lectern_common::events::{PlaybackMode, PlaybackPhase, PlayerEvent};
use lectern_common::{BookId, ChapterId, VoiceId};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

/// Snapshot of the live session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub book_id: Option<BookId>,
    pub chapter_id: Option<ChapterId>,
    pub voice: Option<VoiceId>,
    /// `None` until the cache lookup resolved
    pub mode: Option<PlaybackMode>,
    pub phase: PlaybackPhase,
    /// Current chunk (streaming)
    pub index: usize,
    pub total_chunks: usize,
    /// Position and duration of the current source in seconds
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    pub rate: f32,
    /// Remote synthesis unreachable; always false for native voices
    pub offline: bool,
    pub generation: u64,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            book_id: None,
            chapter_id: None,
            voice: None,
            mode: None,
            phase: PlaybackPhase::Idle,
            index: 0,
            total_chunks: 0,
            position_secs: 0.0,
            duration_secs: None,
            rate: 1.0,
            offline: false,
            generation: 0,
        }
    }
}

impl PlayerStatus {
    pub fn is_playing(&self) -> bool {
        self.phase == PlaybackPhase::Playing
    }

    pub fn is_buffering(&self) -> bool {
        self.phase == PlaybackPhase::Buffering
    }
}

pub struct SharedState {
    pub status: RwLock<PlayerStatus>,

    /// Event broadcaster for SSE events
    pub event_tx: broadcast::Sender<PlayerEvent>,
}

impl SharedState {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            status: RwLock::new(PlayerStatus::default()),
            event_tx,
        }
    }

    /// Broadcast an event to all listeners
    pub fn broadcast_event(&self, event: PlayerEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get_status(&self) -> PlayerStatus {
        self.status.read().await.clone()
    }

    pub async fn set_status(&self, status: PlayerStatus) {
        *self.status.write().await = status;
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
