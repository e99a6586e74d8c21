//! Event types for the Lectern event system
//!
//! Events are broadcast by the player and serialized for SSE transmission.
//! The supporting enums are also used in status snapshots.

use crate::ids::{BookId, ChapterId, VoiceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the current chapter is being played
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Chunk-by-chunk from on-demand synthesis
    Streaming,
    /// Single cached full-chapter track
    Full,
}

impl std::fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackMode::Streaming => write!(f, "streaming"),
            PlaybackMode::Full => write!(f, "full"),
        }
    }
}

/// Player state machine phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    /// No session
    Idle,
    /// Cache lookup for the session is still pending
    ResolvingMode,
    Paused,
    /// Waiting for audio (chunk fetch or speech start)
    Buffering,
    Playing,
    /// Last chunk or full track finished
    Ended,
}

impl PlaybackPhase {
    /// Playing or about to play
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackPhase::Playing | PlaybackPhase::Buffering)
    }
}

impl std::fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackPhase::Idle => write!(f, "idle"),
            PlaybackPhase::ResolvingMode => write!(f, "resolving_mode"),
            PlaybackPhase::Paused => write!(f, "paused"),
            PlaybackPhase::Buffering => write!(f, "buffering"),
            PlaybackPhase::Playing => write!(f, "playing"),
            PlaybackPhase::Ended => write!(f, "ended"),
        }
    }
}

/// Per-chapter projection of the persistent audio cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    #[default]
    Uncached,
    Downloading,
    Cached,
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStatus::Uncached => write!(f, "uncached"),
            CacheStatus::Downloading => write!(f, "downloading"),
            CacheStatus::Cached => write!(f, "cached"),
        }
    }
}

/// Kind of progress tracked by the progress store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Read,
    Listen,
}

impl std::fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressKind::Read => write!(f, "read"),
            ProgressKind::Listen => write!(f, "listen"),
        }
    }
}

/// Progress record exchanged with the remote progress store
///
/// For listening progress in streaming mode `value` is the chunk index and
/// `total` the chunk count; in full mode both are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
}

impl ProgressRecord {
    /// Position as a fraction of the chapter, if a usable total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0.0 && self.value.is_finite() => {
                Some((self.value / total).clamp(0.0, 1.0))
            }
            _ => None,
        }
    }
}

/// Lectern player events
///
/// Broadcast to all subscribers (SSE clients, tests, embedding code).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A new session superseded the previous one
    SessionStarted {
        chapter_id: ChapterId,
        voice: VoiceId,
        total_chunks: usize,
        /// Session generation
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// Cache lookup finished and the session mode is known
    ModeResolved {
        chapter_id: ChapterId,
        voice: VoiceId,
        mode: PlaybackMode,
        timestamp: DateTime<Utc>,
    },

    /// Phase transition
    PlaybackStateChanged {
        old_phase: PlaybackPhase,
        new_phase: PlaybackPhase,
        mode: PlaybackMode,
        timestamp: DateTime<Utc>,
    },

    /// A streaming chunk began playing
    ChunkStarted {
        chapter_id: ChapterId,
        index: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Periodic full-mode position update
    PlaybackPosition {
        chapter_id: ChapterId,
        position_secs: f64,
        duration_secs: f64,
        timestamp: DateTime<Utc>,
    },

    /// Playback reached the end of the chapter
    ChapterEnded {
        chapter_id: ChapterId,
        timestamp: DateTime<Utc>,
    },

    /// Playback stopped on an unrecoverable error; the player is paused
    PlaybackFailed {
        chapter_id: ChapterId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    RateChanged {
        rate: f32,
        timestamp: DateTime<Utc>,
    },

    VoiceChanged {
        old_voice: VoiceId,
        new_voice: VoiceId,
        timestamp: DateTime<Utc>,
    },

    CacheStatusChanged {
        chapter_id: ChapterId,
        voice: VoiceId,
        status: CacheStatus,
        timestamp: DateTime<Utc>,
    },

    /// Sleep timer set, ticked, cancelled or cleared
    SleepTimerChanged {
        remaining_seconds: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    SleepTimerExpired {
        timestamp: DateTime<Utc>,
    },

    ConnectivityChanged {
        online: bool,
        timestamp: DateTime<Utc>,
    },
}

impl PlayerEvent {
    /// Get event type as string for SSE event names and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::SessionStarted { .. } => "SessionStarted",
            PlayerEvent::ModeResolved { .. } => "ModeResolved",
            PlayerEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            PlayerEvent::ChunkStarted { .. } => "ChunkStarted",
            PlayerEvent::PlaybackPosition { .. } => "PlaybackPosition",
            PlayerEvent::ChapterEnded { .. } => "ChapterEnded",
            PlayerEvent::PlaybackFailed { .. } => "PlaybackFailed",
            PlayerEvent::RateChanged { .. } => "RateChanged",
            PlayerEvent::VoiceChanged { .. } => "VoiceChanged",
            PlayerEvent::CacheStatusChanged { .. } => "CacheStatusChanged",
            PlayerEvent::SleepTimerChanged { .. } => "SleepTimerChanged",
            PlayerEvent::SleepTimerExpired { .. } => "SleepTimerExpired",
            PlayerEvent::ConnectivityChanged { .. } => "ConnectivityChanged",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_record_wire_format() {
        let record = ProgressRecord {
            book_id: "b1".into(),
            chapter_id: "c1".into(),
            kind: ProgressKind::Listen,
            value: 4.0,
            total: Some(20.0),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["bookId"], "b1");
        assert_eq!(json["chapterId"], "c1");
        assert_eq!(json["type"], "listen");
        assert_eq!(json["total"], 20.0);

        let no_total: ProgressRecord = serde_json::from_str(
            r#"{"bookId":"b1","chapterId":"c1","type":"read","value":3}"#,
        )
        .unwrap();
        assert_eq!(no_total.total, None);
        assert_eq!(no_total.fraction(), None);
    }

    #[test]
    fn test_progress_fraction_is_clamped() {
        let record = ProgressRecord {
            book_id: "b".into(),
            chapter_id: "c".into(),
            kind: ProgressKind::Listen,
            value: 30.0,
            total: Some(20.0),
        };
        assert_eq!(record.fraction(), Some(1.0));
    }

    #[test]
    fn test_event_serialization_tagged() {
        let event = PlayerEvent::ModeResolved {
            chapter_id: "c1".into(),
            voice: "v1".into(),
            mode: PlaybackMode::Full,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ModeResolved");
        assert_eq!(json["mode"], "full");
        assert_eq!(event.event_type(), "ModeResolved");
    }

    #[test]
    fn test_phase_display_matches_serde() {
        let phase = PlaybackPhase::ResolvingMode;
        let json = serde_json::to_string(&phase).unwrap();
        assert_eq!(json, format!("\"{}\"", phase));
        assert!(PlaybackPhase::Buffering.is_active());
        assert!(!PlaybackPhase::Ended.is_active());
    }
}
