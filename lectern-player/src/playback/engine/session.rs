//! The live playback session

use crate::audio::SourceId;
use crate::playback::chunker::Chunk;
use crate::playback::prefetch::PrefetchScheduler;
use crate::progress::ProgressReporter;
use lectern_common::events::{PlaybackMode, PlaybackPhase};
use lectern_common::{BookId, ChapterId, NativeVoice, VoiceId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Identifies the async operation a result belongs to
///
/// `generation` changes with every session; `seq` with every chunk play
/// request inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Ticket {
    pub generation: u64,
    pub seq: u64,
}

/// Where chunk audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Backend {
    Remote,
    Native(NativeVoice),
}

impl Backend {
    pub fn for_voice(voice: &VoiceId) -> Self {
        match voice.native_voice() {
            Some(native) => Backend::Native(native),
            None => Backend::Remote,
        }
    }
}

pub(super) struct Session {
    pub generation: u64,
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    pub voice: VoiceId,
    /// Kept for re-chunking on voice change
    pub text: String,
    pub backend: Backend,
    pub chunks: Arc<Vec<Chunk>>,
    /// `None` while resolving
    pub mode: Option<PlaybackMode>,
    pub phase: PlaybackPhase,
    pub index: usize,
    pub seq: u64,
    /// Not playing and no play requested; late async results check this
    pub stopped: bool,
    /// Play once the mode is resolved
    pub auto_play: bool,
    /// Position fraction waiting to be applied at resolution
    pub seed: Option<f64>,
    pub cancel: CancellationToken,
    /// Child of `cancel` for the current chunk play; replaced with every ticket
    pub chunk_cancel: CancellationToken,
    /// Remote back-end only
    pub prefetch: Option<PrefetchScheduler>,
    pub reporter: Option<ProgressReporter>,
    /// Source currently loaded in the sink for this session
    pub source: Option<SourceId>,
    /// Full-mode track length
    pub duration: Option<Duration>,
}

impl Session {
    pub fn ticket(&self) -> Ticket {
        Ticket {
            generation: self.generation,
            seq: self.seq,
        }
    }

    /// Invalidate every pending chunk result of this session and stop
    /// whatever the previous ticket started
    pub fn next_ticket(&mut self) -> Ticket {
        self.seq += 1;
        self.chunk_cancel.cancel();
        self.chunk_cancel = self.cancel.child_token();
        self.ticket()
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.ticket() == ticket
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.backend, Backend::Native(_))
    }

    pub fn mode_or_default(&self) -> PlaybackMode {
        self.mode.unwrap_or(PlaybackMode::Streaming)
    }

    pub fn chunk_text(&self, index: usize) -> Option<&str> {
        self.chunks.get(index).map(|c| c.text.as_str())
    }
}

/// Chunk index after moving `delta` chunks, clamped to `[0, len - 1]`
pub(super) fn clamp_chunk_index(current: usize, delta: i64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let last = (len - 1) as i64;
    (current as i64).saturating_add(delta).clamp(0, last) as usize
}

/// Full-mode seek target, clamped to `[0, duration - end_guard]`
pub(super) fn full_seek_target(
    position: Duration,
    delta: i64,
    duration: Duration,
    divisions: f64,
    end_guard: Duration,
) -> Duration {
    let divisions = if divisions.is_finite() && divisions > 0.0 {
        divisions
    } else {
        20.0
    };
    let step = duration.as_secs_f64() / divisions;
    let max = duration.saturating_sub(end_guard).as_secs_f64();
    let target = position.as_secs_f64() + delta as f64 * step;
    Duration::from_secs_f64(target.clamp(0.0, max))
}

/// Chunk index for a chapter fraction
pub(super) fn index_for_fraction(fraction: f64, len: usize) -> usize {
    if len == 0 || !fraction.is_finite() {
        return 0;
    }
    let index = (fraction.clamp(0.0, 1.0) * len as f64).round() as usize;
    index.min(len - 1)
}

/// Track position for a chapter fraction, kept clear of the end like a seek
pub(super) fn position_for_fraction(fraction: f64, duration: Duration, end_guard: Duration) -> Duration {
    if !fraction.is_finite() {
        return Duration::ZERO;
    }
    let max = duration.saturating_sub(end_guard).as_secs_f64();
    Duration::from_secs_f64((fraction.clamp(0.0, 1.0) * duration.as_secs_f64()).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_seek_clamps() {
        assert_eq!(clamp_chunk_index(3, 1, 10), 4);
        assert_eq!(clamp_chunk_index(0, -1, 10), 0);
        assert_eq!(clamp_chunk_index(9, 5, 10), 9);
        assert_eq!(clamp_chunk_index(2, i64::MIN, 10), 0);
        assert_eq!(clamp_chunk_index(2, i64::MAX, 10), 9);
        assert_eq!(clamp_chunk_index(0, 3, 0), 0);
    }

    #[test]
    fn test_full_seek_step_and_guard() {
        let duration = Duration::from_secs(200);
        let guard = Duration::from_millis(500);

        // One step is duration / 20 = 10 s
        let forward = full_seek_target(Duration::from_secs(50), 1, duration, 20.0, guard);
        assert_eq!(forward, Duration::from_secs(60));

        let back = full_seek_target(Duration::from_secs(5), -1, duration, 20.0, guard);
        assert_eq!(back, Duration::ZERO);

        let end = full_seek_target(Duration::from_secs(195), 3, duration, 20.0, guard);
        assert_eq!(end, Duration::from_millis(199_500));
    }

    #[test]
    fn test_full_seek_short_track() {
        let target = full_seek_target(
            Duration::ZERO,
            2,
            Duration::from_millis(300),
            20.0,
            Duration::from_millis(500),
        );
        assert_eq!(target, Duration::ZERO);

        let bad_divisions =
            full_seek_target(Duration::ZERO, 1, Duration::from_secs(20), 0.0, Duration::ZERO);
        assert_eq!(bad_divisions, Duration::from_secs(1));
    }

    #[test]
    fn test_fraction_mapping() {
        assert_eq!(index_for_fraction(0.0, 20), 0);
        assert_eq!(index_for_fraction(4.0 / 20.0, 20), 4);
        assert_eq!(index_for_fraction(1.0, 20), 19);
        assert_eq!(index_for_fraction(f64::NAN, 20), 0);
        assert_eq!(index_for_fraction(0.5, 0), 0);

        let guard = Duration::from_millis(500);
        assert_eq!(
            position_for_fraction(0.5, Duration::from_secs(100), guard),
            Duration::from_secs(50)
        );
        assert_eq!(
            position_for_fraction(1.0, Duration::from_secs(100), guard),
            Duration::from_millis(99_500)
        );
    }

    #[test]
    fn test_backend_from_voice_prefix() {
        assert_eq!(Backend::for_voice(&"vi-VN-HoaiMyNeural".into()), Backend::Remote);
        assert_eq!(
            Backend::for_voice(&"native:2".into()),
            Backend::Native(NativeVoice::Index(2))
        );
        assert_eq!(
            Backend::for_voice(&"native:default".into()),
            Backend::Native(NativeVoice::Default)
        );
    }
}
