//! Audio sink abstraction
//!
//! **Responsibilities:**
//! - Define the single-sink contract the playback controller drives
//! - Probe/decode encoded audio with symphonia
//! - Provide a headless, timing-accurate sink ([`ClockSink`]) and, with the
//!   `device` feature, a cpal output sink ([`DeviceSink`])
//!
//! A sink holds at most one loaded source. Loading replaces the previous
//! source; only the session that loaded it reacts to its `Ended` event.

mod clock;
pub mod decode;
#[cfg(feature = "device")]
mod output;

pub use clock::ClockSink;
#[cfg(feature = "device")]
pub use output::DeviceSink;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifies one loaded source; increases with every `load`
pub type SourceId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Sink refused to start playback
    #[error("playback rejected: {0}")]
    Rejected(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("output device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// Source reached its natural end
    Ended { source: SourceId },
}

/// Playback control over one decoded audio source at a time
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Replace the current source; the new one starts paused at position 0
    async fn load(&self, audio: Bytes) -> Result<SourceId, SinkError>;

    /// Start or resume the loaded source
    async fn play(&self) -> Result<(), SinkError>;

    async fn pause(&self);

    /// Time-seek within the loaded source, clamped to its duration
    async fn seek(&self, position: Duration);

    /// Playback speed multiplier; kept across loads
    async fn set_rate(&self, rate: f32);

    async fn position(&self) -> Duration;

    /// Duration of the loaded source, `None` if nothing is loaded
    async fn duration(&self) -> Option<Duration>;

    /// Drop the loaded source
    async fn unload(&self);

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
}
