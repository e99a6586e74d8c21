//! Remote chunk synthesis
//!
//! **Responsibilities:**
//! - Fetch rendered audio for one chunk of text from the synthesis service
//! - Gate requests on connectivity
//! - Retry transient failures; surface caller errors and cancellation

mod client;
mod connectivity;

pub use client::HttpSynthesisClient;
pub use connectivity::{probe_address, Connectivity};

use async_trait::async_trait;
use bytes::Bytes;
use lectern_common::VoiceId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of a chunk fetch
///
/// Timeouts, 5xx and network failures never appear here: they are retried
/// until the fetch succeeds or is cancelled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    /// Service refused the request (4xx); retrying cannot help
    #[error("request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Request could not be built (bad base URL, invalid header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Cancelled because the owning session was superseded
    #[error("aborted")]
    Aborted,
}

/// Source of per-chunk audio
#[async_trait]
pub trait ChunkSynthesizer: Send + Sync {
    /// Fetch audio for `text` spoken by `voice`
    ///
    /// Resolves only with the audio, a permanent error, or
    /// [`SynthesisError::Aborted`] once `cancel` fires.
    async fn fetch_chunk_audio(
        &self,
        text: &str,
        voice: &VoiceId,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SynthesisError>;
}
