//! On-device speech synthesis
//!
//! **Responsibilities:**
//! - Define the engine seam used by the native playback back-end
//! - Run a local speech program per chunk ([`CommandSpeechEngine`])
//!
//! `speak` resolves once speech has started (the short "buffering" latency);
//! the returned [`Utterance`] resolves when it finished or was stopped.
//! Cancelling [`SpeakRequest::cancel`] stops that utterance only.

mod command;

pub use command::CommandSpeechEngine;

use async_trait::async_trait;
use lectern_common::NativeVoice;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NativeError {
    /// Speech program could not be started
    #[error("failed to start speech engine: {0}")]
    Spawn(String),

    /// Speech program ran but failed
    #[error("speech engine failed: {0}")]
    Failed(String),

    /// Utterance was stopped before it finished
    #[error("utterance interrupted")]
    Interrupted,
}

/// Voice reported by the device engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeVoiceInfo {
    /// Position in the device list, used in `native:<index>` voice ids
    pub index: usize,
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: NativeVoice,
    pub rate: f32,
    /// Stops the utterance, or keeps it from starting
    pub cancel: CancellationToken,
}

/// Completion of one spoken chunk
#[derive(Debug)]
pub struct Utterance {
    done: oneshot::Receiver<Result<(), NativeError>>,
}

impl Utterance {
    /// Pair of utterance and the sender its engine completes
    pub fn channel() -> (oneshot::Sender<Result<(), NativeError>>, Self) {
        let (tx, done) = oneshot::channel();
        (tx, Self { done })
    }

    /// Resolves when speech finished; a dropped engine counts as interrupted
    pub async fn finished(self) -> Result<(), NativeError> {
        self.done.await.unwrap_or(Err(NativeError::Interrupted))
    }
}

#[async_trait]
pub trait NativeSpeechEngine: Send + Sync {
    async fn voices(&self) -> Result<Vec<NativeVoiceInfo>, NativeError>;

    /// Start speaking; resolves when speech has begun
    async fn speak(&self, request: SpeakRequest) -> Result<Utterance, NativeError>;

    /// Stop the current utterance, if any
    async fn stop(&self);
}
