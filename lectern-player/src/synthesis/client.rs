//! HTTP synthesis client
//!
//! `POST {base_url}/tts/speak` with `{ "text", "voice" }`, answering with the
//! rendered audio bytes.
//!
//! Retry policy:
//! - offline: wait on [`Connectivity`] before each attempt
//! - attempt timeout: retry immediately
//! - 5xx or transport failure: wait `retry_backoff`, retry, indefinitely
//! - 4xx: fail with [`SynthesisError::Rejected`], no retry
//! - cancellation: [`SynthesisError::Aborted`] from any wait point

use super::{ChunkSynthesizer, Connectivity, SynthesisError};
use crate::config::SynthesisConfig;
use async_trait::async_trait;
use bytes::Bytes;
use lectern_common::VoiceId;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

/// Outcome of one attempt, before the retry policy is applied
enum Attempt {
    Audio(Bytes),
    Rejected { status: u16, message: String },
    Invalid(String),
    Transient(String),
}

#[derive(Debug, Clone)]
pub struct HttpSynthesisClient {
    http_client: reqwest::Client,
    speak_url: String,
    connectivity: Connectivity,
    attempt_timeout: Duration,
    retry_backoff: Duration,
}

impl HttpSynthesisClient {
    pub fn new(config: &SynthesisConfig, connectivity: Connectivity) -> Self {
        Self::with_client(reqwest::Client::new(), config, connectivity)
    }

    pub fn with_client(
        http_client: reqwest::Client,
        config: &SynthesisConfig,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            http_client,
            speak_url: format!("{}/tts/speak", config.base_url.trim_end_matches('/')),
            connectivity,
            attempt_timeout: config.attempt_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    async fn attempt(&self, text: &str, voice: &VoiceId) -> Attempt {
        let response = match self
            .http_client
            .post(&self.speak_url)
            .json(&SpeakRequest {
                text,
                voice: voice.as_str(),
            })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_builder() => return Attempt::Invalid(e.to_string()),
            Err(e) => return Attempt::Transient(e.to_string()),
        };

        let status = response.status();
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Attempt::Rejected {
                status: status.as_u16(),
                message,
            };
        }
        if !status.is_success() {
            return Attempt::Transient(format!("HTTP {}", status.as_u16()));
        }

        match response.bytes().await {
            Ok(audio) => Attempt::Audio(audio),
            Err(e) => Attempt::Transient(format!("body read failed: {}", e)),
        }
    }
}

#[async_trait]
impl ChunkSynthesizer for HttpSynthesisClient {
    async fn fetch_chunk_audio(
        &self,
        text: &str,
        voice: &VoiceId,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SynthesisError> {
        let mut attempts: u32 = 0;
        loop {
            self.connectivity.wait_online(cancel).await?;
            attempts += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SynthesisError::Aborted),
                outcome = tokio::time::timeout(self.attempt_timeout, self.attempt(text, voice)) => outcome,
            };

            match outcome {
                Ok(Attempt::Audio(audio)) => {
                    debug!(attempts, bytes = audio.len(), voice = %voice, "Chunk synthesized");
                    return Ok(audio);
                }
                Ok(Attempt::Rejected { status, message }) => {
                    warn!(status, voice = %voice, "Synthesis rejected: {}", message);
                    return Err(SynthesisError::Rejected { status, message });
                }
                Ok(Attempt::Invalid(message)) => {
                    return Err(SynthesisError::InvalidRequest(message));
                }
                Err(_) => {
                    warn!(
                        attempts,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "Synthesis attempt timed out, retrying"
                    );
                }
                Ok(Attempt::Transient(reason)) => {
                    warn!(attempts, "Synthesis attempt failed ({}), backing off", reason);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SynthesisError::Aborted),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }
}
