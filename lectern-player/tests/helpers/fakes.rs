//! In-process fakes for the controller's collaborators

use async_trait::async_trait;
use bytes::Bytes;
use lectern_common::events::{ProgressKind, ProgressRecord};
use lectern_common::{CacheKey, ChapterId, NativeVoice, VoiceId};
use lectern_player::cache::{BlobCache, MemoryBlobCache};
use lectern_player::native::{
    NativeError, NativeSpeechEngine, NativeVoiceInfo, SpeakRequest, Utterance,
};
use lectern_player::progress::ProgressStore;
use lectern_player::synthesis::{ChunkSynthesizer, SynthesisError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 16-bit mono PCM WAV of `millis` of silence at 8 kHz
pub fn wav_bytes(millis: u32) -> Bytes {
    let sample_rate: u32 = 8000;
    let frames = sample_rate as u64 * millis as u64 / 1000;
    let data_len = (frames * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    Bytes::from(out)
}

// ============================================================================
// Synthesizer
// ============================================================================

/// Answers every chunk with WAV audio after a fixed delay
pub struct ScriptedSynthesizer {
    delay: Duration,
    audio_millis: u32,
    calls: Mutex<Vec<(VoiceId, String)>>,
    reject_marker: Mutex<Option<String>>,
}

impl ScriptedSynthesizer {
    pub fn new(delay: Duration, audio_millis: u32) -> Arc<Self> {
        Arc::new(Self {
            delay,
            audio_millis,
            calls: Mutex::new(Vec::new()),
            reject_marker: Mutex::new(None),
        })
    }

    /// Reject (HTTP 422) every chunk whose text contains `marker`
    pub fn reject_when(&self, marker: &str) {
        *self.reject_marker.lock().unwrap() = Some(marker.to_string());
    }

    pub fn calls(&self) -> Vec<(VoiceId, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Requests whose text contains `needle`
    pub fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, text)| text.contains(needle))
            .count()
    }
}

#[async_trait]
impl ChunkSynthesizer for ScriptedSynthesizer {
    async fn fetch_chunk_audio(
        &self,
        text: &str,
        voice: &VoiceId,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SynthesisError> {
        self.calls
            .lock()
            .unwrap()
            .push((voice.clone(), text.to_string()));

        let rejected = self
            .reject_marker
            .lock()
            .unwrap()
            .as_deref()
            .map(|marker| text.contains(marker))
            .unwrap_or(false);
        if rejected {
            return Err(SynthesisError::Rejected {
                status: 422,
                message: "unprocessable text".to_string(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(SynthesisError::Aborted),
            _ = tokio::time::sleep(self.delay) => Ok(wav_bytes(self.audio_millis)),
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Memory cache whose lookups take `get_delay`
pub struct DelayedCache {
    inner: MemoryBlobCache,
    get_delay: Duration,
}

impl DelayedCache {
    pub fn new(get_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBlobCache::new(),
            get_delay,
        })
    }

    pub async fn insert(&self, chapter_id: &str, voice: &str, audio: Bytes) {
        self.inner
            .put(&CacheKey::new(chapter_id.into(), voice.into()), audio)
            .await;
    }
}

#[async_trait]
impl BlobCache for DelayedCache {
    async fn has(&self, key: &CacheKey) -> bool {
        self.inner.has(key).await
    }

    async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        tokio::time::sleep(self.get_delay).await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &CacheKey, audio: Bytes) {
        self.inner.put(key, audio).await
    }

    async fn evict(&self, key: &CacheKey) {
        self.inner.evict(key).await
    }
}

// ============================================================================
// Progress store
// ============================================================================

/// Records saves; serves one stored record after `load_delay`
#[derive(Default)]
pub struct RecordingProgressStore {
    saved: Mutex<Vec<ProgressRecord>>,
    stored: Mutex<Option<ProgressRecord>>,
    load_delay: Duration,
}

impl RecordingProgressStore {
    pub fn new(stored: Option<ProgressRecord>, load_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            saved: Mutex::new(Vec::new()),
            stored: Mutex::new(stored),
            load_delay,
        })
    }

    pub fn saved(&self) -> Vec<ProgressRecord> {
        self.saved.lock().unwrap().clone()
    }

    pub fn last_saved(&self) -> Option<ProgressRecord> {
        self.saved.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProgressStore for RecordingProgressStore {
    async fn save(&self, record: &ProgressRecord) -> lectern_player::Result<()> {
        self.saved.lock().unwrap().push(record.clone());
        *self.stored.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    async fn load(
        &self,
        chapter_id: &ChapterId,
        kind: ProgressKind,
    ) -> lectern_player::Result<Option<ProgressRecord>> {
        tokio::time::sleep(self.load_delay).await;
        let stored = self.stored.lock().unwrap().clone();
        Ok(stored.filter(|r| &r.chapter_id == chapter_id && r.kind == kind))
    }
}

// ============================================================================
// On-device speech
// ============================================================================

/// Speaks every chunk for `utterance` and records what it was asked to say
pub struct FakeNativeEngine {
    utterance: Duration,
    spoken: Mutex<Vec<(NativeVoice, String, f32)>>,
    current: Mutex<Option<CancellationToken>>,
    /// Utterances still running
    active: Arc<AtomicUsize>,
}

impl FakeNativeEngine {
    pub fn new(utterance: Duration) -> Arc<Self> {
        Arc::new(Self {
            utterance,
            spoken: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn spoken(&self) -> Vec<(NativeVoice, String, f32)> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn is_speaking(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl NativeSpeechEngine for FakeNativeEngine {
    async fn voices(&self) -> Result<Vec<NativeVoiceInfo>, NativeError> {
        Ok(vec![
            NativeVoiceInfo {
                index: 0,
                name: "vietnam".to_string(),
                language: "vi".to_string(),
            },
            NativeVoiceInfo {
                index: 1,
                name: "english".to_string(),
                language: "en".to_string(),
            },
        ])
    }

    async fn speak(&self, request: SpeakRequest) -> Result<Utterance, NativeError> {
        self.spoken
            .lock()
            .unwrap()
            .push((request.voice, request.text.clone(), request.rate));

        let token = request.cancel.child_token();
        if let Some(previous) = self.current.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let (done, utterance) = Utterance::channel();
        let length = self.utterance;
        let active = Arc::clone(&self.active);
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(NativeError::Interrupted),
                _ = tokio::time::sleep(length) => Ok(()),
            };
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = done.send(result);
        });
        Ok(utterance)
    }

    async fn stop(&self) {
        if let Some(token) = self.current.lock().unwrap().take() {
            token.cancel();
        }
    }
}
