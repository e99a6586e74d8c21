//! Prefetch scheduler
//!
//! Keeps a map from chunk index to a shared fetch for one session generation.
//! Each fetch runs in its own task, so it makes progress whether or not anybody
//! is awaiting it yet; consumers await a cloned [`SharedFetch`].
//!
//! **Invariants:**
//! - At most one fetch per index per generation (`prefetch` is idempotent)
//! - `teardown` cancels every fetch of the generation, clears the map and
//!   releases the session's audio handles

use super::chunker::Chunk;
use super::handles::{AudioHandle, HandleScope};
use crate::synthesis::{ChunkSynthesizer, SynthesisError};
use futures::future::{BoxFuture, FutureExt, Shared};
use lectern_common::VoiceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of one chunk fetch: a handle into the session's scope
pub type FetchResult = Result<AudioHandle, SynthesisError>;

/// Cloneable, awaitable fetch
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

pub struct PrefetchScheduler {
    synthesizer: Arc<dyn ChunkSynthesizer>,
    chunks: Arc<Vec<Chunk>>,
    voice: VoiceId,
    generation: u64,
    cancel: CancellationToken,
    scope: Arc<HandleScope>,
    fetches: HashMap<usize, SharedFetch>,
}

impl PrefetchScheduler {
    pub fn new(
        synthesizer: Arc<dyn ChunkSynthesizer>,
        chunks: Arc<Vec<Chunk>>,
        voice: VoiceId,
        generation: u64,
        cancel: CancellationToken,
        scope: Arc<HandleScope>,
    ) -> Self {
        Self {
            synthesizer,
            chunks,
            voice,
            generation,
            cancel,
            scope,
            fetches: HashMap::new(),
        }
    }

    /// Start fetching `index` unless it is out of range or already known.
    /// Returns true if a new fetch was started.
    pub fn prefetch(&mut self, index: usize) -> bool {
        if self.cancel.is_cancelled() || self.fetches.contains_key(&index) {
            return false;
        }
        let Some(chunk) = self.chunks.get(index) else {
            return false;
        };

        let synthesizer = Arc::clone(&self.synthesizer);
        let scope = Arc::clone(&self.scope);
        let cancel = self.cancel.clone();
        let voice = self.voice.clone();
        let text = chunk.text.clone();

        let task = tokio::spawn(async move {
            let audio = synthesizer.fetch_chunk_audio(&text, &voice, &cancel).await?;
            Ok::<AudioHandle, SynthesisError>(scope.register(audio))
        });
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                // Task panicked or runtime shutting down
                Err(_) => Err(SynthesisError::Aborted),
            }
        }
        .boxed()
        .shared();

        debug!(generation = self.generation, index, "Prefetch started");
        self.fetches.insert(index, fetch);
        true
    }

    /// Prefetch `window` chunks starting at `start`
    pub fn prefetch_window(&mut self, start: usize, window: usize) {
        for index in start..start.saturating_add(window.max(1)) {
            self.prefetch(index);
        }
    }

    /// Shared fetch for `index`, starting it if needed
    pub fn get(&mut self, index: usize) -> Option<SharedFetch> {
        self.prefetch(index);
        self.fetches.get(&index).cloned()
    }

    /// Drop the fetch for `index`; the next `get` starts a fresh one
    pub fn forget(&mut self, index: usize) -> bool {
        self.fetches.remove(&index).is_some()
    }

    /// Number of indices with a pending or resolved fetch
    pub fn scheduled_count(&self) -> usize {
        self.fetches.len()
    }

    /// Cancel all fetches, clear the map and release the session's handles
    pub fn teardown(&mut self) {
        self.cancel.cancel();
        let cleared = self.fetches.len();
        self.fetches.clear();
        let released = self.scope.close();
        debug!(
            generation = self.generation,
            cleared, released, "Prefetch scheduler torn down"
        );
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::handles::HandleStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Resolves after a fixed delay, counting calls
    struct SlowSynth {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ChunkSynthesizer for SlowSynth {
        async fn fetch_chunk_audio(
            &self,
            text: &str,
            _voice: &VoiceId,
            cancel: &CancellationToken,
        ) -> Result<Bytes, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => Err(SynthesisError::Aborted),
                _ = tokio::time::sleep(self.delay) => Ok(Bytes::from(text.to_string())),
            }
        }
    }

    fn chunks(n: usize) -> Arc<Vec<Chunk>> {
        Arc::new(
            (0..n)
                .map(|index| Chunk {
                    index,
                    text: format!("chunk {}", index),
                })
                .collect(),
        )
    }

    fn scheduler(synth: Arc<SlowSynth>, store: &Arc<HandleStore>) -> PrefetchScheduler {
        PrefetchScheduler::new(
            synth,
            chunks(5),
            VoiceId::from("v1"),
            1,
            CancellationToken::new(),
            store.scope(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_twice_fetches_once() {
        let synth = Arc::new(SlowSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        });
        let store = HandleStore::new();
        let mut prefetch = scheduler(Arc::clone(&synth), &store);

        assert!(prefetch.prefetch(2));
        assert!(!prefetch.prefetch(2));
        let first = prefetch.get(2).unwrap();
        let second = prefetch.get(2).unwrap();

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, b);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        let handle = a.unwrap();
        assert_eq!(store.resolve(handle), Some(Bytes::from("chunk 2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_and_out_of_range() {
        let synth = Arc::new(SlowSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        });
        let store = HandleStore::new();
        let mut prefetch = scheduler(Arc::clone(&synth), &store);

        prefetch.prefetch_window(3, 3);
        assert_eq!(prefetch.scheduled_count(), 2); // 3 and 4; 5 is out of range
        assert!(prefetch.get(9).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_and_releases() {
        let synth = Arc::new(SlowSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(10),
        });
        let store = HandleStore::new();
        let mut prefetch = scheduler(Arc::clone(&synth), &store);

        let quick = {
            prefetch.prefetch(0);
            prefetch.get(1).unwrap()
        };
        prefetch.teardown();

        assert_eq!(quick.await, Err(SynthesisError::Aborted));
        assert_eq!(prefetch.scheduled_count(), 0);
        assert_eq!(store.live_count(), 0);
        assert!(!prefetch.prefetch(0), "no new fetches after teardown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_releases_resolved_handles() {
        let synth = Arc::new(SlowSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let store = HandleStore::new();
        let mut prefetch = scheduler(Arc::clone(&synth), &store);

        let handle = prefetch.get(0).unwrap().await.unwrap();
        assert_eq!(store.live_count(), 1);

        prefetch.teardown();
        assert!(store.resolve(handle).is_none());
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_allows_refetch() {
        let synth = Arc::new(SlowSynth {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let store = HandleStore::new();
        let mut prefetch = scheduler(Arc::clone(&synth), &store);

        prefetch.get(1).unwrap().await.unwrap();
        assert!(prefetch.forget(1));
        assert!(!prefetch.forget(1));

        prefetch.get(1).unwrap().await.unwrap();
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }
}
