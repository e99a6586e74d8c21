//! Neighbor chapter preloading
//!
//! Warms the persistent audio cache with full-chapter tracks so that later
//! sessions for those chapters start in full mode.
//!
//! **Rules:**
//! - Only chapters whose synthesis is known to be complete are preloaded;
//!   requesting an unsynthesized chapter would trigger slow synthesis
//! - A (chapter, voice) pair is downloaded by at most one task at a time,
//!   across every consumer sharing the [`InFlightRegistry`]
//! - Downloads wait for connectivity like chunk fetches do
//! - A download, body included, is bounded by the client timeout and ends
//!   on [`ChapterPreloader::shutdown`]

use crate::cache::BlobCache;
use crate::error::{Error, Result};
use crate::state::SharedState;
use crate::synthesis::{Connectivity, SynthesisError};
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use lectern_common::events::{CacheStatus, PlayerEvent};
use lectern_common::{CacheKey, ChapterId, VoiceId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keys of chapter downloads currently running
///
/// Lives for the process; clones share the same set. `reset` exists for tests.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    keys: Arc<Mutex<HashSet<CacheKey>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<CacheKey>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `key`; `None` if another download holds it
    pub fn try_acquire(&self, key: &CacheKey) -> Option<InFlightGuard> {
        if !self.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            registry: self.clone(),
            key: key.clone(),
        })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

/// Releases its key on drop
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    key: CacheKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Chapter near the current one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborChapter {
    pub id: ChapterId,
    /// Full-chapter synthesis already completed on the service
    #[serde(default)]
    pub synthesis_ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterCacheStatus {
    pub chapter_id: ChapterId,
    pub voice: VoiceId,
    pub status: CacheStatus,
}

pub struct ChapterPreloader {
    http_client: reqwest::Client,
    base_url: String,
    cache: Arc<dyn BlobCache>,
    connectivity: Connectivity,
    registry: InFlightRegistry,
    statuses: RwLock<HashMap<CacheKey, CacheStatus>>,
    state: Option<Arc<SharedState>>,
    shutdown: CancellationToken,
}

/// Used when no `[cache] download_timeout_ms` is configured
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

impl ChapterPreloader {
    pub fn new(
        base_url: &str,
        cache: Arc<dyn BlobCache>,
        connectivity: Connectivity,
        registry: InFlightRegistry,
    ) -> Self {
        Self {
            http_client: download_client(DEFAULT_DOWNLOAD_TIMEOUT),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
            connectivity,
            registry,
            statuses: RwLock::new(HashMap::new()),
            state: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bound every download, response body included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_client = download_client(timeout);
        self
    }

    /// Broadcast status changes as player events
    pub fn with_events(mut self, state: Arc<SharedState>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Abort running and waiting downloads
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Download every ready, uncached neighbor; returns how many got cached
    pub async fn preload(&self, neighbors: &[NeighborChapter], voice: &VoiceId) -> usize {
        if voice.is_native() {
            debug!(voice = %voice, "No chapter audio for native voices, preload skipped");
            return 0;
        }

        let downloads = neighbors
            .iter()
            .filter(|chapter| {
                if !chapter.synthesis_ready {
                    debug!(chapter_id = %chapter.id, "Chapter not synthesized yet, preload skipped");
                }
                chapter.synthesis_ready
            })
            .map(|chapter| async move {
                match self.warm(&chapter.id, voice).await {
                    Ok(status) => status == CacheStatus::Cached,
                    Err(Error::Synthesis(SynthesisError::Aborted)) => false,
                    Err(e) => {
                        warn!(chapter_id = %chapter.id, "Chapter preload failed: {}", e);
                        false
                    }
                }
            });

        let cached = join_all(downloads).await.into_iter().filter(|ok| *ok).count();
        info!(requested = neighbors.len(), cached, "Neighbor preload finished");
        cached
    }

    /// Explicit full-chapter download, regardless of readiness hints
    pub async fn download_chapter(&self, chapter_id: &ChapterId, voice: &VoiceId) -> Result<CacheStatus> {
        if voice.is_native() {
            return Err(Error::BadRequest(format!(
                "voice {} has no chapter audio",
                voice
            )));
        }
        self.warm(chapter_id, voice).await
    }

    pub async fn evict_chapter(&self, chapter_id: &ChapterId, voice: &VoiceId) {
        let key = CacheKey::new(chapter_id.clone(), voice.clone());
        self.cache.evict(&key).await;
        self.set_status(&key, CacheStatus::Uncached).await;
        info!(key = %key, "Chapter audio evicted");
    }

    /// Current status, falling back to the cache for unknown chapters
    pub async fn status(&self, chapter_id: &ChapterId, voice: &VoiceId) -> CacheStatus {
        let key = CacheKey::new(chapter_id.clone(), voice.clone());
        if let Some(status) = self.statuses.read().await.get(&key) {
            return *status;
        }
        if self.cache.has(&key).await {
            self.set_status(&key, CacheStatus::Cached).await;
            return CacheStatus::Cached;
        }
        CacheStatus::Uncached
    }

    /// Every chapter this preloader has seen
    pub async fn statuses(&self) -> Vec<ChapterCacheStatus> {
        let mut all: Vec<ChapterCacheStatus> = self
            .statuses
            .read()
            .await
            .iter()
            .map(|(key, status)| ChapterCacheStatus {
                chapter_id: key.chapter_id.clone(),
                voice: key.voice.clone(),
                status: *status,
            })
            .collect();
        all.sort_by(|a, b| {
            (a.chapter_id.as_str(), a.voice.as_str()).cmp(&(b.chapter_id.as_str(), b.voice.as_str()))
        });
        all
    }

    async fn warm(&self, chapter_id: &ChapterId, voice: &VoiceId) -> Result<CacheStatus> {
        let key = CacheKey::new(chapter_id.clone(), voice.clone());
        if self.cache.has(&key).await {
            self.set_status(&key, CacheStatus::Cached).await;
            return Ok(CacheStatus::Cached);
        }

        let Some(_guard) = self.registry.try_acquire(&key) else {
            debug!(key = %key, "Chapter download already in flight");
            return Ok(CacheStatus::Downloading);
        };
        self.set_status(&key, CacheStatus::Downloading).await;

        let audio = match self.download(&key).await {
            Ok(audio) => audio,
            Err(e) => {
                self.set_status(&key, CacheStatus::Uncached).await;
                return Err(e);
            }
        };

        let bytes = audio.len();
        self.cache.put(&key, audio).await;
        // put is best-effort; only a readable entry counts as cached
        let status = if self.cache.has(&key).await {
            info!(key = %key, bytes, "Chapter audio cached");
            CacheStatus::Cached
        } else {
            CacheStatus::Uncached
        };
        self.set_status(&key, status).await;
        Ok(status)
    }

    async fn download(&self, key: &CacheKey) -> Result<Bytes> {
        self.connectivity.wait_online(&self.shutdown).await?;

        let url = format!("{}/tts/chapter-audio/{}", self.base_url, key.chapter_id);
        let fetch = async {
            let response = self
                .http_client
                .get(&url)
                .query(&[("voice", key.voice.as_str())])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(Error::Remote {
                    status: status.as_u16(),
                    message,
                });
            }
            Ok::<Bytes, Error>(response.bytes().await?)
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(key = %key, "Chapter download aborted by shutdown");
                Err(SynthesisError::Aborted.into())
            }
            audio = fetch => audio,
        }
    }

    async fn set_status(&self, key: &CacheKey, status: CacheStatus) {
        let previous = self.statuses.write().await.insert(key.clone(), status);
        if previous == Some(status) {
            return;
        }
        if let Some(state) = &self.state {
            state.broadcast_event(PlayerEvent::CacheStatusChanged {
                chapter_id: key.chapter_id.clone(),
                voice: key.voice.clone(),
                status,
                timestamp: Utc::now(),
            });
        }
    }
}

fn download_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!("Could not build download client with timeout, using defaults: {}", e);
            reqwest::Client::new()
        })
}
