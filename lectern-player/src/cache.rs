//! Persistent audio cache abstraction
//!
//! Full-chapter audio keyed by the exact (chapter, voice) pair. Entries are
//! either fully present or absent. Writes are best-effort: a rejected write
//! (quota, storage error) is logged and dropped, and the player keeps using
//! streaming mode for that chapter.
//!
//! Implementations: [`MemoryBlobCache`] here and
//! [`crate::db::SqliteBlobCache`] for on-disk storage.

use async_trait::async_trait;
use bytes::Bytes;
use lectern_common::CacheKey;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn has(&self, key: &CacheKey) -> bool;

    async fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Store a complete entry; failures are swallowed
    async fn put(&self, key: &CacheKey, audio: Bytes);

    async fn evict(&self, key: &CacheKey);
}

/// In-process cache with an optional byte quota
#[derive(Debug, Default)]
pub struct MemoryBlobCache {
    entries: RwLock<HashMap<CacheKey, Bytes>>,
    quota_bytes: Option<usize>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn has(&self, key: &CacheKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.read().await.get(key).cloned()
    }

    async fn put(&self, key: &CacheKey, audio: Bytes) {
        let mut entries = self.entries.write().await;
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| *k != key)
                .map(|(_, v)| v.len())
                .sum();
            if used + audio.len() > quota {
                warn!(key = %key, bytes = audio.len(), "Cache quota exceeded, entry not stored");
                return;
            }
        }
        entries.insert(key.clone(), audio);
    }

    async fn evict(&self, key: &CacheKey) {
        self.entries.write().await.remove(key);
    }
}
