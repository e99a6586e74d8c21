//! SQLite-backed chapter audio cache
//!
//! One row per (chapter, voice) in `chapter_audio`. A put is a single
//! `INSERT OR REPLACE` inside a transaction with the quota check, so readers
//! see either the old entry, the new one, or nothing.

use crate::cache::BlobCache;
use async_trait::async_trait;
use bytes::Bytes;
use lectern_common::CacheKey;
use sqlx::{Pool, Sqlite};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SqliteBlobCache {
    db: Pool<Sqlite>,
    quota_bytes: Option<u64>,
}

impl SqliteBlobCache {
    pub fn new(db: Pool<Sqlite>, quota_bytes: Option<u64>) -> Self {
        Self { db, quota_bytes }
    }

    /// Total bytes stored
    pub async fn used_bytes(&self) -> crate::Result<u64> {
        let used: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM chapter_audio")
            .fetch_one(&self.db)
            .await?;
        Ok(used.max(0) as u64)
    }

    async fn try_put(&self, key: &CacheKey, audio: &Bytes) -> crate::Result<bool> {
        let mut tx = self.db.begin().await?;

        if let Some(quota) = self.quota_bytes {
            let others: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(size_bytes), 0) FROM chapter_audio
                WHERE NOT (chapter_id = ? AND voice = ?)
                "#,
            )
            .bind(key.chapter_id.as_str())
            .bind(key.voice.as_str())
            .fetch_one(&mut *tx)
            .await?;

            if others.max(0) as u64 + audio.len() as u64 > quota {
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chapter_audio (chapter_id, voice, audio, size_bytes, stored_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(key.chapter_id.as_str())
        .bind(key.voice.as_str())
        .bind(audio.as_ref())
        .bind(audio.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl BlobCache for SqliteBlobCache {
    async fn has(&self, key: &CacheKey) -> bool {
        let result: Result<bool, sqlx::Error> = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM chapter_audio WHERE chapter_id = ? AND voice = ?)",
        )
        .bind(key.chapter_id.as_str())
        .bind(key.voice.as_str())
        .fetch_one(&self.db)
        .await;

        result.unwrap_or_else(|e| {
            warn!(key = %key, "Cache lookup failed: {}", e);
            false
        })
    }

    async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let result: Result<Option<Vec<u8>>, sqlx::Error> = sqlx::query_scalar(
            "SELECT audio FROM chapter_audio WHERE chapter_id = ? AND voice = ?",
        )
        .bind(key.chapter_id.as_str())
        .bind(key.voice.as_str())
        .fetch_optional(&self.db)
        .await;

        match result {
            Ok(audio) => audio.map(Bytes::from),
            Err(e) => {
                warn!(key = %key, "Cache read failed: {}", e);
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, audio: Bytes) {
        match self.try_put(key, &audio).await {
            Ok(true) => debug!(key = %key, bytes = audio.len(), "Chapter audio cached"),
            Ok(false) => warn!(key = %key, bytes = audio.len(), "Cache quota exceeded, entry not stored"),
            Err(e) => warn!(key = %key, "Cache write failed: {}", e),
        }
    }

    async fn evict(&self, key: &CacheKey) {
        let result = sqlx::query("DELETE FROM chapter_audio WHERE chapter_id = ? AND voice = ?")
            .bind(key.chapter_id.as_str())
            .bind(key.voice.as_str())
            .execute(&self.db)
            .await;

        if let Err(e) = result {
            warn!(key = %key, "Cache evict failed: {}", e);
        }
    }
}
