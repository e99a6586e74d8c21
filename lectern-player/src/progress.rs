//! Listening progress sync
//!
//! [`ProgressReporter`] debounces position updates of one session and pushes
//! the latest one to a [`ProgressStore`]. Sync is best-effort: a failed save is
//! logged, swallowed and leaves the value pending so the next flush retries it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use lectern_common::events::{ProgressKind, ProgressRecord};
use lectern_common::{BookId, ChapterId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Remote store of reading/listening progress
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn save(&self, record: &ProgressRecord) -> Result<()>;

    /// Stored progress for a chapter, `None` if there is none
    async fn load(&self, chapter_id: &ChapterId, kind: ProgressKind)
        -> Result<Option<ProgressRecord>>;
}

/// Progress store behind the backend API
///
/// - `PUT {base}/progress` with the record as JSON
/// - `GET {base}/progress/chapter/{id}?type={kind}` answering a record or `null`
#[derive(Debug, Clone)]
pub struct HttpProgressStore {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpProgressStore {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http_client: reqwest::Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

async fn remote_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Error::Remote { status, message }
}

#[async_trait]
impl ProgressStore for HttpProgressStore {
    async fn save(&self, record: &ProgressRecord) -> Result<()> {
        let response = self
            .http_client
            .put(format!("{}/progress", self.base_url))
            .json(record)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }
        Ok(())
    }

    async fn load(
        &self,
        chapter_id: &ChapterId,
        kind: ProgressKind,
    ) -> Result<Option<ProgressRecord>> {
        let response = self
            .http_client
            .get(format!("{}/progress/chapter/{}", self.base_url, chapter_id))
            .query(&[("type", kind.to_string())])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(remote_error(response).await);
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// One reported position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub value: f64,
    pub total: Option<f64>,
}

#[derive(Default)]
struct ReporterState {
    pending: Option<ProgressSample>,
    last_sent: Option<ProgressSample>,
    timer: Option<JoinHandle<()>>,
}

struct ReporterInner {
    store: Arc<dyn ProgressStore>,
    book_id: BookId,
    chapter_id: ChapterId,
    kind: ProgressKind,
    debounce: Duration,
    state: Mutex<ReporterState>,
    /// Serializes saves so two flushes never race on `last_sent`
    flushing: tokio::sync::Mutex<()>,
}

impl ReporterInner {
    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush(&self) {
        let _flushing = self.flushing.lock().await;

        let sample = {
            let mut state = self.lock();
            match state.pending {
                None => return,
                Some(sample) if state.last_sent == Some(sample) => {
                    state.pending = None;
                    return;
                }
                Some(sample) => sample,
            }
        };

        let record = ProgressRecord {
            book_id: self.book_id.clone(),
            chapter_id: self.chapter_id.clone(),
            kind: self.kind,
            value: sample.value,
            total: sample.total,
        };

        match self.store.save(&record).await {
            Ok(()) => {
                let mut state = self.lock();
                state.last_sent = Some(sample);
                if state.pending == Some(sample) {
                    state.pending = None;
                }
                debug!(chapter_id = %self.chapter_id, value = sample.value, "Progress saved");
            }
            Err(e) => {
                warn!(chapter_id = %self.chapter_id, "Progress sync failed, will retry: {}", e);
            }
        }
    }
}

/// Debounced progress reporting for one chapter
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        book_id: BookId,
        chapter_id: ChapterId,
        kind: ProgressKind,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                store,
                book_id,
                chapter_id,
                kind,
                debounce,
                state: Mutex::new(ReporterState::default()),
                flushing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Record the latest position and restart the debounce timer
    pub fn report(&self, value: f64, total: Option<f64>) {
        if !value.is_finite() {
            return;
        }
        let mut state = self.inner.lock();
        state.pending = Some(ProgressSample { value, total });
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.lock().timer = None;
            inner.flush().await;
        }));
    }

    /// Send the pending value now if it differs from the last one sent
    pub async fn flush(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
        self.inner.flush().await;
    }

    pub fn pending(&self) -> Option<ProgressSample> {
        self.inner.lock().pending
    }

    pub fn last_sent(&self) -> Option<ProgressSample> {
        self.inner.lock().last_sent
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("chapter_id", &self.inner.chapter_id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<ProgressRecord>>,
        failing: AtomicBool,
    }

    impl RecordingStore {
        fn values(&self) -> Vec<f64> {
            self.saved.lock().unwrap().iter().map(|r| r.value).collect()
        }
    }

    #[async_trait]
    impl ProgressStore for RecordingStore {
        async fn save(&self, record: &ProgressRecord) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Http("connection refused".to_string()));
            }
            self.saved.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load(&self, _: &ChapterId, _: ProgressKind) -> Result<Option<ProgressRecord>> {
            Ok(None)
        }
    }

    fn reporter(store: &Arc<RecordingStore>) -> ProgressReporter {
        ProgressReporter::new(
            Arc::clone(store) as Arc<dyn ProgressStore>,
            "b1".into(),
            "c1".into(),
            ProgressKind::Listen,
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_sends_latest_once() {
        let store = Arc::new(RecordingStore::default());
        let reporter = reporter(&store);

        reporter.report(1.0, Some(20.0));
        tokio::time::sleep(Duration::from_secs(3)).await;
        reporter.report(2.0, Some(20.0));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.values().is_empty(), "timer restarts on every report");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.values(), vec![2.0]);
        assert_eq!(reporter.pending(), None);

        let saved = store.saved.lock().unwrap()[0].clone();
        assert_eq!(saved.total, Some(20.0));
        assert_eq!(saved.kind, ProgressKind::Listen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_value_not_resent() {
        let store = Arc::new(RecordingStore::default());
        let reporter = reporter(&store);

        reporter.report(4.0, Some(20.0));
        reporter.flush().await;
        reporter.report(4.0, Some(20.0));
        reporter.flush().await;

        assert_eq!(store.values(), vec![4.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_value_pending() {
        let store = Arc::new(RecordingStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let reporter = reporter(&store);

        reporter.report(7.0, None);
        reporter.flush().await;
        assert!(store.values().is_empty());
        assert_eq!(reporter.pending().map(|s| s.value), Some(7.0));
        assert_eq!(reporter.last_sent(), None);

        store.failing.store(false, Ordering::SeqCst);
        reporter.flush().await;
        assert_eq!(store.values(), vec![7.0]);
        assert_eq!(reporter.pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_cancels_timer() {
        let store = Arc::new(RecordingStore::default());
        let reporter = reporter(&store);

        reporter.report(3.0, Some(10.0));
        reporter.flush().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.values(), vec![3.0]);
    }
}
