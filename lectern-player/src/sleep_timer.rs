//! Sleep timer
//!
//! Counts down once per second; at zero runs the expire callback exactly once
//! and clears itself. Every `set`/`cancel` replaces the previous countdown.

use crate::state::SharedState;
use chrono::Utc;
use lectern_common::events::PlayerEvent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::info;

pub type ExpireCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerInner {
    remaining: watch::Sender<Option<u32>>,
    on_expire: ExpireCallback,
    state: Option<Arc<SharedState>>,
}

impl TimerInner {
    fn publish(&self, remaining: Option<u32>) {
        self.remaining.send_replace(remaining);
        if let Some(state) = &self.state {
            state.broadcast_event(PlayerEvent::SleepTimerChanged {
                remaining_seconds: remaining,
                timestamp: Utc::now(),
            });
        }
    }
}

pub struct SleepTimer {
    inner: Arc<TimerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SleepTimer {
    pub fn new(on_expire: ExpireCallback) -> Self {
        Self::build(on_expire, None)
    }

    /// Timer that also broadcasts its changes as player events
    pub fn with_events(on_expire: ExpireCallback, state: Arc<SharedState>) -> Self {
        Self::build(on_expire, Some(state))
    }

    fn build(on_expire: ExpireCallback, state: Option<Arc<SharedState>>) -> Self {
        let (remaining, _) = watch::channel(None);
        Self {
            inner: Arc::new(TimerInner {
                remaining,
                on_expire,
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start a countdown of `minutes`; returns the seconds remaining
    pub fn set(&self, minutes: f64) -> u32 {
        let seconds = (minutes * 60.0).round().max(1.0) as u32;
        let inner = Arc::clone(&self.inner);

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }
        inner.publish(Some(seconds));
        info!(seconds, "Sleep timer set");

        *task = Some(tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticks = interval_at(Instant::now() + period, period);
            let mut remaining = seconds;
            loop {
                ticks.tick().await;
                remaining = remaining.saturating_sub(1);
                if remaining > 0 {
                    inner.publish(Some(remaining));
                    continue;
                }

                inner.publish(None);
                info!("Sleep timer expired");
                if let Some(state) = &inner.state {
                    state.broadcast_event(PlayerEvent::SleepTimerExpired {
                        timestamp: Utc::now(),
                    });
                }
                (inner.on_expire)();
                break;
            }
        }));
        seconds
    }

    /// Clear without running the callback
    pub fn cancel(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
            info!("Sleep timer cancelled");
        }
        self.inner.publish(None);
    }

    pub fn remaining(&self) -> Option<u32> {
        *self.inner.remaining.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u32>> {
        self.inner.remaining.subscribe()
    }
}

impl Drop for SleepTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}
