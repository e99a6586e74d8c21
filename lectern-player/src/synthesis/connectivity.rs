//! Online/offline gate
//!
//! A `watch` channel carrying the current connectivity state. Fetches wait on
//! it while offline. The state is set explicitly (API, tests) or by the
//! optional background probe that tries a TCP connect to the service.

use super::SynthesisError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the state; returns true if it changed
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once online, or with `Aborted` when `cancel` fires first
    pub async fn wait_online(&self, cancel: &CancellationToken) -> Result<(), SynthesisError> {
        let mut rx = self.tx.subscribe();
        let mut logged = false;
        loop {
            let online = *rx.borrow_and_update();
            if online {
                return Ok(());
            }
            if !logged {
                debug!("Offline, waiting for connectivity");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SynthesisError::Aborted),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(SynthesisError::Aborted);
                    }
                }
            }
        }
    }

    /// Periodically probe `host:port` and update the state
    pub fn spawn_probe(
        &self,
        address: String,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let connectivity = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reachable = matches!(
                    tokio::time::timeout(interval, TcpStream::connect(address.as_str())).await,
                    Ok(Ok(_))
                );
                connectivity.set_online(reachable);
            }
            debug!("Connectivity probe stopped");
        })
    }
}

/// `host:port` of an HTTP(S) base URL, for the reachability probe
pub fn probe_address(base_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}
