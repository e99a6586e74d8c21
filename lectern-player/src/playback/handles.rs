//! Locally-addressable audio handles
//!
//! Fetched chunk audio is registered in a [`HandleStore`] and referenced by an
//! opaque [`AudioHandle`]. Every handle belongs to a [`HandleScope`] (one per
//! playback session); closing the scope releases all of its handles at once.
//! Registering into a closed scope releases the audio immediately, so a fetch
//! that completes after its session was torn down cannot leak.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Opaque reference to audio bytes held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioHandle(Uuid);

impl std::fmt::Display for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "audio:{}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-wide registry of live audio handles
#[derive(Debug, Default)]
pub struct HandleStore {
    entries: Mutex<HashMap<AudioHandle, Bytes>>,
}

impl HandleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new scope for one session
    pub fn scope(self: &Arc<Self>) -> Arc<HandleScope> {
        Arc::new(HandleScope {
            store: Arc::clone(self),
            state: Mutex::new(ScopeState::default()),
        })
    }

    /// Look up the audio behind a handle; `None` once released
    pub fn resolve(&self, handle: AudioHandle) -> Option<Bytes> {
        lock(&self.entries).get(&handle).cloned()
    }

    /// Number of handles not yet released
    pub fn live_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Total bytes held by live handles
    pub fn live_bytes(&self) -> usize {
        lock(&self.entries).values().map(Bytes::len).sum()
    }

    fn insert(&self, audio: Bytes) -> AudioHandle {
        let handle = AudioHandle(Uuid::new_v4());
        lock(&self.entries).insert(handle, audio);
        handle
    }

    fn remove(&self, handle: AudioHandle) {
        lock(&self.entries).remove(&handle);
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    closed: bool,
    handles: Vec<AudioHandle>,
}

/// Tracks the handles created for one session
#[derive(Debug)]
pub struct HandleScope {
    store: Arc<HandleStore>,
    state: Mutex<ScopeState>,
}

impl HandleScope {
    /// Register audio and return its handle
    ///
    /// On a closed scope the handle is returned already released.
    pub fn register(&self, audio: Bytes) -> AudioHandle {
        let mut state = lock(&self.state);
        let handle = self.store.insert(audio);
        if state.closed {
            self.store.remove(handle);
        } else {
            state.handles.push(handle);
        }
        handle
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every handle and refuse new ones; returns how many were released
    pub fn close(&self) -> usize {
        let mut state = lock(&self.state);
        state.closed = true;
        let released = state.handles.len();
        for handle in state.handles.drain(..) {
            self.store.remove(handle);
        }
        released
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let store = HandleStore::new();
        let scope = store.scope();

        let handle = scope.register(Bytes::from_static(b"abc"));
        assert_eq!(store.resolve(handle), Some(Bytes::from_static(b"abc")));
        assert_eq!(store.live_count(), 1);
        assert_eq!(store.live_bytes(), 3);
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_close_releases_all() {
        let store = HandleStore::new();
        let scope = store.scope();
        let a = scope.register(Bytes::from_static(b"a"));
        let b = scope.register(Bytes::from_static(b"b"));

        assert_eq!(scope.close(), 2);
        assert_eq!(store.live_count(), 0);
        assert!(store.resolve(a).is_none());
        assert!(store.resolve(b).is_none());
        assert!(scope.is_empty());
    }

    #[test]
    fn test_register_after_close_is_released() {
        let store = HandleStore::new();
        let scope = store.scope();
        scope.close();

        let late = scope.register(Bytes::from_static(b"late"));
        assert!(store.resolve(late).is_none());
        assert_eq!(store.live_count(), 0);
        assert!(scope.is_closed());
    }

    #[test]
    fn test_scopes_are_independent_and_drop_releases() {
        let store = HandleStore::new();
        let first = store.scope();
        let kept = {
            let second = store.scope();
            second.register(Bytes::from_static(b"gone"));
            first.register(Bytes::from_static(b"kept"))
        };

        assert_eq!(store.live_count(), 1);
        assert!(store.resolve(kept).is_some());
        drop(first);
        assert_eq!(store.live_count(), 0);
    }
}
