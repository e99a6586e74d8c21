//! Controller task
//!
//! **Responsibilities:**
//! - Own the single live session and apply commands to it in order
//! - Drive streaming playback chunk by chunk (remote fetch or native speech)
//! - Drive full-mode playback of a cached chapter track
//! - Report progress and publish status/events
//!
//! Every spawned operation posts its result back as an [`Internal`] event.
//! Results whose ticket no longer matches the session are dropped.

use super::session::{
    clamp_chunk_index, full_seek_target, index_for_fraction, position_for_fraction, Backend,
    Session, Ticket,
};
use super::{Command, EndedHook, EngineConfig, EngineDeps, SessionRequest};
use crate::audio::{SinkEvent, SourceId};
use crate::native::{NativeError, SpeakRequest};
use crate::playback::chunker::split_into_chunks;
use crate::playback::prefetch::{FetchResult, PrefetchScheduler};
use crate::progress::ProgressReporter;
use crate::state::{PlayerStatus, SharedState};
use crate::synthesis::SynthesisError;
use bytes::Bytes;
use chrono::Utc;
use lectern_common::events::{PlaybackMode, PlaybackPhase, PlayerEvent, ProgressKind};
use lectern_common::{CacheKey, VoiceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Results of async work spawned by the controller
#[derive(Debug)]
enum Internal {
    ModeResolved {
        generation: u64,
        cached: Option<Bytes>,
    },
    SeedLoaded {
        generation: u64,
        fraction: Option<f64>,
    },
    ChunkReady {
        ticket: Ticket,
        index: usize,
        result: FetchResult,
    },
    NativeStarted {
        ticket: Ticket,
        result: Result<(), NativeError>,
    },
    NativeFinished {
        ticket: Ticket,
        result: Result<(), NativeError>,
    },
}

fn set_phase(state: &SharedState, session: &mut Session, phase: PlaybackPhase) {
    if session.phase == phase {
        return;
    }
    let old = std::mem::replace(&mut session.phase, phase);
    info!(
        chapter_id = %session.chapter_id,
        generation = session.generation,
        "Playback {} -> {}", old, phase
    );
    state.broadcast_event(PlayerEvent::PlaybackStateChanged {
        old_phase: old,
        new_phase: phase,
        mode: session.mode_or_default(),
        timestamp: Utc::now(),
    });
}

/// Stop in a paused, playable-again state
fn fail(state: &SharedState, session: &mut Session, reason: String) {
    error!(
        chapter_id = %session.chapter_id,
        index = session.index,
        "Playback stopped: {}", reason
    );
    session.next_ticket();
    session.stopped = true;
    set_phase(state, session, PlaybackPhase::Paused);
    state.broadcast_event(PlayerEvent::PlaybackFailed {
        chapter_id: session.chapter_id.clone(),
        reason,
        timestamp: Utc::now(),
    });
}

pub(super) struct Controller {
    config: EngineConfig,
    deps: EngineDeps,
    on_ended: Option<EndedHook>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    session: Option<Session>,
    generation: u64,
    /// Playback speed, kept for the player's lifetime
    rate: f32,
    /// Progress flushes started at teardown
    flushes: Vec<JoinHandle<()>>,
}

impl Controller {
    pub fn new(config: EngineConfig, deps: EngineDeps, on_ended: Option<EndedHook>) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            deps,
            on_ended,
            internal_tx,
            internal_rx: Some(internal_rx),
            session: None,
            generation: 0,
            rate: 1.0,
            flushes: Vec::new(),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut internal) = self.internal_rx.take() else {
            return;
        };
        let mut sink_events = self.deps.sink.subscribe();
        let mut sink_open = true;
        let mut online = self.deps.connectivity.subscribe();
        let mut online_open = true;
        let mut ticker = tokio::time::interval(self.config.position_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Playback controller started");
        self.publish().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => {
                        self.handle_command(command).await;
                        self.publish().await;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = internal.recv() => {
                    self.handle_internal(event).await;
                    self.publish().await;
                }
                event = sink_events.recv(), if sink_open => match event {
                    Ok(SinkEvent::Ended { source }) => {
                        self.on_sink_ended(source).await;
                        self.publish().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sink events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => sink_open = false,
                },
                changed = online.changed(), if online_open => match changed {
                    Ok(()) => {
                        let is_online = *online.borrow_and_update();
                        self.deps.state.broadcast_event(PlayerEvent::ConnectivityChanged {
                            online: is_online,
                            timestamp: Utc::now(),
                        });
                        self.publish().await;
                    }
                    Err(_) => online_open = false,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        info!("Playback controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(request) => self.start(*request).await,
            Command::Toggle => self.toggle().await,
            Command::Play => self.play().await,
            Command::Pause => self.pause().await,
            Command::Seek(delta) => self.seek(delta).await,
            Command::SetRate(rate) => self.set_rate(rate).await,
            Command::ChangeVoice(voice) => self.change_voice(voice).await,
            Command::RestartChunk => self.restart_chunk().await,
            Command::Stop => self.stop().await,
            // Handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::ModeResolved { generation, cached } => {
                self.on_mode_resolved(generation, cached).await
            }
            Internal::SeedLoaded {
                generation,
                fraction,
            } => self.on_seed_loaded(generation, fraction).await,
            Internal::ChunkReady {
                ticket,
                index,
                result,
            } => self.on_chunk_ready(ticket, index, result).await,
            Internal::NativeStarted { ticket, result } => self.on_native_started(ticket, result),
            Internal::NativeFinished { ticket, result } => {
                self.on_native_finished(ticket, result).await
            }
        }
    }

    // ---------------------------------------------------------------------
    // Session lifecycle
    // ---------------------------------------------------------------------

    async fn start(&mut self, request: SessionRequest) {
        let previous_phase = self
            .session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(PlaybackPhase::Idle);
        self.teardown().await;

        self.generation += 1;
        let generation = self.generation;
        let chunks = Arc::new(split_into_chunks(&request.text, &self.config.chunking));
        let backend = Backend::for_voice(&request.voice);
        let cancel = CancellationToken::new();

        let prefetch = match backend {
            Backend::Remote => Some(PrefetchScheduler::new(
                Arc::clone(&self.deps.synthesizer),
                Arc::clone(&chunks),
                request.voice.clone(),
                generation,
                cancel.child_token(),
                self.deps.handles.scope(),
            )),
            Backend::Native(_) => None,
        };
        let reporter = self.deps.progress.as_ref().map(|store| {
            ProgressReporter::new(
                Arc::clone(store),
                request.book_id.clone(),
                request.chapter_id.clone(),
                ProgressKind::Listen,
                self.config.progress_debounce,
            )
        });

        info!(
            chapter_id = %request.chapter_id,
            voice = %request.voice,
            chunks = chunks.len(),
            generation,
            "Session started"
        );
        self.deps.state.broadcast_event(PlayerEvent::SessionStarted {
            chapter_id: request.chapter_id.clone(),
            voice: request.voice.clone(),
            total_chunks: chunks.len(),
            generation,
            timestamp: Utc::now(),
        });
        self.deps.state.broadcast_event(PlayerEvent::PlaybackStateChanged {
            old_phase: previous_phase,
            new_phase: PlaybackPhase::ResolvingMode,
            mode: PlaybackMode::Streaming,
            timestamp: Utc::now(),
        });

        if request.initial_position.is_none() {
            if let Some(store) = self.deps.progress.clone() {
                let chapter_id = request.chapter_id.clone();
                let tx = self.internal_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let loaded = tokio::select! {
                        _ = cancel.cancelled() => return,
                        loaded = store.load(&chapter_id, ProgressKind::Listen) => loaded,
                    };
                    let fraction = match loaded {
                        Ok(record) => record.and_then(|r| r.fraction()),
                        Err(e) => {
                            warn!(chapter_id = %chapter_id, "Could not load listening progress: {}", e);
                            None
                        }
                    };
                    let _ = tx.send(Internal::SeedLoaded {
                        generation,
                        fraction,
                    });
                });
            }
        }

        if backend == Backend::Remote {
            let cache = Arc::clone(&self.deps.cache);
            let key = CacheKey::new(request.chapter_id.clone(), request.voice.clone());
            let tx = self.internal_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let cached = tokio::select! {
                    _ = cancel.cancelled() => return,
                    cached = cache.get(&key) => cached,
                };
                let _ = tx.send(Internal::ModeResolved { generation, cached });
            });
        }

        self.session = Some(Session {
            generation,
            book_id: request.book_id,
            chapter_id: request.chapter_id,
            voice: request.voice,
            text: request.text,
            backend,
            chunks,
            mode: None,
            phase: PlaybackPhase::ResolvingMode,
            index: 0,
            seq: 0,
            stopped: true,
            auto_play: request.auto_play,
            seed: request.initial_position,
            chunk_cancel: cancel.child_token(),
            cancel,
            prefetch,
            reporter,
            source: None,
            duration: None,
        });

        // Native voices never have cached tracks
        if matches!(backend, Backend::Native(_)) {
            self.on_mode_resolved(generation, None).await;
        }
    }

    /// Cancel all work of the live session and release its resources
    async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        if let Some(mut prefetch) = session.prefetch.take() {
            prefetch.teardown();
        }

        match session.backend {
            Backend::Remote => {
                self.deps.sink.pause().await;
                self.deps.sink.unload().await;
            }
            Backend::Native(_) => {
                if let Some(native) = &self.deps.native {
                    native.stop().await;
                }
            }
        }

        self.flushes.retain(|flush| !flush.is_finished());
        if let Some(reporter) = session.reporter.take() {
            self.flushes.push(tokio::spawn(async move { reporter.flush().await }));
        }
        debug!(
            chapter_id = %session.chapter_id,
            generation = session.generation,
            "Session torn down"
        );
    }

    async fn stop(&mut self) {
        let Some(previous) = self.session.as_ref().map(|s| (s.phase, s.mode_or_default())) else {
            return;
        };
        self.teardown().await;
        self.deps.state.broadcast_event(PlayerEvent::PlaybackStateChanged {
            old_phase: previous.0,
            new_phase: PlaybackPhase::Idle,
            mode: previous.1,
            timestamp: Utc::now(),
        });
        info!("Playback stopped");
    }

    async fn shutdown(&mut self) {
        self.teardown().await;
        for flush in self.flushes.drain(..) {
            let _ = flush.await;
        }
        self.publish().await;
    }

    // ---------------------------------------------------------------------
    // Mode resolution
    // ---------------------------------------------------------------------

    async fn on_mode_resolved(&mut self, generation: u64, cached: Option<Bytes>) {
        let fraction = self.current_fraction().await;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.generation != generation {
            debug!(generation, "Stale mode resolution dropped");
            return;
        }

        if session.mode.is_some() {
            // Streaming fallback already running; only a still-stopped
            // session may switch to the cached track
            if !session.stopped || cached.is_none() {
                debug!(chapter_id = %session.chapter_id, "Late mode resolution discarded");
                return;
            }
            session.seed = Some(fraction);
            session.auto_play = false;
        }

        match cached {
            Some(audio) => self.enter_full(audio).await,
            None => self.enter_streaming().await,
        }
    }

    async fn enter_full(&mut self, audio: Bytes) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sink = &self.deps.sink;

        sink.pause().await;
        let source = match sink.load(audio).await {
            Ok(source) => source,
            Err(e) => {
                warn!(
                    chapter_id = %session.chapter_id,
                    "Cached chapter audio unusable, streaming instead: {}", e
                );
                if session.mode.is_none() {
                    self.enter_streaming().await;
                } else {
                    session.seed = None;
                }
                return;
            }
        };
        sink.set_rate(self.rate).await;
        let duration = sink.duration().await.unwrap_or_default();

        if let Some(mut prefetch) = session.prefetch.take() {
            prefetch.teardown();
        }
        session.next_ticket();
        session.mode = Some(PlaybackMode::Full);
        session.source = Some(source);
        session.duration = Some(duration);
        session.index = 0;

        if let Some(fraction) = session.seed.take() {
            sink.seek(position_for_fraction(fraction, duration, self.config.end_guard))
                .await;
        }

        info!(
            chapter_id = %session.chapter_id,
            duration_secs = duration.as_secs_f64(),
            "Playing cached chapter track"
        );
        self.deps.state.broadcast_event(PlayerEvent::ModeResolved {
            chapter_id: session.chapter_id.clone(),
            voice: session.voice.clone(),
            mode: PlaybackMode::Full,
            timestamp: Utc::now(),
        });
        set_phase(&self.deps.state, session, PlaybackPhase::Paused);

        if session.auto_play {
            self.play_full().await;
        }
    }

    async fn enter_streaming(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.mode = Some(PlaybackMode::Streaming);
        if let Some(fraction) = session.seed.take() {
            session.index = index_for_fraction(fraction, session.len());
        }

        debug!(
            chapter_id = %session.chapter_id,
            index = session.index,
            "Streaming chapter"
        );
        self.deps.state.broadcast_event(PlayerEvent::ModeResolved {
            chapter_id: session.chapter_id.clone(),
            voice: session.voice.clone(),
            mode: PlaybackMode::Streaming,
            timestamp: Utc::now(),
        });
        set_phase(&self.deps.state, session, PlaybackPhase::Paused);

        if session.auto_play {
            self.play_streaming().await;
        }
    }

    async fn on_seed_loaded(&mut self, generation: u64, fraction: Option<f64>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.generation != generation {
            return;
        }
        let Some(fraction) = fraction else {
            return;
        };

        match session.mode {
            None => {
                session.seed.get_or_insert(fraction);
            }
            Some(_) if !session.stopped => {
                debug!(
                    chapter_id = %session.chapter_id,
                    "Late initial position skipped, playback already started"
                );
            }
            Some(PlaybackMode::Streaming) => {
                session.index = index_for_fraction(fraction, session.len());
                session.source = None;
            }
            Some(PlaybackMode::Full) => {
                let duration = session.duration.unwrap_or_default();
                self.deps
                    .sink
                    .seek(position_for_fraction(fraction, duration, self.config.end_guard))
                    .await;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Transport
    // ---------------------------------------------------------------------

    async fn toggle(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.phase.is_active() {
            self.pause().await;
        } else {
            self.play().await;
        }
    }

    async fn play(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match (session.phase, session.mode) {
            (PlaybackPhase::Playing | PlaybackPhase::Buffering, _) => {}
            (PlaybackPhase::ResolvingMode, _) | (_, None) => {
                // Don't wait for the cache lookup
                session.auto_play = true;
                self.enter_streaming().await;
            }
            (_, Some(PlaybackMode::Full)) => self.play_full().await,
            (_, Some(PlaybackMode::Streaming)) => self.play_streaming().await,
        }
    }

    async fn play_full(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let sink = &self.deps.sink;
        if session.phase == PlaybackPhase::Ended {
            sink.seek(Duration::ZERO).await;
        }
        set_phase(&self.deps.state, session, PlaybackPhase::Buffering);
        match sink.play().await {
            Ok(()) => {
                session.next_ticket();
                session.stopped = false;
                set_phase(&self.deps.state, session, PlaybackPhase::Playing);
            }
            Err(e) => fail(&self.deps.state, session, e.to_string()),
        }
    }

    async fn play_streaming(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.len() == 0 {
            // Nothing to speak: not a finished chapter either
            debug!(chapter_id = %session.chapter_id, "Chapter has no chunks, staying paused");
            session.next_ticket();
            session.stopped = true;
            session.auto_play = false;
            set_phase(&self.deps.state, session, PlaybackPhase::Paused);
            return;
        }

        // Resume the chunk that is still loaded
        if session.source.is_some() && !session.is_native() && session.phase == PlaybackPhase::Paused
        {
            match self.deps.sink.play().await {
                Ok(()) => {
                    session.next_ticket();
                    session.stopped = false;
                    set_phase(&self.deps.state, session, PlaybackPhase::Playing);
                }
                Err(e) => fail(&self.deps.state, session, e.to_string()),
            }
            return;
        }

        let index = session.index;
        self.play_chunk(index).await;
    }

    /// Start playing chunk `index`: buffering until its audio is ready
    async fn play_chunk(&mut self, index: usize) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ticket = session.next_ticket();
        session.index = index;
        session.stopped = false;
        session.source = None;
        set_phase(&self.deps.state, session, PlaybackPhase::Buffering);

        if let Some(reporter) = &session.reporter {
            reporter.report(index as f64, Some(session.len() as f64));
        }

        match session.backend {
            Backend::Remote => {
                let Some(prefetch) = session.prefetch.as_mut() else {
                    return;
                };
                prefetch.prefetch_window(index, self.config.prefetch_window);
                let Some(fetch) = prefetch.get(index) else {
                    return;
                };
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = fetch.await;
                    let _ = tx.send(Internal::ChunkReady {
                        ticket,
                        index,
                        result,
                    });
                });
            }
            Backend::Native(voice) => {
                let Some(native) = self.deps.native.clone() else {
                    fail(
                        &self.deps.state,
                        session,
                        "on-device speech is not available".to_string(),
                    );
                    return;
                };
                let cancel = session.chunk_cancel.clone();
                let request = SpeakRequest {
                    text: session.chunk_text(index).unwrap_or_default().to_string(),
                    voice,
                    rate: self.rate,
                    cancel: cancel.clone(),
                };
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let started = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        started = native.speak(request) => started,
                    };
                    if cancel.is_cancelled() {
                        // Went stale while starting; the utterance shares the token
                        debug!(
                            generation = ticket.generation,
                            index, "Native utterance started after its ticket expired"
                        );
                        return;
                    }
                    match started {
                        Ok(utterance) => {
                            let _ = tx.send(Internal::NativeStarted {
                                ticket,
                                result: Ok(()),
                            });
                            let result = utterance.finished().await;
                            let _ = tx.send(Internal::NativeFinished { ticket, result });
                        }
                        Err(e) => {
                            let _ = tx.send(Internal::NativeStarted {
                                ticket,
                                result: Err(e),
                            });
                        }
                    }
                });
            }
        }
    }

    async fn on_chunk_ready(&mut self, ticket: Ticket, index: usize, result: FetchResult) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_current(ticket) || session.stopped {
            debug!(generation = ticket.generation, index, "Stale chunk result dropped");
            return;
        }

        let handle = match result {
            Ok(handle) => handle,
            Err(SynthesisError::Aborted) => {
                debug!(index, "Chunk fetch aborted");
                return;
            }
            Err(e) => {
                // A later play request asks the service again
                if let Some(prefetch) = session.prefetch.as_mut() {
                    prefetch.forget(index);
                }
                fail(&self.deps.state, session, e.to_string());
                return;
            }
        };
        let Some(audio) = self.deps.handles.resolve(handle) else {
            fail(
                &self.deps.state,
                session,
                format!("audio for chunk {} was released", index),
            );
            return;
        };

        let sink = &self.deps.sink;
        let source = match sink.load(audio).await {
            Ok(source) => source,
            Err(e) => {
                fail(&self.deps.state, session, e.to_string());
                return;
            }
        };
        session.source = Some(source);
        sink.set_rate(self.rate).await;
        if let Err(e) = sink.play().await {
            fail(&self.deps.state, session, e.to_string());
            return;
        }

        set_phase(&self.deps.state, session, PlaybackPhase::Playing);
        debug!(chapter_id = %session.chapter_id, index, "Chunk playing");
        self.deps.state.broadcast_event(PlayerEvent::ChunkStarted {
            chapter_id: session.chapter_id.clone(),
            index,
            total: session.len(),
            timestamp: Utc::now(),
        });
    }

    fn on_native_started(&mut self, ticket: Ticket, result: Result<(), NativeError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_current(ticket) || session.stopped {
            return;
        }
        match result {
            Ok(()) => {
                set_phase(&self.deps.state, session, PlaybackPhase::Playing);
                self.deps.state.broadcast_event(PlayerEvent::ChunkStarted {
                    chapter_id: session.chapter_id.clone(),
                    index: session.index,
                    total: session.len(),
                    timestamp: Utc::now(),
                });
            }
            Err(NativeError::Interrupted) => {}
            Err(e) => fail(&self.deps.state, session, e.to_string()),
        }
    }

    async fn on_native_finished(&mut self, ticket: Ticket, result: Result<(), NativeError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_current(ticket) || session.phase != PlaybackPhase::Playing {
            return;
        }
        match result {
            Ok(()) => self.advance().await,
            Err(NativeError::Interrupted) => {
                debug!(index = session.index, "Native utterance interrupted");
            }
            Err(e) => fail(&self.deps.state, session, e.to_string()),
        }
    }

    async fn on_sink_ended(&mut self, source: SourceId) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.source != Some(source) || session.phase != PlaybackPhase::Playing {
            return;
        }
        let mode = session.mode;
        match mode {
            Some(PlaybackMode::Full) => self.finish_chapter().await,
            _ => self.advance().await,
        }
    }

    /// Next chunk, or end of chapter after the last one
    async fn advance(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let next = session.index + 1;
        if next < session.len() {
            self.play_chunk(next).await;
        } else {
            self.finish_chapter().await;
        }
    }

    async fn finish_chapter(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.next_ticket();
        session.stopped = true;

        if let Some(reporter) = &session.reporter {
            match session.mode {
                Some(PlaybackMode::Full) => {
                    let total = session.duration.unwrap_or_default().as_secs_f64();
                    reporter.report(total, Some(total));
                }
                _ => {
                    let total = session.len() as f64;
                    reporter.report(total, Some(total));
                }
            }
            let reporter = reporter.clone();
            self.flushes.retain(|flush| !flush.is_finished());
            self.flushes.push(tokio::spawn(async move { reporter.flush().await }));
        }

        session.index = 0;
        if session.mode != Some(PlaybackMode::Full) {
            session.source = None;
        }
        set_phase(&self.deps.state, session, PlaybackPhase::Ended);

        info!(chapter_id = %session.chapter_id, "Chapter ended");
        let chapter_id = session.chapter_id.clone();
        self.deps.state.broadcast_event(PlayerEvent::ChapterEnded {
            chapter_id: chapter_id.clone(),
            timestamp: Utc::now(),
        });
        if let Some(hook) = &self.on_ended {
            hook(chapter_id);
        }
    }

    async fn pause(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.phase {
            PlaybackPhase::ResolvingMode => {
                session.auto_play = false;
                return;
            }
            PlaybackPhase::Playing | PlaybackPhase::Buffering => {}
            _ => return,
        }

        session.next_ticket();
        session.stopped = true;
        match session.backend {
            Backend::Remote => self.deps.sink.pause().await,
            Backend::Native(_) => {
                if let Some(native) = &self.deps.native {
                    native.stop().await;
                }
            }
        }
        set_phase(&self.deps.state, session, PlaybackPhase::Paused);
        self.report_progress().await;
    }

    async fn seek(&mut self, delta: i64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mode = session.mode;
        match mode {
            None => {
                debug!(delta, "Seek ignored while resolving mode");
            }
            Some(PlaybackMode::Full) => {
                let sink = &self.deps.sink;
                let duration = session.duration.unwrap_or_default();
                let target = full_seek_target(
                    sink.position().await,
                    delta,
                    duration,
                    self.config.seek_divisions,
                    self.config.end_guard,
                );
                sink.seek(target).await;
                if session.phase == PlaybackPhase::Ended {
                    set_phase(&self.deps.state, session, PlaybackPhase::Paused);
                }
                self.report_progress().await;
            }
            Some(PlaybackMode::Streaming) => {
                if session.len() == 0 {
                    return;
                }
                let target = clamp_chunk_index(session.index, delta, session.len());
                let was_active = session.phase.is_active();

                session.next_ticket();
                match session.backend {
                    Backend::Remote => self.deps.sink.pause().await,
                    Backend::Native(_) => {
                        if let Some(native) = &self.deps.native {
                            native.stop().await;
                        }
                    }
                }
                session.source = None;
                session.index = target;
                if let Some(prefetch) = session.prefetch.as_mut() {
                    prefetch.prefetch_window(target, self.config.prefetch_window);
                }

                if was_active {
                    self.play_chunk(target).await;
                } else {
                    session.stopped = true;
                    set_phase(&self.deps.state, session, PlaybackPhase::Paused);
                    self.report_progress().await;
                }
            }
        }
    }

    async fn set_rate(&mut self, rate: f32) {
        if !rate.is_finite() || rate <= 0.0 {
            warn!(rate, "Ignoring invalid playback rate");
            return;
        }
        self.rate = rate;
        self.deps.sink.set_rate(rate).await;
        self.deps.state.broadcast_event(PlayerEvent::RateChanged {
            rate,
            timestamp: Utc::now(),
        });

        // A running utterance can't change speed; speak the chunk again
        let restart = self
            .session
            .as_ref()
            .filter(|s| s.is_native() && s.phase.is_active())
            .map(|s| s.index);
        if let Some(index) = restart {
            if let Some(native) = &self.deps.native {
                native.stop().await;
            }
            self.play_chunk(index).await;
        }
    }

    async fn change_voice(&mut self, voice: VoiceId) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.voice == voice {
            debug!(voice = %voice, "Voice unchanged");
            return;
        }
        self.deps.state.broadcast_event(PlayerEvent::VoiceChanged {
            old_voice: session.voice.clone(),
            new_voice: voice.clone(),
            timestamp: Utc::now(),
        });
        self.resume_with(voice).await;
    }

    async fn restart_chunk(&mut self) {
        let Some(voice) = self.session.as_ref().map(|s| s.voice.clone()) else {
            return;
        };
        self.resume_with(voice).await;
    }

    /// Replace the session with one for `voice` at the same logical position
    async fn resume_with(&mut self, voice: VoiceId) {
        let fraction = self.current_fraction().await;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let was_playing = session.phase.is_active()
            || (session.phase == PlaybackPhase::ResolvingMode && session.auto_play);

        let request = SessionRequest {
            book_id: session.book_id.clone(),
            chapter_id: session.chapter_id.clone(),
            text: session.text.clone(),
            voice,
            auto_play: was_playing,
            initial_position: Some(fraction),
        };
        self.start(request).await;
    }

    // ---------------------------------------------------------------------
    // Position, progress and status
    // ---------------------------------------------------------------------

    /// Position as `(value, total)`: chunks in streaming mode, seconds in full
    async fn current_progress(&self) -> Option<(f64, f64)> {
        let session = self.session.as_ref()?;
        match session.mode? {
            PlaybackMode::Streaming => Some((session.index as f64, session.len() as f64)),
            PlaybackMode::Full => {
                let duration = session.duration.unwrap_or_default().as_secs_f64();
                let position = self.deps.sink.position().await.as_secs_f64();
                Some((position, duration))
            }
        }
    }

    async fn current_fraction(&self) -> f64 {
        if let Some((value, total)) = self.current_progress().await {
            return if total > 0.0 {
                (value / total).clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        self.session
            .as_ref()
            .and_then(|s| s.seed)
            .unwrap_or(0.0)
    }

    async fn report_progress(&self) {
        let Some((value, total)) = self.current_progress().await else {
            return;
        };
        if let Some(reporter) = self.session.as_ref().and_then(|s| s.reporter.as_ref()) {
            reporter.report(value, Some(total));
        }
    }

    async fn on_tick(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.phase != PlaybackPhase::Playing {
            return;
        }

        if session.mode == Some(PlaybackMode::Full) {
            let position_secs = self.deps.sink.position().await.as_secs_f64();
            let duration_secs = session.duration.unwrap_or_default().as_secs_f64();
            self.deps.state.broadcast_event(PlayerEvent::PlaybackPosition {
                chapter_id: session.chapter_id.clone(),
                position_secs,
                duration_secs,
                timestamp: Utc::now(),
            });
            if let Some(reporter) = &session.reporter {
                reporter.report(position_secs, Some(duration_secs));
            }
        }
        self.publish().await;
    }

    async fn publish(&self) {
        let online = self.deps.connectivity.is_online();
        let status = match &self.session {
            None => PlayerStatus {
                rate: self.rate,
                offline: !online,
                generation: self.generation,
                ..PlayerStatus::default()
            },
            Some(session) => {
                let sink = &self.deps.sink;
                let (position_secs, duration_secs) = if session.mode == Some(PlaybackMode::Full) {
                    (
                        sink.position().await.as_secs_f64(),
                        session.duration.map(|d| d.as_secs_f64()),
                    )
                } else if session.source.is_some() {
                    (
                        sink.position().await.as_secs_f64(),
                        sink.duration().await.map(|d| d.as_secs_f64()),
                    )
                } else {
                    (0.0, None)
                };

                PlayerStatus {
                    book_id: Some(session.book_id.clone()),
                    chapter_id: Some(session.chapter_id.clone()),
                    voice: Some(session.voice.clone()),
                    mode: session.mode,
                    phase: session.phase,
                    index: session.index,
                    total_chunks: session.len(),
                    position_secs,
                    duration_secs,
                    rate: self.rate,
                    offline: !session.is_native() && !online,
                    generation: session.generation,
                }
            }
        };
        self.deps.state.set_status(status).await;
    }
}
