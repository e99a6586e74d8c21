//! HTTP server setup and routing
//!
//! Sets up the Axum HTTP server with routes for control endpoints and SSE.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::native::NativeSpeechEngine;
use crate::playback::PlayerHandle;
use crate::preload::ChapterPreloader;
use crate::sleep_timer::SleepTimer;
use crate::state::SharedState;
use crate::synthesis::Connectivity;
use axum::{
    routing::{get, post},
    Router,
};
use lectern_common::VoiceId;
use sqlx::{Pool, Sqlite};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub state: Arc<SharedState>,
    pub player: PlayerHandle,
    pub preloader: Arc<ChapterPreloader>,
    pub sleep_timer: Arc<SleepTimer>,
    pub native: Option<Arc<dyn NativeSpeechEngine>>,
    /// Settings database; `None` runs without persisting the voice choice
    pub db_pool: Option<Pool<Sqlite>>,
    pub connectivity: Connectivity,
    /// Voice used when neither the request nor the settings name one
    pub default_voice: VoiceId,
}

/// Build the router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        // Health endpoint
        .route("/health", get(super::handlers::health))

        // Playback control
        .route("/playback/status", get(super::handlers::get_status))
        .route("/playback/start", post(super::handlers::start))
        .route("/playback/toggle", post(super::handlers::toggle))
        .route("/playback/play", post(super::handlers::play))
        .route("/playback/pause", post(super::handlers::pause))
        .route("/playback/seek", post(super::handlers::seek))
        .route("/playback/rate", post(super::handlers::set_rate))
        .route("/playback/voice", post(super::handlers::set_voice))
        .route("/playback/restart", post(super::handlers::restart_chunk))
        .route("/playback/stop", post(super::handlers::stop))

        // Sleep timer
        .route(
            "/sleep",
            get(super::handlers::get_sleep)
                .post(super::handlers::set_sleep)
                .delete(super::handlers::cancel_sleep),
        )

        // Chapter audio cache
        .route("/cache/status", get(super::handlers::cache_status))
        .route("/cache/preload", post(super::handlers::preload))
        .route("/cache/:chapter_id/download", post(super::handlers::download_chapter))
        .route(
            "/cache/:chapter_id",
            get(super::handlers::chapter_cache_status).delete(super::handlers::evict_chapter),
        )

        // Connectivity override
        .route(
            "/connectivity",
            get(super::handlers::get_connectivity).post(super::handlers::set_connectivity),
        )

        // On-device voices
        .route("/voices/native", get(super::handlers::native_voices))

        // SSE event stream
        .route("/events", get(super::sse::event_stream))

        // Attach application context
        .with_state(ctx)

        // Request tracing
        .layer(TraceLayer::new_for_http())

        // Enable CORS for local access
        .layer(CorsLayer::permissive())
}

/// Run HTTP API server until `shutdown` resolves
pub async fn run<F>(config: &ServerConfig, ctx: AppContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(ctx);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
