//! HTTP request handlers
//!
//! Implements the REST endpoints for playback control. Playback commands are
//! queued to the controller task and answer immediately; their effect shows up
//! in `GET /playback/status` and on the event stream.

use crate::api::server::AppContext;
use crate::error::Error;
use crate::native::NativeVoiceInfo;
use crate::playback::SessionRequest;
use crate::preload::{ChapterCacheStatus, NeighborChapter};
use crate::state::PlayerStatus;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use lectern_common::{BookId, ChapterId, VoiceId};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
}

impl StatusResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
        })
    }
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn error_response(e: Error) -> ApiError {
    let code = match &e {
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Remote { .. } | Error::Client(_) => StatusCode::BAD_GATEWAY,
        Error::Native(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error_response(Error::BadRequest(message.into()))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    book_id: BookId,
    chapter_id: ChapterId,
    text: String,
    /// Falls back to the last selected voice, then the configured default
    #[serde(default)]
    voice: Option<VoiceId>,
    #[serde(default)]
    auto_play: bool,
    /// Fraction of the chapter, 0.0..=1.0
    #[serde(default)]
    initial_position: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    delta: i64,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    rate: f32,
}

#[derive(Debug, Deserialize)]
pub struct VoiceRequest {
    voice: VoiceId,
}

#[derive(Debug, Deserialize)]
pub struct SleepRequest {
    minutes: f64,
}

#[derive(Debug, Serialize)]
pub struct SleepResponse {
    remaining_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PreloadRequest {
    chapters: Vec<NeighborChapter>,
    #[serde(default)]
    voice: Option<VoiceId>,
}

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    #[serde(default)]
    voice: Option<VoiceId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectivityBody {
    online: bool,
}

/// Requested voice, else the live session's, else the stored one, else the default
async fn resolve_voice(ctx: &AppContext, requested: Option<VoiceId>) -> VoiceId {
    if let Some(voice) = requested {
        return voice;
    }
    if let Some(voice) = ctx.state.get_status().await.voice {
        return voice;
    }
    if let Some(db) = &ctx.db_pool {
        match crate::db::settings::get_last_voice(db).await {
            Ok(Some(voice)) => return voice,
            Ok(None) => {}
            Err(e) => warn!("Failed to read last voice: {}", e),
        }
    }
    ctx.default_voice.clone()
}

/// Persist an explicit voice choice; failures only cost the preference
async fn remember_voice(ctx: &AppContext, voice: &VoiceId) {
    if let Some(db) = &ctx.db_pool {
        if let Err(e) = crate::db::settings::set_last_voice(db, voice).await {
            warn!(voice = %voice, "Failed to store last voice: {}", e);
        }
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "lectern_player".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// Playback Control Endpoints
// ============================================================================

/// GET /playback/status - Snapshot of the live session
pub async fn get_status(State(ctx): State<AppContext>) -> Json<PlayerStatus> {
    Json(ctx.player.status().await)
}

/// POST /playback/start - Start a session for a chapter
pub async fn start(
    State(ctx): State<AppContext>,
    Json(req): Json<StartRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    if let Some(position) = req.initial_position {
        if !(0.0..=1.0).contains(&position) {
            return Err(bad_request(format!(
                "initial_position must be within 0..=1, got {}",
                position
            )));
        }
    }

    let explicit = req.voice.is_some();
    let voice = match req.voice {
        Some(voice) => voice,
        None => {
            let stored = match &ctx.db_pool {
                Some(db) => crate::db::settings::get_last_voice(db).await.unwrap_or_else(|e| {
                    warn!("Failed to read last voice: {}", e);
                    None
                }),
                None => None,
            };
            stored.unwrap_or_else(|| ctx.default_voice.clone())
        }
    };
    if explicit {
        remember_voice(&ctx, &voice).await;
    }

    info!(chapter_id = %req.chapter_id, voice = %voice, "Start request");
    ctx.player
        .start(SessionRequest {
            book_id: req.book_id,
            chapter_id: req.chapter_id,
            text: req.text,
            voice,
            auto_play: req.auto_play,
            initial_position: req.initial_position,
        })
        .map_err(error_response)?;
    Ok(StatusResponse::ok())
}

/// POST /playback/toggle - Play if paused, pause if playing
pub async fn toggle(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.toggle().map_err(error_response)?;
    Ok(StatusResponse::ok())
}

pub async fn play(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.play().map_err(error_response)?;
    Ok(StatusResponse::ok())
}

pub async fn pause(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.pause().map_err(error_response)?;
    Ok(StatusResponse::ok())
}

/// POST /playback/seek - Move by `delta` chunks (streaming) or steps (full)
pub async fn seek(
    State(ctx): State<AppContext>,
    Json(req): Json<SeekRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.seek(req.delta).map_err(error_response)?;
    Ok(StatusResponse::ok())
}

/// POST /playback/rate - Change the speech rate
pub async fn set_rate(
    State(ctx): State<AppContext>,
    Json(req): Json<RateRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    if !req.rate.is_finite() || req.rate <= 0.0 {
        return Err(bad_request(format!("rate must be positive, got {}", req.rate)));
    }
    ctx.player.change_rate(req.rate).map_err(error_response)?;
    Ok(StatusResponse::ok())
}

/// POST /playback/voice - Switch voice, resuming at the same position
pub async fn set_voice(
    State(ctx): State<AppContext>,
    Json(req): Json<VoiceRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    if req.voice.as_str().trim().is_empty() {
        return Err(bad_request("voice must not be empty"));
    }
    info!(voice = %req.voice, "Voice change request");
    remember_voice(&ctx, &req.voice).await;
    ctx.player.change_voice(req.voice).map_err(error_response)?;
    Ok(StatusResponse::ok())
}

/// POST /playback/restart - Re-run the current chunk request
pub async fn restart_chunk(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.restart_chunk().map_err(error_response)?;
    Ok(StatusResponse::ok())
}

pub async fn stop(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    ctx.player.stop().map_err(error_response)?;
    Ok(StatusResponse::ok())
}

// ============================================================================
// Sleep Timer Endpoints
// ============================================================================

pub async fn get_sleep(State(ctx): State<AppContext>) -> Json<SleepResponse> {
    Json(SleepResponse {
        remaining_seconds: ctx.sleep_timer.remaining(),
    })
}

/// POST /sleep - (Re)start the countdown
pub async fn set_sleep(
    State(ctx): State<AppContext>,
    Json(req): Json<SleepRequest>,
) -> Result<Json<SleepResponse>, ApiError> {
    if !req.minutes.is_finite() || req.minutes <= 0.0 {
        return Err(bad_request(format!(
            "minutes must be positive, got {}",
            req.minutes
        )));
    }
    let remaining = ctx.sleep_timer.set(req.minutes);
    Ok(Json(SleepResponse {
        remaining_seconds: Some(remaining),
    }))
}

pub async fn cancel_sleep(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    ctx.sleep_timer.cancel();
    StatusResponse::ok()
}

// ============================================================================
// Cache Endpoints
// ============================================================================

/// GET /cache/status - Every chapter the preloader knows about
pub async fn cache_status(State(ctx): State<AppContext>) -> Json<Vec<ChapterCacheStatus>> {
    Json(ctx.preloader.statuses().await)
}

/// GET /cache/:chapter_id - Status of one chapter under a voice
pub async fn chapter_cache_status(
    State(ctx): State<AppContext>,
    Path(chapter_id): Path<ChapterId>,
    Query(query): Query<VoiceQuery>,
) -> Json<ChapterCacheStatus> {
    let voice = resolve_voice(&ctx, query.voice).await;
    let status = ctx.preloader.status(&chapter_id, &voice).await;
    Json(ChapterCacheStatus {
        chapter_id,
        voice,
        status,
    })
}

/// POST /cache/preload - Warm the cache for neighbor chapters in the background
pub async fn preload(
    State(ctx): State<AppContext>,
    Json(req): Json<PreloadRequest>,
) -> (StatusCode, Json<StatusResponse>) {
    let voice = resolve_voice(&ctx, req.voice).await;
    info!(voice = %voice, chapters = req.chapters.len(), "Preload request");

    let preloader = ctx.preloader.clone();
    tokio::spawn(async move {
        preloader.preload(&req.chapters, &voice).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(StatusResponse {
            status: "accepted".to_string(),
        }),
    )
}

/// POST /cache/:chapter_id/download - Download full-chapter audio now
pub async fn download_chapter(
    State(ctx): State<AppContext>,
    Path(chapter_id): Path<ChapterId>,
    Query(query): Query<VoiceQuery>,
) -> Result<Json<ChapterCacheStatus>, ApiError> {
    let voice = resolve_voice(&ctx, query.voice).await;
    match ctx.preloader.download_chapter(&chapter_id, &voice).await {
        Ok(status) => Ok(Json(ChapterCacheStatus {
            chapter_id,
            voice,
            status,
        })),
        Err(e) => {
            error!(chapter_id = %chapter_id, "Chapter download failed: {}", e);
            Err(error_response(e))
        }
    }
}

/// DELETE /cache/:chapter_id - Drop cached chapter audio for a voice
pub async fn evict_chapter(
    State(ctx): State<AppContext>,
    Path(chapter_id): Path<ChapterId>,
    Query(query): Query<VoiceQuery>,
) -> StatusCode {
    let voice = resolve_voice(&ctx, query.voice).await;
    ctx.preloader.evict_chapter(&chapter_id, &voice).await;
    StatusCode::NO_CONTENT
}

// ============================================================================
// Connectivity Endpoints
// ============================================================================

pub async fn get_connectivity(State(ctx): State<AppContext>) -> Json<ConnectivityBody> {
    Json(ConnectivityBody {
        online: ctx.connectivity.is_online(),
    })
}

/// POST /connectivity - Force the online state (until the next probe)
pub async fn set_connectivity(
    State(ctx): State<AppContext>,
    Json(req): Json<ConnectivityBody>,
) -> Json<ConnectivityBody> {
    ctx.connectivity.set_online(req.online);
    Json(ConnectivityBody {
        online: ctx.connectivity.is_online(),
    })
}

// ============================================================================
// Native Voice Endpoints
// ============================================================================

/// GET /voices/native - Voices of the on-device engine
pub async fn native_voices(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<NativeVoiceInfo>>, ApiError> {
    let Some(native) = &ctx.native else {
        return Err(error_response(Error::NotFound(
            "no on-device speech engine configured".to_string(),
        )));
    };
    match native.voices().await {
        Ok(voices) => Ok(Json(voices)),
        Err(e) => {
            error!("Failed to list native voices: {}", e);
            Err(error_response(e.into()))
        }
    }
}
