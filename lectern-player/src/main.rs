//! Lectern Speech Player (lectern-player) - Main entry point
//!
//! Hosts the chunked playback engine behind the HTTP/SSE control API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lectern_common::config::{RootFolderInitializer, RootFolderResolver};
use lectern_player::api::{self, AppContext};
use lectern_player::audio::AudioSink;
use lectern_player::cache::BlobCache;
use lectern_player::config::PlayerConfig;
use lectern_player::db::{self, SqliteBlobCache};
use lectern_player::native::{CommandSpeechEngine, NativeSpeechEngine};
use lectern_player::playback::{EngineConfig, EngineDeps, HandleStore, PlaybackEngine};
use lectern_player::preload::{ChapterPreloader, InFlightRegistry};
use lectern_player::progress::{HttpProgressStore, ProgressStore};
use lectern_player::sleep_timer::SleepTimer;
use lectern_player::synthesis::{probe_address, Connectivity, HttpSynthesisClient};
use lectern_player::SharedState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for lectern-player
#[derive(Parser, Debug)]
#[command(name = "lectern-player")]
#[command(about = "Chunked speech playback service for Lectern")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "LECTERN_PORT")]
    port: Option<u16>,

    /// Root folder holding the database and cached chapter audio
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file (defaults to the per-user lectern config directory)
    #[arg(short, long, env = "LECTERN_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the backend API (overrides the config file)
    #[arg(long, env = "LECTERN_SERVER_URL")]
    server_url: Option<String>,
}

/// Filter directive for a bare level, or the configured directive itself
fn log_filter(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("lectern_player={level},lectern_common={level},tower_http={level}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = RootFolderResolver::new("player")
        .with_cli_override(args.root_folder.clone())
        .with_config_path(args.config.clone());
    let bootstrap = resolver.load_config();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(&bootstrap.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root_folder = resolver.resolve();
    info!("Root folder: {}", root_folder.display());

    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to create root folder")?;
    let db_pool = db::init_database(&initializer.database_path())
        .await
        .context("Failed to open database")?;

    let mut config = PlayerConfig::load(resolver.config_file_path().as_deref())
        .context("Failed to load player configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(server_url) = args.server_url {
        config.synthesis.base_url = server_url;
    }
    info!("Synthesis service: {}", config.synthesis.base_url);

    let state = Arc::new(SharedState::new());
    let shutdown = CancellationToken::new();

    let connectivity = Connectivity::new(true);
    if config.synthesis.probe_interval_ms > 0 {
        match probe_address(&config.synthesis.base_url) {
            Some(address) => {
                connectivity.spawn_probe(
                    address,
                    Duration::from_millis(config.synthesis.probe_interval_ms),
                    shutdown.clone(),
                );
            }
            None => warn!(
                "Cannot derive a probe address from {}, connectivity probe disabled",
                config.synthesis.base_url
            ),
        }
    }

    let cache: Arc<dyn BlobCache> =
        Arc::new(SqliteBlobCache::new(db_pool.clone(), config.cache.quota_bytes));
    let native: Arc<dyn NativeSpeechEngine> = Arc::new(CommandSpeechEngine::new(&config.native));
    let progress: Option<Arc<dyn ProgressStore>> = if config.progress.enabled {
        Some(Arc::new(HttpProgressStore::new(&config.synthesis.base_url)))
    } else {
        info!("Progress sync disabled");
        None
    };

    let deps = EngineDeps {
        synthesizer: Arc::new(HttpSynthesisClient::new(
            &config.synthesis,
            connectivity.clone(),
        )),
        cache: Arc::clone(&cache),
        sink: build_sink()?,
        native: Some(Arc::clone(&native)),
        progress,
        connectivity: connectivity.clone(),
        handles: HandleStore::new(),
        state: Arc::clone(&state),
    };
    let player = PlaybackEngine::new(EngineConfig::from(&config), deps).spawn();
    info!("Playback engine started");

    let preloader = Arc::new(
        ChapterPreloader::new(
            &config.synthesis.base_url,
            cache,
            connectivity.clone(),
            InFlightRegistry::new(),
        )
        .with_timeout(config.cache.download_timeout())
        .with_events(Arc::clone(&state)),
    );

    let sleep_timer = {
        let player = player.clone();
        Arc::new(SleepTimer::with_events(
            Arc::new(move || {
                info!("Sleep timer expired, pausing");
                if let Err(e) = player.pause() {
                    warn!("Failed to pause on sleep timer: {}", e);
                }
            }),
            Arc::clone(&state),
        ))
    };

    let ctx = AppContext {
        state,
        player: player.clone(),
        preloader: Arc::clone(&preloader),
        sleep_timer: Arc::clone(&sleep_timer),
        native: Some(native),
        db_pool: Some(db_pool),
        connectivity,
        default_voice: config.playback.default_voice.clone(),
    };

    api::run(&config.server, ctx, shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    preloader.shutdown();
    sleep_timer.cancel();
    player
        .shutdown()
        .await
        .context("Failed to stop playback engine")?;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "device")]
fn build_sink() -> Result<Arc<dyn AudioSink>> {
    let sink = lectern_player::audio::DeviceSink::open(None)
        .context("Failed to open audio output device")?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "device"))]
fn build_sink() -> Result<Arc<dyn AudioSink>> {
    info!("Built without device output, using the headless clock sink");
    Ok(Arc::new(lectern_player::audio::ClockSink::new()))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
