//! lectern-player specific configuration
//!
//! Read from the same TOML file as the bootstrap [`lectern_common::config::TomlConfig`];
//! every section is optional and falls back to built-in defaults.
//!
//! ```toml
//! [server]
//! port = 5780
//!
//! [synthesis]
//! base_url = "http://localhost:8000/api"
//! attempt_timeout_ms = 20000
//! retry_backoff_ms = 2000
//!
//! [chunking]
//! target_count = 20
//! hard_max = 600
//! ```

use crate::error::{Error, Result};
use crate::playback::ChunkerConfig;
use lectern_common::VoiceId;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub native: NativeConfig,
}

impl PlayerConfig {
    /// Load from a TOML file; a missing file yields defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid player config: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5780
}

/// Remote synthesis service settings
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    /// Base URL of the backend API (`/tts/...` and `/progress` hang off it)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-attempt deadline
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Fixed backoff between failed attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Interval of the background reachability probe, 0 disables it
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl SynthesisConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_attempt_timeout_ms() -> u64 {
    20_000
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_count")]
    pub target_count: usize,
    #[serde(default = "default_hard_max")]
    pub hard_max: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_count: default_target_count(),
            hard_max: default_hard_max(),
        }
    }
}

impl From<&ChunkingConfig> for ChunkerConfig {
    fn from(config: &ChunkingConfig) -> Self {
        ChunkerConfig {
            target_count: config.target_count,
            hard_max: config.hard_max,
        }
    }
}

fn default_target_count() -> usize {
    20
}

fn default_hard_max() -> usize {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Chunks fetched ahead, counting the current one
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: usize,
    /// Full-mode seek step is `duration / seek_divisions`
    #[serde(default = "default_seek_divisions")]
    pub seek_divisions: f64,
    /// Full-mode seeks never land closer than this to the end
    #[serde(default = "default_end_guard_ms")]
    pub end_guard_ms: u64,
    /// Full-mode position/progress reporting interval
    #[serde(default = "default_position_interval_ms")]
    pub position_interval_ms: u64,
    /// Voice used when no voice was ever selected
    #[serde(default = "default_voice")]
    pub default_voice: VoiceId,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prefetch_window: default_prefetch_window(),
            seek_divisions: default_seek_divisions(),
            end_guard_ms: default_end_guard_ms(),
            position_interval_ms: default_position_interval_ms(),
            default_voice: default_voice(),
        }
    }
}

fn default_prefetch_window() -> usize {
    3
}

fn default_seek_divisions() -> f64 {
    20.0
}

fn default_end_guard_ms() -> u64 {
    500
}

fn default_position_interval_ms() -> u64 {
    1_000
}

fn default_voice() -> VoiceId {
    VoiceId::default_remote()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Total bytes of chapter audio kept; writes beyond it are dropped
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    /// Whole-request limit for one chapter download, body included
    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,
}

impl CacheConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            download_timeout_ms: default_download_timeout_ms(),
        }
    }
}

fn default_download_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Disable remote progress sync entirely
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            enabled: true,
        }
    }
}

fn default_debounce_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// On-device speech program
#[derive(Debug, Clone, Deserialize)]
pub struct NativeConfig {
    #[serde(default = "default_native_program")]
    pub program: String,
    /// Words per minute at rate 1.0
    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: u32,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            program: default_native_program(),
            words_per_minute: default_words_per_minute(),
        }
    }
}

fn default_native_program() -> String {
    "espeak-ng".to_string()
}

fn default_words_per_minute() -> u32 {
    175
}
