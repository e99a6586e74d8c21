//! Error types for lectern-player
//!
//! Defines module-specific error types using thiserror for clear error propagation.
//! Component-level errors (`SynthesisError`, `SinkError`, `NativeError`) live
//! next to their components and convert into this type at the API boundary.

use thiserror::Error;

/// Main error type for lectern-player
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Outbound HTTP client errors (progress store, chapter downloads)
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Remote service answered with an unexpected status
    #[error("Remote service returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// Malformed JSON from a remote service
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Playback engine errors
    #[error("Playback error: {0}")]
    Playback(String),

    /// Chunk synthesis errors
    #[error("Synthesis error: {0}")]
    Synthesis(#[from] crate::synthesis::SynthesisError),

    /// Audio sink errors
    #[error("Audio sink error: {0}")]
    Sink(#[from] crate::audio::SinkError),

    /// On-device speech engine errors
    #[error("Native speech error: {0}")]
    Native(#[from] crate::native::NativeError),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors bubbled up from lectern-common
    #[error(transparent)]
    Common(#[from] lectern_common::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using lectern-player Error
pub type Result<T> = std::result::Result<T, Error>;
