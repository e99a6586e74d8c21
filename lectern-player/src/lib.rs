//! # Lectern Speech Player Library (lectern-player)
//!
//! Chunked, dual-mode speech playback for book chapters.
//!
//! **Purpose:** Split chapter text into chunks, fetch synthesized audio for
//! them just ahead of playback (streaming mode) or play a cached full-chapter
//! track (full mode), keep listening progress in sync, and provide an HTTP/SSE
//! control interface.
//!
//! **Architecture:** one controller task owns the session; synthesis, cache,
//! audio sink, on-device speech and progress store sit behind traits.

pub mod api;
pub mod audio;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod native;
pub mod playback;
pub mod preload;
pub mod progress;
pub mod sleep_timer;
pub mod state;
pub mod synthesis;

pub use error::{Error, Result};
pub use state::SharedState;
