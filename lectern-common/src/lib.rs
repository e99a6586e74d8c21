//! # Lectern Common Library
//!
//! Shared code for the Lectern speech player and its surrounding services:
//! - Identifier types (chapters, books, voices, cache keys)
//! - Event types (PlayerEvent enum) and playback state enums
//! - Progress record shape exchanged with the progress store
//! - Bootstrap configuration loading and root folder resolution

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

pub use error::{Error, Result};
pub use ids::{BookId, CacheKey, ChapterId, NativeVoice, VoiceId};
