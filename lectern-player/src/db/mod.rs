//! Database access
//!
//! SQLite via sqlx: the `settings` key-value table and the `chapter_audio`
//! cache table live in the player's database file.

pub mod audio_cache;
pub mod init;
pub mod settings;

pub use audio_cache::SqliteBlobCache;
pub use init::{init_database, init_schema};
