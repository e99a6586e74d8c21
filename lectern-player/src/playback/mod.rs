//! Chunked playback: chunking, prefetch, audio handles and the controller

pub mod chunker;
pub mod engine;
pub mod handles;
pub mod prefetch;

pub use chunker::{split_into_chunks, Chunk, ChunkerConfig};
pub use engine::{EndedHook, EngineConfig, EngineDeps, PlaybackEngine, PlayerHandle, SessionRequest};
pub use handles::{AudioHandle, HandleScope, HandleStore};
pub use prefetch::PrefetchScheduler;
