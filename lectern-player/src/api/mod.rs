//! HTTP control API
//!
//! REST endpoints for playback control, sleep timer and cache management,
//! plus the SSE event stream.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, run, AppContext};
