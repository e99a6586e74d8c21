//! Test helper modules for lectern-player integration tests
//!
//! Provides reusable test infrastructure components:
//! - Fakes: scripted synthesizer, slow cache, recording progress store,
//!   on-device speech engine
//! - TestPlayer: a running controller wired to the fakes and a clock sink
//! - HTTP stubs: axum servers on 127.0.0.1:0 for the real HTTP clients

#![allow(dead_code)]

pub mod fakes;
pub mod http;
pub mod test_player;

pub use fakes::{
    wav_bytes, DelayedCache, FakeNativeEngine, RecordingProgressStore, ScriptedSynthesizer,
};
pub use http::spawn_http;
pub use test_player::{chapter_text, TestPlayer, TestPlayerBuilder};
