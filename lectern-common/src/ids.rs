//! Identifier types
//!
//! Chapters, books and voices are opaque strings owned by the catalog service.
//! They are wrapped in newtypes so the engine cannot mix them up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Voice id prefix selecting the on-device speech engine
pub const NATIVE_VOICE_PREFIX: &str = "native:";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Chapter identifier as issued by the catalog
    ChapterId
);

string_id!(
    /// Book identifier as issued by the catalog
    BookId
);

string_id!(
    /// Voice selector
    ///
    /// Remote voices are passed to the synthesis service untouched
    /// (e.g. `vi-VN-HoaiMyNeural`). Voices starting with `native:` select the
    /// on-device engine; the remainder is an index into the device voice list.
    VoiceId
);

/// Device voice selection parsed from a `native:` voice id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeVoice {
    /// Engine default voice (`native:default` or any non-numeric suffix)
    Default,
    /// Index into the device-reported voice list
    Index(usize),
}

impl VoiceId {
    /// Default remote voice used when nothing else was selected
    pub fn default_remote() -> Self {
        Self::new("vi-VN-HoaiMyNeural")
    }

    /// True if this id selects the on-device engine
    pub fn is_native(&self) -> bool {
        self.0.starts_with(NATIVE_VOICE_PREFIX)
    }

    /// Parse the device voice selection, `None` for remote voices
    pub fn native_voice(&self) -> Option<NativeVoice> {
        let rest = self.0.strip_prefix(NATIVE_VOICE_PREFIX)?;
        Some(match rest.parse::<usize>() {
            Ok(index) => NativeVoice::Index(index),
            Err(_) => NativeVoice::Default,
        })
    }
}

/// Persistent audio cache key: the exact (chapter, voice) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub chapter_id: ChapterId,
    pub voice: VoiceId,
}

impl CacheKey {
    pub fn new(chapter_id: ChapterId, voice: VoiceId) -> Self {
        Self { chapter_id, voice }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chapter-audio://{}/{}", self.chapter_id, self.voice)
    }
}
