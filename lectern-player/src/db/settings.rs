//! Settings database access
//!
//! Read/write settings from the settings table (key-value store).

use crate::error::{Error, Result};
use lectern_common::VoiceId;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

const LAST_VOICE_KEY: &str = "last_voice";

/// Last voice the user selected, if any
pub async fn get_last_voice(db: &Pool<Sqlite>) -> Result<Option<VoiceId>> {
    Ok(get_setting::<String>(db, LAST_VOICE_KEY)
        .await?
        .filter(|v| !v.trim().is_empty())
        .map(VoiceId::from))
}

pub async fn set_last_voice(db: &Pool<Sqlite>, voice: &VoiceId) -> Result<()> {
    set_setting(db, LAST_VOICE_KEY, voice.as_str()).await
}

/// Generic setting getter
///
/// Returns `None` if the key is missing; an unparseable value is a config error.
pub async fn get_setting<T: FromStr>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match value {
        Some(s) => match s.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(Error::Config(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

/// Generic setting setter
///
/// Inserts or updates setting in database.
pub async fn set_setting<T: ToString>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()> {
    let value_str = value.to_string();

    sqlx::query(
        r#"
        INSERT INTO settings (key, value)
        VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value_str)
    .execute(db)
    .await?;

    Ok(())
}
