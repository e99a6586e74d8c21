//! Speech engine backed by a local command (espeak-ng by default)

use super::{NativeError, NativeSpeechEngine, NativeVoiceInfo, SpeakRequest, Utterance};
use crate::config::NativeConfig;
use async_trait::async_trait;
use lectern_common::NativeVoice;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct CommandSpeechEngine {
    program: String,
    words_per_minute: u32,
    voices: OnceCell<Vec<NativeVoiceInfo>>,
    current: Mutex<Option<CancellationToken>>,
}

impl CommandSpeechEngine {
    pub fn new(config: &NativeConfig) -> Self {
        Self {
            program: config.program.clone(),
            words_per_minute: config.words_per_minute,
            voices: OnceCell::new(),
            current: Mutex::new(None),
        }
    }

    fn replace_current(&self, token: Option<CancellationToken>) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = std::mem::replace(&mut *current, token) {
            previous.cancel();
        }
    }

    async fn load_voices(&self) -> Result<Vec<NativeVoiceInfo>, NativeError> {
        let output = Command::new(&self.program)
            .arg("--voices")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NativeError::Spawn(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(NativeError::Failed(format!(
                "{} --voices exited with {}",
                self.program, output.status
            )));
        }
        Ok(parse_voice_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn voice_name(&self, voice: NativeVoice) -> Option<String> {
        let NativeVoice::Index(index) = voice else {
            return None;
        };
        match self.voices().await {
            Ok(voices) => {
                let found = voices.into_iter().find(|v| v.index == index).map(|v| v.name);
                if found.is_none() {
                    warn!(index, "Native voice index out of range, using default voice");
                }
                found
            }
            Err(e) => {
                warn!("Could not list native voices: {}", e);
                None
            }
        }
    }
}

/// Parse `espeak-ng --voices` output
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  vi              --/M      Vietnamese_Northern roa/vi
/// ```
pub(crate) fn parse_voice_list(output: &str) -> Vec<NativeVoiceInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            match columns.as_slice() {
                [_pty, language, _age_gender, name, ..] => {
                    Some(((*language).to_string(), (*name).to_string()))
                }
                _ => None,
            }
        })
        .enumerate()
        .map(|(index, (language, name))| NativeVoiceInfo {
            index,
            name,
            language,
        })
        .collect()
}

#[async_trait]
impl NativeSpeechEngine for CommandSpeechEngine {
    async fn voices(&self) -> Result<Vec<NativeVoiceInfo>, NativeError> {
        self.voices
            .get_or_try_init(|| self.load_voices())
            .await
            .cloned()
    }

    async fn speak(&self, request: SpeakRequest) -> Result<Utterance, NativeError> {
        let voice = self.voice_name(request.voice).await;
        if request.cancel.is_cancelled() {
            return Err(NativeError::Interrupted);
        }
        let speed = (self.words_per_minute as f32 * request.rate).round().clamp(80.0, 500.0) as u32;

        let mut command = Command::new(&self.program);
        if let Some(voice) = &voice {
            command.arg("-v").arg(voice);
        }
        command
            .arg("-s")
            .arg(speed.to_string())
            .arg("--")
            .arg(&request.text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| NativeError::Spawn(format!("{}: {}", self.program, e)))?;
        debug!(voice = ?voice, speed, chars = request.text.len(), "Native utterance started");

        let stop = request.cancel.child_token();
        self.replace_current(Some(stop.clone()));
        let (done, utterance) = Utterance::channel();

        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(NativeError::Failed(format!("exited with {}", status))),
                    Err(e) => Err(NativeError::Failed(e.to_string())),
                },
                _ = stop.cancelled() => {
                    let _ = child.kill().await;
                    Err(NativeError::Interrupted)
                }
            };
            let _ = done.send(result);
        });

        Ok(utterance)
    }

    async fn stop(&self) {
        self.replace_current(None);
    }
}
