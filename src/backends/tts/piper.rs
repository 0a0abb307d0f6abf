//! Piper TTS via the `piper` binary
//!
//! Each request runs `piper --model <voice.onnx> --output_raw`, writes the
//! text to stdin and reads raw 16-bit PCM from stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::backends::base::{
    Backend, BackendError, BackendResult, BackendStatus, ConfigSchema, OptionSpec,
    SynthesizedAudio, Synthesizer,
};
use crate::backends::process::{binary_available, resolve_binary};
use crate::config::LiveConfig;

const NAME: &str = "piper";
const SYNTH_TIMEOUT: Duration = Duration::from_secs(60);

pub fn config_schema() -> ConfigSchema {
    ConfigSchema::from([
        (
            "piper_model_path".to_string(),
            OptionSpec::path()
                .required()
                .with_description("Voice model (.onnx) with its .onnx.json next to it"),
        ),
        (
            "piper_binary".to_string(),
            OptionSpec::string().with_default("piper"),
        ),
        (
            "piper_speaker".to_string(),
            OptionSpec::integer()
                .with_default(0)
                .with_description("Speaker id for multi-speaker voices"),
        ),
        (
            "piper_sample_rate".to_string(),
            OptionSpec::integer()
                .with_default(22050)
                .with_description("Used when the voice config does not declare one"),
        ),
    ])
}

pub fn probe() -> BackendResult<bool> {
    Ok(binary_available("piper"))
}

pub fn create() -> Box<dyn Synthesizer> {
    Box::new(PiperSynthesizer::default())
}

/// Sample rate declared by the voice's `<model>.json`, if present.
async fn voice_sample_rate(model: &Path) -> Option<u32> {
    let mut config_path = model.as_os_str().to_owned();
    config_path.push(".json");
    let raw = tokio::fs::read_to_string(PathBuf::from(config_path)).await.ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    value
        .get("audio")?
        .get("sample_rate")?
        .as_u64()
        .and_then(|r| u32::try_from(r).ok())
}

#[derive(Debug, Default)]
pub struct PiperSynthesizer {
    binary: Option<PathBuf>,
    model_path: String,
    speaker: u32,
    sample_rate: u32,
}

impl PiperSynthesizer {
    fn args(&self, voice: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model_path.clone(),
            "--output_raw".to_string(),
        ];
        let speaker = voice
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(self.speaker);
        if speaker > 0 {
            args.push("--speaker".to_string());
            args.push(speaker.to_string());
        }
        args
    }
}

#[async_trait]
impl Backend for PiperSynthesizer {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()> {
        let model = config.piper_model_path.trim();
        if model.is_empty() {
            return Err(BackendError::Configuration(
                "piper_model_path is not set".to_string(),
            ));
        }
        tokio::fs::metadata(model).await.map_err(|e| {
            BackendError::Configuration(format!("piper model {model} unavailable: {e}"))
        })?;

        let binary = resolve_binary(&config.piper_binary).await?;
        let sample_rate = voice_sample_rate(Path::new(model))
            .await
            .unwrap_or(config.piper_sample_rate);

        self.binary = Some(binary);
        self.model_path = model.to_string();
        self.speaker = config.piper_speaker;
        self.sample_rate = sample_rate;
        tracing::info!(backend = NAME, model = %self.model_path, sample_rate, "TTS backend ready");
        Ok(())
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }

    fn status(&self) -> BackendStatus {
        let voice = Path::new(&self.model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        BackendStatus::new(NAME, format!("Piper ({voice})"))
            .loaded(self.binary.is_some())
            .with_path(self.model_path.clone())
            .with_extra("speaker", self.speaker)
            .with_extra("sample_rate", self.sample_rate)
    }
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> BackendResult<SynthesizedAudio> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| BackendError::NotReady("piper not initialized".to_string()))?;

        let mut child = Command::new(binary)
            .args(self.args(voice))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Process(format!("failed to start piper: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // Dropping stdin signals end of input
        }

        let output = timeout(SYNTH_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Process("piper timed out".to_string()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Process(format!(
                "piper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(SynthesizedAudio {
            pcm: Bytes::from(output.stdout),
            sample_rate: self.sample_rate,
            format: "pcm_s16le".to_string(),
        })
    }

    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
