use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LiveConfig;

/// Backend role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Stt,
    Tts,
    Llm,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Stt, BackendKind::Tts, BackendKind::Llm];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Stt => "stt",
            BackendKind::Tts => "tts",
            BackendKind::Llm => "llm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stt" => Ok(BackendKind::Stt),
            "tts" => Ok(BackendKind::Tts),
            "llm" => Ok(BackendKind::Llm),
            other => Err(format!("unknown backend type '{other}'")),
        }
    }
}

/// Errors raised by backend construction and operation
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend configuration error: {0}")]
    Configuration(String),
    #[error("Backend not ready: {0}")]
    NotReady(String),
    #[error("Backend connection error: {0}")]
    Connection(String),
    #[error("Backend process error: {0}")]
    Process(String),
    #[error("Backend request failed: {0}")]
    Request(String),
    #[error("Backend protocol error: {0}")]
    Protocol(String),
    #[error("Backend panicked: {0}")]
    Panic(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            BackendError::Connection(e.to_string())
        } else {
            BackendError::Request(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BackendError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BackendError::Connection(e.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// JSON type of one configuration option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    String,
    Integer,
    Number,
    Boolean,
    Path,
}

/// Declarative description of one backend option
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionSpec {
    #[serde(rename = "type")]
    pub kind: OptionType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OptionSpec {
    fn new(kind: OptionType) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            choices: None,
            description: None,
        }
    }

    pub fn string() -> Self {
        Self::new(OptionType::String)
    }

    pub fn integer() -> Self {
        Self::new(OptionType::Integer)
    }

    pub fn number() -> Self {
        Self::new(OptionType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(OptionType::Boolean)
    }

    pub fn path() -> Self {
        Self::new(OptionType::Path)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Option name to option description
pub type ConfigSchema = BTreeMap<String, OptionSpec>;

/// Runtime status reported by a backend instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub display: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl BackendStatus {
    pub fn new(name: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display: display.into(),
            ..Default::default()
        }
    }

    pub fn loaded(mut self, loaded: bool) -> Self {
        self.loaded = loaded;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = (!path.is_empty()).then_some(path);
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Capabilities shared by every backend role
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name of this backend
    fn name(&self) -> &str;

    /// Load models, connect, or start child processes for `config`.
    ///
    /// Called exactly once before the instance is published.
    async fn initialize(&mut self, config: &LiveConfig) -> BackendResult<()>;

    /// Release connections and stop child processes.
    async fn shutdown(&self) -> BackendResult<()>;

    fn status(&self) -> BackendStatus;
}

/// Transcript produced by a recognizer stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

impl Transcript {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Streaming recognizer handle owned by one session
#[async_trait]
pub trait RecognizerStream: Send {
    /// Feed 16-bit little-endian mono PCM.
    ///
    /// Returns every final produced since the last call, in order, followed by
    /// the newest partial if one arrived after them.
    async fn accept_audio(&mut self, pcm: Bytes) -> BackendResult<Vec<Transcript>>;

    /// Flush buffered audio and return the remaining finals, in order.
    async fn finish(&mut self) -> BackendResult<Vec<Transcript>>;

    async fn close(&mut self);
}

/// Speech-to-text role
#[async_trait]
pub trait SpeechRecognizer: Backend {
    async fn open_stream(&self, sample_rate: u32) -> BackendResult<Box<dyn RecognizerStream>>;

    /// One-shot recognition of a complete utterance.
    async fn process_audio(&self, pcm: Bytes, sample_rate: u32) -> BackendResult<Option<String>> {
        let mut stream = self.open_stream(sample_rate).await?;
        let result = match stream.accept_audio(pcm).await {
            Ok(mut transcripts) => stream.finish().await.map(|rest| {
                transcripts.extend(rest);
                transcripts
            }),
            Err(e) => Err(e),
        };
        stream.close().await;

        let text = result?
            .into_iter()
            .filter(|t| t.is_final && !t.text.trim().is_empty())
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join(" ");
        Ok((!text.is_empty()).then_some(text))
    }
}

/// Synthesized PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub format: String,
}

/// Text-to-speech role
#[async_trait]
pub trait Synthesizer: Backend {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> BackendResult<SynthesizedAudio>;

    fn output_sample_rate(&self) -> u32;
}

/// Generation parameters reported with LLM status and `reload_llm`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub repeat_penalty: f64,
    pub context_size: u32,
    pub system_prompt: String,
}

impl GenerationParams {
    pub fn from_config(config: &LiveConfig) -> Self {
        Self {
            temperature: config.llm_temperature,
            top_p: config.llm_top_p,
            max_tokens: config.llm_max_tokens,
            repeat_penalty: config.llm_repeat_penalty,
            context_size: config.llm_context_size,
            system_prompt: config.llm_system_prompt.clone(),
        }
    }
}

/// Incremental generation output
pub type TokenStream = BoxStream<'static, BackendResult<String>>;

/// Language generation role
#[async_trait]
pub trait Generator: Backend {
    async fn generate(&self, prompt: &str) -> BackendResult<String>;

    async fn generate_stream(&self, prompt: &str) -> BackendResult<TokenStream>;

    fn params(&self) -> GenerationParams;
}
