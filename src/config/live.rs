//! Live model configuration
//!
//! [`LiveConfig`] is the immutable snapshot describing which backends are
//! active and how each one is configured. It is shared by the whole process
//! through the model manager and is never mutated in place: every
//! reconfiguration builds a new value with [`LiveConfig::with_field`] or
//! [`LiveConfig::with_overrides`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ConfigError;

/// STT backends selectable through `stt_backend`
pub const STT_BACKENDS: &[&str] = &["vosk", "sherpa", "kroko"];

/// TTS backends selectable through `tts_backend`
pub const TTS_BACKENDS: &[&str] = &["kokoro", "piper"];

/// Default input sample rate for raw PCM frames
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Snapshot of every model-side setting.
///
/// Field names double as the flat keys accepted by `switch_model` and as the
/// environment variable names (uppercased) read at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub stt_backend: String,
    pub tts_backend: String,
    pub stt_sample_rate: u32,

    // vosk-server
    pub vosk_url: String,
    pub vosk_model_path: String,

    // sherpa-onnx streaming server
    pub sherpa_url: String,
    pub sherpa_model_path: String,

    // kroko (sherpa-compatible, optionally supervised locally)
    pub kroko_url: String,
    pub kroko_model_path: String,
    pub kroko_language: String,
    pub kroko_embedded: bool,
    pub kroko_port: u16,
    pub kroko_binary: String,

    // Kokoro HTTP server
    pub kokoro_url: String,
    pub kokoro_voice: String,
    pub kokoro_speed: f64,
    pub kokoro_lang: String,

    // piper subprocess
    pub piper_binary: String,
    pub piper_model_path: String,
    pub piper_speaker: u32,
    pub piper_sample_rate: u32,

    // llama-server
    pub llm_url: String,
    pub llm_model_path: String,
    pub llm_spawn_server: bool,
    pub llm_server_binary: String,
    pub llm_port: u16,
    pub llm_context_size: u32,
    pub llm_gpu_layers: i32,
    pub llm_threads: u32,
    pub llm_temperature: f64,
    pub llm_top_p: f64,
    pub llm_max_tokens: u32,
    pub llm_repeat_penalty: f64,
    pub llm_system_prompt: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            stt_backend: "vosk".to_string(),
            tts_backend: "kokoro".to_string(),
            stt_sample_rate: DEFAULT_SAMPLE_RATE,
            vosk_url: "ws://127.0.0.1:2700".to_string(),
            vosk_model_path: String::new(),
            sherpa_url: "ws://127.0.0.1:6007".to_string(),
            sherpa_model_path: String::new(),
            kroko_url: "ws://127.0.0.1:6006".to_string(),
            kroko_model_path: String::new(),
            kroko_language: "en".to_string(),
            kroko_embedded: false,
            kroko_port: 6006,
            kroko_binary: "kroko-server".to_string(),
            kokoro_url: "http://127.0.0.1:8880".to_string(),
            kokoro_voice: "af_heart".to_string(),
            kokoro_speed: 1.0,
            kokoro_lang: "en-us".to_string(),
            piper_binary: "piper".to_string(),
            piper_model_path: String::new(),
            piper_speaker: 0,
            piper_sample_rate: 22050,
            llm_url: "http://127.0.0.1:8080".to_string(),
            llm_model_path: String::new(),
            llm_spawn_server: false,
            llm_server_binary: "llama-server".to_string(),
            llm_port: 8080,
            llm_context_size: 4096,
            llm_gpu_layers: 0,
            llm_threads: 4,
            llm_temperature: 0.7,
            llm_top_p: 0.9,
            llm_max_tokens: 256,
            llm_repeat_penalty: 1.1,
            llm_system_prompt: "You are a helpful voice assistant. Keep replies short and conversational."
                .to_string(),
        }
    }
}

impl LiveConfig {
    /// Every settable key, in serialization order.
    pub fn keys() -> Vec<String> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `key` names a field of the snapshot.
    pub fn has_key(key: &str) -> bool {
        Self::keys().iter().any(|k| k == key)
    }

    /// The snapshot as a JSON object.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Current JSON value of one field.
    pub fn field(&self, key: &str) -> Option<Value> {
        self.to_map().remove(key)
    }

    /// Returns a copy of `self` with one field replaced.
    ///
    /// The value must already have the field's JSON type; coercion from
    /// loosely typed input happens in the control plane before this call.
    pub fn with_field(&self, key: &str, value: Value) -> Result<Self, ConfigError> {
        let mut map = self.to_map();
        if !map.contains_key(key) {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        map.insert(key.to_string(), value);
        serde_json::from_value(Value::Object(map)).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Returns a copy of `self` with every override applied in order.
    pub fn with_overrides<'a, I>(&self, overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut next = self.clone();
        for (key, value) in overrides {
            next = next.with_field(key, value)?;
        }
        Ok(next)
    }

    /// Config key holding the model path of the active STT backend.
    pub fn stt_model_path_key(&self) -> Option<&'static str> {
        match self.stt_backend.as_str() {
            "vosk" => Some("vosk_model_path"),
            "sherpa" => Some("sherpa_model_path"),
            "kroko" => Some("kroko_model_path"),
            _ => None,
        }
    }

    /// Config key holding the server URL of the active STT backend.
    pub fn stt_url_key(&self) -> Option<&'static str> {
        match self.stt_backend.as_str() {
            "vosk" => Some("vosk_url"),
            "sherpa" => Some("sherpa_url"),
            "kroko" => Some("kroko_url"),
            _ => None,
        }
    }

    /// Config key holding the model path of the active TTS backend.
    ///
    /// Kokoro is served over HTTP and has no local model path.
    pub fn tts_model_path_key(&self) -> Option<&'static str> {
        match self.tts_backend.as_str() {
            "piper" => Some("piper_model_path"),
            _ => None,
        }
    }

    /// Model path of the active STT backend.
    pub fn stt_model_path(&self) -> &str {
        match self.stt_backend.as_str() {
            "vosk" => &self.vosk_model_path,
            "sherpa" => &self.sherpa_model_path,
            "kroko" => &self.kroko_model_path,
            _ => "",
        }
    }

    /// Effective kroko endpoint: the supervised child when embedded.
    pub fn kroko_endpoint(&self) -> String {
        if self.kroko_embedded {
            format!("ws://127.0.0.1:{}", self.kroko_port)
        } else {
            self.kroko_url.clone()
        }
    }

    /// Effective llama-server endpoint: the supervised child when spawned.
    pub fn llm_endpoint(&self) -> String {
        if self.llm_spawn_server {
            format!("http://127.0.0.1:{}", self.llm_port)
        } else {
            self.llm_url.trim_end_matches('/').to_string()
        }
    }
}
