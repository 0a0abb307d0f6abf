use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

use super::env::apply_model_value;
use super::{ConfigError, ConfigResult, ServerConfig};

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override the environment.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "127.0.0.1"
///   port: 8765
///
/// auth:
///   token: "your-shared-token"
///
/// session:
///   connection_idle_timeout_secs: 300
///   stt_idle_timeout_ms: 10000
///   duplicate_window_ms: 2000
///   max_frame_size: 10485760
///
/// limits:
///   max_websocket_connections: 200
///   max_connections_per_ip: 20
///   retire_grace_secs: 30
///
/// models:
///   stt_backend: kroko
///   kroko_embedded: true
///   kroko_model_path: /models/kroko-en.data
///   tts_backend: kokoro
///   kokoro_voice: af_heart
///   llm_model_path: /models/qwen2.5-3b-instruct-q4_k_m.gguf
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub auth: Option<AuthYaml>,
    pub session: Option<SessionYaml>,
    pub limits: Option<LimitsYaml>,
    /// Initial live model values, keyed by config field name
    pub models: Option<Map<String, Value>>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub load_models_on_start: Option<bool>,
}

/// Authentication configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub token: Option<String>,
}

/// Session timing configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub connection_idle_timeout_secs: Option<u64>,
    pub stt_idle_timeout_ms: Option<u64>,
    pub duplicate_window_ms: Option<u64>,
    pub max_frame_size: Option<usize>,
}

/// Connection limit configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LimitsYaml {
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
    pub retire_grace_secs: Option<u64>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Overlay every value present in the file onto `config`.
    pub fn apply(&self, config: &mut ServerConfig) -> ConfigResult<()> {
        if let Some(server) = &self.server {
            if let Some(host) = &server.host {
                config.host = host.clone();
            }
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(load) = server.load_models_on_start {
                config.load_models_on_start = load;
            }
        }

        if let Some(token) = self.auth.as_ref().and_then(|a| a.token.clone()) {
            config.auth_token = Some(token);
        }

        if let Some(session) = &self.session {
            if let Some(v) = session.connection_idle_timeout_secs {
                config.connection_idle_timeout_secs = v;
            }
            if let Some(v) = session.stt_idle_timeout_ms {
                config.stt_idle_timeout_ms = v;
            }
            if let Some(v) = session.duplicate_window_ms {
                config.duplicate_window_ms = v;
            }
            if let Some(v) = session.max_frame_size {
                config.max_frame_size = v;
            }
        }

        if let Some(limits) = &self.limits {
            if let Some(v) = limits.max_websocket_connections {
                config.max_websocket_connections = Some(v);
            }
            if let Some(v) = limits.max_connections_per_ip {
                config.max_connections_per_ip = v;
            }
            if let Some(v) = limits.retire_grace_secs {
                config.retire_grace_secs = v;
            }
        }

        if let Some(models) = &self.models {
            for (key, value) in models {
                config.models = apply_model_value(&config.models, key, value)?;
            }
        }

        Ok(())
    }
}
