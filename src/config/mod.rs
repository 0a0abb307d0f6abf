//! Configuration module for the voxhost server
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `live`: the hot-reloadable model configuration snapshot
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use voxhost::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use subtle::ConstantTimeEq;

mod env;
pub mod live;
mod validation;
mod yaml;

pub use live::{DEFAULT_SAMPLE_RATE, LiveConfig, STT_BACKENDS, TTS_BACKENDS};

/// Errors raised while loading configuration at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("Unknown config key: {0}")]
    UnknownKey(String),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Server configuration
///
/// Contains everything needed to run the voxhost server:
/// - Listener settings (host, port)
/// - The optional shared auth token
/// - Session timing (idle timeouts, duplicate-final window, frame size)
/// - Connection limits
/// - The initial model configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Shared token required from clients; `None` disables the auth gate
    pub auth_token: Option<String>,

    /// Connections with no inbound frame for this long are closed
    pub connection_idle_timeout_secs: u64,
    /// Recognizer streams with no audio for this long are finalized
    pub stt_idle_timeout_ms: u64,
    /// Identical finals inside this window are suppressed
    pub duplicate_window_ms: u64,
    /// Maximum WebSocket frame and message size in bytes
    pub max_frame_size: usize,

    /// Global cap on concurrent WebSocket connections
    pub max_websocket_connections: Option<usize>,
    /// Per client IP cap on concurrent WebSocket connections
    pub max_connections_per_ip: u32,

    /// How long a replaced backend may stay in use before forced shutdown
    pub retire_grace_secs: u64,
    /// Build the configured backends at boot
    pub load_models_on_start: bool,

    /// Initial live model configuration
    pub models: LiveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            auth_token: None,
            connection_idle_timeout_secs: 300,
            stt_idle_timeout_ms: 10_000,
            duplicate_window_ms: 2_000,
            max_frame_size: 10 * 1024 * 1024,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            retire_grace_secs: 30,
            load_models_on_start: true,
            models: LiveConfig::default(),
        }
    }
}

/// Zeroize the auth token when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut token) = self.auth_token {
            token.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only.
    ///
    /// The `.env` file is loaded in `main` before this is called.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file layered over the environment.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read or is not valid YAML
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;

        let mut config = Self::default();
        env::apply_env(&mut config)?;
        yaml_config.apply(&mut config)?;

        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port", bracketing IPv6 hosts
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the listen host only accepts local connections.
    pub fn is_loopback_bind(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
    }

    /// Connections are refused when bound beyond loopback without a token.
    pub fn accepts_connections(&self) -> bool {
        self.is_loopback_bind() || self.has_auth_token()
    }

    /// Constant-time comparison of a client token against the configured one.
    ///
    /// Always succeeds when no token is configured.
    pub fn verify_token(&self, candidate: &str) -> bool {
        match self.auth_token.as_deref() {
            Some(expected) if !expected.is_empty() => {
                expected.as_bytes().ct_eq(candidate.as_bytes()).into()
            }
            _ => true,
        }
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs)
    }

    pub fn stt_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stt_idle_timeout_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn retire_grace(&self) -> Duration {
        Duration::from_secs(self.retire_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("AUTH_TOKEN");
            env::remove_var("CONNECTION_IDLE_TIMEOUT_SECS");
            env::remove_var("MAX_CONNECTIONS_PER_IP");
            env::remove_var("KOKORO_VOICE");
            env::remove_var("KROKO_EMBEDDED");
            env::remove_var("KROKO_PORT");
            env::remove_var("STT_BACKEND");
        }
    }

    #[test]
    fn test_address() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "127.0.0.1:8765");
    }

    #[test]
    fn test_address_brackets_ipv6() {
        let mut config = ServerConfig::default();
        config.host = "::1".to_string();
        assert_eq!(config.address(), "[::1]:8765");
        let addr: std::net::SocketAddr = config.address().parse().unwrap();
        assert!(addr.ip().is_loopback());

        config.host = "[::1]".to_string();
        assert_eq!(config.address(), "[::1]:8765");
    }

    #[test]
    fn test_loopback_detection() {
        let mut config = ServerConfig::default();
        assert!(config.is_loopback_bind());

        config.host = "localhost".to_string();
        assert!(config.is_loopback_bind());

        config.host = "::1".to_string();
        assert!(config.is_loopback_bind());

        config.host = "0.0.0.0".to_string();
        assert!(!config.is_loopback_bind());
        assert!(!config.accepts_connections());

        config.auth_token = Some("secret".to_string());
        assert!(config.accepts_connections());
    }

    #[test]
    fn test_verify_token() {
        let mut config = ServerConfig::default();
        assert!(config.verify_token("anything"));

        config.auth_token = Some("secret123".to_string());
        assert!(config.verify_token("secret123"));
        assert!(!config.verify_token("secret12"));
        assert!(!config.verify_token("secret1234"));
        assert!(!config.verify_token(""));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 8765);
        assert_eq!(config.auth_token, None);
        assert_eq!(config.models, LiveConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_model_keys() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("AUTH_TOKEN", "env-token");
            env::set_var("KOKORO_VOICE", "af_sky");
            env::set_var("KROKO_EMBEDDED", "yes");
            env::set_var("KROKO_PORT", "7001");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.auth_token.as_deref(), Some("env-token"));
        assert_eq!(config.models.kokoro_voice, "af_sky");
        assert!(config.models.kroko_embedded);
        assert_eq!(config.models.kroko_port, 7001);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_port() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "not-a-port");
        }

        let result = ServerConfig::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 9000

auth:
  token: "yaml-token"

session:
  connection_idle_timeout_secs: 60
  duplicate_window_ms: 1500

limits:
  max_websocket_connections: 10
  max_connections_per_ip: 3

models:
  stt_backend: kroko
  kroko_embedded: "true"
  kroko_port: "6006"
  kokoro_voice: af_sky
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth_token.as_deref(), Some("yaml-token"));
        assert_eq!(config.connection_idle_timeout_secs, 60);
        assert_eq!(config.duplicate_window_ms, 1500);
        assert_eq!(config.max_websocket_connections, Some(10));
        assert_eq!(config.max_connections_per_ip, 3);
        assert_eq!(config.models.stt_backend, "kroko");
        assert!(config.models.kroko_embedded);
        assert_eq!(config.models.kroko_port, 6006);
        assert_eq!(config.models.kokoro_voice, "af_sky");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PORT", "9100");
            env::set_var("KOKORO_VOICE", "env_voice");
        }

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "server:\n  port: 9200\nmodels:\n  kokoro_voice: yaml_voice\n",
        )
        .unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.models.kokoro_voice, "yaml_voice");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = ServerConfig::from_file(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    #[serial]
    fn test_from_file_invalid_yaml() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server: [unclosed").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    #[serial]
    fn test_from_file_unknown_model_key() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "models:\n  whisper_model: base\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }
}
