use std::env;
use std::str::FromStr;

use serde_json::Value;

use super::{ConfigError, ConfigResult, LiveConfig, ServerConfig};
use crate::control::coerce::coerce_like;

fn read_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match read_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: name.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn parse_bool_var(name: &str) -> ConfigResult<Option<bool>> {
    match read_var(name) {
        Some(raw) => match coerce_like(&Value::Bool(false), &Value::String(raw)) {
            Some(Value::Bool(b)) => Ok(Some(b)),
            _ => Err(ConfigError::InvalidValue {
                key: name.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        },
        None => Ok(None),
    }
}

/// Overlay environment variables onto `config`.
pub(super) fn apply_env(config: &mut ServerConfig) -> ConfigResult<()> {
    if let Some(host) = read_var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_var("PORT")? {
        config.port = port;
    }
    if let Some(token) = read_var("AUTH_TOKEN") {
        config.auth_token = Some(token);
    }
    if let Some(v) = parse_var("CONNECTION_IDLE_TIMEOUT_SECS")? {
        config.connection_idle_timeout_secs = v;
    }
    if let Some(v) = parse_var("STT_IDLE_TIMEOUT_MS")? {
        config.stt_idle_timeout_ms = v;
    }
    if let Some(v) = parse_var("DUPLICATE_WINDOW_MS")? {
        config.duplicate_window_ms = v;
    }
    if let Some(v) = parse_var("MAX_FRAME_SIZE")? {
        config.max_frame_size = v;
    }
    if let Some(v) = parse_var("MAX_WEBSOCKET_CONNECTIONS")? {
        config.max_websocket_connections = Some(v);
    }
    if let Some(v) = parse_var("MAX_CONNECTIONS_PER_IP")? {
        config.max_connections_per_ip = v;
    }
    if let Some(v) = parse_var("RETIRE_GRACE_SECS")? {
        config.retire_grace_secs = v;
    }
    if let Some(v) = parse_bool_var("LOAD_MODELS_ON_START")? {
        config.load_models_on_start = v;
    }

    // Model keys map one-to-one onto uppercased variable names
    for key in LiveConfig::keys() {
        if let Some(raw) = read_var(&key.to_uppercase()) {
            config.models = apply_model_value(&config.models, &key, &Value::String(raw))?;
        }
    }

    Ok(())
}

/// Coerce `value` to the field's type and apply it, failing on bad input.
///
/// Shared by the environment and YAML layers.
pub(super) fn apply_model_value(
    models: &LiveConfig,
    key: &str,
    value: &Value,
) -> ConfigResult<LiveConfig> {
    let current = models
        .field(key)
        .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
    let coerced = coerce_like(&current, value).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("cannot interpret {value} as the type of {current}"),
    })?;
    models.with_field(key, coerced)
}
