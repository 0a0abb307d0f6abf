use super::{ConfigError, ConfigResult, STT_BACKENDS, ServerConfig, TTS_BACKENDS};

/// Validate a fully merged configuration.
pub(super) fn validate(config: &ServerConfig) -> ConfigResult<()> {
    validate_auth_token(config.auth_token.as_deref())?;
    validate_timeouts(config)?;
    validate_backends(&config.models.stt_backend, &config.models.tts_backend)?;
    validate_sample_rate(config.models.stt_sample_rate)?;
    Ok(())
}

fn validate_auth_token(token: Option<&str>) -> ConfigResult<()> {
    if let Some(token) = token
        && token.trim().is_empty()
    {
        return Err(ConfigError::Validation(
            "auth token must not be blank when set".to_string(),
        ));
    }
    Ok(())
}

fn validate_timeouts(config: &ServerConfig) -> ConfigResult<()> {
    if config.connection_idle_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "connection_idle_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if config.stt_idle_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "stt_idle_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if config.max_frame_size < 1024 {
        return Err(ConfigError::Validation(
            "max_frame_size must be at least 1024 bytes".to_string(),
        ));
    }
    if config.max_connections_per_ip == 0 {
        return Err(ConfigError::Validation(
            "max_connections_per_ip must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_backends(stt: &str, tts: &str) -> ConfigResult<()> {
    if !STT_BACKENDS.contains(&stt) {
        return Err(ConfigError::Validation(format!(
            "unsupported stt_backend '{stt}' (expected one of {})",
            STT_BACKENDS.join(", ")
        )));
    }
    if !TTS_BACKENDS.contains(&tts) {
        return Err(ConfigError::Validation(format!(
            "unsupported tts_backend '{tts}' (expected one of {})",
            TTS_BACKENDS.join(", ")
        )));
    }
    Ok(())
}

fn validate_sample_rate(rate: u32) -> ConfigResult<()> {
    if !(8000..=48000).contains(&rate) {
        return Err(ConfigError::Validation(format!(
            "stt_sample_rate {rate} outside 8000..=48000"
        )));
    }
    Ok(())
}
