//! Status snapshots and dependency probes

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::backends::endpoint::is_reachable;
use crate::backends::isolation::await_isolated;
use crate::backends::process::binary_available;
use crate::backends::{Backend, BackendKind, BackendResult, BackendStatus, Registries};
use crate::config::LiveConfig;
use crate::protocol::{PROTOCOL_VERSION, StatusSnapshot};

use super::{LLM_BACKEND, LiveState};

/// Connect timeout for reachability probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

fn placeholder(registries: &Registries, kind: BackendKind, name: &str, path: &str) -> BackendStatus {
    let display = registries
        .display_name(kind, name)
        .unwrap_or_else(|| name.to_string());
    BackendStatus::new(name, display).with_path(path)
}

fn role_status<T: Backend + ?Sized>(
    backend: Option<&T>,
    fallback: impl FnOnce() -> BackendStatus,
) -> BackendStatus {
    backend.map(|b| b.status()).unwrap_or_else(fallback)
}

/// Build a status snapshot from one live state.
pub(super) fn build_snapshot(state: &LiveState, registries: &Registries) -> StatusSnapshot {
    let config = state.config.as_ref();

    let mut models = BTreeMap::new();
    models.insert(
        BackendKind::Stt.to_string(),
        role_status(state.stt.as_deref(), || {
            placeholder(registries, BackendKind::Stt, &config.stt_backend, config.stt_model_path())
        }),
    );
    models.insert(
        BackendKind::Tts.to_string(),
        role_status(state.tts.as_deref(), || {
            let path = match config.tts_backend.as_str() {
                "piper" => config.piper_model_path.as_str(),
                _ => "",
            };
            placeholder(registries, BackendKind::Tts, &config.tts_backend, path)
        }),
    );
    models.insert(
        BackendKind::Llm.to_string(),
        role_status(state.llm.as_deref(), || {
            placeholder(registries, BackendKind::Llm, LLM_BACKEND, &config.llm_model_path)
        }),
    );

    StatusSnapshot {
        status: "ok".to_string(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        stt_backend: config.stt_backend.clone(),
        tts_backend: config.tts_backend.clone(),
        models,
        kroko: json!({
            "url": config.kroko_endpoint(),
            "embedded": config.kroko_embedded,
            "port": config.kroko_port,
            "language": config.kroko_language,
            "model_path": config.kroko_model_path,
        }),
        kokoro: json!({
            "url": config.kokoro_url,
            "voice": config.kokoro_voice,
            "speed": config.kokoro_speed,
            "lang": config.kokoro_lang,
        }),
        derived: json!({
            "stt_model_path": config.stt_model_path(),
            "stt_url_key": config.stt_url_key(),
            "llm_endpoint": config.llm_endpoint(),
            "stt_generation": state.stt_generation,
        }),
        config: config.to_map(),
    }
}

async fn probe<F>(name: &str, check: F) -> bool
where
    F: Future<Output = BackendResult<bool>>,
{
    match await_isolated(check).await {
        Ok(available) => available,
        Err(e) => {
            warn!(dependency = %name, error = %e, "Capability probe failed");
            false
        }
    }
}

async fn binary_on_path(program: String) -> BackendResult<bool> {
    tokio::task::spawn_blocking(move || binary_available(&program))
        .await
        .map_err(|e| crate::backends::BackendError::Process(e.to_string()))
}

async fn file_exists(path: String) -> BackendResult<bool> {
    if path.is_empty() {
        return Ok(false);
    }
    Ok(tokio::fs::try_exists(Path::new(&path)).await?)
}

/// Probe every native dependency the built-in backends rely on.
pub(super) async fn probe_capabilities(config: &LiveConfig) -> BTreeMap<String, bool> {
    let mut capabilities = BTreeMap::new();

    let vosk = probe("vosk", async { Ok(is_reachable(&config.vosk_url, PROBE_TIMEOUT).await) });
    let sherpa = probe("sherpa", async {
        Ok(is_reachable(&config.sherpa_url, PROBE_TIMEOUT).await)
    });
    let kroko = probe("kroko", async {
        if config.kroko_embedded {
            binary_on_path(config.kroko_binary.clone()).await
        } else {
            Ok(is_reachable(&config.kroko_url, PROBE_TIMEOUT).await)
        }
    });
    let kroko_binary = probe("kroko_server_binary", binary_on_path(config.kroko_binary.clone()));
    let kokoro = probe("kokoro", async {
        Ok(is_reachable(&config.kokoro_url, PROBE_TIMEOUT).await)
    });
    let piper_binary = probe("piper_binary", binary_on_path(config.piper_binary.clone()));
    let piper_model = probe("piper_model", file_exists(config.piper_model_path.clone()));
    let llama = probe("llama", async {
        if config.llm_spawn_server {
            binary_on_path(config.llm_server_binary.clone()).await
        } else {
            Ok(is_reachable(&config.llm_url, PROBE_TIMEOUT).await)
        }
    });
    let llama_binary = probe(
        "llama_server_binary",
        binary_on_path(config.llm_server_binary.clone()),
    );

    let (vosk, sherpa, kroko, kroko_binary, kokoro, piper_binary, piper_model, llama, llama_binary) = tokio::join!(
        vosk,
        sherpa,
        kroko,
        kroko_binary,
        kokoro,
        piper_binary,
        piper_model,
        llama,
        llama_binary
    );

    capabilities.insert("vosk".to_string(), vosk);
    capabilities.insert("sherpa".to_string(), sherpa);
    capabilities.insert("kroko".to_string(), kroko);
    capabilities.insert("kroko_server_binary".to_string(), kroko_binary);
    capabilities.insert("kokoro".to_string(), kokoro);
    capabilities.insert("piper".to_string(), piper_binary && piper_model);
    capabilities.insert("piper_binary".to_string(), piper_binary);
    capabilities.insert("llama".to_string(), llama);
    capabilities.insert("llama_server_binary".to_string(), llama_binary);
    capabilities
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_capabilities_false_when_nothing_runs() {
        let mut config = LiveConfig::default();
        config.vosk_url = "ws://127.0.0.1:1".to_string();
        config.piper_binary = "definitely-not-a-real-piper-binary".to_string();
        config.piper_model_path = "/nonexistent/voice.onnx".to_string();

        let caps = probe_capabilities(&config).await;
        assert_eq!(caps.get("vosk"), Some(&false));
        assert_eq!(caps.get("piper"), Some(&false));
        assert_eq!(caps.get("piper_binary"), Some(&false));
        assert!(caps.contains_key("llama_server_binary"));
    }

    #[tokio::test]
    async fn test_probe_downgrades_errors_and_panics() {
        assert!(!probe("broken", async { Err(crate::backends::BackendError::NotReady("x".into())) }).await);
        let explode = true;
        assert!(
            !probe("panicky", async move {
                if explode {
                    panic!("probe exploded");
                }
                Ok(true)
            })
            .await
        );
    }

    #[test]
    fn test_snapshot_without_backends_reports_unloaded() {
        let registries = Registries::new();
        let state = LiveState::empty(Arc::new(LiveConfig::default()));
        let snapshot = build_snapshot(&state, &registries);

        assert_eq!(snapshot.status, "ok");
        assert_eq!(snapshot.stt_backend, "vosk");
        assert!(!snapshot.models["stt"].loaded);
        assert_eq!(snapshot.models["stt"].display, "Vosk");
        assert_eq!(snapshot.models["llm"].name, "llama");
        assert_eq!(snapshot.config["kokoro_voice"], "af_heart");
        assert_eq!(snapshot.kroko["url"], "ws://127.0.0.1:6006");
    }
}
