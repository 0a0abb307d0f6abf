//! Control plane
//!
//! Pure computation of a new [`LiveConfig`] from the current snapshot and a
//! `switch_model` request. Nothing here touches backends or shared state; the
//! model manager decides what to do with the resulting [`SwitchPlan`].
//!
//! A request may carry:
//! - `stt_backend` / `tts_backend` selections (allow-listed)
//! - flat keys naming any settable config field (`kokoro_voice`, `kroko_port`, ...)
//! - `stt_model_path` / `tts_model_path`, redirected to the active backend's key
//! - nested `stt_config` / `tts_config` / `llm_config` blocks
//! - `dry_run`

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backends::BackendKind;
use crate::config::{LiveConfig, STT_BACKENDS, TTS_BACKENDS};

pub mod coerce;

use coerce::{coerce_like, display_value, parse_truthy};

/// Roles whose backends must be rebuilt.
pub type RoleSet = BTreeSet<BackendKind>;

/// `stt_config` fields with a fixed target key.
const STT_CONFIG_MAP: &[(&str, &str)] = &[
    ("sample_rate", "stt_sample_rate"),
    ("language", "kroko_language"),
    ("embedded", "kroko_embedded"),
    ("port", "kroko_port"),
];

/// `tts_config` fields with a fixed target key.
const TTS_CONFIG_MAP: &[(&str, &str)] = &[
    ("speed", "kokoro_speed"),
    ("lang", "kokoro_lang"),
    ("url", "kokoro_url"),
    ("speaker", "piper_speaker"),
    ("binary", "piper_binary"),
];

/// `llm_config` fields with a fixed target key.
const LLM_CONFIG_MAP: &[(&str, &str)] = &[
    ("model_path", "llm_model_path"),
    ("url", "llm_url"),
    ("spawn_server", "llm_spawn_server"),
    ("port", "llm_port"),
    ("context_size", "llm_context_size"),
    ("gpu_layers", "llm_gpu_layers"),
    ("threads", "llm_threads"),
    ("temperature", "llm_temperature"),
    ("top_p", "llm_top_p"),
    ("max_tokens", "llm_max_tokens"),
    ("repeat_penalty", "llm_repeat_penalty"),
    ("system_prompt", "llm_system_prompt"),
];

/// Top-level request keys that are never treated as flat config keys.
const RESERVED_KEYS: &[&str] = &[
    "type",
    "dry_run",
    "stt_backend",
    "tts_backend",
    "stt_model_path",
    "tts_model_path",
    "stt_config",
    "tts_config",
    "llm_config",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("switch request must be a JSON object")]
    NotAnObject,
}

/// Outcome of [`apply_switch`].
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchPlan {
    /// New snapshot; equal to the input when `changes` is empty
    pub config: LiveConfig,
    /// `field=value` records in the order fields were first touched
    pub changes: Vec<String>,
    pub dry_run: bool,
    /// Roles whose configuration changed
    pub reload: RoleSet,
}

impl SwitchPlan {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Role owning a config key, by prefix.
pub fn role_for_key(key: &str) -> Option<BackendKind> {
    const STT_PREFIXES: &[&str] = &["stt_", "vosk_", "sherpa_", "kroko_"];
    const TTS_PREFIXES: &[&str] = &["tts_", "kokoro_", "piper_"];

    if STT_PREFIXES.iter().any(|p| key.starts_with(p)) {
        Some(BackendKind::Stt)
    } else if TTS_PREFIXES.iter().any(|p| key.starts_with(p)) {
        Some(BackendKind::Tts)
    } else if key.starts_with("llm_") {
        Some(BackendKind::Llm)
    } else {
        None
    }
}

fn is_dry_run(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => parse_truthy(s),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

struct PlanBuilder {
    original: LiveConfig,
    config: LiveConfig,
    touched: Vec<String>,
}

impl PlanBuilder {
    fn new(current: &LiveConfig) -> Self {
        Self {
            original: current.clone(),
            config: current.clone(),
            touched: Vec::new(),
        }
    }

    /// Coerce and assign one field; failures keep the current value.
    fn set(&mut self, key: &str, raw: &Value) {
        let Some(current) = self.config.field(key) else {
            debug!(key = %key, "Ignoring unknown config key");
            return;
        };

        let Some(coerced) = coerce_like(&current, raw) else {
            warn!(key = %key, value = %raw, "Ignoring value that cannot be coerced");
            return;
        };

        if coerced == current {
            return;
        }

        match self.config.with_field(key, coerced) {
            Ok(next) => {
                self.config = next;
                if !self.touched.iter().any(|k| k == key) {
                    self.touched.push(key.to_string());
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Ignoring rejected config value"),
        }
    }

    fn select_backend(&mut self, key: &str, raw: &Value, allowed: &[&str]) {
        let Some(name) = raw.as_str().map(|s| s.trim().to_lowercase()) else {
            warn!(key = %key, value = %raw, "Backend selection must be a string");
            return;
        };
        if !allowed.contains(&name.as_str()) {
            warn!(key = %key, backend = %name, "Ignoring unsupported backend");
            return;
        }
        self.set(key, &Value::String(name));
    }

    fn finish(self, dry_run: bool) -> SwitchPlan {
        let mut changes = Vec::new();
        let mut reload = RoleSet::new();

        for key in &self.touched {
            let now = self.config.field(key);
            if now == self.original.field(key) {
                continue;
            }
            if let Some(value) = now {
                changes.push(format!("{key}={}", display_value(&value)));
            }
            if let Some(role) = role_for_key(key) {
                reload.insert(role);
            }
        }

        SwitchPlan {
            config: self.config,
            changes,
            dry_run,
            reload,
        }
    }
}

/// Compute the snapshot a `switch_model` request asks for.
///
/// Never fails on individual fields: unknown keys, unsupported backends and
/// values that cannot be coerced are skipped with a log line.
pub fn apply_switch(current: &LiveConfig, request: &Value) -> Result<SwitchPlan, ControlError> {
    let request = request.as_object().ok_or(ControlError::NotAnObject)?;
    Ok(apply_switch_map(current, request))
}

pub fn apply_switch_map(current: &LiveConfig, request: &Map<String, Value>) -> SwitchPlan {
    let mut plan = PlanBuilder::new(current);
    let stt_block = request.get("stt_config").and_then(Value::as_object);
    let tts_block = request.get("tts_config").and_then(Value::as_object);
    let llm_block = request.get("llm_config").and_then(Value::as_object);

    // Backend selection first so redirects target the new backend
    if let Some(raw) = stt_block
        .and_then(|b| b.get("backend"))
        .or_else(|| request.get("stt_backend"))
    {
        plan.select_backend("stt_backend", raw, STT_BACKENDS);
    }
    if let Some(raw) = tts_block
        .and_then(|b| b.get("backend"))
        .or_else(|| request.get("tts_backend"))
    {
        plan.select_backend("tts_backend", raw, TTS_BACKENDS);
    }

    for (key, raw) in request {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        if LiveConfig::has_key(key) {
            plan.set(key, raw);
        } else {
            debug!(key = %key, "Ignoring unmapped switch_model key");
        }
    }

    if let Some(raw) = request.get("stt_model_path") {
        match plan.config.stt_model_path_key() {
            Some(key) => plan.set(key, raw),
            None => warn!("stt_model_path given but active STT backend has no model path"),
        }
    }
    if let Some(raw) = request.get("tts_model_path") {
        match plan.config.tts_model_path_key() {
            Some(key) => plan.set(key, raw),
            None => debug!(
                backend = %plan.config.tts_backend,
                "Ignoring tts_model_path for backend without a model path"
            ),
        }
    }

    if let Some(block) = stt_block {
        for (field, raw) in block {
            let target = match field.as_str() {
                "backend" => continue,
                "model_path" => plan.config.stt_model_path_key(),
                "url" => plan.config.stt_url_key(),
                other => lookup(STT_CONFIG_MAP, other),
            };
            apply_mapped(&mut plan, "stt_config", field, target, raw);
        }
    }

    if let Some(block) = tts_block {
        for (field, raw) in block {
            let target = match field.as_str() {
                "backend" => continue,
                "voice" => Some(if plan.config.tts_backend == "piper" {
                    "piper_speaker"
                } else {
                    "kokoro_voice"
                }),
                "model_path" => plan.config.tts_model_path_key(),
                other => lookup(TTS_CONFIG_MAP, other),
            };
            apply_mapped(&mut plan, "tts_config", field, target, raw);
        }
    }

    if let Some(block) = llm_block {
        for (field, raw) in block {
            let target = lookup(LLM_CONFIG_MAP, field);
            apply_mapped(&mut plan, "llm_config", field, target, raw);
        }
    }

    plan.finish(is_dry_run(request.get("dry_run")))
}

fn lookup(table: &[(&str, &'static str)], field: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, key)| *key)
}

fn apply_mapped(
    plan: &mut PlanBuilder,
    block: &str,
    field: &str,
    target: Option<&'static str>,
    raw: &Value,
) {
    match target {
        Some(key) => plan.set(key, raw),
        None => debug!(block = %block, field = %field, "Ignoring unmapped field"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(request: Value) -> SwitchPlan {
        apply_switch(&LiveConfig::default(), &request).unwrap()
    }

    #[test]
    fn test_flat_voice_dry_run() {
        let plan = plan(json!({"type": "switch_model", "dry_run": true, "kokoro_voice": "af_sky"}));

        assert_eq!(plan.changes, vec!["kokoro_voice=af_sky".to_string()]);
        assert!(plan.dry_run);
        assert_eq!(plan.config.kokoro_voice, "af_sky");
        assert_eq!(plan.reload, RoleSet::from([BackendKind::Tts]));
    }

    #[test]
    fn test_string_values_coerced() {
        let plan = plan(json!({"kroko_embedded": "true", "kroko_port": "7007"}));

        assert!(plan.config.kroko_embedded);
        assert_eq!(plan.config.kroko_port, 7007);
        assert_eq!(
            plan.changes,
            vec!["kroko_embedded=true".to_string(), "kroko_port=7007".to_string()]
        );
    }

    #[test]
    fn test_equal_value_is_not_a_change() {
        let plan = plan(json!({"kroko_port": "6006", "kokoro_voice": "af_heart"}));

        assert!(plan.is_noop());
        assert_eq!(plan.config, LiveConfig::default());
        assert!(plan.reload.is_empty());
    }

    #[test]
    fn test_failed_coercion_skips_field_only() {
        let plan = plan(json!({"kroko_port": "many", "llm_max_tokens": "64"}));

        assert_eq!(plan.config.kroko_port, 6006);
        assert_eq!(plan.config.llm_max_tokens, 64);
        assert_eq!(plan.changes, vec!["llm_max_tokens=64".to_string()]);
    }

    #[test]
    fn test_out_of_range_value_skipped() {
        let plan = plan(json!({"kroko_port": 70000}));
        assert!(plan.is_noop());
    }

    #[test]
    fn test_backend_allow_list() {
        let plan = plan(json!({"stt_backend": "whisper", "tts_backend": "Piper"}));

        assert_eq!(plan.config.stt_backend, "vosk");
        assert_eq!(plan.config.tts_backend, "piper");
        assert_eq!(plan.changes, vec!["tts_backend=piper".to_string()]);
    }

    #[test]
    fn test_model_path_redirect_after_backend_switch() {
        let plan = plan(json!({"stt_backend": "sherpa", "stt_model_path": "/models/zipformer"}));

        assert_eq!(plan.config.sherpa_model_path, "/models/zipformer");
        assert_eq!(plan.config.vosk_model_path, "");
        assert_eq!(
            plan.changes,
            vec![
                "stt_backend=sherpa".to_string(),
                "sherpa_model_path=/models/zipformer".to_string()
            ]
        );
        assert_eq!(plan.reload, RoleSet::from([BackendKind::Stt]));
    }

    #[test]
    fn test_tts_model_path_ignored_for_kokoro() {
        let plan = plan(json!({"tts_model_path": "/models/voice.onnx"}));
        assert!(plan.is_noop());

        let plan = apply_switch(
            &LiveConfig::default(),
            &json!({"tts_backend": "piper", "tts_model_path": "/models/voice.onnx"}),
        )
        .unwrap();
        assert_eq!(plan.config.piper_model_path, "/models/voice.onnx");
    }

    #[test]
    fn test_nested_blocks() {
        let plan = plan(json!({
            "stt_config": {"backend": "kroko", "embedded": "yes", "model_path": "/m/kroko", "bogus": 1},
            "tts_config": {"voice": "af_bella", "speed": "1.25"},
            "llm_config": {"temperature": 0.2, "max_tokens": "128"}
        }));

        assert_eq!(plan.config.stt_backend, "kroko");
        assert!(plan.config.kroko_embedded);
        assert_eq!(plan.config.kroko_model_path, "/m/kroko");
        assert_eq!(plan.config.kokoro_voice, "af_bella");
        assert_eq!(plan.config.kokoro_speed, 1.25);
        assert_eq!(plan.config.llm_temperature, 0.2);
        assert_eq!(plan.config.llm_max_tokens, 128);
        assert_eq!(
            plan.reload,
            RoleSet::from([BackendKind::Stt, BackendKind::Tts, BackendKind::Llm])
        );
    }

    #[test]
    fn test_voice_targets_piper_speaker() {
        let plan = plan(json!({"tts_config": {"backend": "piper", "voice": "4"}}));

        assert_eq!(plan.config.piper_speaker, 4);
        assert_eq!(plan.config.kokoro_voice, "af_heart");
    }

    #[test]
    fn test_stt_url_targets_active_backend() {
        let plan = plan(json!({"stt_config": {"url": "ws://10.0.0.5:2700"}}));
        assert_eq!(plan.config.vosk_url, "ws://10.0.0.5:2700");
    }

    #[test]
    fn test_reverting_value_in_same_request() {
        let plan = plan(json!({
            "kokoro_voice": "af_sky",
            "tts_config": {"voice": "af_heart"}
        }));
        assert!(plan.is_noop());
    }

    #[test]
    fn test_dry_run_flag_forms() {
        assert!(plan(json!({"dry_run": "yes", "llm_top_p": 0.5})).dry_run);
        assert!(!plan(json!({"dry_run": false, "llm_top_p": 0.5})).dry_run);
        assert!(!plan(json!({"llm_top_p": 0.5})).dry_run);
    }

    #[test]
    fn test_input_not_mutated() {
        let current = LiveConfig::default();
        let snapshot = current.clone();
        let _ = apply_switch(&current, &json!({"kokoro_voice": "af_sky"})).unwrap();
        assert_eq!(current, snapshot);
    }

    #[test]
    fn test_non_object_request() {
        let err = apply_switch(&LiveConfig::default(), &json!([1, 2])).unwrap_err();
        assert_eq!(err, ControlError::NotAnObject);
    }

    #[test]
    fn test_role_for_key() {
        assert_eq!(role_for_key("kroko_port"), Some(BackendKind::Stt));
        assert_eq!(role_for_key("piper_speaker"), Some(BackendKind::Tts));
        assert_eq!(role_for_key("llm_top_p"), Some(BackendKind::Llm));
        assert_eq!(role_for_key("unknown"), None);
    }
}
