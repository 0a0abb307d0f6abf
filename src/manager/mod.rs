//! Model Manager
//!
//! Owns the live state: the current [`LiveConfig`] snapshot together with the
//! backend instances built from it. Readers load the state lock-free through
//! `ArcSwap`; every mutation runs under one async reload lock and follows the
//! same order: compute the new snapshot, build and initialize backends for the
//! affected roles, publish config and backends in one store, then retire the
//! replaced instances.
//!
//! In-flight requests clone the backend `Arc` they use, so a retired instance
//! keeps serving them until they finish; it is shut down once no request holds
//! it or the grace period runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::backends::isolation::await_isolated;
use crate::backends::{
    Backend, BackendError, BackendKind, BackendRegistry, GenerationParams, Generator, Registries,
    RegistryError, SpeechRecognizer, Synthesizer,
};
use crate::config::LiveConfig;
use crate::control::{self, RoleSet};
use crate::protocol::{ErrorObject, OutgoingMessage, StatusSnapshot};

mod status;

/// The only LLM adapter; the config has no LLM backend selector
pub const LLM_BACKEND: &str = "llama";

/// Poll interval while waiting for a retired backend to go idle
const RETIRE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Failed to start {kind} backend '{name}': {source}")]
    Backend {
        kind: BackendKind,
        name: String,
        #[source]
        source: BackendError,
    },
    #[error("Invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("Backend construction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Config snapshot plus the backends built from it
pub struct LiveState {
    pub config: Arc<LiveConfig>,
    pub stt: Option<Arc<dyn SpeechRecognizer>>,
    pub tts: Option<Arc<dyn Synthesizer>>,
    pub llm: Option<Arc<dyn Generator>>,
    /// Bumped whenever the STT instance is replaced
    pub stt_generation: u64,
}

impl LiveState {
    pub fn empty(config: Arc<LiveConfig>) -> Self {
        Self {
            config,
            stt: None,
            tts: None,
            llm: None,
            stt_generation: 0,
        }
    }

    fn with_config(&self, config: LiveConfig) -> Self {
        Self {
            config: Arc::new(config),
            stt: self.stt.clone(),
            tts: self.tts.clone(),
            llm: self.llm.clone(),
            stt_generation: self.stt_generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStatus {
    Success,
    NoChange,
    Error,
}

impl SwitchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::Success => "success",
            SwitchStatus::NoChange => "no_change",
            SwitchStatus::Error => "error",
        }
    }
}

/// Result of a `switch_model` request
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchOutcome {
    pub status: SwitchStatus,
    pub message: String,
    pub changes: Vec<String>,
    pub dry_run: bool,
}

impl SwitchOutcome {
    fn no_change() -> Self {
        Self {
            status: SwitchStatus::NoChange,
            message: "No changes requested".to_string(),
            changes: Vec::new(),
            dry_run: false,
        }
    }

    pub fn into_message(self) -> OutgoingMessage {
        let changed = (!self.changes.is_empty()).then_some(self.changes);
        OutgoingMessage::SwitchResponse {
            status: self.status.as_str().to_string(),
            message: self.message,
            changed,
        }
    }
}

/// Result of `reload_models` / `reload_llm`
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadOutcome {
    pub ok: bool,
    pub message: String,
    pub llm_params: Option<GenerationParams>,
}

impl ReloadOutcome {
    fn failed(e: &ManagerError) -> Self {
        Self {
            ok: false,
            message: e.to_string(),
            llm_params: None,
        }
    }

    pub fn into_message(self) -> OutgoingMessage {
        OutgoingMessage::ReloadResponse {
            status: if self.ok { "success" } else { "error" }.to_string(),
            message: self.message,
            llm_params: self.llm_params,
        }
    }
}

/// Backends built for one publication; `None` keeps the current instance.
#[derive(Default)]
struct BuiltBackends {
    stt: Option<Arc<dyn SpeechRecognizer>>,
    tts: Option<Arc<dyn Synthesizer>>,
    llm: Option<Arc<dyn Generator>>,
}

impl BuiltBackends {
    /// Shut down instances that will never be published.
    async fn discard(self) {
        if let Some(b) = self.stt {
            shutdown_quietly(BackendKind::Stt, b).await;
        }
        if let Some(b) = self.tts {
            shutdown_quietly(BackendKind::Tts, b).await;
        }
        if let Some(b) = self.llm {
            shutdown_quietly(BackendKind::Llm, b).await;
        }
    }
}

async fn shutdown_quietly<T: Backend + ?Sized>(kind: BackendKind, backend: Arc<T>) {
    if let Err(e) = await_isolated(backend.shutdown()).await {
        warn!(kind = %kind, backend = %backend.name(), error = %e, "Backend shutdown failed");
    }
}

/// Instantiate on the blocking pool, then initialize under panic isolation.
async fn build_backend<T>(
    registry: &BackendRegistry<T>,
    name: &str,
    config: &LiveConfig,
) -> ManagerResult<Arc<T>>
where
    T: Backend + ?Sized + 'static,
{
    let kind = registry.kind();
    let descriptor = registry.require(name)?;
    let mut backend = tokio::task::spawn_blocking(move || descriptor.instantiate())
        .await?
        .map_err(|source| ManagerError::Backend {
            kind,
            name: name.to_string(),
            source,
        })?;

    if let Err(source) = await_isolated(backend.initialize(config)).await {
        if let Err(e) = backend.shutdown().await {
            warn!(kind = %kind, backend = %name, error = %e, "Cleanup after failed initialize failed");
        }
        return Err(ManagerError::Backend {
            kind,
            name: name.to_string(),
            source,
        });
    }

    info!(kind = %kind, backend = %name, "Backend initialized");
    Ok(Arc::from(backend))
}

/// Shut a replaced backend down once no request holds it, or after `grace`.
fn retire<T: Backend + ?Sized + 'static>(kind: BackendKind, old: Arc<T>, grace: Duration) {
    tokio::spawn(async move {
        let deadline = Instant::now() + grace;
        while Arc::strong_count(&old) > 1 && Instant::now() < deadline {
            tokio::time::sleep(RETIRE_POLL).await;
        }
        if Arc::strong_count(&old) > 1 {
            warn!(kind = %kind, backend = %old.name(), "Retiring backend still in use after grace period");
        }
        shutdown_quietly(kind, Arc::clone(&old)).await;
        info!(kind = %kind, backend = %old.name(), "Retired backend");
    });
}

fn replaced<T: ?Sized>(old: &Option<Arc<T>>, new: &Option<Arc<T>>) -> Option<Arc<T>> {
    match (old, new) {
        (Some(old), Some(new)) if !Arc::ptr_eq(old, new) => Some(Arc::clone(old)),
        _ => None,
    }
}

pub struct ModelManager {
    registries: Arc<Registries>,
    live: ArcSwap<LiveState>,
    reload_lock: Mutex<()>,
    retire_grace: Duration,
}

impl ModelManager {
    pub fn new(registries: Arc<Registries>, config: LiveConfig, retire_grace: Duration) -> Self {
        Self {
            registries,
            live: ArcSwap::from_pointee(LiveState::empty(Arc::new(config))),
            reload_lock: Mutex::new(()),
            retire_grace,
        }
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    /// Current live state
    pub fn snapshot(&self) -> Arc<LiveState> {
        self.live.load_full()
    }

    pub fn config(&self) -> Arc<LiveConfig> {
        Arc::clone(&self.live.load().config)
    }

    /// Current recognizer and its generation
    pub fn recognizer(&self) -> Option<(Arc<dyn SpeechRecognizer>, u64)> {
        let state = self.live.load();
        state.stt.clone().map(|stt| (stt, state.stt_generation))
    }

    pub fn synthesizer(&self) -> Option<Arc<dyn Synthesizer>> {
        self.live.load().tts.clone()
    }

    pub fn generator(&self) -> Option<Arc<dyn Generator>> {
        self.live.load().llm.clone()
    }

    async fn build_roles(&self, config: &LiveConfig, roles: &RoleSet) -> ManagerResult<BuiltBackends> {
        let mut built = BuiltBackends::default();
        for kind in roles {
            let result = match kind {
                BackendKind::Stt => build_backend(self.registries.stt(), &config.stt_backend, config)
                    .await
                    .map(|b| built.stt = Some(b)),
                BackendKind::Tts => build_backend(self.registries.tts(), &config.tts_backend, config)
                    .await
                    .map(|b| built.tts = Some(b)),
                BackendKind::Llm => build_backend(self.registries.llm(), LLM_BACKEND, config)
                    .await
                    .map(|b| built.llm = Some(b)),
            };
            if let Err(e) = result {
                built.discard().await;
                return Err(e);
            }
        }
        Ok(built)
    }

    /// Store `config` with the newly built backends and retire what they replace.
    /// Caller holds the reload lock.
    fn publish(&self, current: &LiveState, config: LiveConfig, built: BuiltBackends) {
        let stt_replaced = built.stt.is_some();
        let next = LiveState {
            config: Arc::new(config),
            stt: built.stt.or_else(|| current.stt.clone()),
            tts: built.tts.or_else(|| current.tts.clone()),
            llm: built.llm.or_else(|| current.llm.clone()),
            stt_generation: current.stt_generation + u64::from(stt_replaced),
        };

        let old_stt = replaced(&current.stt, &next.stt);
        let old_tts = replaced(&current.tts, &next.tts);
        let old_llm = replaced(&current.llm, &next.llm);
        self.live.store(Arc::new(next));

        if let Some(old) = old_stt {
            retire(BackendKind::Stt, old, self.retire_grace);
        }
        if let Some(old) = old_tts {
            retire(BackendKind::Tts, old, self.retire_grace);
        }
        if let Some(old) = old_llm {
            retire(BackendKind::Llm, old, self.retire_grace);
        }
    }

    /// Apply a `switch_model` request.
    pub async fn switch_model(&self, request: &Map<String, Value>) -> SwitchOutcome {
        let _guard = self.reload_lock.lock().await;
        let current = self.live.load_full();
        let plan = control::apply_switch_map(&current.config, request);

        if plan.is_noop() {
            info!("switch_model requested no effective change");
            return SwitchOutcome::no_change();
        }

        let summary = plan.changes.join(", ");
        if plan.dry_run {
            self.live.store(Arc::new(current.with_config(plan.config)));
            info!(changes = %summary, "Switched config without reload (dry run)");
            return SwitchOutcome {
                status: SwitchStatus::Success,
                message: format!("Models switched (dry_run): {summary}"),
                changes: plan.changes,
                dry_run: true,
            };
        }

        match self.build_roles(&plan.config, &plan.reload).await {
            Ok(built) => {
                self.publish(&current, plan.config, built);
                info!(changes = %summary, roles = ?plan.reload, "Switched and reloaded models");
                SwitchOutcome {
                    status: SwitchStatus::Success,
                    message: format!("Models switched and reloaded: {summary}"),
                    changes: plan.changes,
                    dry_run: false,
                }
            }
            Err(e) => {
                error!(changes = %summary, error = %e, "Model switch failed; live state unchanged");
                SwitchOutcome {
                    status: SwitchStatus::Error,
                    message: format!("Failed to switch models: {e}"),
                    changes: Vec::new(),
                    dry_run: false,
                }
            }
        }
    }

    /// Rebuild every role from the current config.
    pub async fn reload_all(&self) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;
        let current = self.live.load_full();
        let config = current.config.as_ref().clone();
        let roles: RoleSet = BackendKind::ALL.into_iter().collect();

        match self.build_roles(&config, &roles).await {
            Ok(built) => {
                self.publish(&current, config, built);
                ReloadOutcome {
                    ok: true,
                    message: "All models reloaded".to_string(),
                    llm_params: None,
                }
            }
            Err(e) => {
                error!(error = %e, "Reload failed; live state unchanged");
                ReloadOutcome::failed(&e)
            }
        }
    }

    /// Rebuild the LLM, optionally with a new model path.
    pub async fn reload_llm(&self, model_path: Option<&str>) -> ReloadOutcome {
        let _guard = self.reload_lock.lock().await;
        let current = self.live.load_full();

        let config = match model_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => match current
                .config
                .with_field("llm_model_path", Value::String(path.to_string()))
            {
                Ok(config) => config,
                Err(e) => return ReloadOutcome::failed(&ManagerError::Config(e)),
            },
            None => current.config.as_ref().clone(),
        };
        let roles = RoleSet::from([BackendKind::Llm]);

        match self.build_roles(&config, &roles).await {
            Ok(built) => {
                let params = built.llm.as_ref().map(|llm| llm.params());
                self.publish(&current, config, built);
                ReloadOutcome {
                    ok: true,
                    message: "LLM reloaded".to_string(),
                    llm_params: params,
                }
            }
            Err(e) => {
                error!(error = %e, "LLM reload failed; live state unchanged");
                ReloadOutcome::failed(&e)
            }
        }
    }

    /// Startup load: each role independently, keeping whatever succeeds.
    pub async fn load_initial(&self) {
        let _guard = self.reload_lock.lock().await;
        let current = self.live.load_full();
        let config = current.config.as_ref().clone();

        let mut built = BuiltBackends::default();
        for kind in BackendKind::ALL {
            let roles = RoleSet::from([kind]);
            match self.build_roles(&config, &roles).await {
                Ok(one) => {
                    built.stt = built.stt.or(one.stt);
                    built.tts = built.tts.or(one.tts);
                    built.llm = built.llm.or(one.llm);
                }
                Err(e) => warn!(kind = %kind, error = %e, "Backend unavailable at startup"),
            }
        }
        self.publish(&current, config, built);
    }

    /// Status built from a single live-state load.
    pub fn status(&self) -> StatusSnapshot {
        let state = self.live.load_full();
        status::build_snapshot(&state, &self.registries)
    }

    pub async fn capabilities(&self) -> BTreeMap<String, bool> {
        let config = self.config();
        status::probe_capabilities(&config).await
    }

    /// Describe every registered backend of every role.
    pub fn describe_backends(&self) -> OutgoingMessage {
        OutgoingMessage::BackendsResponse {
            status: "ok".to_string(),
            stt: self.registries.describe_kind(BackendKind::Stt),
            tts: self.registries.describe_kind(BackendKind::Tts),
            llm: self.registries.describe_kind(BackendKind::Llm),
        }
    }

    pub fn backend_schema(&self, backend_type: &str, name: &str) -> OutgoingMessage {
        match self.registries.describe_one(backend_type, name) {
            Ok(description) => OutgoingMessage::BackendSchemaResponse {
                status: "ok".to_string(),
                backend_type: backend_type.to_lowercase(),
                name: description.name,
                available: Some(description.available),
                display_name: Some(description.display_name),
                schema: Some(description.schema),
                error: None,
            },
            Err(e) => OutgoingMessage::BackendSchemaResponse {
                status: "error".to_string(),
                backend_type: backend_type.to_string(),
                name: name.to_string(),
                available: None,
                display_name: None,
                schema: None,
                error: Some(ErrorObject {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendDescriptor, SpeechRecognizer, Synthesizer};
    use crate::test_support::{InitBehavior, Lifecycle, MockGenerator, MockRecognizer, MockSynthesizer};
    use serde_json::json;

    /// Registries with mocks shadowing the built-in names
    fn mock_registries(tts_init: InitBehavior, tts_lifecycle: Arc<Lifecycle>) -> Arc<Registries> {
        let registries = Arc::new(Registries::new());
        for name in ["vosk", "sherpa", "kroko"] {
            registries.stt().register(BackendDescriptor::new(name, "Mock STT", move || {
                Box::new(MockRecognizer::new(name)) as Box<dyn SpeechRecognizer>
            }));
        }
        let lifecycle = Arc::clone(&tts_lifecycle);
        registries.tts().register(BackendDescriptor::new("kokoro", "Mock Kokoro", move || {
            Box::new(MockSynthesizer::new("kokoro").with_lifecycle(Arc::clone(&lifecycle)))
                as Box<dyn Synthesizer>
        }));
        registries.tts().register(BackendDescriptor::new("piper", "Mock Piper", move || {
            Box::new(MockSynthesizer::new("piper").with_init(tts_init)) as Box<dyn Synthesizer>
        }));
        registries.llm().register(BackendDescriptor::new(LLM_BACKEND, "Mock LLM", || {
            Box::new(MockGenerator::new(LLM_BACKEND)) as Box<dyn Generator>
        }));
        registries
    }

    fn manager(tts_init: InitBehavior) -> (ModelManager, Arc<Lifecycle>) {
        let lifecycle = Lifecycle::shared();
        let registries = mock_registries(tts_init, Arc::clone(&lifecycle));
        (
            ModelManager::new(registries, LiveConfig::default(), Duration::from_millis(200)),
            lifecycle,
        )
    }

    fn request(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_noop_switch_leaves_state_untouched() {
        let (manager, _) = manager(InitBehavior::Succeed);
        manager.load_initial().await;
        let before = manager.snapshot();

        let outcome = manager
            .switch_model(&request(json!({"kokoro_voice": "af_heart"})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::NoChange);
        assert!(Arc::ptr_eq(&before, &manager.snapshot()));
        assert_eq!(*before.config, *manager.config());
    }

    #[tokio::test]
    async fn test_dry_run_changes_config_not_backends() {
        let (manager, lifecycle) = manager(InitBehavior::Succeed);
        manager.load_initial().await;
        let tts_before = manager.synthesizer().unwrap();

        let outcome = manager
            .switch_model(&request(json!({"dry_run": true, "kokoro_voice": "af_sky"})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::Success);
        assert_eq!(outcome.message, "Models switched (dry_run): kokoro_voice=af_sky");
        assert_eq!(outcome.changes, vec!["kokoro_voice=af_sky".to_string()]);

        let status = manager.status();
        assert_eq!(status.config["kokoro_voice"], "af_sky");
        assert!(status.models["tts"].loaded);
        assert!(Arc::ptr_eq(&tts_before, &manager.synthesizer().unwrap()));
        assert_eq!(lifecycle.initialized(), 1);
    }

    #[tokio::test]
    async fn test_switch_reloads_only_changed_role_and_retires_old() {
        let (manager, lifecycle) = manager(InitBehavior::Succeed);
        manager.load_initial().await;
        let (stt_before, generation) = manager.recognizer().unwrap();
        let tts_before = manager.synthesizer().unwrap();
        drop(tts_before);

        let outcome = manager
            .switch_model(&request(json!({"kokoro_speed": 1.25})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::Success);
        assert!(outcome.message.starts_with("Models switched and reloaded"));

        let (stt_after, generation_after) = manager.recognizer().unwrap();
        assert!(Arc::ptr_eq(&stt_before, &stt_after));
        assert_eq!(generation, generation_after);
        assert_eq!(lifecycle.initialized(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(lifecycle.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_live_state() {
        let (manager, _) = manager(InitBehavior::Fail);
        manager.load_initial().await;
        let before = manager.snapshot();

        let outcome = manager
            .switch_model(&request(json!({"tts_backend": "piper"})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::Error);
        assert!(outcome.message.contains("piper"));
        assert!(Arc::ptr_eq(&before, &manager.snapshot()));
        assert_eq!(manager.config().tts_backend, "kokoro");
    }

    #[tokio::test]
    async fn test_panicking_initialize_is_contained() {
        let (manager, _) = manager(InitBehavior::Panic);
        let outcome = manager
            .switch_model(&request(json!({"tts_backend": "piper"})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::Error);
        assert!(outcome.message.contains("exploded"));
    }

    #[tokio::test]
    async fn test_stt_switch_bumps_generation() {
        let (manager, _) = manager(InitBehavior::Succeed);
        manager.load_initial().await;
        let (_, generation) = manager.recognizer().unwrap();

        let outcome = manager
            .switch_model(&request(json!({"stt_backend": "sherpa"})))
            .await;
        assert_eq!(outcome.status, SwitchStatus::Success);
        let (stt, generation_after) = manager.recognizer().unwrap();
        assert_eq!(stt.name(), "sherpa");
        assert_eq!(generation_after, generation + 1);
    }

    #[tokio::test]
    async fn test_reload_llm_with_new_path() {
        let (manager, _) = manager(InitBehavior::Succeed);
        let outcome = manager.reload_llm(Some("/models/qwen.gguf")).await;
        assert!(outcome.ok);
        assert!(outcome.llm_params.is_some());
        assert_eq!(manager.config().llm_model_path, "/models/qwen.gguf");
        assert!(manager.generator().is_some());
    }

    #[tokio::test]
    async fn test_reload_all_error_response() {
        let (manager, _) = manager(InitBehavior::Fail);
        manager
            .switch_model(&request(json!({"dry_run": true, "tts_backend": "piper"})))
            .await;

        let message = manager.reload_all().await.into_message();
        let value = serde_json::to_value(message).unwrap();
        assert_eq!(value["status"], "error");
        assert!(manager.synthesizer().is_none());
    }

    #[test]
    fn test_backend_schema_errors_are_objects() {
        let (manager, _) = manager(InitBehavior::Succeed);

        let value = serde_json::to_value(manager.backend_schema("asr", "vosk")).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error"]["code"], "unknown_backend_type");

        let value = serde_json::to_value(manager.backend_schema("tts", "espeak")).unwrap();
        assert_eq!(value["error"]["code"], "unknown_backend_name");

        let value = serde_json::to_value(manager.backend_schema("TTS", "kokoro")).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["backend_type"], "tts");
        assert_eq!(value["available"], true);
    }
}
