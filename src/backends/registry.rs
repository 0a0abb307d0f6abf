//! Backend Registry
//!
//! Three name-keyed catalogs (STT, TTS, LLM) of backend descriptors. Built-in
//! backends are collected at link time with `inventory` and loaded into a
//! [`Registries`] instance on first use; runtime registrations (tests,
//! override builds) go through the same maps.
//!
//! # Architecture
//!
//! Each catalog is a DashMap keyed by lowercase backend name. Registration
//! replaces any previous entry with the same name, so the last registration
//! wins.
//!
//! # Usage
//!
//! ```ignore
//! use voxhost::backends::global_registries;
//!
//! let registries = global_registries();
//! let names = registries.stt().list_names();
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once, OnceLock};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use super::base::{
    BackendKind, BackendResult, ConfigSchema, Generator, SpeechRecognizer, Synthesizer,
};
use super::builtin;
use super::isolation::{call_isolated, call_isolated_value};

/// Factory producing an uninitialized backend instance
pub type FactoryFn<T> = Arc<dyn Fn() -> Box<T> + Send + Sync>;

/// Builder for a backend's declarative config schema
pub type SchemaFn = Arc<dyn Fn() -> ConfigSchema + Send + Sync>;

/// Availability probe (native dependency present, binary on PATH, ...)
pub type ProbeFn = Arc<dyn Fn() -> BackendResult<bool> + Send + Sync>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown backend type '{0}'")]
    UnknownBackendType(String),
    #[error("unknown {kind} backend '{name}'")]
    UnknownBackendName { kind: BackendKind, name: String },
}

impl RegistryError {
    /// Stable machine-readable code used in error objects
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::UnknownBackendType(_) => "unknown_backend_type",
            RegistryError::UnknownBackendName { .. } => "unknown_backend_name",
        }
    }
}

/// Static description of a registered backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendMetadata {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Registry entry: metadata, schema builder, probe and factory.
pub struct BackendDescriptor<T: ?Sized> {
    pub metadata: BackendMetadata,
    pub schema: SchemaFn,
    pub probe: ProbeFn,
    pub factory: FactoryFn<T>,
}

impl<T: ?Sized> Clone for BackendDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            schema: Arc::clone(&self.schema),
            probe: Arc::clone(&self.probe),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: ?Sized> BackendDescriptor<T> {
    /// Descriptor with an empty schema and an always-available probe.
    pub fn new<F>(name: &str, display_name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<T> + Send + Sync + 'static,
    {
        Self {
            metadata: BackendMetadata {
                name: name.to_lowercase(),
                display_name: display_name.to_string(),
                description: String::new(),
            },
            schema: Arc::new(ConfigSchema::new),
            probe: Arc::new(|| -> BackendResult<bool> { Ok(true) }),
            factory: Arc::new(factory),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn with_schema<F>(mut self, schema: F) -> Self
    where
        F: Fn() -> ConfigSchema + Send + Sync + 'static,
    {
        self.schema = Arc::new(schema);
        self
    }

    pub fn with_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> BackendResult<bool> + Send + Sync + 'static,
    {
        self.probe = Arc::new(probe);
        self
    }

    /// Run the probe and schema builder under panic isolation.
    pub fn describe(&self) -> BackendDescription {
        let probe = Arc::clone(&self.probe);
        let available = match call_isolated(AssertUnwindSafe(move || probe())) {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(backend = %self.metadata.name, error = %e, "Availability probe failed");
                false
            }
        };

        let schema_fn = Arc::clone(&self.schema);
        let schema = match call_isolated_value(AssertUnwindSafe(move || schema_fn())) {
            Ok(schema) => {
                serde_json::to_value(schema).unwrap_or_else(|_| Value::Object(Default::default()))
            }
            Err(e) => {
                tracing::warn!(backend = %self.metadata.name, error = %e, "Schema builder failed");
                Value::Object(Default::default())
            }
        };

        BackendDescription {
            name: self.metadata.name.clone(),
            display_name: self.metadata.display_name.clone(),
            available,
            schema,
        }
    }

    /// Build a fresh, uninitialized instance under panic isolation.
    pub fn instantiate(&self) -> BackendResult<Box<T>> {
        let factory = Arc::clone(&self.factory);
        call_isolated(AssertUnwindSafe(move || Ok(factory())))
    }
}

/// Result of describing a backend: availability and schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDescription {
    pub name: String,
    pub display_name: String,
    pub available: bool,
    pub schema: Value,
}

/// Name-keyed catalog for one backend role
pub struct BackendRegistry<T: ?Sized> {
    kind: BackendKind,
    entries: DashMap<String, BackendDescriptor<T>>,
}

impl<T: ?Sized> BackendRegistry<T> {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Insert or replace by declared name.
    pub fn register(&self, descriptor: BackendDescriptor<T>) {
        let name = descriptor.metadata.name.to_lowercase();
        if self.entries.insert(name.clone(), descriptor).is_some() {
            tracing::debug!(kind = %self.kind, backend = %name, "Replaced registered backend");
        } else {
            tracing::debug!(kind = %self.kind, backend = %name, "Registered backend");
        }
    }

    pub fn get(&self, name: &str) -> Option<BackendDescriptor<T>> {
        self.entries
            .get(&name.to_lowercase())
            .map(|entry| entry.value().clone())
    }

    /// Like [`get`](Self::get), mapping absence to [`RegistryError::UnknownBackendName`].
    pub fn require(&self, name: &str) -> Result<BackendDescriptor<T>, RegistryError> {
        self.get(name).ok_or_else(|| RegistryError::UnknownBackendName {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn list_all(&self) -> Vec<BackendMetadata> {
        let mut all: Vec<BackendMetadata> = self
            .entries
            .iter()
            .map(|e| e.value().metadata.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Describe every backend; a failing probe only marks that entry unavailable.
    pub fn describe_all(&self) -> Vec<BackendDescription> {
        let descriptors: Vec<BackendDescriptor<T>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        let mut described: Vec<BackendDescription> =
            descriptors.iter().map(BackendDescriptor::describe).collect();
        described.sort_by(|a, b| a.name.cmp(&b.name));
        described
    }

    pub fn describe(&self, name: &str) -> Result<BackendDescription, RegistryError> {
        Ok(self.require(name)?.describe())
    }

    /// Instantiate the named backend, uninitialized.
    #[cfg(test)]
    pub fn create(&self, name: &str) -> BackendResult<Box<T>> {
        let descriptor = self
            .require(name)
            .map_err(|e| super::base::BackendError::Configuration(e.to_string()))?;
        descriptor.instantiate()
    }
}

/// The three role catalogs, with lazily loaded built-ins
pub struct Registries {
    stt: BackendRegistry<dyn SpeechRecognizer>,
    tts: BackendRegistry<dyn Synthesizer>,
    llm: BackendRegistry<dyn Generator>,
    builtins: Once,
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl Registries {
    /// Empty catalogs; built-ins load on first access.
    pub fn new() -> Self {
        Self {
            stt: BackendRegistry::new(BackendKind::Stt),
            tts: BackendRegistry::new(BackendKind::Tts),
            llm: BackendRegistry::new(BackendKind::Llm),
            builtins: Once::new(),
        }
    }

    /// Load the link-time built-in catalog. Idempotent.
    pub fn load_builtins(&self) {
        self.builtins.call_once(|| {
            let (stt, tts, llm) = builtin::load_into(&self.stt, &self.tts, &self.llm);
            tracing::info!(stt, tts, llm, "Loaded built-in backends");
        });
    }

    pub fn stt(&self) -> &BackendRegistry<dyn SpeechRecognizer> {
        self.load_builtins();
        &self.stt
    }

    pub fn tts(&self) -> &BackendRegistry<dyn Synthesizer> {
        self.load_builtins();
        &self.tts
    }

    pub fn llm(&self) -> &BackendRegistry<dyn Generator> {
        self.load_builtins();
        &self.llm
    }

    pub fn describe_kind(&self, kind: BackendKind) -> Vec<BackendDescription> {
        match kind {
            BackendKind::Stt => self.stt().describe_all(),
            BackendKind::Tts => self.tts().describe_all(),
            BackendKind::Llm => self.llm().describe_all(),
        }
    }

    /// Describe one backend given a user-supplied role string.
    pub fn describe_one(
        &self,
        backend_type: &str,
        name: &str,
    ) -> Result<BackendDescription, RegistryError> {
        let kind = backend_type
            .parse::<BackendKind>()
            .map_err(|_| RegistryError::UnknownBackendType(backend_type.to_string()))?;
        match kind {
            BackendKind::Stt => self.stt().describe(name),
            BackendKind::Tts => self.tts().describe(name),
            BackendKind::Llm => self.llm().describe(name),
        }
    }

    pub fn display_name(&self, kind: BackendKind, name: &str) -> Option<String> {
        let name = name.to_lowercase();
        let meta = match kind {
            BackendKind::Stt => self.stt().get(&name).map(|d| d.metadata),
            BackendKind::Tts => self.tts().get(&name).map(|d| d.metadata),
            BackendKind::Llm => self.llm().get(&name).map(|d| d.metadata),
        };
        meta.map(|m| m.display_name)
    }
}

static GLOBAL_REGISTRIES: OnceLock<Arc<Registries>> = OnceLock::new();

/// Process-wide registries
pub fn global_registries() -> Arc<Registries> {
    Arc::clone(GLOBAL_REGISTRIES.get_or_init(|| Arc::new(Registries::new())))
}
