//! Built-in backends
//!
//! Each adapter is submitted to `inventory` at link time and copied into a
//! [`Registries`](super::Registries) instance by [`load_into`].

use super::base::{BackendResult, ConfigSchema, Generator, SpeechRecognizer, Synthesizer};
use super::llm::llama;
use super::registry::{BackendDescriptor, BackendRegistry};
use super::stt::{kroko, sherpa, vosk};
use super::tts::{kokoro, piper};

/// Role-specific factory pointer
pub enum BuiltinFactory {
    Stt(fn() -> Box<dyn SpeechRecognizer>),
    Tts(fn() -> Box<dyn Synthesizer>),
    Llm(fn() -> Box<dyn Generator>),
}

/// Link-time backend registration
///
/// Uses function pointers so it can be built in a `const` context for
/// `inventory::submit!`.
pub struct BuiltinBackend {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub schema: fn() -> ConfigSchema,
    pub probe: fn() -> BackendResult<bool>,
    pub factory: BuiltinFactory,
}

impl BuiltinBackend {
    pub const fn stt(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        schema: fn() -> ConfigSchema,
        probe: fn() -> BackendResult<bool>,
        factory: fn() -> Box<dyn SpeechRecognizer>,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            schema,
            probe,
            factory: BuiltinFactory::Stt(factory),
        }
    }

    pub const fn tts(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        schema: fn() -> ConfigSchema,
        probe: fn() -> BackendResult<bool>,
        factory: fn() -> Box<dyn Synthesizer>,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            schema,
            probe,
            factory: BuiltinFactory::Tts(factory),
        }
    }

    pub const fn llm(
        name: &'static str,
        display_name: &'static str,
        description: &'static str,
        schema: fn() -> ConfigSchema,
        probe: fn() -> BackendResult<bool>,
        factory: fn() -> Box<dyn Generator>,
    ) -> Self {
        Self {
            name,
            display_name,
            description,
            schema,
            probe,
            factory: BuiltinFactory::Llm(factory),
        }
    }

    fn descriptor<T: ?Sized + 'static>(&self, factory: fn() -> Box<T>) -> BackendDescriptor<T> {
        BackendDescriptor::new(self.name, self.display_name, factory)
            .with_description(self.description)
            .with_schema(self.schema)
            .with_probe(self.probe)
    }
}

inventory::collect!(BuiltinBackend);

/// Network clients are compiled in; reachability is a capabilities concern.
fn probe_compiled_in() -> BackendResult<bool> {
    Ok(true)
}

inventory::submit! {
    BuiltinBackend::stt(
        "vosk",
        "Vosk",
        "Streaming recognition against a local vosk-server",
        vosk::config_schema,
        probe_compiled_in,
        vosk::create,
    )
}

inventory::submit! {
    BuiltinBackend::stt(
        "sherpa",
        "Sherpa-ONNX",
        "Streaming recognition against a local sherpa-onnx websocket server",
        sherpa::config_schema,
        probe_compiled_in,
        sherpa::create,
    )
}

inventory::submit! {
    BuiltinBackend::stt(
        "kroko",
        "Kroko",
        "Kroko streaming recognition, optionally supervising a local kroko-server",
        kroko::config_schema,
        probe_compiled_in,
        kroko::create,
    )
}

inventory::submit! {
    BuiltinBackend::tts(
        "kokoro",
        "Kokoro",
        "Kokoro speech synthesis over a local OpenAI-compatible HTTP server",
        kokoro::config_schema,
        probe_compiled_in,
        kokoro::create,
    )
}

inventory::submit! {
    BuiltinBackend::tts(
        "piper",
        "Piper",
        "Piper speech synthesis via the piper binary",
        piper::config_schema,
        piper::probe,
        piper::create,
    )
}

inventory::submit! {
    BuiltinBackend::llm(
        "llama",
        "llama.cpp",
        "Chat completions against a local llama-server",
        llama::config_schema,
        probe_compiled_in,
        llama::create,
    )
}

/// Copy every built-in into the given catalogs; returns per-role counts.
pub(super) fn load_into(
    stt: &BackendRegistry<dyn SpeechRecognizer>,
    tts: &BackendRegistry<dyn Synthesizer>,
    llm: &BackendRegistry<dyn Generator>,
) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for builtin in inventory::iter::<BuiltinBackend> {
        match builtin.factory {
            BuiltinFactory::Stt(factory) => {
                stt.register(builtin.descriptor(factory));
                counts.0 += 1;
            }
            BuiltinFactory::Tts(factory) => {
                tts.register(builtin.descriptor(factory));
                counts.1 += 1;
            }
            BuiltinFactory::Llm(factory) => {
                llm.register(builtin.descriptor(factory));
                counts.2 += 1;
            }
        }
    }
    counts
}
