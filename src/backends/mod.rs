//! Pluggable model backends
//!
//! This module provides:
//! - Role traits ([`SpeechRecognizer`], [`Synthesizer`], [`Generator`]) on top
//!   of the shared [`Backend`] lifecycle
//! - Name-keyed registries with link-time built-ins
//! - Panic isolation for probes, factories and initialization
//! - Adapters for locally hosted engines (vosk, sherpa-onnx, kroko, Kokoro,
//!   piper, llama.cpp)

pub mod base;
pub mod builtin;
pub mod endpoint;
pub mod isolation;
pub mod llm;
pub mod process;
pub mod registry;
pub mod stt;
pub mod tts;

pub use base::{
    Backend, BackendError, BackendKind, BackendResult, BackendStatus, ConfigSchema,
    GenerationParams, Generator, OptionSpec, OptionType, RecognizerStream, SpeechRecognizer,
    SynthesizedAudio, Synthesizer, TokenStream, Transcript,
};
pub use registry::{
    BackendDescription, BackendDescriptor, BackendMetadata, BackendRegistry, Registries,
    RegistryError, global_registries,
};
