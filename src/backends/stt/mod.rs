//! Speech-to-text adapters

pub mod kroko;
pub mod sherpa;
pub mod vosk;
mod ws_stream;

pub use ws_stream::{Dialect, WsRecognizerStream};
