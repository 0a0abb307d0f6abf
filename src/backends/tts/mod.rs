//! Text-to-speech adapters

pub mod kokoro;
pub mod piper;
