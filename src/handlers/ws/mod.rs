//! Realtime WebSocket endpoint
//!
//! - `handler` - upgrade, read loop, writer task and teardown
//! - `processor` - auth gate and message dispatch
//! - `audio` - recognition, synthesis and generation pipelines

mod audio;
pub mod handler;
mod processor;

pub use handler::ws_handler;
