//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `ws` - Realtime voice protocol over WebSocket

pub mod api;
pub mod ws;

pub use ws::ws_handler;
