//! Realtime WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::ws_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the WebSocket router
///
/// # Endpoint
///
/// `GET /ws` - WebSocket upgrade for the realtime voice protocol
///
/// # Protocol
///
/// Clients exchange JSON text frames keyed by `type` (see `voxhost contract
/// export`) and raw 16-bit little-endian mono PCM as binary frames.
///
/// ```json
/// {"type": "auth", "auth_token": "secret123"}
/// {"type": "set_mode", "mode": "stt", "call_id": "abc"}
/// ```
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
}
