use std::sync::Arc;

use axum::{Json, extract::State};
use serde::Serialize;

use crate::protocol::PROTOCOL_VERSION;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub protocol_version: &'static str,
    pub stt_backend: String,
    pub tts_backend: String,
    pub stt_loaded: bool,
    pub tts_loaded: bool,
    pub llm_loaded: bool,
    pub connections: usize,
}

/// Health check with the active backend selection
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let live = state.manager.snapshot();
    Json(HealthResponse {
        status: "ok",
        protocol_version: PROTOCOL_VERSION,
        stt_backend: live.config.stt_backend.clone(),
        tts_backend: live.config.tts_backend.clone(),
        stt_loaded: live.stt.is_some(),
        tts_loaded: live.tts.is_some(),
        llm_loaded: live.llm.is_some(),
        connections: state.ws_connection_count(),
    })
}
