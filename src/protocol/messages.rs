//! WebSocket message types
//!
//! Inbound frames deserialize into [`IncomingMessage`]; every server reply is
//! an [`OutgoingMessage`] whose serialized form matches the contract table.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backends::{BackendDescription, BackendStatus, GenerationParams};

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingMessage {
    #[serde(rename = "auth")]
    Auth {
        #[serde(default, alias = "token")]
        auth_token: Option<String>,
    },

    #[serde(rename = "set_mode")]
    SetMode {
        mode: String,
        #[serde(default)]
        call_id: Option<String>,
    },

    /// Base64-wrapped PCM chunk
    #[serde(rename = "audio")]
    Audio {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "tts_request")]
    TtsRequest {
        text: String,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "llm_request")]
    LlmRequest {
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        stream: Option<bool>,
        #[serde(default)]
        call_id: Option<String>,
    },

    #[serde(rename = "reload_models")]
    ReloadModels,

    #[serde(rename = "reload_llm")]
    ReloadLlm {
        #[serde(default, alias = "llm_model_path")]
        model_path: Option<String>,
    },

    /// Free-form switch request, interpreted by the control plane
    #[serde(rename = "switch_model")]
    SwitchModel(Map<String, Value>),

    #[serde(rename = "status")]
    Status,

    #[serde(rename = "capabilities")]
    Capabilities,

    #[serde(rename = "backends")]
    Backends,

    #[serde(rename = "backend_schema")]
    BackendSchema { backend_type: String, name: String },
}

impl IncomingMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            IncomingMessage::Auth { .. } => "auth",
            IncomingMessage::SetMode { .. } => "set_mode",
            IncomingMessage::Audio { .. } => "audio",
            IncomingMessage::TtsRequest { .. } => "tts_request",
            IncomingMessage::LlmRequest { .. } => "llm_request",
            IncomingMessage::ReloadModels => "reload_models",
            IncomingMessage::ReloadLlm { .. } => "reload_llm",
            IncomingMessage::SwitchModel(_) => "switch_model",
            IncomingMessage::Status => "status",
            IncomingMessage::Capabilities => "capabilities",
            IncomingMessage::Backends => "backends",
            IncomingMessage::BackendSchema { .. } => "backend_schema",
        }
    }
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Error object carried by `backend_schema_response`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

/// Full server status
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: String,
    pub protocol_version: String,
    pub stt_backend: String,
    pub tts_backend: String,
    /// Per-role backend status keyed `stt`, `tts`, `llm`
    pub models: BTreeMap<String, BackendStatus>,
    pub kroko: Value,
    pub kokoro: Value,
    pub derived: Value,
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "auth_response")]
    AuthResponse {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "mode_ready")]
    ModeReady { mode: String, call_id: String },

    #[serde(rename = "stt_result")]
    SttResult {
        call_id: String,
        text: String,
        is_final: bool,
    },

    /// Header for the binary PCM frame that follows
    #[serde(rename = "tts_audio")]
    TtsAudio {
        call_id: String,
        sample_rate: u32,
        format: String,
        bytes: usize,
    },

    #[serde(rename = "llm_response")]
    LlmResponse {
        call_id: String,
        text: String,
        done: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },

    #[serde(rename = "reload_response")]
    ReloadResponse {
        status: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        llm_params: Option<GenerationParams>,
    },

    #[serde(rename = "switch_response")]
    SwitchResponse {
        status: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        changed: Option<Vec<String>>,
    },

    #[serde(rename = "status_response")]
    StatusResponse(StatusSnapshot),

    #[serde(rename = "capabilities_response")]
    CapabilitiesResponse {
        status: String,
        capabilities: BTreeMap<String, bool>,
    },

    #[serde(rename = "backends_response")]
    BackendsResponse {
        status: String,
        stt: Vec<BackendDescription>,
        tts: Vec<BackendDescription>,
        llm: Vec<BackendDescription>,
    },

    #[serde(rename = "backend_schema_response")]
    BackendSchemaResponse {
        status: String,
        backend_type: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        available: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorObject>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn auth_ok() -> Self {
        OutgoingMessage::AuthResponse {
            status: "ok".to_string(),
            message: None,
        }
    }

    pub fn auth_error(message: &str) -> Self {
        OutgoingMessage::AuthResponse {
            status: "error".to_string(),
            message: Some(message.to_string()),
        }
    }

    pub fn error(call_id: &str, message: impl Into<String>) -> Self {
        OutgoingMessage::Error {
            code: None,
            message: message.into(),
            call_id: Some(call_id.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            OutgoingMessage::AuthResponse { .. } => "auth_response",
            OutgoingMessage::ModeReady { .. } => "mode_ready",
            OutgoingMessage::SttResult { .. } => "stt_result",
            OutgoingMessage::TtsAudio { .. } => "tts_audio",
            OutgoingMessage::LlmResponse { .. } => "llm_response",
            OutgoingMessage::ReloadResponse { .. } => "reload_response",
            OutgoingMessage::SwitchResponse { .. } => "switch_response",
            OutgoingMessage::StatusResponse(_) => "status_response",
            OutgoingMessage::CapabilitiesResponse { .. } => "capabilities_response",
            OutgoingMessage::BackendsResponse { .. } => "backends_response",
            OutgoingMessage::BackendSchemaResponse { .. } => "backend_schema_response",
            OutgoingMessage::Error { .. } => "error",
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Frames queued for the connection writer task
#[derive(Debug)]
pub enum MessageRoute {
    /// JSON text frame
    Outgoing(OutgoingMessage),
    /// `tts_audio` header immediately followed by its PCM frame
    Audio { header: OutgoingMessage, pcm: Bytes },
    /// Close with an optional code and reason
    Close(Option<(u16, String)>),
}
