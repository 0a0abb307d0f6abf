//! WebSocket message processing
//!
//! Parses text frames, applies the auth gate and dispatches on `type`.
//! Malformed frames, contract violations and unknown types are logged and
//! dropped; the connection stays open.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{
    Direction, IncomingMessage, MessageRoute, OutgoingMessage, contract, parse_frame, validate,
    validate_minimal,
};
use crate::session::{Mode, Session};
use crate::state::AppState;

use super::audio::{self, send};

const AUTH_REQUIRED: &str = "authentication_required";
const INVALID_TOKEN: &str = "invalid_token";

/// Reply for any non-`auth` input on an unauthenticated session
pub(super) async fn reject_unauthenticated(message_tx: &mpsc::Sender<MessageRoute>) {
    send(message_tx, OutgoingMessage::auth_error(AUTH_REQUIRED)).await;
}

/// Handle one text frame.
pub async fn handle_text(
    text: &str,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    let payload = match parse_frame(text) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(call_id = %session.call_id(), error = %e, "Dropping malformed frame");
            return;
        }
    };
    let message_type = match validate_minimal(&payload) {
        Ok(message_type) => message_type.to_string(),
        Err(e) => {
            warn!(call_id = %session.call_id(), error = %e, "Dropping frame without a type");
            return;
        }
    };

    if message_type != "auth" && !session.is_authenticated() {
        debug!(call_id = %session.call_id(), message_type = %message_type, "Rejected before auth");
        reject_unauthenticated(message_tx).await;
        return;
    }

    if !contract::shape(&message_type).is_some_and(|s| s.direction == Direction::Inbound) {
        warn!(call_id = %session.call_id(), message_type = %message_type, "Ignoring unknown message type");
        return;
    }
    if let Err(e) = validate(&payload) {
        warn!(call_id = %session.call_id(), error = %e, "Dropping frame that violates the contract");
        return;
    }

    match serde_json::from_value::<IncomingMessage>(payload) {
        Ok(message) => handle_incoming(message, session, message_tx, app_state).await,
        Err(e) => {
            warn!(call_id = %session.call_id(), message_type = %message_type, error = %e, "Failed to decode message");
        }
    }
}

/// Dispatch a decoded message.
pub async fn handle_incoming(
    message: IncomingMessage,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    debug!(call_id = %session.call_id(), message_type = message.type_name(), "Dispatching message");
    let manager = &app_state.manager;

    match message {
        IncomingMessage::Auth { auth_token } => {
            handle_auth(auth_token.as_deref(), session, message_tx, app_state).await;
        }
        IncomingMessage::SetMode { mode, call_id } => {
            let mode = match mode.parse::<Mode>() {
                Ok(mode) => mode,
                Err(e) => {
                    warn!(call_id = %session.call_id(), error = %e, "Ignoring set_mode");
                    return;
                }
            };
            session.set_call_id(call_id.as_deref());
            session.set_mode(mode);
            if !mode.consumes_audio()
                && let Some(mut active) = session.take_recognizer()
            {
                active.stream.close().await;
            }
            info!(call_id = %session.call_id(), mode = %mode, "Mode set");
            send(
                message_tx,
                OutgoingMessage::ModeReady {
                    mode: mode.to_string(),
                    call_id: session.call_id().to_string(),
                },
            )
            .await;
        }
        IncomingMessage::Audio {
            data,
            sample_rate,
            call_id,
        } => {
            session.set_call_id(call_id.as_deref());
            if let Some(rate) = sample_rate
                && let Some(mut previous) = session.set_sample_rate(rate)
            {
                previous.stream.close().await;
            }
            let Some(data) = data else {
                return;
            };
            match BASE64.decode(data.as_bytes()) {
                Ok(pcm) => audio::handle_audio(Bytes::from(pcm), session, message_tx, app_state).await,
                Err(e) => warn!(call_id = %session.call_id(), error = %e, "Invalid base64 audio"),
            }
        }
        IncomingMessage::TtsRequest {
            text,
            voice,
            call_id,
        } => {
            session.set_call_id(call_id.as_deref());
            if text.trim().is_empty() {
                send(message_tx, OutgoingMessage::error(session.call_id(), "Empty text")).await;
                return;
            }
            audio::synthesize(&text, voice.as_deref(), session.call_id(), message_tx, app_state)
                .await;
        }
        IncomingMessage::LlmRequest {
            prompt,
            text,
            stream,
            call_id,
        } => {
            session.set_call_id(call_id.as_deref());
            let prompt = prompt
                .or(text)
                .map(|p| p.trim().to_string())
                .unwrap_or_default();
            if prompt.is_empty() {
                send(message_tx, OutgoingMessage::error(session.call_id(), "Empty prompt")).await;
                return;
            }
            let stream = stream.unwrap_or(false);
            audio::generate(&prompt, stream, session.call_id(), message_tx, app_state).await;
        }
        IncomingMessage::ReloadModels => {
            info!(call_id = %session.call_id(), "Reloading all models");
            send(message_tx, manager.reload_all().await.into_message()).await;
        }
        IncomingMessage::ReloadLlm { model_path } => {
            info!(call_id = %session.call_id(), model_path = ?model_path, "Reloading LLM");
            send(
                message_tx,
                manager.reload_llm(model_path.as_deref()).await.into_message(),
            )
            .await;
        }
        IncomingMessage::SwitchModel(request) => {
            send(message_tx, manager.switch_model(&request).await.into_message()).await;
        }
        IncomingMessage::Status => {
            send(message_tx, OutgoingMessage::StatusResponse(manager.status())).await;
        }
        IncomingMessage::Capabilities => {
            send(
                message_tx,
                OutgoingMessage::CapabilitiesResponse {
                    status: "ok".to_string(),
                    capabilities: manager.capabilities().await,
                },
            )
            .await;
        }
        IncomingMessage::Backends => {
            let manager = Arc::clone(manager);
            // Probes may touch the filesystem
            let response = tokio::task::spawn_blocking(move || manager.describe_backends()).await;
            match response {
                Ok(response) => send(message_tx, response).await,
                Err(e) => warn!(error = %e, "Backend listing task failed"),
            }
        }
        IncomingMessage::BackendSchema { backend_type, name } => {
            let manager = Arc::clone(manager);
            let response =
                tokio::task::spawn_blocking(move || manager.backend_schema(&backend_type, &name))
                    .await;
            match response {
                Ok(response) => send(message_tx, response).await,
                Err(e) => warn!(error = %e, "Backend schema task failed"),
            }
        }
    }
}

async fn handle_auth(
    token: Option<&str>,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    let config = &app_state.config;
    let accepted = !config.has_auth_token() || token.is_some_and(|t| config.verify_token(t));

    if accepted {
        session.authenticate();
        info!(call_id = %session.call_id(), "Session authenticated");
        send(message_tx, OutgoingMessage::auth_ok()).await;
    } else {
        warn!(call_id = %session.call_id(), "Rejected auth attempt");
        send(message_tx, OutgoingMessage::auth_error(INVALID_TOKEN)).await;
    }
}
