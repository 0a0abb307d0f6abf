//! WebSocket connection handler
//!
//! One task per connection runs the read loop; a writer task owns the socket
//! sink and drains a [`MessageRoute`] channel. The session is released after
//! the loop ends, whether it ended by close, transport error or panic.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures::stream::SplitStream;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backends::isolation::panic_message;
use crate::middleware::ConnectionSlot;
use crate::protocol::{MessageRoute, OutgoingMessage, validate};
use crate::session::Session;
use crate::state::AppState;

use super::audio;
use super::processor::{handle_text, reject_unauthenticated};

const CHANNEL_BUFFER_SIZE: usize = 1024;

/// How often idle deadlines are checked
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Time allowed for queued frames to flush after the loop ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Upgrades `GET /ws` to the realtime protocol.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    slot: Option<Extension<ConnectionSlot>>,
) -> Response {
    let max_size = state.config.max_frame_size;
    let slot = slot.map(|Extension(slot)| slot);
    ws.max_frame_size(max_size)
        .max_message_size(max_size)
        .on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, slot: Option<ConnectionSlot>) {
    let client = slot.as_ref().map(|s| s.ip().to_string()).unwrap_or_default();
    let (mut sender, receiver) = socket.split();

    if !app_state.config.accepts_connections() {
        warn!(
            client = %client,
            host = %app_state.config.host,
            "Refusing connection: non-loopback bind without an auth token"
        );
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: "auth token required for non-loopback bind".into(),
        };
        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Failed to send policy close");
        }
        return;
    }

    info!(client = %client, "WebSocket connection established");
    let (message_tx, message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);
    let mut sender_task = tokio::spawn(write_loop(sender, message_rx));

    let mut session = Session::new(app_state.config.has_auth_token());
    let outcome = AssertUnwindSafe(read_loop(receiver, &mut session, &message_tx, &app_state))
        .catch_unwind()
        .await;
    if let Err(panic_info) = outcome {
        error!(
            call_id = %session.call_id(),
            panic = %panic_message(&panic_info),
            "Session loop panicked"
        );
    }

    session.release().await;
    drop(message_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut sender_task).await.is_err() {
        sender_task.abort();
    }

    // Keeps the connection slot reserved until the session is gone
    drop(slot);
    info!(call_id = %session.call_id(), client = %client, "WebSocket connection terminated");
}

async fn write_loop(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut message_rx: mpsc::Receiver<MessageRoute>,
) {
    while let Some(route) = message_rx.recv().await {
        let should_close = matches!(route, MessageRoute::Close(_));

        let result = match route {
            MessageRoute::Outgoing(message) => match encode(&message) {
                Some(text) => sender.send(Message::Text(text.into())).await,
                None => continue,
            },
            MessageRoute::Audio { header, pcm } => match encode(&header) {
                Some(text) => match sender.send(Message::Text(text.into())).await {
                    Ok(()) => sender.send(Message::Binary(pcm)).await,
                    Err(e) => Err(e),
                },
                None => continue,
            },
            MessageRoute::Close(frame) => {
                let frame = frame.map(|(code, reason)| CloseFrame {
                    code,
                    reason: reason.into(),
                });
                sender.send(Message::Close(frame)).await
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Failed to send WebSocket message");
            break;
        }
        if should_close {
            break;
        }
    }
}

/// Serialize and check an outgoing message against the contract.
fn encode(message: &OutgoingMessage) -> Option<String> {
    let value = match serde_json::to_value(message) {
        Ok(value) => value,
        Err(e) => {
            error!(message_type = message.type_name(), error = %e, "Failed to serialize outgoing message");
            return None;
        }
    };
    if let Err(e) = validate(&value) {
        error!(message_type = message.type_name(), error = %e, "Outgoing message violates the contract");
        return None;
    }
    serde_json::to_string(message).ok()
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) {
    let connection_idle = app_state.config.connection_idle_timeout();
    let stt_idle = app_state.config.stt_idle_timeout();

    loop {
        select! {
            frame = receiver.next() => {
                session.touch();
                match frame {
                    Some(Ok(message)) => {
                        if !process_frame(message, session, message_tx, app_state).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(call_id = %session.call_id(), error = %e, "WebSocket transport error");
                        break;
                    }
                    None => {
                        info!(call_id = %session.call_id(), "WebSocket closed by client");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                if session.recognizer_idle(stt_idle) {
                    audio::finalize_idle_stream(session, message_tx, app_state).await;
                }
                if session.idle_for() >= connection_idle {
                    warn!(
                        call_id = %session.call_id(),
                        idle_secs = session.idle_for().as_secs(),
                        "Closing idle connection"
                    );
                    let _ = message_tx
                        .send(MessageRoute::Close(Some((
                            close_code::NORMAL,
                            "idle timeout".to_string(),
                        ))))
                        .await;
                    break;
                }
            }
        }
    }
}

/// Returns false when the connection should end.
async fn process_frame(
    message: Message,
    session: &mut Session,
    message_tx: &mpsc::Sender<MessageRoute>,
    app_state: &Arc<AppState>,
) -> bool {
    match message {
        Message::Text(text) => {
            handle_text(text.as_str(), session, message_tx, app_state).await;
            true
        }
        Message::Binary(data) => {
            if !session.is_authenticated() {
                reject_unauthenticated(message_tx).await;
            } else {
                audio::handle_audio(data, session, message_tx, app_state).await;
            }
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(frame) => {
            debug!(call_id = %session.call_id(), frame = ?frame, "Received close frame");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_puts_type_first() {
        let text = encode(&OutgoingMessage::auth_ok()).unwrap();
        assert!(text.starts_with(r#"{"type":"auth_response""#));
    }
}
